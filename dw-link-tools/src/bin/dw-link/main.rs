mod cmd;
mod util;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use colored::Colorize;
use dw_link::bridge::{emulation_port, DEFAULT_LISTEN_PORT};
use dw_link::discovery::{DiscoveryOptions, DEFAULT_BAUD_RATES};
use dw_link::serial::Lister;
use figment::providers::{Env, Format as _, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::util::logging::{self, setup_logging, LevelFilter};

/// Settings read from `.dw-link.{toml,json,yaml,yml}` and `DW_LINK_*` variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct Config {
    /// TCP port of the bridge.
    pub listen_port: u16,
    /// Show every adapter console message.
    pub verbose: bool,
    /// Keep the bridge running after a client disconnects.
    pub persistent: bool,
    /// Program started next to the bridge.
    pub companion: Option<String>,
    /// Baud rates tried while searching the adapter.
    pub baud_rates: Vec<u32>,
    /// Pauses between opening a port and the enquiry, one scan each.
    pub settle_delays_ms: Vec<u64>,
    /// Log level when neither `--log-level` nor `RUST_LOG` is given.
    pub log_level: Option<LevelFilter>,
}

impl Default for Config {
    fn default() -> Self {
        let discovery = DiscoveryOptions::default();

        Self {
            listen_port: DEFAULT_LISTEN_PORT,
            verbose: false,
            persistent: false,
            companion: None,
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            settle_delays_ms: discovery
                .settle_delays
                .iter()
                .map(|delay| delay.as_millis() as u64)
                .collect(),
            log_level: None,
        }
    }
}

impl Config {
    pub fn discovery_options(&self) -> DiscoveryOptions {
        DiscoveryOptions {
            settle_delays: self
                .settle_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
            baud_rates: self.baud_rates.clone(),
            ..DiscoveryOptions::default()
        }
    }
}

#[derive(Debug, clap::Args)]
struct LogOptions {
    /// Location for log file
    #[arg(long, global = true, help_heading = "LOG CONFIGURATION")]
    log_file: Option<PathBuf>,
    /// Log level; defaults to `RUST_LOG`, or WARN if that is not set
    #[arg(long, global = true, value_enum, help_heading = "LOG CONFIGURATION")]
    log_level: Option<LevelFilter>,
}

#[derive(Debug, clap::Parser)]
#[clap(
    name = "dw-link",
    about = "Host tools for the dw-link debugWIRE adapter",
    version = env!("DW_LINK_VERSION"),
    long_version = env!("DW_LINK_LONG_VERSION")
)]
struct Cli {
    #[clap(flatten)]
    log: LogOptions,

    #[clap(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Make the adapter reachable over TCP for GDB
    Server(cmd::server::Cmd),
    /// Upload adapter firmware through the board's bootloader
    Upload(cmd::upload::Cmd),
    /// Search the serial ports for an adapter
    Discover(cmd::discover::Cmd),
    /// List all serial ports
    List(cmd::list::Cmd),
}

/// `dw-server`: the bridge on its own.
#[derive(Debug, clap::Parser)]
#[clap(
    name = "dw-server",
    about = "TCP bridge to the dw-link debugWIRE adapter",
    version = env!("DW_LINK_VERSION"),
    long_version = env!("DW_LINK_LONG_VERSION")
)]
struct ServerCli {
    #[clap(flatten)]
    log: LogOptions,

    #[clap(flatten)]
    cmd: cmd::server::Cmd,
}

/// `dw-uploader`: the firmware uploader on its own.
#[derive(Debug, clap::Parser)]
#[clap(
    name = "dw-uploader",
    about = "Firmware uploader for the dw-link debugWIRE adapter",
    version = env!("DW_LINK_VERSION"),
    long_version = env!("DW_LINK_LONG_VERSION")
)]
struct UploaderCli {
    #[clap(flatten)]
    log: LogOptions,

    #[clap(flatten)]
    cmd: cmd::upload::Cmd,
}

/// What a single invocation does, after the argument vector was looked at.
#[derive(Debug)]
enum Invocation {
    Cli(Cli),
    Server(ServerCli),
    Uploader(UploaderCli),
    /// Started by an IDE in place of OpenOCD.
    Emulation(u16),
}

impl Invocation {
    /// Log file and level given on the command line.
    fn log_settings(&self) -> (Option<PathBuf>, Option<LevelFilter>) {
        let log = match self {
            Invocation::Cli(cli) => &cli.log,
            Invocation::Server(cli) => &cli.log,
            Invocation::Uploader(cli) => &cli.log,
            Invocation::Emulation(_) => return (None, None),
        };
        (log.log_file.clone(), log.log_level)
    }
}

/// Returns the cleaned arguments for the handler of the respective end binary
/// (dw-link, dw-server, dw-uploader).
fn multicall_check<'list>(args: &'list [OsString], want: &str) -> Option<&'list [OsString]> {
    let argv0 = Path::new(args.first()?);
    if let Some(command) = argv0.file_stem().and_then(|f| f.to_str()) {
        if command == want {
            return Some(args);
        }
    }

    if let Some(command) = args.get(1).and_then(|f| f.to_str()) {
        if command == want {
            return Some(&args[1..]);
        }
    }

    None
}

/// Picks the tool personality and parses its arguments.
///
/// OpenOCD-style invocations of the server are recognized before clap sees the
/// arguments, since they carry OpenOCD options the bridge does not know.
fn parse_invocation(args: &[OsString]) -> Result<Invocation, clap::Error> {
    if let Some(args) = multicall_check(args, "dw-server") {
        let words = args
            .iter()
            .skip(1)
            .map(|arg| arg.to_string_lossy())
            .collect::<Vec<_>>();
        if let Some(port) = emulation_port(&words) {
            return Ok(Invocation::Emulation(port));
        }
        return ServerCli::try_parse_from(args).map(Invocation::Server);
    }

    if let Some(args) = multicall_check(args, "dw-uploader") {
        return UploaderCli::try_parse_from(args).map(Invocation::Uploader);
    }

    Cli::try_parse_from(args).map(Invocation::Cli)
}

/// Process exit status for a failed command.
fn exit_code(error: &anyhow::Error) -> u8 {
    let library_error = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<dw_link::Error>());

    match library_error {
        Some(dw_link::Error::AdapterNotFound) => 1,
        Some(error) if error.is_serial_open_failure() => 2,
        _ => 3,
    }
}

fn load_config() -> anyhow::Result<Config> {
    let mut paths = vec![PathBuf::from(".")];
    if let Some(home) = directories::UserDirs::new().map(|user| user.home_dir().to_path_buf()) {
        paths.push(home);
    }

    let mut figment = Figment::from(Serialized::defaults(Config::default()));
    for path in paths {
        figment = figment
            .merge(Toml::file(path.join(".dw-link.toml")))
            .merge(Json::file(path.join(".dw-link.json")))
            .merge(Yaml::file(path.join(".dw-link.yaml")))
            .merge(Yaml::file(path.join(".dw-link.yml")));
    }

    let config = figment
        .merge(Env::prefixed("DW_LINK_").only(&[
            "listen_port",
            "verbose",
            "persistent",
            "companion",
            "baud_rates",
            "settle_delays_ms",
            "log_level",
        ]))
        .extract::<Config>()?;

    Ok(config)
}

fn run(invocation: Invocation, config: &Config) -> anyhow::Result<()> {
    let lister = Lister::new();

    let (log_file, level) = invocation.log_settings();
    let _logger_guard = setup_logging(log_file.as_deref(), level.or(config.log_level))
        .context("Failed to set up logging")?;

    match invocation {
        Invocation::Emulation(port) => cmd::server::run_emulation(&lister, config, port),
        Invocation::Server(cli) => cli.cmd.run(&lister, config),
        Invocation::Uploader(cli) => cli.cmd.run(&lister, config),
        Invocation::Cli(cli) => match cli.subcommand {
            Subcommand::Server(cmd) => cmd.run(&lister, config),
            Subcommand::Upload(cmd) => cmd.run(&lister, config),
            Subcommand::Discover(cmd) => cmd.run(&lister, config),
            Subcommand::List(cmd) => cmd.run(&lister),
        },
    }
}

fn main() -> ExitCode {
    let args: Vec<_> = std::env::args_os().collect();

    let invocation = match parse_invocation(&args) {
        Ok(invocation) => invocation,
        Err(error) => error.exit(),
    };

    let result = load_config()
        .context("Failed to load configuration.")
        .and_then(|config| run(invocation, &config));

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            logging::clear_progress_bar();
            logging::eprintln(format!("{} {error:#}", "Error:".red().bold()));
            ExitCode::from(exit_code(&error))
        }
    }
}

#[cfg(test)]
mod test {
    use std::io;

    use dw_link::serial::SerialError;
    use dw_link::stk500::UploadError;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;

    fn os_strs(args: &[&str]) -> Vec<OsString> {
        args.iter().map(|s| s.into()).collect()
    }

    #[test]
    fn argument_preprocessing() {
        assert_eq!(
            multicall_check(&os_strs(&["/usr/bin/dw-server", "-p", "3333"]), "dw-server").unwrap(),
            os_strs(&["/usr/bin/dw-server", "-p", "3333"])
        );
        assert_eq!(
            multicall_check(&os_strs(&["dw-link", "dw-uploader", "fw.hex"]), "dw-uploader")
                .unwrap(),
            os_strs(&["dw-uploader", "fw.hex"])
        );
        assert!(multicall_check(&os_strs(&["dw-link", "upload"]), "dw-uploader").is_none());
    }

    #[test]
    fn openocd_style_server_invocation_enters_emulation() {
        let args = os_strs(&["dw-server", "-f", "board.cfg", "-c", "gdb_port 50000"]);

        assert!(matches!(
            parse_invocation(&args).unwrap(),
            Invocation::Emulation(50000)
        ));
    }

    #[test]
    fn plain_server_invocation_is_parsed_by_clap() {
        let args = os_strs(&["dw-server", "-p", "3333", "--persistent"]);

        let Invocation::Server(cli) = parse_invocation(&args).unwrap() else {
            panic!("expected the server personality");
        };
        assert_eq!(cli.cmd.port, Some(3333));
        assert!(cli.cmd.persistent);
    }

    #[test]
    fn subcommands_are_parsed() {
        let args = os_strs(&["dw-link", "--log-level", "TRACE", "upload", "--port", "COM3"]);

        let Invocation::Cli(cli) = parse_invocation(&args).unwrap() else {
            panic!("expected the main personality");
        };
        assert_eq!(cli.log.log_level, Some(LevelFilter::Trace));
        let Subcommand::Upload(upload) = cli.subcommand else {
            panic!("expected the upload command");
        };
        assert_eq!(upload.port.as_deref(), Some("COM3"));
        assert_eq!(upload.path, PathBuf::from("dw-link.hex"));
    }

    #[test]
    fn log_settings_are_taken_from_every_personality() {
        let args = os_strs(&["dw-uploader", "--log-file", "upload.log", "--log-level", "DEBUG"]);
        let invocation = parse_invocation(&args).unwrap();

        assert_eq!(
            invocation.log_settings(),
            (Some(PathBuf::from("upload.log")), Some(LevelFilter::Debug))
        );
        assert!(matches!(invocation, Invocation::Uploader(_)));

        let emulation = parse_invocation(&os_strs(&["dw-server", "-c", "gdb_port 3333"])).unwrap();
        assert_eq!(emulation.log_settings(), (None, None));
    }

    fn open_failure() -> SerialError {
        SerialError::Open {
            port: "/dev/ttyUSB0".to_string(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        }
    }

    #[test_case(anyhow::Error::from(dw_link::Error::AdapterNotFound), 1; "adapter not found")]
    #[test_case(anyhow::Error::from(dw_link::Error::Serial(open_failure())), 2; "serial open failure")]
    #[test_case(
        anyhow::Error::from(dw_link::Error::Upload(UploadError::Serial(open_failure())))
            .context("Upload to /dev/ttyUSB0 failed"),
        2;
        "open failure behind context"
    )]
    #[test_case(anyhow::Error::from(dw_link::Error::Upload(UploadError::NotConnected)), 3; "upload failure")]
    #[test_case(anyhow::anyhow!("Verification failed"), 3; "other failure")]
    fn failures_map_to_exit_codes(error: anyhow::Error, code: u8) {
        assert_eq!(exit_code(&error), code);
    }

    #[test]
    fn default_config_matches_library_defaults() {
        let config = Config::default();

        assert_eq!(config.listen_port, 2000);
        assert_eq!(config.discovery_options(), DiscoveryOptions::default());
    }
}
