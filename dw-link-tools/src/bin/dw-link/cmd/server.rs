use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use dw_link::bridge::{
    BridgeConfig, BridgeEvent, BridgeEvents, BridgeServer, CompanionCommand, DisconnectReason,
    SessionMode, StartupMode,
};
use dw_link::discovery::discover;
use dw_link::serial::Lister;
use signal_hook::consts::signal;

use crate::util::logging;
use crate::Config;

/// Companion started by `--gede`.
const GEDE: &str = "gede";

#[derive(Debug, clap::Parser)]
pub struct Cmd {
    /// TCP port the bridge listens on [default: 2000]
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Program started once the bridge listens, e.g. a GDB front end
    #[arg(short, long, value_name = "COMMAND", conflicts_with = "gede")]
    pub start: Option<String>,

    /// Start the gede debugger front end
    #[arg(short, long)]
    pub gede: bool,

    /// Show every console message of the adapter, not only the fatal ones
    #[arg(short, long)]
    pub verbose: bool,

    /// Keep accepting clients after the first one disconnects
    #[arg(long)]
    pub persistent: bool,
}

impl Cmd {
    /// Builds the bridge settings, command line flags taking precedence over the configuration.
    pub fn bridge_config(&self, config: &Config) -> anyhow::Result<BridgeConfig> {
        let companion = match (&self.start, self.gede, &config.companion) {
            (Some(line), _, _) => Some(line.as_str()),
            (None, true, _) => Some(GEDE),
            (None, false, configured) => configured.as_deref(),
        };
        let companion = companion
            .map(CompanionCommand::parse)
            .transpose()
            .map_err(dw_link::Error::from)?;

        let session_mode = if self.persistent || config.persistent {
            SessionMode::Persistent
        } else {
            SessionMode::SingleShot
        };

        Ok(BridgeConfig {
            port: self.port.unwrap_or(config.listen_port),
            verbose: self.verbose || config.verbose,
            session_mode,
            companion,
            ..BridgeConfig::default()
        })
    }

    pub fn run(self, lister: &Lister, config: &Config) -> anyhow::Result<()> {
        let bridge_config = self.bridge_config(config)?;
        serve(lister, config, bridge_config)
    }
}

/// Runs the bridge in OpenOCD emulation mode on `port`.
pub fn run_emulation(lister: &Lister, config: &Config, port: u16) -> anyhow::Result<()> {
    let bridge_config = BridgeConfig {
        port,
        verbose: config.verbose,
        startup: StartupMode::Emulation,
        ..BridgeConfig::default()
    };

    serve(lister, config, bridge_config)
}

fn serve(lister: &Lister, config: &Config, bridge_config: BridgeConfig) -> anyhow::Result<()> {
    let startup = bridge_config.startup;
    let options = config.discovery_options();

    let adapter = discover(lister, &options).ok_or(dw_link::Error::AdapterNotFound)?;
    if startup == StartupMode::Plain {
        logging::println(format!(
            "{} dw-link on {} at {} baud",
            "Found".green().bold(),
            adapter.device,
            adapter.baud
        ));
    }

    let server = BridgeServer::open(lister, &adapter, bridge_config)
        .map_err(dw_link::Error::from)
        .with_context(|| format!("Failed to open {}", adapter.device))?
        .with_events(BridgeEvents::new(move |event| print_event(startup, event)));

    let interrupt = Arc::new(AtomicBool::new(false));
    let sig_id = signal_hook::flag::register(signal::SIGINT, interrupt.clone())?;

    let result = server.run(&interrupt);

    signal_hook::low_level::unregister(sig_id);

    result.map_err(dw_link::Error::from)?;
    Ok(())
}

fn print_event(startup: StartupMode, event: BridgeEvent) {
    match (startup, event) {
        (_, BridgeEvent::Banner(line)) => logging::println(line),
        (_, BridgeEvent::Diagnostic(frame)) => {
            let text = frame.text.trim_end();
            if frame.is_fatal() {
                logging::eprintln(text.red().bold().to_string());
            } else {
                logging::eprintln(text);
            }
        }
        (StartupMode::Emulation, _) => {}
        (StartupMode::Plain, BridgeEvent::Listening(address)) => {
            logging::println(format!(
                "{} on port {}",
                "Listening".green().bold(),
                address.port()
            ));
        }
        (StartupMode::Plain, BridgeEvent::Waiting(_)) => {
            logging::println("Waiting for a GDB connection");
        }
        (StartupMode::Plain, BridgeEvent::Connected(peer)) => {
            logging::println(format!("{} {peer}", "Connected to".green().bold()));
        }
        (StartupMode::Plain, BridgeEvent::Disconnected(reason)) => {
            let why = match reason {
                DisconnectReason::ClientClosed => "client closed the connection",
                DisconnectReason::ClientError => "client connection failed",
                DisconnectReason::SerialError => "serial port failed",
                DisconnectReason::CompanionExited => "companion program exited",
                DisconnectReason::Interrupted => "interrupted",
            };
            logging::println(format!("{} ({why})", "Disconnected".yellow().bold()));
        }
        (StartupMode::Plain, BridgeEvent::CompanionStarted { program, pid }) => {
            logging::println(format!(
                "{} {program} (pid {pid})",
                "Started".green().bold()
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    fn parse(args: &[&str]) -> Cmd {
        Cmd::try_parse_from(std::iter::once("server").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn defaults_come_from_the_configuration() {
        let config = Config {
            listen_port: 4242,
            persistent: true,
            ..Config::default()
        };

        let bridge = parse(&[]).bridge_config(&config).unwrap();

        assert_eq!(bridge.port, 4242);
        assert_eq!(bridge.session_mode, SessionMode::Persistent);
        assert_eq!(bridge.companion, None);
        assert!(!bridge.verbose);
    }

    #[test]
    fn flags_override_the_configuration() {
        let config = Config {
            listen_port: 4242,
            companion: Some("ddd".to_string()),
            ..Config::default()
        };

        let bridge = parse(&["-p", "3333", "-v", "-s", "gdb-multiarch -x 'my init.gdb'"])
            .bridge_config(&config)
            .unwrap();

        assert_eq!(bridge.port, 3333);
        assert!(bridge.verbose);
        let companion = bridge.companion.unwrap();
        assert_eq!(companion.program(), "gdb-multiarch");
        assert_eq!(companion.args(), ["-x", "my init.gdb"]);
    }

    #[test]
    fn gede_flag_starts_gede() {
        let bridge = parse(&["--gede"]).bridge_config(&Config::default()).unwrap();

        assert_eq!(bridge.port, 2000);
        assert_eq!(bridge.companion.unwrap().program(), "gede");
    }

    #[test]
    fn start_and_gede_conflict() {
        assert!(Cmd::try_parse_from(["server", "-g", "-s", "ddd"]).is_err());
    }

    #[test]
    fn unbalanced_quotes_are_rejected() {
        let error = parse(&["-s", "gede 'oops"])
            .bridge_config(&Config::default())
            .unwrap_err();

        assert!(error.downcast_ref::<dw_link::Error>().is_some());
    }
}
