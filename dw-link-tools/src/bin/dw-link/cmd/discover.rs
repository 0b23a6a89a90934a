use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use colored::Colorize;
use dw_link::discovery::{discover, DiscoveryResult};
use dw_link::serial::Lister;

use crate::util::logging;
use crate::Config;

#[derive(Debug, clap::Parser)]
pub struct Cmd {
    /// Write a GDB script connecting to the adapter, or printing that none was found
    #[arg(
        long,
        value_name = "PATH",
        num_args = 0..=1,
        default_missing_value = ".gdb-connect-to-dw-link"
    )]
    pub gdb_script: Option<PathBuf>,
}

impl Cmd {
    pub fn run(self, lister: &Lister, config: &Config) -> anyhow::Result<()> {
        let found = discover(lister, &config.discovery_options());

        if let Some(path) = &self.gdb_script {
            fs::write(path, gdb_script(found.as_ref()))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            tracing::info!("Wrote {}", path.display());
        }

        match found {
            Some(adapter) => {
                logging::println(format!(
                    "{} dw-link on {} at {} baud",
                    "Found".green().bold(),
                    adapter.device,
                    adapter.baud
                ));
                Ok(())
            }
            // The script tells GDB about the missing adapter.
            None if self.gdb_script.is_some() => Ok(()),
            None => Err(dw_link::Error::AdapterNotFound.into()),
        }
    }
}

/// GDB commands that attach to the adapter directly over its serial port.
pub fn gdb_script(found: Option<&DiscoveryResult>) -> String {
    match found {
        Some(adapter) => format!(
            "set serial baud {}\ntarget extended-remote {}\n",
            adapter.baud, adapter.device
        ),
        None => "print \"No dw-link adapter found\"\n".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn script_connects_at_the_discovered_speed() {
        let adapter = DiscoveryResult {
            baud: 230_400,
            device: "/dev/cu.usbserial-1410".to_string(),
        };

        assert_eq!(
            gdb_script(Some(&adapter)),
            "set serial baud 230400\ntarget extended-remote /dev/cu.usbserial-1410\n"
        );
    }

    #[test]
    fn script_reports_a_missing_adapter() {
        assert_eq!(gdb_script(None), "print \"No dw-link adapter found\"\n");
    }
}
