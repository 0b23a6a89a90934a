use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context};
use colored::Colorize;
use dw_link::discovery::{discover, is_bogus_port};
use dw_link::flashing::{FlashImage, UploadProgress};
use dw_link::serial::Lister;
use dw_link::stk500::{UploadOptions, UploadSession};

use crate::util::logging;
use crate::util::progress::CliProgressBars;
use crate::Config;

#[derive(Debug, clap::Parser)]
pub struct Cmd {
    /// Intel hex file with the adapter firmware
    #[arg(value_name = "HEX", default_value = "dw-link.hex")]
    pub path: PathBuf,

    /// Serial port of the board; skips the search for it
    #[arg(long)]
    pub port: Option<String>,

    /// Do not show progress bars
    #[arg(long)]
    pub disable_progressbars: bool,
}

impl Cmd {
    pub fn run(self, lister: &Lister, config: &Config) -> anyhow::Result<()> {
        let options = UploadOptions::default();

        let image = FlashImage::from_hex_file(&self.path, &options.geometry)
            .map_err(dw_link::Error::from)
            .with_context(|| format!("Failed to load {}", self.path.display()))?;

        let device = match self.port {
            Some(port) => port,
            None => resolve_port(lister, config)?,
        };
        logging::println(format!(
            "{} {} bytes to {device}",
            "Uploading".green().bold(),
            image.len()
        ));

        let bars = (!self.disable_progressbars).then(CliProgressBars::new);
        let progress = UploadProgress::new(move |event| {
            tracing::debug!("{event:?}");
            if let Some(bars) = &bars {
                bars.handle(event);
            }
        });

        let started = Instant::now();
        let report = UploadSession::new(&device, image, options)
            .map_err(dw_link::Error::from)?
            .with_progress(progress)
            .run(lister)
            .map_err(dw_link::Error::from)
            .with_context(|| format!("Upload to {device} failed"))?;

        logging::clear_progress_bar();
        logging::println(format!(
            "    {} in {:.02}s",
            "Finished".green().bold(),
            started.elapsed().as_secs_f32()
        ));

        if report.adapter_alive {
            logging::println("dw-link is operational");
        } else {
            logging::println("dw-link did not respond to initial communication attempt");
        }

        if let Some(mismatch) = report.mismatch {
            bail!(
                "Verification failed in the page at {:#06x}: byte {:#06x} is {:#04x}, expected {:#04x}",
                mismatch.page,
                mismatch.address,
                mismatch.observed,
                mismatch.expected
            );
        }

        Ok(())
    }
}

/// Finds the port to upload to.
///
/// A board that already runs dw-link answers the discovery enquiry. Otherwise
/// the only serial port present is used.
fn resolve_port(lister: &Lister, config: &Config) -> anyhow::Result<String> {
    if let Some(found) = discover(lister, &config.discovery_options()) {
        return Ok(found.device);
    }

    let candidates = lister
        .list()
        .map_err(dw_link::Error::from)?
        .into_iter()
        .map(|port| port.name)
        .filter(|name| !is_bogus_port(name))
        .collect::<Vec<_>>();

    match candidates.as_slice() {
        [] => Err(dw_link::Error::AdapterNotFound).context("No serial ports found"),
        [only] => {
            logging::println(format!("Will use {only} for upload"));
            Ok(only.clone())
        }
        several => Err(dw_link::Error::AdapterNotFound).with_context(|| {
            format!(
                "Several serial ports found, choose one with --port: {}",
                several.join(", ")
            )
        }),
    }
}

#[cfg(test)]
mod tests {
    use dw_link::serial::fake::{FakeLister, FakeSerialPort};
    use pretty_assertions::assert_eq;

    use super::*;

    fn quick_config() -> Config {
        Config {
            settle_delays_ms: vec![0],
            ..Config::default()
        }
    }

    fn silent_port(name: &'static str) -> impl Fn(u32) -> std::io::Result<FakeSerialPort> {
        move |_| Ok(FakeSerialPort::new(name))
    }

    #[test]
    fn single_port_is_used_when_nothing_answers() {
        let lister = Lister::with_lister(Box::new(
            FakeLister::new()
                .with_port("/dev/tty.usbserial-1", silent_port("/dev/tty.usbserial-1"))
                .with_port("/dev/cu.usbserial-1", silent_port("/dev/cu.usbserial-1")),
        ));

        assert_eq!(
            resolve_port(&lister, &quick_config()).unwrap(),
            "/dev/cu.usbserial-1"
        );
    }

    #[test]
    fn discovered_adapter_wins() {
        let lister = Lister::with_lister(Box::new(
            FakeLister::new()
                .with_port("/dev/ttyUSB0", silent_port("/dev/ttyUSB0"))
                .with_port("/dev/ttyACM0", |_| {
                    Ok(FakeSerialPort::with_responder("/dev/ttyACM0", |data| {
                        match data {
                            [0x05] => b"dw-link".to_vec(),
                            _ => Vec::new(),
                        }
                    }))
                }),
        ));

        assert_eq!(resolve_port(&lister, &quick_config()).unwrap(), "/dev/ttyACM0");
    }

    #[test]
    fn several_candidates_are_an_error() {
        let lister = Lister::with_lister(Box::new(
            FakeLister::new()
                .with_port("/dev/ttyUSB0", silent_port("/dev/ttyUSB0"))
                .with_port("/dev/ttyUSB1", silent_port("/dev/ttyUSB1")),
        ));

        let error = resolve_port(&lister, &quick_config()).unwrap_err();

        assert!(error.to_string().contains("/dev/ttyUSB0, /dev/ttyUSB1"));
        assert!(matches!(
            error.downcast_ref::<dw_link::Error>(),
            Some(dw_link::Error::AdapterNotFound)
        ));
    }
}
