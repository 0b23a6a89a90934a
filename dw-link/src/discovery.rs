//! Locating the dw-link adapter.
//!
//! The adapter answers the ASCII enquiry byte (`0x05`) with the seven byte
//! signature `dw-link`. Discovery walks all serial ports, skipping some
//! well-known pseudo devices, and sends the enquiry at every candidate baud rate.
//!
//! Opening a port usually resets the Arduino, and its firmware needs a moment to
//! boot before it answers. The scan is therefore repeated with increasing settle
//! delays: a quick pass first, then a slow one.

use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use crate::serial::{read_available, Lister, SerialError, SerialSettings};

/// The enquiry byte.
pub const ENQ: u8 = 0x05;

/// The adapter's reply to [`ENQ`].
pub const SIGNATURE: &[u8; 7] = b"dw-link";

/// Baud rates the adapter firmware can be configured for.
pub const DEFAULT_BAUD_RATES: [u32; 2] = [115_200, 230_400];

/// Port name prefixes that never lead to an adapter.
const BOGUS_PORT_PREFIXES: &[&str] = &["/dev/tty."];

/// Port names that never lead to an adapter.
const BOGUS_PORTS: &[&str] = &["/dev/cu.Bluetooth-Incoming-Port", "/dev/cu.debug-console"];

/// Tuning knobs of the discovery scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryOptions {
    /// Delays between opening a port and sending the enquiry, one full scan per entry.
    pub settle_delays: Vec<Duration>,
    /// Baud rates tried on every port, in order.
    pub baud_rates: Vec<u32>,
    /// Read timeout while waiting for the signature.
    pub read_timeout: Duration,
    /// Pause before the single retry after an empty reply.
    pub retry_delay: Duration,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            settle_delays: vec![Duration::from_millis(100), Duration::from_secs(2)],
            baud_rates: DEFAULT_BAUD_RATES.to_vec(),
            read_timeout: Duration::from_millis(100),
            retry_delay: Duration::from_millis(100),
        }
    }
}

/// Where the adapter was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryResult {
    /// The baud rate the adapter answered at.
    pub baud: u32,
    /// The serial device it is attached to.
    pub device: String,
}

/// Returns `true` for ports that are never probed.
///
/// On macOS every device exists twice, as `/dev/tty.*` and `/dev/cu.*`; only the
/// callout devices are usable without waiting for carrier detect.
pub fn is_bogus_port(name: &str) -> bool {
    BOGUS_PORT_PREFIXES
        .iter()
        .any(|prefix| name.starts_with(prefix))
        || BOGUS_PORTS.contains(&name)
}

/// Scans all serial ports for a dw-link adapter.
///
/// Returns the first `(port, baud)` pair that answered with the signature. Ports
/// that cannot be opened or answer with anything else are skipped; every port
/// opened by the scan is closed again before the next one is tried.
pub fn discover(lister: &Lister, options: &DiscoveryOptions) -> Option<DiscoveryResult> {
    let ports = match lister.list() {
        Ok(ports) => ports,
        Err(e) => {
            tracing::warn!("Could not enumerate serial ports: {e}");
            return None;
        }
    };

    let candidates: Vec<_> = ports
        .into_iter()
        .filter(|port| !is_bogus_port(&port.name))
        .collect();

    tracing::debug!(
        "Discovery candidates: {:?}",
        candidates.iter().map(|p| &p.name).collect::<Vec<_>>()
    );

    for &settle in &options.settle_delays {
        for port in &candidates {
            for &baud in &options.baud_rates {
                match probe(lister, &port.name, baud, settle, options) {
                    Ok(true) => {
                        tracing::info!("Found dw-link on {} at {baud} baud", port.name);
                        return Some(DiscoveryResult {
                            baud,
                            device: port.name.clone(),
                        });
                    }
                    Ok(false) => tracing::debug!("No dw-link on {} at {baud} baud", port.name),
                    Err(e) => tracing::debug!("Skipping {} at {baud} baud: {e}", port.name),
                }
            }
        }
    }

    None
}

/// Opens one port, waits for the board to settle and sends the enquiry.
fn probe(
    lister: &Lister,
    device: &str,
    baud: u32,
    settle: Duration,
    options: &DiscoveryOptions,
) -> Result<bool, SerialError> {
    let mut link = lister.open(device, SerialSettings::new(baud, options.read_timeout))?;

    thread::sleep(settle);

    inquire(link.as_mut(), options.retry_delay).map_err(|source| SerialError::Io {
        port: device.to_string(),
        source,
    })
}

/// Sends the enquiry on an open link and checks for the signature.
///
/// An empty reply is retried once after `retry_delay`, since the first byte sent
/// to a freshly reset board is sometimes lost.
pub fn inquire<L>(link: &mut L, retry_delay: Duration) -> io::Result<bool>
where
    L: Read + Write + ?Sized,
{
    let mut reply = exchange(link)?;

    if reply.is_empty() {
        thread::sleep(retry_delay);
        reply = exchange(link)?;
    }

    Ok(reply.as_slice() == SIGNATURE)
}

fn exchange<L>(link: &mut L) -> io::Result<Vec<u8>>
where
    L: Read + Write + ?Sized,
{
    link.write_all(&[ENQ])?;
    link.flush()?;
    read_available(link, SIGNATURE.len())
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    use super::*;
    use crate::serial::fake::{FakeLister, FakeSerialPort};

    fn quick() -> DiscoveryOptions {
        DiscoveryOptions {
            settle_delays: vec![Duration::ZERO, Duration::ZERO],
            baud_rates: vec![115_200, 230_400],
            read_timeout: Duration::ZERO,
            retry_delay: Duration::ZERO,
        }
    }

    fn adapter(name: &str) -> FakeSerialPort {
        FakeSerialPort::with_responder(name, |written| {
            if written == [ENQ] {
                SIGNATURE.to_vec()
            } else {
                Vec::new()
            }
        })
    }

    #[test_case("/dev/tty.usbserial-1410", true; "macos dial-in device")]
    #[test_case("/dev/cu.Bluetooth-Incoming-Port", true; "bluetooth")]
    #[test_case("/dev/cu.debug-console", true; "debug console")]
    #[test_case("/dev/cu.usbserial-1410", false; "macos callout device")]
    #[test_case("/dev/ttyUSB0", false; "linux usb serial")]
    #[test_case("COM3", false; "windows")]
    fn bogus_ports(name: &str, bogus: bool) {
        assert_eq!(is_bogus_port(name), bogus);
    }

    #[test]
    fn finds_adapter_on_second_port() {
        let silent = FakeSerialPort::new("/dev/ttyUSB0");
        let dw_link = adapter("/dev/ttyUSB1");

        let fake = FakeLister::new()
            .with_port("/dev/ttyUSB0", move |_| Ok(silent.clone()))
            .with_port("/dev/ttyUSB1", move |_| Ok(dw_link.clone()));
        let lister = Lister::with_lister(Box::new(fake));

        let found = discover(&lister, &quick());

        assert_eq!(
            found,
            Some(DiscoveryResult {
                baud: 115_200,
                device: "/dev/ttyUSB1".to_string()
            })
        );
    }

    #[test]
    fn probes_every_baud_rate_of_a_port_before_the_next_port() {
        let fake = FakeLister::new()
            .with_port("/dev/ttyUSB0", |_| Ok(FakeSerialPort::new("/dev/ttyUSB0")))
            .with_port("/dev/ttyUSB1", |_| Ok(FakeSerialPort::new("/dev/ttyUSB1")));
        let log = fake.open_log();
        let lister = Lister::with_lister(Box::new(fake));

        assert_eq!(discover(&lister, &quick()), None);

        let attempts = log.attempts();
        let expected: Vec<_> = [
            ("/dev/ttyUSB0", 115_200),
            ("/dev/ttyUSB0", 230_400),
            ("/dev/ttyUSB1", 115_200),
            ("/dev/ttyUSB1", 230_400),
        ]
        .repeat(2)
        .into_iter()
        .map(|(port, baud)| (port.to_string(), baud))
        .collect();

        assert_eq!(attempts, expected);
    }

    #[test]
    fn answers_only_at_configured_baud() {
        let dw_link = adapter("/dev/ttyACM0");
        let fake = FakeLister::new().with_port("/dev/ttyACM0", move |baud| {
            if baud == 230_400 {
                Ok(dw_link.clone())
            } else {
                Ok(FakeSerialPort::new("/dev/ttyACM0"))
            }
        });
        let lister = Lister::with_lister(Box::new(fake));

        let found = discover(&lister, &quick()).unwrap();

        assert_eq!(found.baud, 230_400);
    }

    #[test]
    fn busy_port_is_skipped() {
        let dw_link = adapter("/dev/ttyUSB1");
        let fake = FakeLister::new()
            .with_port("/dev/ttyUSB0", |_| {
                Err(io::Error::new(io::ErrorKind::PermissionDenied, "busy"))
            })
            .with_port("/dev/ttyUSB1", move |_| Ok(dw_link.clone()));
        let lister = Lister::with_lister(Box::new(fake));

        let found = discover(&lister, &quick()).unwrap();

        assert_eq!(found.device, "/dev/ttyUSB1");
    }

    #[test]
    fn bogus_ports_are_never_opened() {
        let fake = FakeLister::new().with_port("/dev/tty.usbserial", |_| {
            panic!("bogus port must not be opened")
        });
        let lister = Lister::with_lister(Box::new(fake));

        assert_eq!(discover(&lister, &quick()), None);
    }

    #[test]
    fn wrong_reply_is_not_a_match_and_port_is_closed() {
        let chatty = FakeSerialPort::with_responder("/dev/ttyUSB0", |_| b"hello!!".to_vec());
        let handle = chatty.clone();
        let fake = FakeLister::new().with_port("/dev/ttyUSB0", move |_| Ok(chatty.clone()));
        let lister = Lister::with_lister(Box::new(fake));

        assert_eq!(discover(&lister, &quick()), None);
        assert_eq!(handle.open_handles(), 0);
    }

    #[test]
    fn empty_first_reply_is_retried_once() {
        let mut replies = 0;
        let slow = FakeSerialPort::with_responder("/dev/ttyUSB0", move |_| {
            replies += 1;
            if replies == 1 {
                Vec::new()
            } else {
                SIGNATURE.to_vec()
            }
        });
        let mut link = slow.clone();

        assert!(inquire(&mut link, Duration::ZERO).unwrap());
        assert_eq!(slow.written(), vec![ENQ, ENQ]);
    }
}
