//! Serial port access shared by discovery, the bootloader client and the bridge.
//!
//! All ports are opened 8N1 without flow control. Which ports exist and how they
//! are opened is decided by a [`PortLister`], so everything above this module can
//! be driven by in-memory ports in tests.

#[cfg(any(test, feature = "test"))]
pub mod fake;
mod native;

pub use native::NativePortLister;

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

/// Errors raised while enumerating, opening or using a serial port.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum SerialError {
    /// Serial port {port} could not be opened.
    Open {
        /// Device name of the port.
        port: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// Enumerating the serial ports failed.
    Enumerate(#[source] io::Error),
    /// I/O error on serial port {port}.
    Io {
        /// Device name of the port.
        port: String,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

impl SerialError {
    /// Returns `true` for [`SerialError::Open`].
    pub fn is_open_failure(&self) -> bool {
        matches!(self, SerialError::Open { .. })
    }
}

/// Parameters used to open a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    /// Line speed in baud.
    pub baud: u32,
    /// How long a read waits for the first byte before it times out.
    pub timeout: Duration,
}

impl SerialSettings {
    /// Creates settings for the given baud rate and read timeout.
    pub fn new(baud: u32, timeout: Duration) -> Self {
        Self { baud, timeout }
    }
}

/// An open, bidirectional byte stream to a serial device.
///
/// Reads return [`io::ErrorKind::TimedOut`] (or `Ok(0)`) when no byte arrived
/// within the configured timeout.
pub trait SerialLink: Read + Write + Send {
    /// Discards everything received but not yet read.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Changes the read timeout.
    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;

    /// Opens a second handle to the same port, used by a reader thread.
    fn try_clone_link(&self) -> io::Result<Box<dyn SerialLink>>;
}

/// A serial port found during enumeration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortInfo {
    /// Device name, e.g. `/dev/ttyUSB0` or `COM3`.
    pub name: String,
    /// USB product string, if the port is a USB device.
    pub description: Option<String>,
}

impl PortInfo {
    /// Creates a port entry without a description.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
        }
    }
}

/// Enumerates and opens serial ports.
pub trait PortLister: fmt::Debug + Send + Sync {
    /// Lists all serial ports currently present.
    fn list(&self) -> Result<Vec<PortInfo>, SerialError>;

    /// Opens a port with exclusive access.
    fn open(&self, port: &str, settings: SerialSettings)
        -> Result<Box<dyn SerialLink>, SerialError>;
}

/// Entry point for enumerating and opening serial ports.
#[derive(Debug)]
pub struct Lister {
    lister: Box<dyn PortLister>,
}

impl Default for Lister {
    fn default() -> Self {
        Self::new()
    }
}

impl Lister {
    /// Creates a lister backed by the operating system's serial ports.
    pub fn new() -> Self {
        Self {
            lister: Box::new(NativePortLister),
        }
    }

    /// Creates a lister with a custom port backend.
    pub fn with_lister(lister: Box<dyn PortLister>) -> Self {
        Self { lister }
    }

    /// Lists all serial ports currently present.
    pub fn list(&self) -> Result<Vec<PortInfo>, SerialError> {
        self.lister.list()
    }

    /// Opens a port and returns its raw link.
    pub fn open(
        &self,
        port: &str,
        settings: SerialSettings,
    ) -> Result<Box<dyn SerialLink>, SerialError> {
        tracing::debug!("Opening {port} at {} baud", settings.baud);
        self.lister.open(port, settings)
    }
}

/// An open serial connection to a known device at a known baud rate.
///
/// The port is closed when the endpoint is dropped.
pub struct SerialEndpoint {
    device: String,
    settings: SerialSettings,
    link: Box<dyn SerialLink>,
}

impl fmt::Debug for SerialEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialEndpoint")
            .field("device", &self.device)
            .field("baud", &self.settings.baud)
            .finish()
    }
}

impl SerialEndpoint {
    /// Opens `device` through the given lister.
    pub fn open(
        lister: &Lister,
        device: &str,
        settings: SerialSettings,
    ) -> Result<Self, SerialError> {
        let link = lister.open(device, settings)?;

        Ok(Self {
            device: device.to_string(),
            settings,
            link,
        })
    }

    /// The device name this endpoint was opened on.
    pub fn device(&self) -> &str {
        &self.device
    }

    /// The baud rate this endpoint was opened with.
    pub fn baud(&self) -> u32 {
        self.settings.baud
    }

    /// Discards pending input.
    pub fn clear_input(&mut self) -> Result<(), SerialError> {
        self.link.clear_input().map_err(|source| self.io_error(source))
    }

    /// Changes the read timeout.
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<(), SerialError> {
        self.link
            .set_timeout(timeout)
            .map_err(|source| self.io_error(source))?;
        self.settings.timeout = timeout;
        Ok(())
    }

    /// Opens a second handle to the port for a concurrent reader.
    pub fn try_clone_link(&self) -> Result<Box<dyn SerialLink>, SerialError> {
        self.link
            .try_clone_link()
            .map_err(|source| self.io_error(source))
    }

    /// Wraps an I/O error with the device name of this endpoint.
    pub fn io_error(&self, source: io::Error) -> SerialError {
        SerialError::Io {
            port: self.device.clone(),
            source,
        }
    }

    /// Closes the port.
    pub fn close(self) {
        tracing::debug!("Closing {}", self.device);
    }
}

impl Read for SerialEndpoint {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.link.read(buf)
    }
}

impl Write for SerialEndpoint {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.link.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.link.flush()
    }
}

/// Returns `true` if the error only means that no data arrived in time.
pub fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
    )
}

/// Reads until `len` bytes arrived or a read times out, returning what was received.
pub fn read_available<R: Read + ?Sized>(reader: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0; len];
    let mut received = 0;

    while received < len {
        match reader.read(&mut buffer[received..]) {
            Ok(0) => break,
            Ok(n) => received += n,
            Err(e) if is_timeout(&e) => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    buffer.truncate(received);
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeLister, FakeSerialPort};
    use super::*;

    #[test]
    fn read_available_stops_at_timeout() {
        let port = FakeSerialPort::new("/dev/fake0");
        port.push_input(b"dw-");

        let mut link = port.clone();
        let data = read_available(&mut link, 7).unwrap();

        assert_eq!(data, b"dw-");
    }

    #[test]
    fn endpoint_reports_device_and_baud() {
        let port = FakeSerialPort::new("/dev/fake0");
        let lister = Lister::with_lister(Box::new(
            FakeLister::new().with_port("/dev/fake0", move |_| Ok(port.clone())),
        ));

        let endpoint = SerialEndpoint::open(
            &lister,
            "/dev/fake0",
            SerialSettings::new(230_400, Duration::from_millis(10)),
        )
        .unwrap();

        assert_eq!(endpoint.device(), "/dev/fake0");
        assert_eq!(endpoint.baud(), 230_400);
    }

    #[test]
    fn opening_an_unknown_port_fails() {
        let lister = Lister::with_lister(Box::new(FakeLister::new()));

        let error = SerialEndpoint::open(
            &lister,
            "/dev/missing",
            SerialSettings::new(115_200, Duration::ZERO),
        )
        .unwrap_err();

        assert!(error.is_open_failure());
    }
}
