use crate::bridge::BridgeError;
use crate::flashing::ImageError;
use crate::serial::SerialError;
use crate::stk500::UploadError;

/// The overarching error type which contains all possible errors as variants.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum Error {
    /// No dw-link adapter was discovered.
    AdapterNotFound,
    /// A serial port operation failed.
    Serial(#[from] SerialError),
    /// The firmware image could not be loaded.
    Image(#[from] ImageError),
    /// The firmware upload failed.
    Upload(#[from] UploadError),
    /// The TCP bridge failed.
    Bridge(#[from] BridgeError),
}

impl Error {
    /// Returns `true` if the error was caused by a serial port that could not be opened.
    ///
    /// This looks through upload and bridge errors as well, since both open a port first.
    pub fn is_serial_open_failure(&self) -> bool {
        match self {
            Error::Serial(error) => error.is_open_failure(),
            Error::Upload(UploadError::Serial(error)) => error.is_open_failure(),
            Error::Bridge(BridgeError::Serial(error)) => error.is_open_failure(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;

    #[test]
    fn open_failures_are_recognized_through_wrappers() {
        let open = || SerialError::Open {
            port: "/dev/ttyUSB0".to_string(),
            source: io::Error::from(io::ErrorKind::PermissionDenied),
        };

        assert!(Error::Serial(open()).is_serial_open_failure());
        assert!(Error::Upload(UploadError::Serial(open())).is_serial_open_failure());
        assert!(Error::Bridge(BridgeError::Serial(open())).is_serial_open_failure());
        assert!(!Error::AdapterNotFound.is_serial_open_failure());
    }
}
