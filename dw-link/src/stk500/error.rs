use crate::flashing::ImageError;
use crate::serial::SerialError;

use super::{Opcode, SessionState, Signature};

/// Errors of an upload session.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum UploadError {
    /// Serial communication failed.
    Serial(#[from] SerialError),
    /// The firmware image cannot be uploaded.
    Image(#[from] ImageError),
    /// The session has no open serial port.
    NotConnected,
    /// Cannot {operation} while the session is {state:?}.
    InvalidState {
        /// The requested step.
        operation: &'static str,
        /// The state the session was in.
        state: SessionState,
    },
    /// Bootloader answered {opcode} with {received:#04x}, expected {expected:#04x}.
    Ack {
        /// The request being answered.
        opcode: Opcode,
        /// The framing byte that should have arrived.
        expected: u8,
        /// The byte that arrived instead.
        received: u8,
    },
    /// No data read, timeout? (read={received}, wanted={wanted})
    ReadTimeout {
        /// Number of bytes requested.
        wanted: usize,
        /// Number of bytes received before the timeout.
        received: usize,
    },
    /// Cannot get in sync with the bootloader after {attempts} attempts.
    CannotSync {
        /// Number of sync requests sent.
        attempts: usize,
        /// The failure of the last attempt.
        #[source]
        last: Box<UploadError>,
    },
    /// Device signature {0} is not an ATmega328 variant.
    UnsupportedSignature(Signature),
    /// Transfer of the page at {address:#06x} failed.
    Page {
        /// Start address of the page.
        address: u32,
        /// What went wrong.
        #[source]
        source: Box<UploadError>,
    },
}
