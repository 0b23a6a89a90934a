//! Firmware upload through an STK500v1 bootloader.
//!
//! This is how a fresh dw-link firmware gets onto an Arduino Uno or Nano: the
//! board's bootloader runs for a moment after reset, which opening the serial
//! port triggers, and accepts page writes over the serial line.

mod error;
pub mod protocol;
mod session;

pub use error::UploadError;
pub use protocol::{Opcode, Signature};
pub use session::{
    BootloaderInfo, SessionState, UploadOptions, UploadReport, UploadSession, VerifyMismatch,
};
