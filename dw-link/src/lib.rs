//! # dw-link
//!
//! Host-side communication stack for the dw-link debugWIRE adapter.
//!
//! The adapter is an Arduino running the dw-link firmware. It shows up as an
//! ordinary USB serial port and speaks the GDB remote serial protocol on it.
//! This crate provides the three pieces a host needs around that:
//!
//! - [`discovery`] finds the adapter among the serial ports of the machine by
//!   sending an inquiry byte and waiting for the `dw-link` signature.
//! - [`stk500`] uploads a new firmware image into an ATmega328 board through its
//!   STK500v1 bootloader and verifies it afterwards.
//! - [`bridge`] exposes the adapter on a TCP port, so a GDB client can use
//!   `target extended-remote host:port` instead of talking to the serial port.
//!
//! ## Examples
//!
//! ### Finding the adapter
//!
//! ```no_run
//! use dw_link::discovery::{discover, DiscoveryOptions};
//! use dw_link::serial::Lister;
//!
//! let lister = Lister::new();
//! match discover(&lister, &DiscoveryOptions::default()) {
//!     Some(found) => println!("dw-link on {} at {} baud", found.device, found.baud),
//!     None => println!("no adapter"),
//! }
//! ```
//!
//! ### Uploading firmware
//!
//! ```no_run
//! use dw_link::flashing::{FlashGeometry, FlashImage};
//! use dw_link::serial::Lister;
//! use dw_link::stk500::{UploadOptions, UploadSession};
//!
//! # fn main() -> Result<(), dw_link::Error> {
//! let lister = Lister::new();
//! let image = FlashImage::from_hex_file("dw-link.hex", &FlashGeometry::ATMEGA328P)?;
//! let report = UploadSession::new("/dev/ttyUSB0", image, UploadOptions::default())?.run(&lister)?;
//! println!("programmed {} bytes", report.bytes_programmed);
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod discovery;
mod error;
pub mod flashing;
pub mod serial;
pub mod stk500;

pub use crate::error::Error;
