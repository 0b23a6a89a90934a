//! Firmware images and the flash they are written to.
//!
//! A [`FlashImage`] is loaded from an Intel hex file and laid out starting at
//! address zero. The [`FlashGeometry`] describes how the target's flash is split
//! into pages, which is the unit the bootloader programs and reads back.

mod geometry;
mod image;
mod progress;

pub use geometry::FlashGeometry;
pub use image::{FlashImage, ImageError};
pub use progress::{ProgressEvent, UploadProgress};
