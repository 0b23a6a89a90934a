use std::path::Path;

use ihex::Record;

use super::FlashGeometry;

/// Value of erased flash, used for gaps between hex records.
const ERASED: u8 = 0xFF;

/// Errors while loading a firmware image.
#[derive(Debug, thiserror::Error, docsplay::Display)]
pub enum ImageError {
    /// Could not read the image file {path}.
    Read {
        /// The file that failed to load.
        path: String,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The Intel hex data is malformed.
    Parse(#[from] ihex::ReaderError),
    /// The image contains no data.
    Empty,
    /// Data at {address:#06x} lies outside of the {capacity} bytes of flash.
    OutOfRange {
        /// First address that does not fit.
        address: u32,
        /// Size of the flash.
        capacity: u32,
    },
    /// A flash of {capacity} bytes cannot be split into pages of {page_size} bytes.
    InvalidGeometry {
        /// Requested flash size.
        capacity: u32,
        /// Requested page size.
        page_size: u16,
    },
}

/// A contiguous firmware image starting at flash address zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashImage {
    data: Vec<u8>,
}

impl FlashImage {
    /// Wraps raw bytes, checking that they fit into the flash.
    pub fn from_bytes(data: Vec<u8>, geometry: &FlashGeometry) -> Result<Self, ImageError> {
        if data.is_empty() {
            return Err(ImageError::Empty);
        }

        let len = u32::try_from(data.len()).unwrap_or(u32::MAX);
        if len > geometry.capacity() {
            return Err(ImageError::OutOfRange {
                address: geometry.capacity(),
                capacity: geometry.capacity(),
            });
        }

        Ok(Self { data })
    }

    /// Reads an Intel hex file.
    pub fn from_hex_file(
        path: impl AsRef<Path>,
        geometry: &FlashGeometry,
    ) -> Result<Self, ImageError> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|source| ImageError::Read {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_hex_str(&contents, geometry)
    }

    /// Parses Intel hex data.
    ///
    /// Data records may appear in any order; gaps are filled with `0xFF` and the
    /// image ends at the highest address written.
    pub fn from_hex_str(hex: &str, geometry: &FlashGeometry) -> Result<Self, ImageError> {
        let mut data = Vec::new();
        let mut base_address = 0u32;

        for record in ihex::Reader::new(hex) {
            match record? {
                Record::Data { offset, value } => {
                    let start = base_address.saturating_add(u32::from(offset));
                    let end = start.saturating_add(value.len() as u32);
                    if end > geometry.capacity() {
                        return Err(ImageError::OutOfRange {
                            address: start.max(geometry.capacity()),
                            capacity: geometry.capacity(),
                        });
                    }

                    let (start, end) = (start as usize, end as usize);
                    if data.len() < end {
                        data.resize(end, ERASED);
                    }
                    data[start..end].copy_from_slice(&value);
                }
                Record::ExtendedSegmentAddress(segment) => base_address = u32::from(segment) * 16,
                Record::ExtendedLinearAddress(upper) => base_address = u32::from(upper) << 16,
                Record::EndOfFile => break,
                Record::StartSegmentAddress { .. } | Record::StartLinearAddress(_) => {}
            }
        }

        Self::from_bytes(data, geometry)
    }

    /// Image length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Always `false`; empty images are rejected when loading.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The whole image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// The part of the page starting at `offset` that is covered by the image.
    ///
    /// All pages are `page_size` long except the last, which may be shorter.
    pub fn page(&self, offset: u32, page_size: u16) -> &[u8] {
        let start = (offset as usize).min(self.data.len());
        let end = (start + usize::from(page_size)).min(self.data.len());
        &self.data[start..end]
    }
}
