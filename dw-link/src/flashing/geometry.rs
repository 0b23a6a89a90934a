use super::ImageError;

/// Size and page layout of a target's program flash.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashGeometry {
    capacity: u32,
    page_size: u16,
}

impl FlashGeometry {
    /// The flash of the ATmega328 family: 32 KiB in 256 pages of 128 bytes.
    pub const ATMEGA328P: FlashGeometry = FlashGeometry {
        capacity: 32_768,
        page_size: 128,
    };

    /// Creates a geometry, checking that the capacity is a whole number of pages.
    pub fn new(capacity: u32, page_size: u16) -> Result<Self, ImageError> {
        if page_size == 0 || capacity % u32::from(page_size) != 0 {
            return Err(ImageError::InvalidGeometry {
                capacity,
                page_size,
            });
        }

        Ok(Self {
            capacity,
            page_size,
        })
    }

    /// Total flash size in bytes.
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u16 {
        self.page_size
    }

    /// Number of pages.
    pub fn page_count(&self) -> u32 {
        self.capacity / u32::from(self.page_size)
    }

    /// Start offsets of the pages touched by an image of `len` bytes.
    pub fn page_offsets(&self, len: usize) -> impl Iterator<Item = u32> {
        let len = u32::try_from(len).unwrap_or(u32::MAX).min(self.capacity);
        (0..len).step_by(usize::from(self.page_size))
    }
}

impl Default for FlashGeometry {
    fn default() -> Self {
        Self::ATMEGA328P
    }
}
