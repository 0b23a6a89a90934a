use crate::stk500::{BootloaderInfo, Signature, VerifyMismatch};

/// A structure to manage the upload progress reporting.
///
/// This struct stores a handler closure which will be called every time an event happens during the upload.
///
/// # Example
///
/// ```
/// use dw_link::flashing::UploadProgress;
///
/// // Print events
/// let progress = UploadProgress::new(|event| println!("Event: {:#?}", event));
/// ```
pub struct UploadProgress {
    handler: Box<dyn Fn(ProgressEvent)>,
}

impl UploadProgress {
    /// Create a new `UploadProgress` structure with a given `handler` to be called on events.
    pub fn new(handler: impl Fn(ProgressEvent) + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// Emit an upload progress event.
    pub(crate) fn emit(&self, event: ProgressEvent) {
        (self.handler)(event);
    }
}

impl std::fmt::Debug for UploadProgress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("UploadProgress")
    }
}

/// Possible events during an upload.
///
/// If the upload works without problems, the events will arrive in the
/// following order:
///
/// * `Synchronized`
/// * `Identified`
/// * `StartedProgramming`
/// * `PageProgrammed` for every page
/// * `FinishedProgramming`
/// * `StartedVerifying`
/// * `PageVerified` for every page
/// * `FinishedVerifying`
/// * `LeftProgrammingMode`
/// * `AdapterAlive`
///
/// `FirmwareMessage` can arrive at any point after `Synchronized`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgressEvent {
    /// The bootloader answered the sync request.
    Synchronized,
    /// The bootloader version and device signature have been read.
    Identified(BootloaderInfo),
    /// The device signature is not one of the supported ones.
    UnsupportedSignature(Signature),
    /// Programming of the pages has started.
    StartedProgramming {
        /// Total number of bytes that will be programmed.
        total: usize,
    },
    /// A page has been programmed successfully.
    PageProgrammed {
        /// Start address of the page.
        address: u32,
        /// The number of image bytes in the page.
        size: usize,
    },
    /// Programming of the pages has finished successfully.
    FinishedProgramming,
    /// Reading back the pages has started.
    StartedVerifying {
        /// Total number of bytes that will be compared.
        total: usize,
    },
    /// A page has been read back and matches the image.
    PageVerified {
        /// Start address of the page.
        address: u32,
        /// The number of bytes compared.
        size: usize,
    },
    /// Verification stopped at a byte that differs from the image.
    VerifyMismatch(VerifyMismatch),
    /// Reading back the pages has finished.
    FinishedVerifying,
    /// A text line the device sent between protocol bytes.
    FirmwareMessage(String),
    /// The bootloader acknowledged the leave command.
    LeftProgrammingMode,
    /// Whether the freshly uploaded adapter firmware answered the enquiry.
    AdapterAlive(bool),
}
