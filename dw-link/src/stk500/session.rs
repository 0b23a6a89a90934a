use std::io::{self, Read, Write};
use std::thread;
use std::time::Duration;

use crate::discovery;
use crate::flashing::{FlashGeometry, FlashImage, ImageError, ProgressEvent, UploadProgress};
use crate::serial::{is_timeout, Lister, SerialEndpoint, SerialSettings};

use super::protocol::{Command, Parameter, MESSAGE_MARKER, RESP_STK_INSYNC, RESP_STK_OK};
use super::{Opcode, Signature, UploadError};

/// Timing and target parameters of an upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOptions {
    /// Line speed of the bootloader.
    pub baud: u32,
    /// Read timeout for every reply byte.
    pub read_timeout: Duration,
    /// Requests are written in bursts of at most this many bytes.
    pub burst_size: usize,
    /// Pause after every burst, so the bootloader's receive buffer does not overflow.
    pub burst_delay: Duration,
    /// Sync requests per connect attempt.
    pub sync_attempts: usize,
    /// Pause before every sync request.
    pub sync_delay: Duration,
    /// Connect attempts before giving up.
    pub connect_attempts: usize,
    /// Pause between leaving programming mode and checking the adapter.
    pub liveness_delay: Duration,
    /// Flash layout of the target.
    pub geometry: FlashGeometry,
    /// Device signatures the image may be uploaded to.
    pub supported_signatures: Vec<Signature>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            baud: 115_200,
            read_timeout: Duration::from_millis(400),
            burst_size: 32,
            burst_delay: Duration::from_millis(10),
            sync_attempts: 5,
            sync_delay: Duration::from_millis(200),
            connect_attempts: 3,
            liveness_delay: Duration::from_millis(100),
            geometry: FlashGeometry::ATMEGA328P,
            supported_signatures: Signature::SUPPORTED.to_vec(),
        }
    }
}

impl UploadOptions {
    /// Serial settings used to open the bootloader's port.
    pub fn serial_settings(&self) -> SerialSettings {
        SerialSettings::new(self.baud, self.read_timeout)
    }
}

/// Lifecycle of an [`UploadSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No port is open.
    Disconnected,
    /// The port is open and sync requests are being sent.
    Syncing,
    /// The bootloader answered a sync request.
    Connected,
    /// Pages are being written.
    Programming,
    /// Pages are being read back.
    Verifying,
    /// The leave command was sent.
    Detached,
}

/// Version and signature reported by the bootloader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderInfo {
    /// Major software version.
    pub major: u8,
    /// Minor software version.
    pub minor: u8,
    /// Device signature.
    pub signature: Signature,
}

/// The first byte read back that differs from the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerifyMismatch {
    /// Start address of the page.
    pub page: u32,
    /// Absolute flash address of the byte.
    pub address: u32,
    /// Byte in the image.
    pub expected: u8,
    /// Byte read from flash.
    pub observed: u8,
}

/// Outcome of a complete upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    /// What the bootloader reported about itself and the device.
    pub bootloader: BootloaderInfo,
    /// Number of image bytes written.
    pub bytes_programmed: usize,
    /// Number of bytes compared while verifying.
    pub bytes_verified: usize,
    /// The first difference found while verifying, if any.
    pub mismatch: Option<VerifyMismatch>,
    /// Whether the adapter answered the enquiry after the upload.
    pub adapter_alive: bool,
}

/// Uploads one firmware image through an STK500v1 bootloader.
///
/// The steps are [`connect`](Self::connect), [`identify`](Self::identify),
/// [`program`](Self::program), [`verify`](Self::verify) and
/// [`leave`](Self::leave). [`run`](Self::run) performs all of them and makes sure
/// the bootloader is told to leave programming mode on every error after
/// programming began.
#[derive(Debug)]
pub struct UploadSession {
    device: String,
    image: FlashImage,
    options: UploadOptions,
    progress: Option<UploadProgress>,
    endpoint: Option<SerialEndpoint>,
    state: SessionState,
}

impl UploadSession {
    /// Prepares an upload of `image` to the bootloader on `device`.
    pub fn new(
        device: impl Into<String>,
        image: FlashImage,
        options: UploadOptions,
    ) -> Result<Self, UploadError> {
        let capacity = options.geometry.capacity();
        if image.len() > capacity as usize {
            return Err(ImageError::OutOfRange {
                address: capacity,
                capacity,
            }
            .into());
        }

        Ok(Self {
            device: device.into(),
            image,
            options,
            progress: None,
            endpoint: None,
            state: SessionState::Disconnected,
        })
    }

    /// Reports progress to the given handler.
    pub fn with_progress(mut self, progress: UploadProgress) -> Self {
        self.progress = Some(progress);
        self
    }

    /// The current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Runs the whole upload.
    pub fn run(mut self, lister: &Lister) -> Result<UploadReport, UploadError> {
        self.connect(lister)?;
        let bootloader = self.identify()?;

        let (bytes_programmed, bytes_verified, mismatch) = match self.program_and_verify() {
            Ok(outcome) => outcome,
            Err(error) => {
                if let Err(leave_error) = self.leave_programming_mode() {
                    tracing::warn!("Could not leave programming mode: {leave_error}");
                }
                return Err(error);
            }
        };

        let adapter_alive = self.leave()?;

        Ok(UploadReport {
            bootloader,
            bytes_programmed,
            bytes_verified,
            mismatch,
            adapter_alive,
        })
    }

    fn program_and_verify(&mut self) -> Result<(usize, usize, Option<VerifyMismatch>), UploadError> {
        let programmed = self.program()?;
        let (verified, mismatch) = self.verify()?;
        Ok((programmed, verified, mismatch))
    }

    /// Opens the port and gets in sync with the bootloader.
    pub fn connect(&mut self, lister: &Lister) -> Result<(), UploadError> {
        self.require("connect", &[SessionState::Disconnected])?;

        self.endpoint = Some(SerialEndpoint::open(
            lister,
            &self.device,
            self.options.serial_settings(),
        )?);
        self.state = SessionState::Syncing;

        let mut last_error = None;
        for attempt in 1..=self.options.connect_attempts {
            match self.sync() {
                Ok(()) => {
                    self.state = SessionState::Connected;
                    self.emit(ProgressEvent::Synchronized);
                    return Ok(());
                }
                Err(error) => {
                    tracing::debug!(
                        "Connect attempt {attempt}/{} failed: {error}",
                        self.options.connect_attempts
                    );
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(UploadError::CannotSync {
            attempts: 0,
            last: Box::new(UploadError::NotConnected),
        }))
    }

    /// Sends sync requests until one is answered.
    fn sync(&mut self) -> Result<(), UploadError> {
        let attempts = self.options.sync_attempts;
        let mut last_error = UploadError::NotConnected;

        for _ in 0..attempts {
            thread::sleep(self.options.sync_delay);

            let endpoint = self.endpoint()?;
            endpoint.clear_input()?;

            match self.command(&Command::GetSync) {
                Ok(_) => return Ok(()),
                Err(error) => {
                    tracing::trace!("Sync failed: {error}");
                    last_error = error;
                }
            }
        }

        Err(UploadError::CannotSync {
            attempts,
            last: Box::new(last_error),
        })
    }

    /// Reads the bootloader version and the device signature.
    ///
    /// Fails with [`UploadError::UnsupportedSignature`] for devices other than
    /// the ATmega328 variants; nothing has been written at that point.
    pub fn identify(&mut self) -> Result<BootloaderInfo, UploadError> {
        self.require("identify", &[SessionState::Connected])?;

        let major = self.command(&Command::GetParameter(Parameter::SoftwareMajor))?[0];
        let minor = self.command(&Command::GetParameter(Parameter::SoftwareMinor))?[0];
        let bytes = self.command(&Command::ReadSignature)?;
        let signature = Signature([bytes[0], bytes[1], bytes[2]]);

        tracing::debug!("Bootloader version {major}.{minor}, signature {signature}");

        if !self.options.supported_signatures.contains(&signature) {
            self.emit(ProgressEvent::UnsupportedSignature(signature));
            return Err(UploadError::UnsupportedSignature(signature));
        }

        let info = BootloaderInfo {
            major,
            minor,
            signature,
        };
        self.emit(ProgressEvent::Identified(info));

        Ok(info)
    }

    /// Writes the image page by page and returns the number of bytes written.
    ///
    /// The last page only carries the bytes covered by the image.
    pub fn program(&mut self) -> Result<usize, UploadError> {
        self.require("program", &[SessionState::Connected])?;
        self.state = SessionState::Programming;

        let page_size = self.options.geometry.page_size();
        let total = self.image.len();
        self.emit(ProgressEvent::StartedProgramming { total });

        let mut written = 0;
        for address in self.options.geometry.page_offsets(total) {
            let page = self.image.page(address, page_size).to_vec();

            self.program_page(address, &page)
                .map_err(|source| UploadError::Page {
                    address,
                    source: Box::new(source),
                })?;

            written += page.len();
            self.emit(ProgressEvent::PageProgrammed {
                address,
                size: page.len(),
            });
        }

        self.emit(ProgressEvent::FinishedProgramming);
        Ok(written)
    }

    fn program_page(&mut self, address: u32, data: &[u8]) -> Result<(), UploadError> {
        self.command(&Command::LoadAddress(address))?;
        self.command(&Command::ProgramPage(data))?;
        Ok(())
    }

    /// Reads back every page and compares it with the image.
    ///
    /// Returns the number of bytes compared and the first mismatch. Verification
    /// stops at the first page containing a difference; a mismatch is reported,
    /// not raised as an error.
    pub fn verify(&mut self) -> Result<(usize, Option<VerifyMismatch>), UploadError> {
        self.require("verify", &[SessionState::Programming])?;
        self.state = SessionState::Verifying;

        let page_size = self.options.geometry.page_size();
        let total = self.image.len();
        self.emit(ProgressEvent::StartedVerifying { total });

        let mut compared = 0;
        let mut mismatch = None;

        for address in self.options.geometry.page_offsets(total) {
            let expected = self.image.page(address, page_size).to_vec();

            let observed = self
                .read_page(address, page_size)
                .map_err(|source| UploadError::Page {
                    address,
                    source: Box::new(source),
                })?;
            let observed = &observed[..expected.len()];
            compared += expected.len();

            if let Some(offset) = expected.iter().zip(observed).position(|(e, o)| e != o) {
                let found = VerifyMismatch {
                    page: address,
                    address: address + offset as u32,
                    expected: expected[offset],
                    observed: observed[offset],
                };
                tracing::warn!(
                    "Verification failed in page {:#06x} at {:#06x}: expected {:#04x}, read {:#04x}",
                    found.page,
                    found.address,
                    found.expected,
                    found.observed
                );
                self.emit(ProgressEvent::VerifyMismatch(found));
                mismatch = Some(found);
                break;
            }

            self.emit(ProgressEvent::PageVerified {
                address,
                size: expected.len(),
            });
        }

        self.emit(ProgressEvent::FinishedVerifying);
        Ok((compared, mismatch))
    }

    fn read_page(&mut self, address: u32, page_size: u16) -> Result<Vec<u8>, UploadError> {
        self.command(&Command::LoadAddress(address))?;
        self.command(&Command::ReadPage(page_size))
    }

    /// Leaves programming mode and checks that the new adapter firmware answers.
    ///
    /// Returns whether the adapter responded to the enquiry.
    pub fn leave(&mut self) -> Result<bool, UploadError> {
        self.require(
            "leave programming mode",
            &[
                SessionState::Connected,
                SessionState::Programming,
                SessionState::Verifying,
            ],
        )?;
        self.leave_programming_mode()?;

        thread::sleep(self.options.liveness_delay);

        let delay = self.options.liveness_delay;
        let endpoint = self.endpoint()?;
        let alive = match discovery::inquire(endpoint, delay) {
            Ok(alive) => alive,
            Err(e) => {
                tracing::debug!("Enquiry after upload failed: {e}");
                false
            }
        };

        self.emit(ProgressEvent::AdapterAlive(alive));
        Ok(alive)
    }

    fn leave_programming_mode(&mut self) -> Result<(), UploadError> {
        self.command(&Command::LeaveProgMode)?;
        self.state = SessionState::Detached;
        self.emit(ProgressEvent::LeftProgrammingMode);
        Ok(())
    }

    /// Closes the port.
    pub fn close(mut self) {
        if let Some(endpoint) = self.endpoint.take() {
            endpoint.close();
        }
        self.state = SessionState::Disconnected;
    }

    /// Sends one request and returns the reply payload.
    fn command(&mut self, command: &Command<'_>) -> Result<Vec<u8>, UploadError> {
        let opcode = command.opcode();
        tracing::trace!("Sending {opcode}");

        self.write(&command.to_bytes())?;
        self.expect(opcode, RESP_STK_INSYNC)?;

        let payload = match command.reply_len() {
            0 => Vec::new(),
            1 => vec![self.read_byte()?],
            len => self.read_exact(len)?,
        };

        self.expect(opcode, RESP_STK_OK)?;
        Ok(payload)
    }

    fn expect(&mut self, opcode: Opcode, expected: u8) -> Result<(), UploadError> {
        let received = self.read_byte()?;
        if received != expected {
            return Err(UploadError::Ack {
                opcode,
                expected,
                received,
            });
        }
        Ok(())
    }

    fn write(&mut self, frame: &[u8]) -> Result<(), UploadError> {
        tracing::trace!("> {:02x?}", frame);

        let burst_size = self.options.burst_size.max(1);
        let burst_delay = self.options.burst_delay;
        let endpoint = self.endpoint()?;

        for burst in frame.chunks(burst_size) {
            let result = endpoint.write_all(burst).and_then(|()| endpoint.flush());
            result.map_err(|e| endpoint.io_error(e))?;
            thread::sleep(burst_delay);
        }

        Ok(())
    }

    /// Reads one protocol byte, printing any firmware text lines in between.
    fn read_byte(&mut self) -> Result<u8, UploadError> {
        loop {
            let byte = self.read_exact(1)?[0];
            if byte != MESSAGE_MARKER {
                return Ok(byte);
            }
            self.read_message()?;
        }
    }

    /// Reads a text line up to `\n`; the leading marker is already consumed.
    fn read_message(&mut self) -> Result<(), UploadError> {
        let mut line = Vec::new();
        loop {
            match self.read_exact(1)?[0] {
                b'\n' => break,
                b'\r' => {}
                byte => line.push(byte),
            }
        }

        if !line.is_empty() {
            let text = String::from_utf8_lossy(&line).into_owned();
            tracing::info!("[......] {text}");
            self.emit(ProgressEvent::FirmwareMessage(text));
        }

        Ok(())
    }

    fn read_exact(&mut self, wanted: usize) -> Result<Vec<u8>, UploadError> {
        let endpoint = self.endpoint()?;
        let mut buffer = vec![0; wanted];
        let mut received = 0;

        while received < wanted {
            match endpoint.read(&mut buffer[received..]) {
                Ok(0) => break,
                Ok(n) => received += n,
                Err(e) if is_timeout(&e) => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(endpoint.io_error(e).into()),
            }
        }

        if received < wanted {
            return Err(UploadError::ReadTimeout { wanted, received });
        }

        tracing::trace!("< {:02x?}", buffer);
        Ok(buffer)
    }

    fn endpoint(&mut self) -> Result<&mut SerialEndpoint, UploadError> {
        self.endpoint.as_mut().ok_or(UploadError::NotConnected)
    }

    fn require(
        &self,
        operation: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), UploadError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(UploadError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(progress) = &self.progress {
            progress.emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::serial::fake::{FakeLister, FakeSerialPort};

    fn quick_options() -> UploadOptions {
        UploadOptions {
            read_timeout: Duration::from_millis(20),
            burst_delay: Duration::ZERO,
            sync_delay: Duration::ZERO,
            liveness_delay: Duration::ZERO,
            ..UploadOptions::default()
        }
    }

    fn lister_for(port: &FakeSerialPort) -> Lister {
        let port = port.clone();
        Lister::with_lister(Box::new(
            FakeLister::new().with_port(port.name().to_string(), move |_| Ok(port.clone())),
        ))
    }

    fn image(len: usize) -> FlashImage {
        FlashImage::from_bytes(vec![0x42; len], &FlashGeometry::ATMEGA328P).unwrap()
    }

    #[test]
    fn silent_device_cannot_sync() {
        let port = FakeSerialPort::new("/dev/ttyUSB0");
        let lister = lister_for(&port);
        let options = UploadOptions {
            read_timeout: Duration::ZERO,
            ..quick_options()
        };

        let mut session = UploadSession::new("/dev/ttyUSB0", image(4), options).unwrap();
        let error = session.connect(&lister).unwrap_err();

        assert!(matches!(error, UploadError::CannotSync { attempts: 5, .. }));
        // Three connect attempts of five sync requests each.
        assert_eq!(port.written(), [0x30, 0x20].repeat(15));
        assert_eq!(port.input_clears(), 15);
    }

    #[test]
    fn programming_requires_a_connection() {
        let mut session = UploadSession::new("/dev/ttyUSB0", image(4), quick_options()).unwrap();

        let error = session.program().unwrap_err();

        assert!(matches!(
            error,
            UploadError::InvalidState {
                state: SessionState::Disconnected,
                ..
            }
        ));
    }

    #[test]
    fn image_larger_than_flash_is_rejected() {
        let options = UploadOptions {
            geometry: FlashGeometry::new(256, 128).unwrap(),
            ..quick_options()
        };

        let error = UploadSession::new("/dev/ttyUSB0", image(300), options).unwrap_err();

        assert!(matches!(error, UploadError::Image(ImageError::OutOfRange { .. })));
    }

    #[test]
    fn firmware_messages_are_reported_and_skipped() {
        let port = FakeSerialPort::with_responder("/dev/ttyUSB0", |written| {
            if written == [0x30, 0x20] {
                b"!hello\r\n!\r\n\x14\x10".to_vec()
            } else {
                Vec::new()
            }
        });
        let lister = lister_for(&port);
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();

        let mut session = UploadSession::new("/dev/ttyUSB0", image(4), quick_options())
            .unwrap()
            .with_progress(UploadProgress::new(move |event| {
                sink.lock().unwrap().push(event)
            }));
        session.connect(&lister).unwrap();

        assert_eq!(session.state(), SessionState::Connected);
        assert_eq!(
            *events.lock().unwrap(),
            vec![
                ProgressEvent::FirmwareMessage("hello".to_string()),
                ProgressEvent::Synchronized
            ]
        );
    }
}
