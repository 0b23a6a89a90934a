//! Uploads against a simulated Optiboot-style bootloader.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dw_link::flashing::{FlashGeometry, FlashImage, ProgressEvent, UploadProgress};
use dw_link::serial::fake::{FakeLister, FakeSerialPort};
use dw_link::serial::Lister;
use dw_link::stk500::{Signature, UploadError, UploadOptions, UploadSession, VerifyMismatch};
use pretty_assertions::assert_eq;
use test_case::test_case;

const PORT: &str = "/dev/ttyUSB0";

/// Byte-level model of the bootloader side of the link.
struct Bootloader {
    signature: [u8; 3],
    flash: Vec<u8>,
    address: usize,
    pending: Vec<u8>,
    frames: Vec<Vec<u8>>,
    /// Status byte sent after `INSYNC` for a sync request.
    sync_status: u8,
    /// Answer the n-th page write (0-based) with a bad status byte.
    fail_page_write: Option<usize>,
    /// Flash byte that reads back differently from what was written.
    corrupt_at: Option<usize>,
    /// Stop every page read reply after `INSYNC` and this many data bytes.
    truncate_read_page: Option<usize>,
    /// Text line sent in front of the signature reply.
    chatter: Option<&'static [u8]>,
    page_writes: usize,
}

impl Bootloader {
    fn new() -> Self {
        Self {
            signature: [0x1E, 0x95, 0x0F],
            flash: vec![0xFF; 32_768],
            address: 0,
            pending: Vec::new(),
            frames: Vec::new(),
            sync_status: 0x10,
            fail_page_write: None,
            corrupt_at: None,
            truncate_read_page: None,
            chatter: None,
            page_writes: 0,
        }
    }

    fn frame_len(&self) -> Option<usize> {
        let buffer = &self.pending;
        let len = match *buffer.first()? {
            0x05 => 1,
            0x30 | 0x51 | 0x75 => 2,
            0x41 => 3,
            0x55 => 4,
            0x74 => 5,
            0x64 => {
                let size = u16::from_be_bytes([*buffer.get(1)?, *buffer.get(2)?]);
                5 + usize::from(size)
            }
            _ => 1,
        };
        (buffer.len() >= len).then_some(len)
    }

    fn feed(&mut self, chunk: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(chunk);
        let mut reply = Vec::new();

        while let Some(len) = self.frame_len() {
            let frame: Vec<u8> = self.pending.drain(..len).collect();
            reply.extend(self.answer(&frame));
            self.frames.push(frame);
        }

        reply
    }

    fn answer(&mut self, frame: &[u8]) -> Vec<u8> {
        match frame[0] {
            0x05 => b"dw-link".to_vec(),
            0x30 => vec![0x14, self.sync_status],
            0x41 => match frame[1] {
                0x81 => vec![0x14, 0x08, 0x10],
                _ => vec![0x14, 0x03, 0x10],
            },
            0x75 => {
                let mut reply = self.chatter.map(<[u8]>::to_vec).unwrap_or_default();
                reply.push(0x14);
                reply.extend_from_slice(&self.signature);
                reply.push(0x10);
                reply
            }
            0x55 => {
                self.address = usize::from(u16::from_le_bytes([frame[1], frame[2]])) * 2;
                vec![0x14, 0x10]
            }
            0x64 => {
                let index = self.page_writes;
                self.page_writes += 1;
                if self.fail_page_write == Some(index) {
                    return vec![0x14, 0x11];
                }
                let data = &frame[4..frame.len() - 1];
                self.flash[self.address..self.address + data.len()].copy_from_slice(data);
                vec![0x14, 0x10]
            }
            0x74 => {
                let size = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
                let mut page = self.flash[self.address..self.address + size].to_vec();
                if let Some(corrupt) = self.corrupt_at {
                    if (self.address..self.address + size).contains(&corrupt) {
                        page[corrupt - self.address] ^= 0xFF;
                    }
                }
                let mut reply = vec![0x14];
                if let Some(sent) = self.truncate_read_page {
                    reply.extend_from_slice(&page[..sent]);
                    return reply;
                }
                reply.extend(page);
                reply.push(0x10);
                reply
            }
            0x51 => vec![0x14, 0x10],
            _ => Vec::new(),
        }
    }

    fn frames_with_opcode(&self, opcode: u8) -> Vec<Vec<u8>> {
        self.frames
            .iter()
            .filter(|frame| frame[0] == opcode)
            .cloned()
            .collect()
    }
}

fn attach(bootloader: Bootloader) -> (Lister, Arc<Mutex<Bootloader>>) {
    let bootloader = Arc::new(Mutex::new(bootloader));
    let device = bootloader.clone();
    let port = FakeSerialPort::with_responder(PORT, move |chunk| device.lock().unwrap().feed(chunk));
    let lister = Lister::with_lister(Box::new(
        FakeLister::new().with_port(PORT, move |_| Ok(port.clone())),
    ));

    (lister, bootloader)
}

fn options() -> UploadOptions {
    UploadOptions {
        read_timeout: Duration::from_millis(50),
        burst_delay: Duration::ZERO,
        sync_delay: Duration::ZERO,
        liveness_delay: Duration::ZERO,
        ..UploadOptions::default()
    }
}

fn image(len: usize) -> FlashImage {
    let data = (0..len).map(|i| (i % 251) as u8).collect();
    FlashImage::from_bytes(data, &FlashGeometry::ATMEGA328P).unwrap()
}

#[test]
fn uploads_image_with_partial_last_page() {
    let (lister, bootloader) = attach(Bootloader::new());

    let report = UploadSession::new(PORT, image(130), options())
        .unwrap()
        .run(&lister)
        .unwrap();

    assert_eq!(report.bytes_programmed, 130);
    assert_eq!(report.bytes_verified, 130);
    assert_eq!(report.mismatch, None);
    assert!(report.adapter_alive);
    assert_eq!(report.bootloader.major, 8);
    assert_eq!(report.bootloader.signature, Signature::ATMEGA328P);

    let bootloader = bootloader.lock().unwrap();
    let pages = bootloader.frames_with_opcode(0x64);
    assert_eq!(pages.len(), 2);
    assert_eq!(&pages[1][..4], &[0x64, 0x00, 0x02, b'F']);
    assert_eq!(&bootloader.flash[..130], image(130).as_bytes());
    assert_eq!(bootloader.frames_with_opcode(0x51).len(), 1);

    let addresses = bootloader.frames_with_opcode(0x55);
    assert_eq!(
        addresses,
        vec![
            vec![0x55, 0x00, 0x00, 0x20],
            vec![0x55, 0x40, 0x00, 0x20],
            vec![0x55, 0x00, 0x00, 0x20],
            vec![0x55, 0x40, 0x00, 0x20],
        ]
    );
}

#[test_case([0x1E, 0x95, 0x0F]; "atmega328p")]
#[test_case([0x1E, 0x95, 0x14]; "atmega328")]
#[test_case([0x1E, 0x95, 0x16]; "atmega328pb")]
fn supported_signatures_are_programmed(signature: [u8; 3]) {
    let mut device = Bootloader::new();
    device.signature = signature;
    let (lister, bootloader) = attach(device);

    let report = UploadSession::new(PORT, image(130), options())
        .unwrap()
        .run(&lister)
        .unwrap();

    assert_eq!(report.bootloader.signature, Signature(signature));
    assert_eq!(report.bytes_programmed, 130);
    assert_eq!(bootloader.lock().unwrap().frames_with_opcode(0x64).len(), 2);
}

#[test]
fn unsupported_signature_aborts_before_programming() {
    let mut device = Bootloader::new();
    device.signature = [0x1E, 0x95, 0x01];
    let (lister, bootloader) = attach(device);

    let error = UploadSession::new(PORT, image(130), options())
        .unwrap()
        .run(&lister)
        .unwrap_err();

    assert!(matches!(
        error,
        UploadError::UnsupportedSignature(Signature([0x1E, 0x95, 0x01]))
    ));

    let bootloader = bootloader.lock().unwrap();
    assert!(bootloader.frames_with_opcode(0x64).is_empty());
    assert!(bootloader.frames_with_opcode(0x51).is_empty());
}

#[test]
fn wrong_sync_status_is_a_protocol_error() {
    let mut device = Bootloader::new();
    device.sync_status = 0x12;
    let (lister, _) = attach(device);

    let error = UploadSession::new(PORT, image(4), options())
        .unwrap()
        .run(&lister)
        .unwrap_err();

    let UploadError::CannotSync { last, .. } = error else {
        panic!("expected a sync failure, got {error:?}");
    };
    assert!(matches!(
        *last,
        UploadError::Ack {
            expected: 0x10,
            received: 0x12,
            ..
        }
    ));
}

#[test]
fn verify_mismatch_is_reported_and_session_detaches() {
    let mut device = Bootloader::new();
    device.corrupt_at = Some(0x81);
    let (lister, bootloader) = attach(device);

    let report = UploadSession::new(PORT, image(130), options())
        .unwrap()
        .run(&lister)
        .unwrap();

    let expected = image(130).as_bytes()[0x81];
    assert_eq!(
        report.mismatch,
        Some(VerifyMismatch {
            page: 0x80,
            address: 0x81,
            expected,
            observed: expected ^ 0xFF,
        })
    );
    assert_eq!(bootloader.lock().unwrap().frames_with_opcode(0x51).len(), 1);
}

#[test]
fn failed_page_write_leaves_programming_mode() {
    let mut device = Bootloader::new();
    device.fail_page_write = Some(1);
    let (lister, bootloader) = attach(device);

    let error = UploadSession::new(PORT, image(130), options())
        .unwrap()
        .run(&lister)
        .unwrap_err();

    assert!(matches!(error, UploadError::Page { address: 0x80, .. }));
    assert_eq!(bootloader.lock().unwrap().frames_with_opcode(0x51).len(), 1);
}

#[test]
fn truncated_page_read_times_out_and_leaves_programming_mode() {
    let mut device = Bootloader::new();
    device.truncate_read_page = Some(10);
    let (lister, bootloader) = attach(device);

    let error = UploadSession::new(PORT, image(130), options())
        .unwrap()
        .run(&lister)
        .unwrap_err();

    let UploadError::Page { address, source } = error else {
        panic!("expected a page failure, got {error:?}");
    };
    assert_eq!(address, 0);
    assert!(matches!(
        *source,
        UploadError::ReadTimeout {
            wanted: 128,
            received: 10
        }
    ));

    let bootloader = bootloader.lock().unwrap();
    assert_eq!(bootloader.frames_with_opcode(0x64).len(), 2);
    assert_eq!(bootloader.frames_with_opcode(0x51).len(), 1);
}

#[test]
fn firmware_text_before_a_reply_is_reported() {
    let mut device = Bootloader::new();
    device.chatter = Some(b"!Bootloader ready\r\n");
    let (lister, _) = attach(device);
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = messages.clone();

    UploadSession::new(PORT, image(16), options())
        .unwrap()
        .with_progress(UploadProgress::new(move |event| {
            if let ProgressEvent::FirmwareMessage(text) = event {
                sink.lock().unwrap().push(text);
            }
        }))
        .run(&lister)
        .unwrap();

    assert_eq!(*messages.lock().unwrap(), vec!["Bootloader ready".to_string()]);
}
