//! Picking adapter console output out of the GDB traffic.
//!
//! The adapter reports problems as GDB `O` packets (console output) whose
//! payload starts with `***` for fatal errors. The bridge does not parse the
//! remote protocol; it keeps the bytes received since the last frame boundary
//! and looks at them after every relayed byte that ends what looks like a
//! frame: an ack (`+`) or a `#xx` checksum trailer. Read boundaries play no
//! part, so packets split across reads or packed into one read are all seen.
//!
//! This is a heuristic. Bytes that never reach a boundary are dropped once
//! they exceed a few kilobytes.

/// Acknowledgement byte of the remote protocol.
const ACK: u8 = b'+';
/// Start of a packet.
const PACKET_START: u8 = b'$';
/// Separates packet payload from its checksum.
const CHECKSUM_DELIMITER: u8 = b'#';
/// Payload prefix of fatal adapter messages.
const FATAL_PREFIX: &str = "***";
/// Bytes kept while waiting for a frame boundary.
const MAX_TAIL_LEN: usize = 4096;

/// How an adapter message should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// An adapter error; always shown.
    Fatal,
    /// Anything else; shown in verbose mode.
    Info,
}

/// A console message sent by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticFrame {
    /// The decoded message.
    pub text: String,
    /// Whether the message reports an adapter error.
    pub severity: Severity,
}

impl DiagnosticFrame {
    fn new(text: String) -> Self {
        let severity = if text.starts_with(FATAL_PREFIX) {
            Severity::Fatal
        } else {
            Severity::Info
        };

        Self { text, severity }
    }

    /// Returns `true` for fatal messages.
    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }

    /// Fatal messages are always displayed, the others only when verbose.
    pub fn should_display(&self, verbose: bool) -> bool {
        verbose || self.is_fatal()
    }
}

/// Accumulates serial output between frame boundaries.
#[derive(Debug, Default)]
pub struct DiagnosticScanner {
    tail: Vec<u8>,
}

impl DiagnosticScanner {
    /// Creates an empty scanner.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one chunk of serial output; returns the messages it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<DiagnosticFrame> {
        let mut frames = Vec::new();

        for &byte in chunk {
            self.tail.push(byte);

            if self.at_frame_boundary() {
                frames.extend(decode(&self.tail));
                self.tail.clear();
            } else if self.tail.len() > MAX_TAIL_LEN {
                tracing::trace!("Dropping {} bytes without a frame boundary", self.tail.len());
                self.tail.clear();
            }
        }

        frames
    }

    fn at_frame_boundary(&self) -> bool {
        match self.tail.as_slice() {
            [.., ACK] => true,
            [.., CHECKSUM_DELIMITER, _, _] => true,
            _ => false,
        }
    }
}

/// Decodes `$O<hex>#xx`, ignoring whatever precedes the packet start. `$OK#9a`
/// is not a message.
fn decode(frame: &[u8]) -> Option<DiagnosticFrame> {
    let start = frame.iter().rposition(|&byte| byte == PACKET_START)?;

    let body = frame[start + 1..].strip_prefix(b"O")?;
    if body.first() == Some(&b'K') {
        return None;
    }

    let end = body.iter().rposition(|&byte| byte == CHECKSUM_DELIMITER)?;
    let payload = &body[..end];

    match hex::decode(payload) {
        Ok(bytes) => Some(DiagnosticFrame::new(
            String::from_utf8_lossy(&bytes).into_owned(),
        )),
        Err(e) => {
            tracing::trace!("Ignoring undecodable console packet: {e}");
            None
        }
    }
}
