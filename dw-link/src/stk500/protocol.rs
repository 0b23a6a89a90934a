//! STK500 version 1 framing, as implemented by the Arduino bootloaders.
//!
//! Every request is `opcode [parameters] CRC_EOP`. The bootloader answers with
//! `INSYNC [payload] OK`, where the payload length is fixed per opcode.

use std::fmt;

/// Terminates every request.
pub const SYNC_CRC_EOP: u8 = 0x20;
/// First byte of every reply.
pub const RESP_STK_INSYNC: u8 = 0x14;
/// Last byte of every reply.
pub const RESP_STK_OK: u8 = 0x10;
/// Marker for a firmware text line interleaved with protocol bytes.
pub const MESSAGE_MARKER: u8 = b'!';

/// Memory type selector for program flash.
const MEMTYPE_FLASH: u8 = b'F';

/// Request opcodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// `STK_GET_SYNC`
    GetSync = 0x30,
    /// `STK_GET_PARAMETER`
    GetParameter = 0x41,
    /// `STK_LEAVE_PROGMODE`
    LeaveProgMode = 0x51,
    /// `STK_LOAD_ADDRESS`
    LoadAddress = 0x55,
    /// `STK_PROG_PAGE`
    ProgramPage = 0x64,
    /// `STK_READ_PAGE`
    ReadPage = 0x74,
    /// `STK_READ_SIGN`
    ReadSignature = 0x75,
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::GetSync => "get sync",
            Opcode::GetParameter => "get parameter",
            Opcode::LeaveProgMode => "leave programming mode",
            Opcode::LoadAddress => "load address",
            Opcode::ProgramPage => "program page",
            Opcode::ReadPage => "read page",
            Opcode::ReadSignature => "read signature",
        };
        write!(f, "{name} ({:#04x})", *self as u8)
    }
}

/// Bootloader parameters readable with [`Command::GetParameter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Parameter {
    /// Major software version.
    SoftwareMajor = 0x81,
    /// Minor software version.
    SoftwareMinor = 0x82,
}

/// A single bootloader request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command<'a> {
    /// Checks that the bootloader is listening.
    GetSync,
    /// Reads one parameter byte.
    GetParameter(Parameter),
    /// Reads the three signature bytes.
    ReadSignature,
    /// Sets the address for the next page operation, given as a byte address.
    LoadAddress(u32),
    /// Writes flash at the loaded address.
    ProgramPage(&'a [u8]),
    /// Reads `len` bytes of flash at the loaded address.
    ReadPage(u16),
    /// Leaves programming mode and starts the application.
    LeaveProgMode,
}

impl Command<'_> {
    /// The opcode of this request.
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::GetSync => Opcode::GetSync,
            Command::GetParameter(_) => Opcode::GetParameter,
            Command::ReadSignature => Opcode::ReadSignature,
            Command::LoadAddress(_) => Opcode::LoadAddress,
            Command::ProgramPage(_) => Opcode::ProgramPage,
            Command::ReadPage(_) => Opcode::ReadPage,
            Command::LeaveProgMode => Opcode::LeaveProgMode,
        }
    }

    /// Number of payload bytes between `INSYNC` and `OK` in the reply.
    pub fn reply_len(&self) -> usize {
        match self {
            Command::GetParameter(_) => 1,
            Command::ReadSignature => 3,
            Command::ReadPage(len) => usize::from(*len),
            _ => 0,
        }
    }

    /// Serializes the request.
    ///
    /// Page lengths are big-endian, while the load address is a little-endian
    /// word address.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut frame = vec![self.opcode() as u8];

        match self {
            Command::GetParameter(parameter) => frame.push(*parameter as u8),
            Command::LoadAddress(address) => {
                let word = (address >> 1) as u16;
                frame.extend_from_slice(&word.to_le_bytes());
            }
            Command::ProgramPage(data) => {
                frame.extend_from_slice(&(data.len() as u16).to_be_bytes());
                frame.push(MEMTYPE_FLASH);
                frame.extend_from_slice(data);
            }
            Command::ReadPage(len) => {
                frame.extend_from_slice(&len.to_be_bytes());
                frame.push(MEMTYPE_FLASH);
            }
            Command::GetSync | Command::ReadSignature | Command::LeaveProgMode => {}
        }

        frame.push(SYNC_CRC_EOP);
        frame
    }
}

/// The three device signature bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Signature(pub [u8; 3]);

impl Signature {
    /// ATmega328P.
    pub const ATMEGA328P: Signature = Signature([0x1E, 0x95, 0x0F]);
    /// ATmega328.
    pub const ATMEGA328: Signature = Signature([0x1E, 0x95, 0x14]);
    /// ATmega328PB.
    pub const ATMEGA328PB: Signature = Signature([0x1E, 0x95, 0x16]);

    /// The ATmega328 variants the adapter firmware runs on.
    pub const SUPPORTED: [Signature; 3] = [
        Signature::ATMEGA328P,
        Signature::ATMEGA328,
        Signature::ATMEGA328PB,
    ];
}

impl fmt::Display for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c] = self.0;
        write!(f, "0x{a:02x}{b:02x}{c:02x}")
    }
}
