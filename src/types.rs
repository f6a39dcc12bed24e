//! Protocol constants and the plain data model shared by every layer.

use std::fmt;
use std::str::FromStr;

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

use crate::error::AstmError;

pub const SOH: u8 = 0x01;
pub const STX: u8 = 0x02;
pub const ETX: u8 = 0x03;
pub const EOT: u8 = 0x04;
pub const ENQ: u8 = 0x05;
pub const ACK: u8 = 0x06;
pub const LF: u8 = 0x0A;
pub const CR: u8 = 0x0D;
pub const DLE: u8 = 0x10;
pub const DC1: u8 = 0x11;
pub const DC2: u8 = 0x12;
pub const DC3: u8 = 0x13;
pub const DC4: u8 = 0x14;
pub const NAK: u8 = 0x15;
pub const SYN: u8 = 0x16;
pub const ETB: u8 = 0x17;

/// Characters that may never appear inside frame or record text.
pub const RESTRICTED_CHARACTERS: [u8; 15] = [
    SOH, STX, ETX, EOT, ENQ, ACK, DLE, NAK, SYN, ETB, LF, DC1, DC2, DC3, DC4,
];

/// First byte of a transmission that skips the establishment phase entirely.
pub const NON_COMPLIANT_START: u8 = b'H';

/// Suffix of the (trimmed) record that ends a non-compliant transmission.
pub const TERMINATION_RECORD_END: &str = "L|1|N";

/// First character of the final line that closes a record in framed mode.
pub const MESSAGE_TERMINATOR_RECORD_START: char = 'L';

/// STX + frame number + terminator + 2 checksum characters + CR LF.
pub const OVERHEAD_CHARACTER_COUNT: usize = 7;
pub const MAX_FRAME_SIZE: usize = 64000;
pub const MAX_TEXT_SIZE: usize = MAX_FRAME_SIZE - OVERHEAD_CHARACTER_COUNT;
pub const MAX_FRAME_SIZE_E1381_95: usize = 247;
pub const MAX_TEXT_SIZE_E1381_95: usize = MAX_FRAME_SIZE_E1381_95 - OVERHEAD_CHARACTER_COUNT;

/// Returns true if `byte` is not allowed inside frame or record text.
#[inline]
pub fn is_restricted(byte: u8) -> bool {
    RESTRICTED_CHARACTERS.contains(&byte)
}

/// Transmission protocol profile used on one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AstmVersion {
    /// CLSI LIS01-A2 (E1381-02), large frames.
    #[default]
    #[serde(rename = "LIS01_A")]
    Lis01A,
    /// ASTM E1381-95, 247 byte frames.
    #[serde(rename = "E1381_95")]
    E1381_95,
    /// Plain CR separated character stream, no establishment, frames or checksums.
    #[serde(rename = "NON_COMPLIANT")]
    NonCompliant,
}

impl AstmVersion {
    pub const fn max_frame_size(self) -> usize {
        match self {
            AstmVersion::E1381_95 => MAX_FRAME_SIZE_E1381_95,
            AstmVersion::Lis01A | AstmVersion::NonCompliant => MAX_FRAME_SIZE,
        }
    }

    pub const fn max_text_size(self) -> usize {
        self.max_frame_size() - OVERHEAD_CHARACTER_COUNT
    }

    /// Whether this profile uses the ENQ/ACK handshake and checksummed frames.
    pub const fn is_framed(self) -> bool {
        !matches!(self, AstmVersion::NonCompliant)
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            AstmVersion::Lis01A => "LIS01_A",
            AstmVersion::E1381_95 => "E1381_95",
            AstmVersion::NonCompliant => "NON_COMPLIANT",
        }
    }
}

impl fmt::Display for AstmVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AstmVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().replace('-', "_").as_str() {
            "LIS01_A" | "LIS01A" => Ok(AstmVersion::Lis01A),
            "E1381_95" => Ok(AstmVersion::E1381_95),
            "NON_COMPLIANT" => Ok(AstmVersion::NonCompliant),
            other => Err(format!("unknown ASTM version '{other}'")),
        }
    }
}

/// Frame type, carried on the wire by the text terminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    /// Terminated by ETB, more frames follow.
    Intermediate,
    /// Terminated by ETX, last frame of the transmission.
    End,
}

impl FrameType {
    pub const fn terminator(self) -> u8 {
        match self {
            FrameType::Intermediate => ETB,
            FrameType::End => ETX,
        }
    }

    pub fn from_terminator(byte: u8) -> Result<Self, AstmError> {
        match byte {
            ETB => Ok(FrameType::Intermediate),
            ETX => Ok(FrameType::End),
            other => Err(AstmError::UnrecognizedFrameType(other)),
        }
    }
}

/// One checksum bounded chunk of wire data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    /// Sequence number 0..=7.
    pub frame_number: u8,
    pub text: String,
}

impl Frame {
    pub fn new(frame_type: FrameType, frame_number: u8, text: impl Into<String>) -> Self {
        Self {
            frame_type,
            frame_number: frame_number % 8,
            text: text.into(),
        }
    }

    /// The ASCII digit sent on the wire for this frame's number.
    pub fn number_char(&self) -> u8 {
        b'0' + (self.frame_number % 8)
    }
}

/// One application level line, normally CR terminated.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Record {
    pub text: String,
}

impl Record {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Ordered sequence of records forming one exchange.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    records: Vec<Record>,
}

impl Message {
    pub fn new(records: Vec<Record>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn push(&mut self, record: Record) {
        self.records.push(record);
    }

    /// Exact concatenation of every record's text.
    pub fn text(&self) -> String {
        self.records.iter().map(|r| r.text.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.iter().map(Record::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<Vec<Record>> for Message {
    fn from(records: Vec<Record>) -> Self {
        Self::new(records)
    }
}

bitflags! {
    /// Everything found wrong with one received frame or record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FrameErrors: u8 {
        const WRONG_FRAME_NUMBER = 0b0000_0001;
        const MAX_SIZE_EXCEEDED  = 0b0000_0010;
        const ILLEGAL_CHAR       = 0b0000_0100;
        const BAD_CHECKSUM       = 0b0000_1000;
        const ILLEGAL_START      = 0b0001_0000;
        const ILLEGAL_END        = 0b0010_0000;
    }
}

/// Renders control characters as Unicode control pictures for single line logs.
pub fn printable(text: &str) -> String {
    text.chars()
        .map(|c| match c {
            '\u{7f}' => '\u{2421}',
            c if (c as u32) < 0x20 => char::from_u32(0x2400 + c as u32).unwrap_or(c),
            c => c,
        })
        .collect()
}

/// [`printable`] for raw wire bytes.
pub fn printable_bytes(bytes: &[u8]) -> String {
    printable(&String::from_utf8_lossy(bytes))
}
