//! Checksum and literal wire layout of a single frame.
//!
//! ```text
//! <STX><frame# digit><text><ETB|ETX><checksum: 2 uppercase hex><CR><LF>
//! ```
//!
//! The checksum is the sum of the frame number character, every text byte and
//! the terminator, modulo 256, written as two uppercase hex digits.

use bytes::{BufMut, BytesMut};
use tracing::trace;

use crate::types::{Frame, CR, LF, OVERHEAD_CHARACTER_COUNT, STX};

const HEX_DIGITS: &[u8; 16] = b"0123456789ABCDEF";

/// Running mod 256 checksum, fed byte by byte while a frame streams in.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Checksum(u8);

impl Checksum {
    pub fn new() -> Self {
        Self(0)
    }

    #[inline]
    pub fn update(&mut self, bytes: &[u8]) {
        for b in bytes {
            self.0 = self.0.wrapping_add(*b);
        }
    }

    #[inline]
    pub fn update_byte(&mut self, byte: u8) {
        self.0 = self.0.wrapping_add(byte);
    }

    pub fn value(self) -> u8 {
        self.0
    }

    /// The two uppercase hex characters sent on the wire.
    pub fn to_hex(self) -> [u8; 2] {
        [
            HEX_DIGITS[(self.0 >> 4) as usize],
            HEX_DIGITS[(self.0 & 0x0F) as usize],
        ]
    }
}

/// Checksum over frame number character, text and terminator.
pub fn checksum(number_char: u8, text: &[u8], terminator: u8) -> [u8; 2] {
    let mut sum = Checksum::new();
    sum.update_byte(number_char);
    sum.update(text);
    sum.update_byte(terminator);
    sum.to_hex()
}

/// Compares received checksum characters byte for byte; lowercase hex is rejected.
pub fn checksum_fits(received: &[u8], number_char: u8, text: &[u8], terminator: u8) -> bool {
    received == checksum(number_char, text, terminator)
}

/// Appends the complete wire form of `frame` to `dst`.
pub fn encode_frame_into(frame: &Frame, dst: &mut BytesMut) {
    let number_char = frame.number_char();
    let terminator = frame.frame_type.terminator();
    let text = frame.text.as_bytes();

    dst.reserve(text.len() + OVERHEAD_CHARACTER_COUNT);
    dst.put_u8(STX);
    dst.put_u8(number_char);
    dst.put_slice(text);
    dst.put_u8(terminator);
    dst.put_slice(&checksum(number_char, text, terminator));
    dst.put_u8(CR);
    dst.put_u8(LF);

    trace!(
        "encoded frame {} ({} text bytes)",
        frame.frame_number,
        text.len()
    );
}

/// Wire form of `frame` as an owned buffer.
pub fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(frame.text.len() + OVERHEAD_CHARACTER_COUNT);
    encode_frame_into(frame, &mut buf);
    buf.to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FrameType, ETB, ETX};

    #[test]
    fn test_checksum_known_values() {
        assert_eq!(&checksum(b'1', b"P|1||123\r", ETX), b"CC");
        assert_eq!(&checksum(b'1', b"H|1\r", ETB), b"4A");
        assert_eq!(&checksum(b'2', b"L|1|N\r", ETX), b"05");
    }

    #[test]
    fn test_checksum_is_deterministic() {
        let first = checksum(b'1', b"P|1||123\r", ETX);
        let second = checksum(b'1', b"P|1||123\r", ETX);
        assert_eq!(first, second);
    }

    #[test]
    fn test_checksum_detects_single_byte_change() {
        let base = checksum(b'1', b"P|1||123\r", ETX);
        assert_ne!(base, checksum(b'2', b"P|1||123\r", ETX));
        assert_ne!(base, checksum(b'1', b"P|1||124\r", ETX));
        assert_ne!(base, checksum(b'1', b"P|1||123\r", ETB));
    }

    #[test]
    fn test_checksum_zero_padded() {
        let mut sum = Checksum::new();
        sum.update(&[0xFF, 0x0B]);
        assert_eq!(sum.value(), 0x0A);
        assert_eq!(&sum.to_hex(), b"0A");
    }

    #[test]
    fn test_checksum_fits_rejects_lowercase() {
        assert!(checksum_fits(b"4A", b'1', b"H|1\r", ETB));
        assert!(!checksum_fits(b"4a", b'1', b"H|1\r", ETB));
    }

    #[test]
    fn test_encode_single_end_frame() {
        let frame = Frame::new(FrameType::End, 1, "P|1||123\r");
        let mut expected = vec![STX, b'1'];
        expected.extend_from_slice(b"P|1||123\r");
        expected.extend_from_slice(&[ETX, b'C', b'C', CR, LF]);
        assert_eq!(encode_frame(&frame), expected);
    }

    #[test]
    fn test_encode_intermediate_frame_uses_etb() {
        let frame = Frame::new(FrameType::Intermediate, 7, "abc");
        let encoded = encode_frame(&frame);
        assert_eq!(encoded[1], b'7');
        assert_eq!(encoded[5], ETB);
        assert_eq!(encoded.len(), 3 + OVERHEAD_CHARACTER_COUNT);
    }
}
