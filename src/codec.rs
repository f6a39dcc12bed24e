//! `tokio_util` codec for the ASTM wire.
//!
//! The line is half duplex and what a byte means depends on the phase of the
//! exchange, so the decoder is switched between modes by the communicator:
//!
//! - `Establishment`: one control byte, except the non-compliant start
//!   character which is reported but left in the buffer so it stays part of
//!   the first record.
//! - `Control`: exactly one byte (acknowledgements).
//! - `Frame`: a start byte; STX is followed by a full frame which is parsed
//!   incrementally, any other start byte is reported as a control byte.
//! - `Record`: CR terminated text of the non-compliant character stream.
//!
//! Frame text is streamed through a running checksum, so an oversized frame
//! never buffers more than the profile's text limit. Records are bounded the
//! same way: past the limit the rest of the line is dropped up to its CR.
//!
//! Text is opaque bytes here. Only restricted control characters make it
//! illegal; decoding into strings happens once per reassembled record.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

use crate::error::AstmError;
use crate::frame::{encode_frame_into, Checksum};
use crate::types::{
    is_restricted, printable, printable_bytes, AstmVersion, Frame, FrameErrors, FrameType, CR,
    ETB, ETX, LF, NON_COMPLIANT_START, STX,
};

/// Checksum characters + CR + LF after the terminator.
const TRAILER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeMode {
    Establishment,
    Control,
    Frame,
    Record,
}

/// Items produced by [`AstmCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Control(u8),
    /// The stream opened with the non-compliant start character (not consumed).
    NonCompliantStart,
    Frame(ReceivedFrame),
    Record(ReceivedRecord),
}

/// Items accepted by [`AstmCodec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Control(u8),
    Frame(Frame),
}

/// A frame as read off the wire, before sequence checking.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFrame {
    pub number_char: u8,
    /// Raw text bytes; may end in the middle of a multi-byte character.
    pub text: Bytes,
    pub terminator: u8,
    /// Structural errors; sequence errors are added by the receiver.
    pub errors: FrameErrors,
}

impl ReceivedFrame {
    /// Numeric value of the frame number character, if it is a digit.
    pub fn frame_number(&self) -> Option<u8> {
        (self.number_char as char).to_digit(10).map(|d| d as u8)
    }

    pub fn frame_type(&self) -> Result<FrameType, AstmError> {
        FrameType::from_terminator(self.terminator)
    }
}

/// One CR terminated record of the non-compliant stream, CR included.
///
/// Invalid UTF-8 is replaced with U+FFFD; an oversized record has empty text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedRecord {
    pub text: String,
    pub errors: FrameErrors,
}

#[derive(Debug)]
struct PartialFrame {
    number_char: u8,
    text: BytesMut,
    len: usize,
    sum: Checksum,
    errors: FrameErrors,
}

impl PartialFrame {
    fn new(number_char: u8) -> Self {
        let mut sum = Checksum::new();
        sum.update_byte(number_char);
        Self {
            number_char,
            text: BytesMut::new(),
            len: 0,
            sum,
            errors: FrameErrors::empty(),
        }
    }

    fn push_text(&mut self, chunk: &[u8], max_text_size: usize) {
        self.sum.update(chunk);
        if chunk.iter().any(|b| is_restricted(*b)) {
            self.errors |= FrameErrors::ILLEGAL_CHAR;
        }
        let room = max_text_size.saturating_sub(self.len);
        self.text.extend_from_slice(&chunk[..chunk.len().min(room)]);
        self.len += chunk.len();
        if self.len > max_text_size {
            self.errors |= FrameErrors::MAX_SIZE_EXCEEDED;
        }
    }

    fn finish(mut self, terminator: u8, trailer: &[u8]) -> ReceivedFrame {
        self.sum.update_byte(terminator);
        if trailer[..2] != self.sum.to_hex() {
            trace!(
                "checksum mismatch: received '{}', calculated '{}'",
                printable_bytes(&trailer[..2]),
                printable_bytes(&self.sum.to_hex())
            );
            self.errors |= FrameErrors::BAD_CHECKSUM;
        }
        if trailer[2] != CR || trailer[3] != LF {
            self.errors |= FrameErrors::ILLEGAL_END;
        }
        ReceivedFrame {
            number_char: self.number_char,
            text: self.text.freeze(),
            terminator,
            errors: self.errors,
        }
    }
}

#[derive(Debug, Default)]
enum FrameStage {
    #[default]
    Start,
    Number,
    Text(PartialFrame),
    Trailer(PartialFrame, u8),
}

/// Codec for one ASTM connection.
#[derive(Debug)]
pub struct AstmCodec {
    mode: DecodeMode,
    max_text_size: usize,
    stage: FrameStage,
    /// Record mode: bytes already scanned for CR.
    next_index: usize,
    /// Record mode: dropping an oversized record up to its CR.
    discarding: bool,
}

impl AstmCodec {
    pub fn new(version: AstmVersion) -> Self {
        Self {
            mode: DecodeMode::Control,
            max_text_size: version.max_text_size(),
            stage: FrameStage::Start,
            next_index: 0,
            discarding: false,
        }
    }

    pub fn mode(&self) -> DecodeMode {
        self.mode
    }

    /// Switches the meaning of upcoming bytes, dropping any half parsed frame.
    pub fn set_mode(&mut self, mode: DecodeMode) {
        self.mode = mode;
        self.stage = FrameStage::Start;
        self.next_index = 0;
        self.discarding = false;
    }

    pub fn set_version(&mut self, version: AstmVersion) {
        self.max_text_size = version.max_text_size();
    }

    fn decode_frame(&mut self, src: &mut BytesMut) -> Result<Option<Inbound>, AstmError> {
        loop {
            match std::mem::take(&mut self.stage) {
                FrameStage::Start => {
                    if src.is_empty() {
                        return Ok(None);
                    }
                    let start = src.get_u8();
                    if start != STX {
                        return Ok(Some(Inbound::Control(start)));
                    }
                    self.stage = FrameStage::Number;
                }
                FrameStage::Number => {
                    if src.is_empty() {
                        self.stage = FrameStage::Number;
                        return Ok(None);
                    }
                    self.stage = FrameStage::Text(PartialFrame::new(src.get_u8()));
                }
                FrameStage::Text(mut partial) => {
                    match src.iter().position(|b| *b == ETB || *b == ETX) {
                        Some(pos) => {
                            let chunk = src.split_to(pos);
                            partial.push_text(&chunk, self.max_text_size);
                            let terminator = src.get_u8();
                            self.stage = FrameStage::Trailer(partial, terminator);
                        }
                        None => {
                            let chunk = src.split();
                            partial.push_text(&chunk, self.max_text_size);
                            self.stage = FrameStage::Text(partial);
                            return Ok(None);
                        }
                    }
                }
                FrameStage::Trailer(partial, terminator) => {
                    if src.len() < TRAILER_LEN {
                        self.stage = FrameStage::Trailer(partial, terminator);
                        return Ok(None);
                    }
                    let trailer = src.split_to(TRAILER_LEN);
                    let frame = partial.finish(terminator, &trailer);
                    trace!(
                        "decoded frame '{}' number '{}' errors {:?}",
                        printable_bytes(&frame.text),
                        printable_bytes(&[frame.number_char]),
                        frame.errors
                    );
                    return Ok(Some(Inbound::Frame(frame)));
                }
            }
        }
    }

    /// At most `max_text_size` bytes before the CR are held in the buffer.
    fn decode_record(&mut self, src: &mut BytesMut) -> Option<Inbound> {
        loop {
            let read_to = src.len().min(self.max_text_size + 1);
            let found = src[self.next_index..read_to]
                .iter()
                .position(|b| *b == CR)
                .map(|offset| self.next_index + offset);

            match (self.discarding, found) {
                (true, Some(pos)) => {
                    src.advance(pos + 1);
                    self.discarding = false;
                    self.next_index = 0;
                    trace!("discarded oversized record");
                    return Some(Inbound::Record(ReceivedRecord {
                        text: String::new(),
                        errors: FrameErrors::MAX_SIZE_EXCEEDED,
                    }));
                }
                (true, None) => {
                    src.advance(read_to);
                    self.next_index = 0;
                    if src.is_empty() {
                        return None;
                    }
                }
                (false, Some(pos)) => {
                    let raw = src.split_to(pos + 1);
                    self.next_index = 0;
                    let mut errors = FrameErrors::empty();
                    if raw.iter().any(|b| is_restricted(*b)) {
                        errors |= FrameErrors::ILLEGAL_CHAR;
                    }
                    let text = String::from_utf8_lossy(&raw).into_owned();
                    trace!("decoded record '{}' errors {:?}", printable(&text), errors);
                    return Some(Inbound::Record(ReceivedRecord { text, errors }));
                }
                (false, None) if src.len() > self.max_text_size => {
                    debug!("record exceeds {} bytes, discarding up to CR", self.max_text_size);
                    self.discarding = true;
                    self.next_index = 0;
                }
                (false, None) => {
                    self.next_index = read_to;
                    return None;
                }
            }
        }
    }
}

impl Decoder for AstmCodec {
    type Item = Inbound;
    type Error = AstmError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.mode {
            DecodeMode::Establishment => {
                if src.is_empty() {
                    return Ok(None);
                }
                if src[0] == NON_COMPLIANT_START {
                    return Ok(Some(Inbound::NonCompliantStart));
                }
                Ok(Some(Inbound::Control(src.get_u8())))
            }
            DecodeMode::Control => {
                if src.is_empty() {
                    return Ok(None);
                }
                Ok(Some(Inbound::Control(src.get_u8())))
            }
            DecodeMode::Frame => self.decode_frame(src),
            DecodeMode::Record => Ok(self.decode_record(src)),
        }
    }
}

impl Encoder<Outbound> for AstmCodec {
    type Error = AstmError;

    fn encode(&mut self, item: Outbound, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            Outbound::Control(byte) => {
                trace!("sending '{}'", printable_bytes(&[byte]));
                dst.put_u8(byte);
            }
            Outbound::Frame(frame) => {
                trace!("sending frame '{}'", printable(&frame.text));
                encode_frame_into(&frame, dst);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use crate::types::{ACK, ENQ, EOT, SOH};

    fn codec(mode: DecodeMode) -> AstmCodec {
        let mut codec = AstmCodec::new(AstmVersion::Lis01A);
        codec.set_mode(mode);
        codec
    }

    fn decode_one_frame(codec: &mut AstmCodec, bytes: &[u8]) -> ReceivedFrame {
        let mut buf = BytesMut::from(bytes);
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Frame(frame)) => frame,
            other => panic!("expected a frame, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_valid_frame() {
        let mut codec = codec(DecodeMode::Frame);
        let wire = encode_frame(&Frame::new(FrameType::End, 1, "P|1||123\r"));
        let frame = decode_one_frame(&mut codec, &wire);

        assert!(frame.errors.is_empty());
        assert_eq!(frame.frame_number(), Some(1));
        assert_eq!(&frame.text[..], b"P|1||123\r");
        assert_eq!(frame.frame_type().unwrap(), FrameType::End);
    }

    #[test]
    fn test_decode_frame_split_across_reads() {
        let mut codec = codec(DecodeMode::Frame);
        let wire = encode_frame(&Frame::new(FrameType::Intermediate, 3, "O|1|abc\r"));
        let mut buf = BytesMut::new();

        for byte in &wire[..wire.len() - 1] {
            buf.put_u8(*byte);
            assert!(codec.decode(&mut buf).unwrap().is_none());
        }
        buf.put_u8(wire[wire.len() - 1]);
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Frame(frame)) => {
                assert!(frame.errors.is_empty());
                assert_eq!(frame.terminator, ETB);
                assert_eq!(&frame.text[..], b"O|1|abc\r");
            }
            other => panic!("expected a frame, got {other:?}"),
        }
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_bad_checksum() {
        let mut codec = codec(DecodeMode::Frame);
        let mut wire = encode_frame(&Frame::new(FrameType::End, 1, "P|1\r"));
        let idx = wire.len() - 4;
        wire[idx] = if wire[idx] == b'0' { b'1' } else { b'0' };
        let frame = decode_one_frame(&mut codec, &wire);
        assert_eq!(frame.errors, FrameErrors::BAD_CHECKSUM);
    }

    #[test]
    fn test_decode_illegal_char_and_end() {
        let mut codec = codec(DecodeMode::Frame);
        let mut wire = vec![STX, b'1', b'P', SOH, b'\r', ETX];
        wire.extend_from_slice(&crate::frame::checksum(b'1', &[b'P', SOH, b'\r'], ETX));
        wire.extend_from_slice(&[CR, b'x']);
        let frame = decode_one_frame(&mut codec, &wire);
        assert_eq!(frame.errors, FrameErrors::ILLEGAL_CHAR | FrameErrors::ILLEGAL_END);
    }

    #[test]
    fn test_decode_oversized_frame() {
        let mut codec = AstmCodec::new(AstmVersion::E1381_95);
        codec.set_mode(DecodeMode::Frame);
        let text = "A".repeat(300);
        let wire = encode_frame(&Frame::new(FrameType::End, 1, text));
        let frame = decode_one_frame(&mut codec, &wire);

        assert_eq!(frame.errors, FrameErrors::MAX_SIZE_EXCEEDED);
        assert_eq!(frame.text.len(), 240);
    }

    #[test]
    fn test_decode_size_limit_boundary() {
        let mut codec = AstmCodec::new(AstmVersion::E1381_95);
        codec.set_mode(DecodeMode::Frame);

        let at_limit = encode_frame(&Frame::new(FrameType::End, 1, "A".repeat(240)));
        let frame = decode_one_frame(&mut codec, &at_limit);
        assert!(frame.errors.is_empty());
        assert_eq!(frame.text.len(), 240);

        let over_limit = encode_frame(&Frame::new(FrameType::End, 1, "A".repeat(241)));
        let frame = decode_one_frame(&mut codec, &over_limit);
        assert_eq!(frame.errors, FrameErrors::MAX_SIZE_EXCEEDED);
    }

    #[test]
    fn test_decode_latin1_text_is_legal() {
        let mut codec = codec(DecodeMode::Frame);
        let text = b"P|1||Ren\xE9\r";
        let mut wire = vec![STX, b'1'];
        wire.extend_from_slice(text);
        wire.push(ETX);
        wire.extend_from_slice(&crate::frame::checksum(b'1', text, ETX));
        wire.extend_from_slice(&[CR, LF]);

        let frame = decode_one_frame(&mut codec, &wire);
        assert!(frame.errors.is_empty());
        assert_eq!(&frame.text[..], &text[..]);
    }

    #[test]
    fn test_decode_non_stx_start_is_control() {
        let mut codec = codec(DecodeMode::Frame);
        let mut buf = BytesMut::from(&[EOT, b'Z'][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Control(EOT)));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Control(b'Z')));
    }

    #[test]
    fn test_establishment_peeks_non_compliant_start() {
        let mut codec = codec(DecodeMode::Establishment);
        let mut buf = BytesMut::from(&b"H|1\r"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::NonCompliantStart));
        assert_eq!(&buf[..], b"H|1\r");

        let mut buf = BytesMut::from(&[ENQ][..]);
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Inbound::Control(ENQ)));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_decode_records() {
        let mut codec = codec(DecodeMode::Record);
        let mut buf = BytesMut::from(&b"H|1\rP|\x051\rL|1"[..]);

        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Record(record)) => {
                assert_eq!(record.text, "H|1\r");
                assert!(record.errors.is_empty());
            }
            other => panic!("expected a record, got {other:?}"),
        }
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Record(record)) => assert_eq!(record.errors, FrameErrors::ILLEGAL_CHAR),
            other => panic!("expected a record, got {other:?}"),
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(&buf[..], b"L|1");
    }

    #[test]
    fn test_decode_record_latin1_is_replaced() {
        let mut codec = codec(DecodeMode::Record);
        let mut buf = BytesMut::from(&b"P|1||Ren\xE9\r"[..]);
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Record(record)) => {
                assert!(record.errors.is_empty());
                assert_eq!(record.text, "P|1||Ren\u{FFFD}\r");
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn test_oversized_record_is_bounded_and_skipped() {
        let mut codec = AstmCodec::new(AstmVersion::E1381_95);
        codec.set_mode(DecodeMode::Record);
        let mut buf = BytesMut::new();

        for _ in 0..64 {
            buf.extend_from_slice(&[b'A'; 1024]);
            assert!(codec.decode(&mut buf).unwrap().is_none());
            assert!(buf.len() <= 241);
        }
        buf.extend_from_slice(b"AAA\rL|1|N\r");
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Record(record)) => {
                assert_eq!(record.errors, FrameErrors::MAX_SIZE_EXCEEDED);
                assert!(record.text.is_empty());
            }
            other => panic!("expected a record, got {other:?}"),
        }
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Record(record)) => {
                assert!(record.errors.is_empty());
                assert_eq!(record.text, "L|1|N\r");
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn test_record_at_size_limit_is_kept() {
        let mut codec = AstmCodec::new(AstmVersion::E1381_95);
        codec.set_mode(DecodeMode::Record);
        let mut buf = BytesMut::from(format!("{}\r", "A".repeat(240)).as_bytes());
        match codec.decode(&mut buf).unwrap() {
            Some(Inbound::Record(record)) => {
                assert!(record.errors.is_empty());
                assert_eq!(record.text.len(), 241);
            }
            other => panic!("expected a record, got {other:?}"),
        }
    }

    #[test]
    fn test_encode_outbound() {
        let mut codec = AstmCodec::new(AstmVersion::Lis01A);
        let mut dst = BytesMut::new();
        codec.encode(Outbound::Control(ACK), &mut dst).unwrap();
        codec
            .encode(Outbound::Frame(Frame::new(FrameType::End, 1, "P|1||123\r")), &mut dst)
            .unwrap();
        assert_eq!(dst[0], ACK);
        assert_eq!(&dst[1..], &encode_frame(&Frame::new(FrameType::End, 1, "P|1||123\r"))[..]);
    }
}
