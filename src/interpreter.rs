//! Translation between messages, frames, records and raw text.
//!
//! The same interpreter serves the wire side and the HTTP side so a message
//! is reconstructed identically whichever transport carried it.

use tracing::{debug, trace};

use crate::types::{
    printable, AstmVersion, Frame, FrameType, Message, Record, CR, MESSAGE_TERMINATOR_RECORD_START,
};

/// Terminator record marker as a wire byte.
const TERMINATOR_START_BYTE: u8 = MESSAGE_TERMINATOR_RECORD_START as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interpreter {
    version: AstmVersion,
}

impl Interpreter {
    pub fn new(version: AstmVersion) -> Self {
        Self { version }
    }

    pub fn version(&self) -> AstmVersion {
        self.version
    }

    /// Splits every record into frames of at most the profile's text size.
    ///
    /// Frame numbers start at 1 and run mod 8 across record boundaries. Only
    /// the very last frame is `End`.
    pub fn message_to_frames(&self, message: &Message) -> Vec<Frame> {
        debug!("interpreting message as frames...");
        let max_text_size = self.version.max_text_size();
        let mut frames: Vec<Frame> = message
            .records()
            .iter()
            .flat_map(|record| chunk_text(&record.text, max_text_size))
            .enumerate()
            .map(|(i, text)| Frame::new(FrameType::Intermediate, ((i + 1) % 8) as u8, text))
            .collect();

        if let Some(last) = frames.last_mut() {
            last.frame_type = FrameType::End;
        }
        trace!("message split into {} frames", frames.len());
        frames
    }

    /// Reassembles received frames into a message.
    ///
    /// Text is buffered until an `End` frame leaves a buffer whose final line
    /// starts with the terminator record marker; that buffer becomes one
    /// record. Text still buffered after the last frame becomes the final
    /// record, so the message text always equals the concatenated frame text.
    pub fn frames_to_message(&self, frames: &[Frame]) -> Message {
        self.wire_frames_to_message(
            frames
                .iter()
                .map(|frame| (frame.frame_type, frame.text.as_bytes())),
        )
    }

    /// [`frames_to_message`](Self::frames_to_message) over raw frame text.
    ///
    /// Bytes are joined before decoding, so a character split across frames
    /// is restored. Invalid UTF-8 in a record becomes U+FFFD.
    pub fn wire_frames_to_message<'a, I>(&self, frames: I) -> Message
    where
        I: IntoIterator<Item = (FrameType, &'a [u8])>,
    {
        let mut message = Message::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut count = 0usize;

        for (frame_type, text) in frames {
            count += 1;
            buffer.extend_from_slice(text);
            if frame_type == FrameType::End && closes_record(&buffer) {
                let record = decode_record(&std::mem::take(&mut buffer));
                trace!("added record '{}'", printable(&record.text));
                message.push(record);
            }
        }
        if !buffer.is_empty() {
            let record = decode_record(&buffer);
            trace!("added trailing record '{}'", printable(&record.text));
            message.push(record);
        }
        debug!("interpreted {} frames as message", count);
        message
    }

    pub fn records_to_message(&self, records: Vec<Record>) -> Message {
        Message::new(records)
    }

    pub fn text_to_record(&self, text: impl Into<String>) -> Record {
        Record::new(text)
    }

    /// Splits raw message text after every CR; the text is kept byte for byte.
    pub fn text_to_message(&self, text: &str) -> Message {
        text.split_inclusive(CR as char)
            .map(|line| self.text_to_record(line))
            .collect::<Vec<_>>()
            .into()
    }
}

impl Default for Interpreter {
    fn default() -> Self {
        Self::new(AstmVersion::default())
    }
}

/// Byte chunks of at most `max` bytes that never split a UTF-8 character.
fn chunk_text(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let mut end = rest.len().min(max);
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            end = rest.chars().next().map_or(rest.len(), char::len_utf8);
        }
        let (head, tail) = rest.split_at(end);
        chunks.push(head.to_owned());
        rest = tail;
    }
    chunks
}

fn closes_record(buffer: &[u8]) -> bool {
    let end = buffer.iter().rposition(|b| *b != CR).map_or(0, |i| i + 1);
    let trimmed = &buffer[..end];
    let line_start = trimmed.iter().rposition(|b| *b == CR).map_or(0, |i| i + 1);
    trimmed.get(line_start) == Some(&TERMINATOR_START_BYTE)
}

fn decode_record(bytes: &[u8]) -> Record {
    Record::new(String::from_utf8_lossy(bytes).into_owned())
}
