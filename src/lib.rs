//! # astm-bridge
//!
//! ASTM LIS01-A2 / E1381-95 transmission protocol engine for laboratory
//! instruments, with an HTTP bridge on top:
//!
//! * **Communicator**: the half duplex establishment, framing, checksum and
//!   retry state machine, including line contention and the non-compliant
//!   character stream fallback
//! * **Interpreter**: translation between messages, frames, records and text
//! * **Bridge**: ASTM listen server, HTTP listener and forwarding handlers
//!
//! ## Quick Start
//!
//! ```rust
//! use astm_bridge::{AstmVersion, FrameType, Interpreter, Message, Record};
//!
//! let message = Message::new(vec![Record::new("P|1||123\r")]);
//! let frames = Interpreter::new(AstmVersion::Lis01A).message_to_frames(&message);
//!
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].frame_type, FrameType::End);
//! assert_eq!(frames[0].frame_number, 1);
//!
//! let wire = astm_bridge::frame::encode_frame(&frames[0]);
//! assert_eq!(&wire[wire.len() - 4..], b"CC\r\n");
//! ```
//!
//! ## Wire Format
//!
//! ```text
//! Establishment:  <ENQ> -> <ACK> | <NAK> | <ENQ> (line contention)
//! Frame:          <STX><frame# digit><text><ETB|ETX><checksum: 2 hex><CR><LF>
//! Frame ack:      <ACK> | <NAK> | <EOT>
//! Termination:    <EOT>
//! ```
//!
//! Frame numbers run 1..7, 0, 1, ... across the whole message. The checksum
//! is the sum of the frame number character, the text bytes and the
//! terminator, modulo 256.
//!
//! ## Profiles
//!
//! | Profile  | Max frame | Max text |
//! |----------|-----------|----------|
//! | LIS01-A  | 64000     | 63993    |
//! | E1381-95 | 247       | 240      |
//!
//! A receiver that sees `H` instead of `ENQ` switches to the non-compliant
//! mode: CR separated records without frames or checksums, ending at a
//! record that ends with `L|1|N`.

pub mod codec;
pub mod communicator;
pub mod config;
pub mod error;
pub mod forward;
pub mod frame;
pub mod handler;
pub mod http;
pub mod interpreter;
pub mod tcp;
pub mod types;

// Re-export main types for convenience
pub use types::{AstmVersion, Frame, FrameErrors, FrameType, Message, Record};

pub use codec::AstmCodec;
pub use communicator::{Communicator, SendResult, Timeouts};
pub use error::{AstmError, Result};
pub use handler::{DispatchMode, HandleStatus, HandlerResponse, HandlerService, MessageHandler};
pub use interpreter::Interpreter;
