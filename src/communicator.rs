//! Half duplex ASTM transmission protocol state machine.
//!
//! A [`Communicator`] exclusively owns one byte stream for its whole
//! lifetime. Every read runs under an explicit deadline and is abandoned as
//! soon as the cancellation token fires; an expired deadline is fatal for the
//! exchange and never retried silently. Protocol errors on a frame or record
//! are answered with NAK and retried up to a fixed bound.
//!
//! ```text
//! Idle -> Establishing -> Established | Rejected | LineContention | NonCompliant
//!      -> Transferring -> Terminated
//! ```

use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::codec::{AstmCodec, DecodeMode, Inbound, Outbound, ReceivedFrame};
use crate::error::{AstmError, Result};
use crate::interpreter::Interpreter;
use crate::types::{
    printable_bytes, AstmVersion, Frame, FrameErrors, FrameType, Message, ACK, ENQ, EOT, NAK,
    TERMINATION_RECORD_END,
};

/// Retries after the first attempt of one frame; the 6th consecutive failure is fatal.
pub const MAX_FRAME_RETRY_ATTEMPTS: usize = 5;

/// Retries of one record in non-compliant mode.
pub const MAX_RECORD_RETRY_ATTEMPTS: usize = 3;

/// Connection ids wrap back to 0 at this value.
pub const MAX_CONNECTION_ID: u16 = 1024;

/// Wrapping connection id generator, used only for log correlation.
#[derive(Debug)]
pub struct ConnectionIds {
    counter: AtomicU16,
}

impl ConnectionIds {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU16::new(0),
        }
    }

    pub fn next_id(&self) -> u16 {
        let step = |id: u16| (id + 1) % MAX_CONNECTION_ID;
        match self
            .counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| Some(step(id)))
        {
            Ok(prev) | Err(prev) => step(prev),
        }
    }
}

impl Default for ConnectionIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Process wide id source for communicators built with [`Communicator::new`].
pub static CONNECTION_IDS: ConnectionIds = ConnectionIds::new();

/// Deadlines for every blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Waiting for the peer's establishment character.
    pub establishment_receive: Duration,
    /// Waiting for the reply to our ENQ.
    pub establishment_send: Duration,
    /// Waiting for one complete frame.
    pub frame_receive: Duration,
    /// Waiting for the acknowledgement of a sent frame.
    pub frame_ack: Duration,
    /// Whole message in non-compliant mode.
    pub non_compliant_message: Duration,
    /// Waiting for the peer's ENQ after it won line contention.
    pub line_contention: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            establishment_receive: Duration::from_secs(60),
            establishment_send: Duration::from_secs(15),
            frame_receive: Duration::from_secs(30),
            frame_ack: Duration::from_secs(15),
            non_compliant_message: Duration::from_secs(60),
            line_contention: Duration::from_secs(20),
        }
    }
}

/// Outcome of a send that did not fail outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SendResult {
    /// The peer answered our ENQ with its own ENQ; it must be received from now.
    pub line_contention: bool,
    /// The peer answered our ENQ with NAK; do not retry immediately.
    pub rejected: bool,
}

/// Protocol engine bound to one connection.
pub struct Communicator<S> {
    id: u16,
    framed: Framed<S, AstmCodec>,
    version: AstmVersion,
    interpreter: Interpreter,
    timeouts: Timeouts,
    cancel: CancellationToken,
    receive_established: bool,
}

impl<S> Communicator<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S, version: AstmVersion) -> Self {
        Self::with_id(stream, version, CONNECTION_IDS.next_id())
    }

    pub fn with_id(stream: S, version: AstmVersion, id: u16) -> Self {
        debug!("communicator {}: created for {}", id, version);
        Self {
            id,
            framed: Framed::new(stream, AstmCodec::new(version)),
            version,
            interpreter: Interpreter::new(version),
            timeouts: Timeouts::default(),
            cancel: CancellationToken::new(),
            receive_established: false,
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Aborts pending and future reads once `cancel` fires.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn id(&self) -> u16 {
        self.id
    }

    /// Current profile; switches to `NonCompliant` when a receive detects it.
    pub fn version(&self) -> AstmVersion {
        self.version
    }

    pub fn did_receive_establishment_succeed(&self) -> bool {
        self.receive_established
    }

    /// Flushes and shuts down the write half of the stream.
    pub async fn close(self) -> Result<()> {
        let mut stream = self.framed.into_inner();
        stream.shutdown().await?;
        debug!("communicator {}: closed", self.id);
        Ok(())
    }

    /// Receives one message.
    ///
    /// `line_was_contentious` marks a receive started right after our own send
    /// lost line contention; the peer's establishment is then awaited for the
    /// shorter contention window.
    pub async fn receive(&mut self, line_was_contentious: bool) -> Result<Message> {
        trace!(
            "communicator {}: starting receive protocol (contention: {})",
            self.id,
            line_was_contentious
        );
        if self.version.is_framed() {
            let deadline = if line_was_contentious {
                self.timeouts.line_contention
            } else {
                self.timeouts.establishment_receive
            };
            self.establishment_receive(deadline).await?;
        }

        match self.version {
            AstmVersion::Lis01A | AstmVersion::E1381_95 => self.receive_compliant().await,
            AstmVersion::NonCompliant => self.receive_non_compliant().await,
        }
    }

    /// Sends one message.
    ///
    /// Line contention and rejection are reported in the result rather than
    /// as errors. EOT is sent after every transfer phase, successful or not.
    pub async fn send(&mut self, message: &Message) -> Result<SendResult> {
        trace!("communicator {}: starting send protocol", self.id);
        let frames = self.interpreter.message_to_frames(message);

        let response = match self.establishment_send().await {
            Ok(response) => response,
            Err(e) => {
                error!(
                    "communicator {}: establishment phase of send failed: {}",
                    self.id, e
                );
                self.termination_signal().await;
                return Err(e);
            }
        };
        match response {
            ACK => debug!("communicator {}: send established", self.id),
            ENQ => {
                warn!("communicator {}: line contention detected", self.id);
                return Ok(SendResult {
                    line_contention: true,
                    rejected: false,
                });
            }
            NAK => {
                debug!("communicator {}: establishment rejected by peer", self.id);
                return Ok(SendResult {
                    line_contention: false,
                    rejected: true,
                });
            }
            other => {
                self.termination_signal().await;
                return Err(AstmError::EstablishmentFailed(format!(
                    "received '{}' in reply to ENQ",
                    printable_bytes(&[other])
                )));
            }
        }

        let outcome = self.send_frames(&frames).await;
        self.termination_signal().await;
        outcome.map(|()| SendResult::default())
    }

    async fn read(
        &mut self,
        mode: DecodeMode,
        deadline: Duration,
        phase: &'static str,
    ) -> Result<Inbound> {
        if self.framed.codec().mode() != mode {
            self.framed.codec_mut().set_mode(mode);
        }
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AstmError::Cancelled),
            next = timeout(deadline, self.framed.next()) => match next {
                Err(_) => Err(AstmError::timeout(phase, deadline)),
                Ok(None) => Err(AstmError::ConnectionClosed),
                Ok(Some(item)) => item,
            },
        }
    }

    async fn write(&mut self, item: Outbound) -> Result<()> {
        self.framed.send(item).await
    }

    async fn termination_signal(&mut self) {
        debug!("communicator {}: sending EOT as termination", self.id);
        if let Err(e) = self.write(Outbound::Control(EOT)).await {
            warn!("communicator {}: could not send EOT: {}", self.id, e);
        }
    }

    fn switch_version(&mut self, version: AstmVersion) {
        self.version = version;
        self.interpreter = Interpreter::new(version);
        self.framed.codec_mut().set_version(version);
    }

    async fn establishment_receive(&mut self, deadline: Duration) -> Result<()> {
        let inbound = match self
            .read(DecodeMode::Establishment, deadline, "establishment receive")
            .await
        {
            Ok(inbound) => inbound,
            Err(e) => {
                if matches!(e, AstmError::Timeout { .. }) {
                    warn!(
                        "communicator {}: waited {:?} for the sender but nothing was received",
                        self.id, deadline
                    );
                }
                return Err(e);
            }
        };

        match inbound {
            Inbound::Control(ENQ) => {
                self.write(Outbound::Control(ACK)).await?;
                self.receive_established = true;
                debug!("communicator {}: receive established", self.id);
                Ok(())
            }
            Inbound::NonCompliantStart => {
                debug!(
                    "communicator {}: no establishment signal, reading in non-compliant mode",
                    self.id
                );
                self.switch_version(AstmVersion::NonCompliant);
                self.receive_established = true;
                Ok(())
            }
            other => {
                trace!(
                    "communicator {}: sending NAK, incorrect establishment signal",
                    self.id
                );
                self.write(Outbound::Control(NAK)).await?;
                Err(AstmError::EstablishmentFailed(format!(
                    "expected ENQ, received {}",
                    describe(&other)
                )))
            }
        }
    }

    async fn receive_compliant(&mut self) -> Result<Message> {
        let mut frames: Vec<(FrameType, ReceivedFrame)> = Vec::new();
        let mut retries = 0usize;

        loop {
            if retries > 0 {
                debug!(
                    "communicator {}: attempting retry of frame {}",
                    self.id,
                    frames.len()
                );
            }
            let expected = ((frames.len() + 1) % 8) as u8;
            let inbound = self
                .read(DecodeMode::Frame, self.timeouts.frame_receive, "frame receive")
                .await?;

            let errors = match inbound {
                Inbound::Control(EOT) => {
                    let incomplete = frames
                        .last()
                        .is_some_and(|(frame_type, _)| *frame_type != FrameType::End);
                    if incomplete || retries > 0 {
                        warn!(
                            "communicator {}: EOT before the transmission completed ({} frames, {} pending retries)",
                            self.id,
                            frames.len(),
                            retries
                        );
                        return Err(AstmError::PeerAborted);
                    }
                    debug!("communicator {}: EOT detected", self.id);
                    break;
                }
                Inbound::Frame(received) => {
                    let mut errors = received.errors;
                    if received.frame_number() != Some(expected) {
                        errors |= FrameErrors::WRONG_FRAME_NUMBER;
                    }
                    if errors.is_empty() {
                        frames.push((received.frame_type()?, received));
                    }
                    errors
                }
                other => {
                    error!(
                        "communicator {}: illegal start {} detected",
                        self.id,
                        describe(&other)
                    );
                    FrameErrors::ILLEGAL_START
                }
            };

            if errors.is_empty() {
                self.write(Outbound::Control(ACK)).await?;
                retries = 0;
                continue;
            }

            debug!(
                "communicator {}: frame unsuccessfully received due to {:?}",
                self.id, errors
            );
            self.write(Outbound::Control(NAK)).await?;
            retries += 1;
            if retries > MAX_FRAME_RETRY_ATTEMPTS {
                error!(
                    "communicator {}: max retry attempts reached for frame {}",
                    self.id,
                    frames.len()
                );
                self.drain_termination().await;
                return Err(AstmError::TooManyRetries {
                    attempts: retries,
                    last_errors: errors,
                });
            }
        }

        Ok(self.interpreter.wire_frames_to_message(
            frames
                .iter()
                .map(|(frame_type, frame)| (*frame_type, &frame.text[..])),
        ))
    }

    /// The sender should enter termination after our last NAK; its EOT is irrelevant.
    async fn drain_termination(&mut self) {
        match self
            .read(DecodeMode::Control, self.timeouts.frame_receive, "termination")
            .await
        {
            Ok(inbound) => trace!(
                "communicator {}: drained {} after giving up",
                self.id,
                describe(&inbound)
            ),
            Err(e) => warn!(
                "communicator {}: no termination received after giving up: {}",
                self.id, e
            ),
        }
    }

    async fn receive_non_compliant(&mut self) -> Result<Message> {
        let deadline = self.timeouts.non_compliant_message;
        match timeout(deadline, self.receive_records()).await {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "communicator {}: timeout while receiving message in non-compliant mode",
                    self.id
                );
                Err(AstmError::timeout("non-compliant receive", deadline))
            }
        }
    }

    async fn receive_records(&mut self) -> Result<Message> {
        let mut records = Vec::new();
        let mut retries = 0usize;

        loop {
            let inbound = self
                .read(DecodeMode::Record, self.timeouts.frame_receive, "record receive")
                .await?;
            let errors = match inbound {
                Inbound::Record(record) if record.errors.is_empty() => {
                    retries = 0;
                    let terminates = record.text.trim().ends_with(TERMINATION_RECORD_END);
                    records.push(self.interpreter.text_to_record(record.text));
                    debug!("communicator {}: record successfully received", self.id);
                    if terminates {
                        break;
                    }
                    continue;
                }
                Inbound::Record(record) => record.errors,
                other => {
                    warn!(
                        "communicator {}: unexpected {} in non-compliant mode",
                        self.id,
                        describe(&other)
                    );
                    FrameErrors::ILLEGAL_CHAR
                }
            };

            debug!(
                "communicator {}: record discarded due to {:?}",
                self.id, errors
            );
            retries += 1;
            if retries > MAX_RECORD_RETRY_ATTEMPTS {
                return Err(AstmError::TooManyRetries {
                    attempts: retries,
                    last_errors: errors,
                });
            }
        }

        Ok(self.interpreter.records_to_message(records))
    }

    async fn establishment_send(&mut self) -> Result<u8> {
        trace!("communicator {}: sending ENQ as establishment signal", self.id);
        self.write(Outbound::Control(ENQ)).await?;
        match self
            .read(
                DecodeMode::Control,
                self.timeouts.establishment_send,
                "establishment send",
            )
            .await?
        {
            Inbound::Control(byte) => {
                trace!(
                    "communicator {}: received '{}' in reply to ENQ",
                    self.id,
                    printable_bytes(&[byte])
                );
                Ok(byte)
            }
            other => Err(AstmError::EstablishmentFailed(format!(
                "unexpected {} in reply to ENQ",
                describe(&other)
            ))),
        }
    }

    async fn send_frames(&mut self, frames: &[Frame]) -> Result<()> {
        for (i, frame) in frames.iter().enumerate() {
            let mut retries = 0usize;
            loop {
                self.write(Outbound::Frame(frame.clone())).await?;
                let inbound = self
                    .read(
                        DecodeMode::Control,
                        self.timeouts.frame_ack,
                        "frame acknowledgement",
                    )
                    .await?;
                match inbound {
                    Inbound::Control(ACK) => break,
                    Inbound::Control(EOT) => {
                        warn!(
                            "communicator {}: send terminated early by the receiver at frame {}",
                            self.id, i
                        );
                        return Err(AstmError::PeerAborted);
                    }
                    Inbound::Control(NAK) => {
                        debug!("communicator {}: NAK received for frame {}", self.id, i);
                    }
                    other => {
                        warn!(
                            "communicator {}: illegal acknowledgement {} for frame {}",
                            self.id,
                            describe(&other),
                            i
                        );
                    }
                }
                retries += 1;
                if retries > MAX_FRAME_RETRY_ATTEMPTS {
                    error!(
                        "communicator {}: too many retries sending frame {}",
                        self.id, i
                    );
                    return Err(AstmError::TooManyRetries {
                        attempts: retries,
                        last_errors: FrameErrors::empty(),
                    });
                }
            }
        }
        Ok(())
    }
}

fn describe(inbound: &Inbound) -> String {
    match inbound {
        Inbound::Control(byte) => format!("'{}'", printable_bytes(&[*byte])),
        Inbound::NonCompliantStart => "non-compliant start".to_owned(),
        Inbound::Frame(frame) => format!("frame {:?}", frame.frame_number()),
        Inbound::Record(_) => "record".to_owned(),
    }
}
