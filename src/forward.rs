//! Handlers that forward a message to the other side of the bridge.
//!
//! [`HttpForwardHandler`] posts messages received over ASTM to an HTTP
//! endpoint. [`AstmForwardHandler`] sends messages received over HTTP to an
//! ASTM server, re-attempting rejected or failed sends and switching to
//! receive when the server contests the line.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::communicator::{Communicator, Timeouts};
use crate::error::{AstmError, Result};
use crate::handler::{
    BoxFuture, ForwardHints, HandleStatus, HandlerResponse, HandlerService, MessageHandler,
};
use crate::types::{printable, AstmVersion, Message};

/// Re-attempts after the first send to an ASTM server.
pub const MAX_FORWARD_RETRY_ATTEMPTS: usize = 3;

/// Pause before each re-attempt.
pub const SEND_ATTEMPTS_WAIT: Duration = Duration::from_secs(10);

const HTTP_FORWARD_NAME: &str = "Forwarding ASTM to HTTP Handler";
const ASTM_FORWARD_NAME: &str = "Forwarding HTTP to ASTM Handler";

/// Posts the message text to a fixed URI, optionally with basic auth.
#[derive(Debug, Clone)]
pub struct HttpForwardHandler {
    client: reqwest::Client,
    uri: String,
    username: Option<String>,
    password: Option<String>,
}

impl HttpForwardHandler {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            uri: uri.into(),
            username: None,
            password: None,
        }
    }

    /// Credentials are only sent when `username` is not empty.
    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username.filter(|u| !u.is_empty());
        self.password = password;
        self
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    async fn forward(&self, message: &Message) -> HandlerResponse {
        let body = message.text();
        debug!("forwarding request to http server at {}", self.uri);
        trace!("request: '{}'", printable(&body));

        let mut request = self.client.post(&self.uri).body(body);
        if let Some(username) = &self.username {
            debug!("using username '{}' to forward to {}", username, self.uri);
            request = request.basic_auth(username, self.password.as_deref());
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                error!("error occurred communicating with http server at {}: {}", self.uri, e);
                return HandlerResponse::new(HTTP_FORWARD_NAME, HandleStatus::ForwardFailError, "");
            }
        };

        let status = response.status();
        debug!("received {} response from http server at {}", status, self.uri);
        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => {
                error!("could not read response body from {}: {}", self.uri, e);
                return HandlerResponse::new(HTTP_FORWARD_NAME, HandleStatus::ForwardFailError, "");
            }
        };
        trace!("response: '{}'", printable(&body));

        if status == reqwest::StatusCode::OK {
            HandlerResponse::success(HTTP_FORWARD_NAME, body)
        } else {
            HandlerResponse::new(HTTP_FORWARD_NAME, HandleStatus::ForwardFailBadResponse, body)
        }
    }
}

impl MessageHandler for HttpForwardHandler {
    fn name(&self) -> &str {
        HTTP_FORWARD_NAME
    }

    fn handle<'a>(
        &'a self,
        message: &'a Message,
        _hints: &'a ForwardHints,
    ) -> BoxFuture<'a, Result<HandlerResponse>> {
        Box::pin(async move { Ok(self.forward(message).await) })
    }
}

enum SendOutcome {
    Done(HandleStatus),
    Rejected,
}

/// Sends the message to an ASTM server over TCP.
///
/// If the server contests the line, whatever it sends is received on the same
/// connection and dispatched to `contention_service`.
#[derive(Clone)]
pub struct AstmForwardHandler {
    host: String,
    port: u16,
    version: AstmVersion,
    contention_service: HandlerService,
    timeouts: Timeouts,
    retry_wait: Duration,
    cancel: CancellationToken,
}

impl AstmForwardHandler {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        version: AstmVersion,
        contention_service: HandlerService,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            version,
            contention_service,
            timeouts: Timeouts::default(),
            retry_wait: SEND_ATTEMPTS_WAIT,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    async fn forward(&self, message: &Message, hints: &ForwardHints) -> HandlerResponse {
        let host = hints
            .forward_address
            .as_deref()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(&self.host);
        let port = hints.forward_port.filter(|p| *p > 0).unwrap_or(self.port);
        let version = hints.forward_astm_version.unwrap_or(self.version);

        let mut attempt = 0usize;
        loop {
            if attempt > MAX_FORWARD_RETRY_ATTEMPTS {
                error!("reached max number of retries while attempting to forward http over astm");
                return HandlerResponse::new(ASTM_FORWARD_NAME, HandleStatus::FailTooManyAttempts, "");
            }
            if attempt > 0 {
                debug!("waiting to reattempt sending to astm server...");
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Self::interrupted(),
                    _ = tokio::time::sleep(self.retry_wait) => {}
                }
                debug!("reattempting forward to astm server (attempt {})", attempt + 1);
            }

            match self.attempt(host, port, version, message).await {
                Ok(SendOutcome::Done(status)) => {
                    return HandlerResponse::new(ASTM_FORWARD_NAME, status, "");
                }
                Ok(SendOutcome::Rejected) => {
                    warn!("astm server at {}:{} rejected the message", host, port);
                }
                Err(AstmError::Cancelled) => return Self::interrupted(),
                Err(e) => {
                    error!("error occurred communicating with astm server at {}:{}: {}", host, port, e);
                }
            }
            attempt += 1;
        }
    }

    fn interrupted() -> HandlerResponse {
        error!("interrupted while forwarding http message over astm");
        HandlerResponse::new(ASTM_FORWARD_NAME, HandleStatus::Interrupted, "")
    }

    async fn attempt(
        &self,
        host: &str,
        port: u16,
        version: AstmVersion,
        message: &Message,
    ) -> Result<SendOutcome> {
        debug!("connecting to forward to astm server at {}:{}", host, port);
        let stream = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(AstmError::Cancelled),
            stream = TcpStream::connect((host, port)) => stream?,
        };
        let mut communicator = Communicator::new(stream, version)
            .with_timeouts(self.timeouts)
            .with_cancellation(self.cancel.child_token());
        debug!(
            "created communicator {} for astm server at {}:{}",
            communicator.id(),
            host,
            port
        );

        let outcome = match communicator.send(message).await {
            Ok(result) if result.line_contention => self
                .handle_line_contention(&mut communicator, message)
                .await
                .map(SendOutcome::Done),
            Ok(result) if result.rejected => Ok(SendOutcome::Rejected),
            Ok(_) => Ok(SendOutcome::Done(HandleStatus::Success)),
            Err(e) => Err(e),
        };

        if let Err(e) = communicator.close().await {
            debug!("error closing connection with astm server at {}:{}: {}", host, port, e);
        }
        outcome
    }

    async fn handle_line_contention(
        &self,
        communicator: &mut Communicator<TcpStream>,
        message: &Message,
    ) -> Result<HandleStatus> {
        warn!("line was contested by the remote server, receiving from it first");
        match communicator.receive(true).await {
            Ok(received) => {
                let responses = self
                    .contention_service
                    .handle(&received, &ForwardHints::default())
                    .await;
                for response in responses.iter().filter(|r| !r.status.is_success()) {
                    error!(
                        "message received after line contention was not handled successfully by: {}",
                        response.handler
                    );
                }
            }
            Err(AstmError::Cancelled) => return Err(AstmError::Cancelled),
            Err(e) if !communicator.did_receive_establishment_succeed() => {
                return Err(AstmError::EstablishmentFailed(format!(
                    "line contention occurred but no establishment followed: {}",
                    e
                )));
            }
            Err(e) => error!("receive after line contention failed: {}", e),
        }

        if message.is_empty() {
            info!("original message was empty, treating it as a ping to trigger the remote sender");
            Ok(HandleStatus::Success)
        } else {
            Ok(HandleStatus::FailLineContested)
        }
    }
}

impl MessageHandler for AstmForwardHandler {
    fn name(&self) -> &str {
        ASTM_FORWARD_NAME
    }

    fn handle<'a>(
        &'a self,
        message: &'a Message,
        hints: &'a ForwardHints,
    ) -> BoxFuture<'a, Result<HandlerResponse>> {
        Box::pin(async move { Ok(self.forward(message, hints).await) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use crate::handler::DispatchMode;
    use crate::types::{Frame, FrameType, Record, ACK, ENQ, EOT, NAK};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::Router;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::Mutex;

    #[derive(Clone, Default)]
    struct Recorder(Arc<Mutex<Vec<Message>>>);

    impl MessageHandler for Recorder {
        fn name(&self) -> &str {
            "recorder"
        }

        fn handle<'a>(
            &'a self,
            message: &'a Message,
            _hints: &'a ForwardHints,
        ) -> BoxFuture<'a, Result<HandlerResponse>> {
            Box::pin(async move {
                self.0.lock().await.push(message.clone());
                Ok(HandlerResponse::success("recorder", ""))
            })
        }
    }

    fn quick() -> Timeouts {
        Timeouts {
            establishment_receive: Duration::from_secs(2),
            establishment_send: Duration::from_secs(2),
            frame_receive: Duration::from_secs(2),
            frame_ack: Duration::from_secs(2),
            non_compliant_message: Duration::from_secs(2),
            line_contention: Duration::from_secs(2),
        }
    }

    fn message() -> Message {
        Message::new(vec![Record::new("H|1\r"), Record::new("L|1|N\r")])
    }

    async fn http_endpoint(status: StatusCode) -> (String, Arc<Mutex<Vec<(String, Option<String>)>>>) {
        let seen: Arc<Mutex<Vec<(String, Option<String>)>>> = Arc::default();
        let captured = seen.clone();
        let app = Router::new().route(
            "/",
            post(move |headers: HeaderMap, body: String| {
                let captured = captured.clone();
                async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .map(str::to_owned);
                    captured.lock().await.push((body, auth));
                    (status, "accepted")
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}/", addr), seen)
    }

    #[tokio::test]
    async fn test_http_forward_success_with_basic_auth() {
        let (uri, seen) = http_endpoint(StatusCode::OK).await;
        let handler = HttpForwardHandler::new(uri)
            .with_credentials(Some("lab".into()), Some("secret".into()));

        let response = handler.handle(&message(), &ForwardHints::default()).await.unwrap();
        assert_eq!(response.status, HandleStatus::Success);
        assert_eq!(response.response, "accepted");

        let seen = seen.lock().await;
        assert_eq!(seen[0].0, "H|1\rL|1|N\r");
        assert_eq!(seen[0].1.as_deref(), Some("Basic bGFiOnNlY3JldA=="));
    }

    #[tokio::test]
    async fn test_http_forward_bad_response() {
        let (uri, seen) = http_endpoint(StatusCode::INTERNAL_SERVER_ERROR).await;
        let handler = HttpForwardHandler::new(uri).with_credentials(Some(String::new()), None);

        let response = handler.handle(&message(), &ForwardHints::default()).await.unwrap();
        assert_eq!(response.status, HandleStatus::ForwardFailBadResponse);
        assert_eq!(seen.lock().await[0].1, None);
    }

    #[tokio::test]
    async fn test_http_forward_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let handler = HttpForwardHandler::new(format!("http://{}/", addr));
        let response = handler.handle(&message(), &ForwardHints::default()).await.unwrap();
        assert_eq!(response.status, HandleStatus::ForwardFailError);
    }

    #[tokio::test]
    async fn test_astm_forward_delivers_message() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let peer = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut communicator = Communicator::with_id(socket, AstmVersion::E1381_95, 900)
                .with_timeouts(quick());
            communicator.receive(false).await.unwrap()
        });

        let handler = AstmForwardHandler::new("unused-host", 1, AstmVersion::Lis01A, HandlerService::default())
            .with_timeouts(quick());
        let hints = ForwardHints {
            forward_address: Some("127.0.0.1".into()),
            forward_port: Some(port),
            forward_astm_version: Some(AstmVersion::E1381_95),
        };
        let response = handler.handle(&message(), &hints).await.unwrap();

        assert_eq!(response.status, HandleStatus::Success);
        assert_eq!(peer.await.unwrap().text(), "H|1\rL|1|N\r");
    }

    #[tokio::test]
    async fn test_astm_forward_gives_up_after_rejections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let counter = connections.clone();
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = listener.accept().await.unwrap();
                counter.fetch_add(1, Ordering::SeqCst);
                let mut enq = [0u8; 1];
                socket.read_exact(&mut enq).await.unwrap();
                assert_eq!(enq[0], ENQ);
                socket.write_all(&[NAK]).await.unwrap();
            }
        });

        let handler = AstmForwardHandler::new("127.0.0.1", port, AstmVersion::Lis01A, HandlerService::default())
            .with_timeouts(quick())
            .with_retry_wait(Duration::from_millis(10));
        let response = handler.handle(&message(), &ForwardHints::default()).await.unwrap();

        assert_eq!(response.status, HandleStatus::FailTooManyAttempts);
        assert_eq!(connections.load(Ordering::SeqCst), MAX_FORWARD_RETRY_ATTEMPTS + 1);
    }

    #[tokio::test]
    async fn test_astm_forward_line_contention_ping() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut byte = [0u8; 1];
            socket.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], ENQ);
            // contest the line, then send our own message
            socket.write_all(&[ENQ]).await.unwrap();
            socket.write_all(&[ENQ]).await.unwrap();
            socket.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], ACK);
            let frame = Frame::new(FrameType::End, 1, "R|1|^^^GLU|5.4\r");
            socket.write_all(&encode_frame(&frame)).await.unwrap();
            socket.read_exact(&mut byte).await.unwrap();
            assert_eq!(byte[0], ACK);
            socket.write_all(&[EOT]).await.unwrap();
        });

        let recorder = Recorder::default();
        let service = HandlerService::new(DispatchMode::All).with_handler(recorder.clone());
        let handler = AstmForwardHandler::new("127.0.0.1", port, AstmVersion::Lis01A, service)
            .with_timeouts(quick());
        let response = handler
            .handle(&Message::default(), &ForwardHints::default())
            .await
            .unwrap();

        assert_eq!(response.status, HandleStatus::Success);
        let received = recorder.0.lock().await;
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].text(), "R|1|^^^GLU|5.4\r");
    }

    #[tokio::test]
    async fn test_astm_forward_interrupted() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let handler = AstmForwardHandler::new("127.0.0.1", 9, AstmVersion::Lis01A, HandlerService::default())
            .with_cancellation(cancel);

        let response = handler.handle(&message(), &ForwardHints::default()).await.unwrap();
        assert_eq!(response.status, HandleStatus::Interrupted);
    }
}
