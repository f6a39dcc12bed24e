use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::communicator::{Communicator, Timeouts};
use crate::error::Result;
use crate::handler::{ForwardHints, HandlerService};
use crate::interpreter::Interpreter;
use crate::types::AstmVersion;

/// TCP listen server for one ASTM profile
pub struct AstmTcpServer {
    listener: TcpListener,
    version: AstmVersion,
    timeouts: Timeouts,
}

impl AstmTcpServer {
    /// Bind to the specified address
    pub async fn bind(addr: &str, version: AstmVersion) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        info!("ASTM TCP server ({}) bound to {}", version, addr);

        Ok(Self {
            listener,
            version,
            timeouts: Timeouts::default(),
        })
    }

    pub fn with_timeouts(mut self, timeouts: Timeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn version(&self) -> AstmVersion {
        self.version
    }

    /// Accept connections until `shutdown` fires, one worker task per connection.
    ///
    /// Workers observe a child of `shutdown`, so in-flight exchanges are
    /// cancelled too.
    pub async fn run(self, service: HandlerService, shutdown: CancellationToken) -> Result<()> {
        info!("ASTM TCP server ({}) starting...", self.version);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("ASTM TCP server ({}) shutting down", self.version);
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((socket, addr)) => {
                        info!("New connection from {}", addr);

                        let service = service.clone();
                        let cancel = shutdown.child_token();
                        let version = self.version;
                        let timeouts = self.timeouts;

                        tokio::spawn(async move {
                            Self::handle_connection(socket, addr, version, timeouts, service, cancel)
                                .await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                },
            }
        }

        Ok(())
    }

    /// Handle a single client connection: receive, dispatch, optional reply, close.
    async fn handle_connection(
        socket: TcpStream,
        addr: SocketAddr,
        version: AstmVersion,
        timeouts: Timeouts,
        service: HandlerService,
        cancel: CancellationToken,
    ) {
        let mut communicator = Communicator::new(socket, version)
            .with_timeouts(timeouts)
            .with_cancellation(cancel);
        let id = communicator.id();
        info!("Starting session {} with {}", id, addr);

        if let Err(e) = Self::exchange(&mut communicator, &service).await {
            error!("Session {} error communicating with astm sender: {}", id, e);
        }

        match communicator.close().await {
            Ok(()) => debug!("Session {} closed socket with astm sender", id),
            Err(e) => warn!("Session {} error closing socket: {}", id, e),
        }
        info!("Session {} ended", id);
    }

    async fn exchange(
        communicator: &mut Communicator<TcpStream>,
        service: &HandlerService,
    ) -> Result<()> {
        let id = communicator.id();
        let message = communicator.receive(false).await?;
        info!(
            "Session {} received message of {} records",
            id,
            message.records().len()
        );

        let responses = service.handle(&message, &ForwardHints::default()).await;
        if responses.is_empty() {
            error!("Session {} message was unhandled", id);
        }
        for response in &responses {
            if response.status.is_success() {
                debug!("Session {} message was handled successfully by: {}", id, response.handler);
            } else {
                error!(
                    "Session {} message was not handled successfully by: {} ({:?})",
                    id, response.handler, response.status
                );
            }
        }

        if !communicator.version().is_framed() {
            return Ok(());
        }
        let interpreter = Interpreter::new(communicator.version());
        for response in responses
            .iter()
            .filter(|r| r.status.is_success() && r.communicate_response && !r.response.is_empty())
        {
            debug!("Session {} replying with response from {}", id, response.handler);
            let reply = interpreter.text_to_message(&response.response);
            let result = communicator.send(&reply).await?;
            if result.line_contention || result.rejected {
                warn!(
                    "Session {} reply from {} was not accepted ({:?})",
                    id, response.handler, result
                );
            }
        }
        Ok(())
    }
}
