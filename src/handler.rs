//! Handler dispatch for completed messages.
//!
//! Handlers are registered on a [`HandlerService`] in order. A dispatch
//! selects the matching handlers (all of them, or only the first), runs them
//! one after another and collects one [`HandlerResponse`] each. Errors
//! returned by a handler, and panics raised inside one, are converted to
//! [`HandleStatus::GenericFail`] so they never reach the transport worker.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::Result;
use crate::types::{AstmVersion, Message};

/// Boxed future returned by handlers.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HandleStatus {
    Success,
    GenericFail,
    ForwardFailBadResponse,
    ForwardFailError,
    FailTooManyAttempts,
    FailLineContested,
    Interrupted,
}

impl HandleStatus {
    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Outcome of one handler for one message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HandlerResponse {
    pub response: String,
    pub status: HandleStatus,
    /// Whether `response` should be sent back to the peer that delivered the message.
    #[serde(skip)]
    pub communicate_response: bool,
    /// Name of the handler that produced this response.
    pub handler: String,
}

impl HandlerResponse {
    pub fn new(handler: impl Into<String>, status: HandleStatus, response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            status,
            communicate_response: false,
            handler: handler.into(),
        }
    }

    pub fn success(handler: impl Into<String>, response: impl Into<String>) -> Self {
        Self::new(handler, HandleStatus::Success, response)
    }

    pub fn communicate(mut self) -> Self {
        self.communicate_response = true;
        self
    }
}

/// Per request overrides of the forwarding destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardHints {
    pub forward_address: Option<String>,
    pub forward_port: Option<u16>,
    pub forward_astm_version: Option<AstmVersion>,
}

/// Capability implemented by everything that consumes a completed message.
pub trait MessageHandler: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Whether this handler wants `message`. Defaults to every message.
    fn matches(&self, _message: &Message) -> bool {
        true
    }

    fn handle<'a>(
        &'a self,
        message: &'a Message,
        hints: &'a ForwardHints,
    ) -> BoxFuture<'a, Result<HandlerResponse>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Every matching handler runs.
    #[default]
    All,
    /// Only the first matching handler runs.
    First,
}

/// Ordered handler registry.
#[derive(Clone, Default)]
pub struct HandlerService {
    handlers: Vec<Arc<dyn MessageHandler>>,
    mode: DispatchMode,
}

impl HandlerService {
    pub fn new(mode: DispatchMode) -> Self {
        Self {
            handlers: Vec::new(),
            mode,
        }
    }

    pub fn with_handler<H: MessageHandler>(mut self, handler: H) -> Self {
        self.register(Arc::new(handler));
        self
    }

    pub fn register(&mut self, handler: Arc<dyn MessageHandler>) {
        debug!("registered message handler '{}'", handler.name());
        self.handlers.push(handler);
    }

    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Runs the matching handlers in registration order.
    ///
    /// An empty result means nothing matched.
    pub async fn handle(&self, message: &Message, hints: &ForwardHints) -> Vec<HandlerResponse> {
        let mut responses = Vec::new();

        for handler in &self.handlers {
            if !Self::handler_matches(handler.as_ref(), message) {
                continue;
            }
            responses.push(Self::run(handler.as_ref(), message, hints).await);
            if self.mode == DispatchMode::First {
                break;
            }
        }

        if responses.is_empty() {
            warn!("message was unhandled");
        }
        responses
    }

    fn handler_matches(handler: &dyn MessageHandler, message: &Message) -> bool {
        match std::panic::catch_unwind(AssertUnwindSafe(|| handler.matches(message))) {
            Ok(matches) => matches,
            Err(panic) => {
                error!(
                    "handler '{}' panicked while matching: {}",
                    handler.name(),
                    panic_message(panic.as_ref())
                );
                false
            }
        }
    }

    async fn run(
        handler: &dyn MessageHandler,
        message: &Message,
        hints: &ForwardHints,
    ) -> HandlerResponse {
        let outcome = AssertUnwindSafe(async { handler.handle(message, hints).await })
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(response)) => {
                debug!(
                    "message handled by '{}' with status {:?}",
                    handler.name(),
                    response.status
                );
                response
            }
            Ok(Err(e)) => {
                error!("handler '{}' failed: {}", handler.name(), e);
                HandlerResponse::new(handler.name(), HandleStatus::GenericFail, e.to_string())
            }
            Err(panic) => {
                let reason = panic_message(panic.as_ref());
                error!("handler '{}' panicked: {}", handler.name(), reason);
                HandlerResponse::new(handler.name(), HandleStatus::GenericFail, reason)
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_owned()
    }
}
