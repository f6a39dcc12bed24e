//! HTTP listener.
//!
//! - `POST /` takes raw message text (CR separated records) and dispatches it
//!   to the HTTP side handlers. The query parameters `forwardAddress`,
//!   `forwardPort` and `forwardAstmVersion` override the forwarding target.
//! - `GET /health` reports liveness.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use crate::error::Result;
use crate::handler::{ForwardHints, HandlerResponse, HandlerService};
use crate::interpreter::Interpreter;
use crate::types::printable;

/// Body of a `POST /` reply.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceResponse {
    pub responses: Vec<HandlerResponse>,
}

#[derive(Clone)]
struct HttpState {
    service: HandlerService,
    interpreter: Interpreter,
}

/// Routes for the bridge. `service` should dispatch in `First` mode.
pub fn router(service: HandlerService) -> Router {
    Router::new()
        .route("/", post(handle_message))
        .route("/health", get(health_check))
        .with_state(HttpState {
            service,
            interpreter: Interpreter::default(),
        })
}

/// Serves [`router`] on `listener` until `shutdown` fires.
pub async fn serve(
    listener: TcpListener,
    service: HandlerService,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("HTTP listener bound to {}", listener.local_addr()?);
    axum::serve(listener, router(service))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("HTTP listener stopped");
    Ok(())
}

async fn handle_message(
    State(state): State<HttpState>,
    Query(hints): Query<ForwardHints>,
    body: String,
) -> Json<ServiceResponse> {
    debug!("received http request to handle");
    trace!("request body: '{}', hints: {:?}", printable(&body), hints);

    let message = state.interpreter.text_to_message(&body);
    let responses = state.service.handle(&message, &hints).await;
    for response in &responses {
        if response.status.is_success() {
            debug!("message was handled successfully by: {}", response.handler);
        } else {
            error!("message was not handled successfully by: {}", response.handler);
        }
    }
    Json(ServiceResponse { responses })
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
