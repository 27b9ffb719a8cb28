use std::convert::Infallible;

use axum::body::Body;
use axum::extract::{Json, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{info, warn};

use crate::errors::AppError;
use crate::llm_client::Role;
use crate::state::AppState;

use super::{context, prompts, relay, store};

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    #[serde(default = "default_user_id")]
    pub user_id: String,
    #[serde(default)]
    pub question: String,
}

fn default_user_id() -> String {
    "user123".to_string()
}

/// POST /chat
///
/// Streams the assistant's reply as plain text. The user turn is persisted
/// before streaming begins; the assistant turn is persisted after the
/// upstream stream completes, best-effort (the response has already ended,
/// so a failed write is logged and never surfaced to the caller).
pub async fn handle_chat(
    State(state): State<AppState>,
    Json(req): Json<ChatRequest>,
) -> Result<Response, AppError> {
    info!(user_id = %req.user_id, "Chat request received");

    let ctx = context::build_context(&state.db, &state.llm, &req.user_id, &req.question).await?;

    let messages = prompts::assemble_messages(&ctx.rag_context, &ctx.history, &req.question);

    store::append_turn(&state.db, &req.user_id, Role::User, &req.question).await?;

    let completion = state.llm.stream_chat(&messages).await?;

    // Capacity 1: no buffering beyond the single pending increment, so
    // transport backpressure stalls upstream consumption.
    let (body_tx, body_rx) = mpsc::channel::<Bytes>(1);

    // The relay runs detached from the response so a caller disconnect does
    // not cancel accumulation or the final persistence write.
    let db = state.db.clone();
    let user_id = req.user_id.clone();
    tokio::spawn(async move {
        match relay::pump(completion, body_tx).await {
            Ok(reply) => {
                if let Err(e) = store::append_turn(&db, &user_id, Role::Assistant, &reply).await {
                    warn!(user_id = %user_id, "Failed to persist assistant turn: {e}");
                }
            }
            Err(e) => {
                // The caller sees an abrupt truncation; nothing is persisted
                // for a partial reply.
                warn!(user_id = %user_id, "Completion stream failed mid-response: {e}");
            }
        }
    });

    let stream = ReceiverStream::new(body_rx).map(Ok::<_, Infallible>);

    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_body_gets_defaults() {
        let req: ChatRequest = serde_json::from_str("{}").unwrap();
        assert_eq!(req.user_id, "user123");
        assert_eq!(req.question, "");
    }

    #[test]
    fn test_supplied_fields_override_defaults() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"user_id":"u1","question":"What is KYC?"}"#).unwrap();
        assert_eq!(req.user_id, "u1");
        assert_eq!(req.question, "What is KYC?");
    }

    #[test]
    fn test_unknown_fields_tolerated() {
        let req: ChatRequest =
            serde_json::from_str(r#"{"question":"hi","session":"ignored"}"#).unwrap();
        assert_eq!(req.user_id, "user123");
        assert_eq!(req.question, "hi");
    }
}
