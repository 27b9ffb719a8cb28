/// LLM client — the single point of entry for all OpenAI API calls.
///
/// ARCHITECTURAL RULE: No other module may call the OpenAI API directly.
/// Both embedding generation and chat completions MUST go through this module.
///
/// Models are hardcoded — do not make configurable to prevent drift.
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

const OPENAI_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const OPENAI_EMBEDDINGS_URL: &str = "https://api.openai.com/v1/embeddings";

/// Chat model used for all streamed completions.
pub const CHAT_MODEL: &str = "gpt-4o-mini";
/// Embedding model used for document retrieval.
pub const EMBEDDING_MODEL: &str = "text-embedding-3-small";

const MAX_RETRIES: u32 = 3;
const STREAM_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("JSON parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Rate limited after {retries} retries")]
    RateLimited { retries: u32 },

    #[error("Stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("Embedding response contained no vectors")]
    EmptyEmbedding,
}

/// Message role, matching both the OpenAI wire format and the `role` column
/// of the `conversations` table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One role-tagged message in an assembled prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

/// A single SSE `data: {...}` chunk from a streaming chat completion.
#[derive(Debug, Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    error: OpenAiErrorBody,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorBody {
    message: String,
}

/// The single LLM client used by all services.
/// Wraps the OpenAI embeddings and chat-completions endpoints.
#[derive(Clone)]
pub struct LlmClient {
    client: Client,
    api_key: String,
}

impl LlmClient {
    pub fn new(api_key: String) -> Self {
        Self {
            client: Client::builder()
                .timeout(std::time::Duration::from_secs(120))
                .build()
                .expect("Failed to build HTTP client"),
            api_key,
        }
    }

    /// Generates an embedding vector for `text`.
    /// Retries on 429 (rate limit) and 5xx errors with exponential backoff —
    /// safe here because nothing has been streamed to the caller yet.
    pub async fn embed(&self, text: &str) -> Result<Vec<f32>, LlmError> {
        let body = serde_json::json!({
            "model": EMBEDDING_MODEL,
            "input": text,
        });

        let mut last_error: Option<LlmError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s
                let delay = std::time::Duration::from_millis(1000 * (1 << (attempt - 1)));
                warn!(
                    "Embedding call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            let response = self
                .client
                .post(OPENAI_EMBEDDINGS_URL)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(LlmError::Http(e));
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                warn!("Embeddings API returned {}: {}", status, body);
                last_error = Some(LlmError::Api {
                    status: status.as_u16(),
                    message: body,
                });
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(LlmError::Api {
                    status: status.as_u16(),
                    message: extract_error_message(&body),
                });
            }

            let api_resp: EmbeddingApiResponse = response.json().await?;

            let vector = api_resp
                .data
                .into_iter()
                .next()
                .map(|d| d.embedding)
                .ok_or(LlmError::EmptyEmbedding)?;

            debug!("Embedding generated ({} dimensions)", vector.len());

            return Ok(vector);
        }

        Err(last_error.unwrap_or(LlmError::RateLimited {
            retries: MAX_RETRIES,
        }))
    }

    /// Starts a streaming chat completion and returns a channel of text
    /// increments in arrival order. Errors before the first byte are returned
    /// directly; a mid-stream failure arrives as the final channel item. The
    /// stream is not restartable, so there is no retry.
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
    ) -> Result<mpsc::Receiver<Result<String, LlmError>>, LlmError> {
        let body = serde_json::json!({
            "model": CHAT_MODEL,
            "messages": messages,
            "stream": true,
        });

        debug!(
            model = CHAT_MODEL,
            message_count = messages.len(),
            "Sending streaming chat request"
        );

        let response = self
            .client
            .post(OPENAI_CHAT_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&body)
            .send()
            .await?;

        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Chat API returned {}: {}", status, body);
            return Err(LlmError::Api {
                status: status.as_u16(),
                message: extract_error_message(&body),
            });
        }

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);

        // Read the SSE byte stream and forward content deltas as they arrive.
        tokio::spawn(async move {
            let mut byte_stream = response.bytes_stream();
            let mut buffer = String::new();

            while let Some(chunk_result) = byte_stream.next().await {
                let bytes = match chunk_result {
                    Ok(b) => b,
                    Err(e) => {
                        let _ = tx
                            .send(Err(LlmError::StreamInterrupted(e.to_string())))
                            .await;
                        return;
                    }
                };

                buffer.push_str(&String::from_utf8_lossy(&bytes));

                // Process complete lines
                while let Some(line_end) = buffer.find('\n') {
                    let line = buffer[..line_end].trim_end_matches('\r').to_string();
                    buffer = buffer[line_end + 1..].to_string();

                    match parse_sse_line(&line) {
                        SseFrame::Content(text) => {
                            if tx.send(Ok(text)).await.is_err() {
                                return; // receiver dropped
                            }
                        }
                        SseFrame::Done => return,
                        SseFrame::Skip => {}
                    }
                }
            }
        });

        Ok(rx)
    }
}

#[derive(Debug, PartialEq)]
enum SseFrame {
    /// A non-empty content delta.
    Content(String),
    /// The `[DONE]` terminator.
    Done,
    /// Anything else: blank lines, SSE comments, deltas with no content,
    /// unparseable frames.
    Skip,
}

fn parse_sse_line(line: &str) -> SseFrame {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return SseFrame::Skip;
    }

    let Some(data) = line.strip_prefix("data:") else {
        return SseFrame::Skip;
    };
    let data = data.trim();

    if data == "[DONE]" {
        return SseFrame::Done;
    }

    match serde_json::from_str::<StreamResponse>(data) {
        Ok(resp) => resp
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|c| !c.is_empty())
            .map(SseFrame::Content)
            .unwrap_or(SseFrame::Skip),
        Err(e) => {
            trace!(data, error = %e, "Ignoring unparseable SSE chunk");
            SseFrame::Skip
        }
    }
}

/// Pulls the human-readable message out of an OpenAI error body,
/// falling back to the raw body if it does not parse.
fn extract_error_message(body: &str) -> String {
    serde_json::from_str::<OpenAiError>(body)
        .map(|e| e.error.message)
        .unwrap_or_else(|_| body.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sse_line_content_delta() {
        let line = r#"data: {"choices":[{"delta":{"content":"Hello"}}]}"#;
        assert_eq!(parse_sse_line(line), SseFrame::Content("Hello".to_string()));
    }

    #[test]
    fn test_parse_sse_line_done() {
        assert_eq!(parse_sse_line("data: [DONE]"), SseFrame::Done);
    }

    #[test]
    fn test_parse_sse_line_empty_delta_skipped() {
        // The first chunk of a stream carries only the role, no content.
        let line = r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#;
        assert_eq!(parse_sse_line(line), SseFrame::Skip);
    }

    #[test]
    fn test_parse_sse_line_empty_content_skipped() {
        let line = r#"data: {"choices":[{"delta":{"content":""}}]}"#;
        assert_eq!(parse_sse_line(line), SseFrame::Skip);
    }

    #[test]
    fn test_parse_sse_line_blank_and_comment() {
        assert_eq!(parse_sse_line(""), SseFrame::Skip);
        assert_eq!(parse_sse_line(": keep-alive"), SseFrame::Skip);
    }

    #[test]
    fn test_parse_sse_line_unparseable_skipped() {
        assert_eq!(parse_sse_line("data: not-json"), SseFrame::Skip);
    }

    #[test]
    fn test_role_serializes_lowercase() {
        let msg = ChatMessage {
            role: Role::Assistant,
            content: "hi".to_string(),
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "assistant");
        assert_eq!(json["content"], "hi");
    }

    #[test]
    fn test_extract_error_message() {
        let body = r#"{"error":{"message":"Invalid API key","type":"invalid_request_error"}}"#;
        assert_eq!(extract_error_message(body), "Invalid API key");
        assert_eq!(extract_error_message("boom"), "boom");
    }
}
