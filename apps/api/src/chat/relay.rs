use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use crate::llm_client::LlmError;

/// Pumps completion increments into the response body channel while
/// accumulating the full reply for persistence.
///
/// Increments are forwarded in arrival order, one at a time; there is no
/// batching and no retry. If the body receiver is dropped (caller
/// disconnected), forwarding stops but the upstream stream is still drained
/// so the reply can be persisted. A mid-stream upstream failure returns the
/// error; whatever was already forwarded stays sent.
pub async fn pump(
    mut completion: mpsc::Receiver<Result<String, LlmError>>,
    body: mpsc::Sender<Bytes>,
) -> Result<String, LlmError> {
    let mut collected = String::new();
    let mut caller_connected = true;

    while let Some(increment) = completion.recv().await {
        let text = increment?;
        collected.push_str(&text);

        if caller_connected && body.send(Bytes::from(text)).await.is_err() {
            debug!("Caller disconnected mid-stream; draining completion for persistence");
            caller_connected = false;
        }
    }

    Ok(collected)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drives `pump` with scripted increments and returns (pump result,
    /// bytes the caller saw).
    async fn run_pump(
        increments: Vec<Result<String, LlmError>>,
        caller_reads: Option<usize>,
    ) -> (Result<String, LlmError>, String) {
        let (completion_tx, completion_rx) = mpsc::channel(8);
        let (body_tx, mut body_rx) = mpsc::channel::<Bytes>(1);

        let producer = tokio::spawn(async move {
            for increment in increments {
                if completion_tx.send(increment).await.is_err() {
                    return;
                }
            }
        });

        let consumer = tokio::spawn(async move {
            let mut seen = String::new();
            let mut remaining = caller_reads;
            while let Some(bytes) = body_rx.recv().await {
                seen.push_str(&String::from_utf8_lossy(&bytes));
                if let Some(n) = remaining.as_mut() {
                    *n -= 1;
                    if *n == 0 {
                        break; // simulate disconnect
                    }
                }
            }
            seen
        });

        let result = pump(completion_rx, body_tx).await;
        producer.await.unwrap();
        let seen = consumer.await.unwrap();

        (result, seen)
    }

    #[tokio::test]
    async fn test_streamed_output_equals_accumulated_reply() {
        let increments = vec![
            Ok("KYC ".to_string()),
            Ok("means ".to_string()),
            Ok("Know Your Customer.".to_string()),
        ];

        let (result, seen) = run_pump(increments, None).await;

        let collected = result.unwrap();
        assert_eq!(collected, "KYC means Know Your Customer.");
        assert_eq!(seen, collected);
    }

    #[tokio::test]
    async fn test_empty_stream_yields_empty_reply() {
        let (result, seen) = run_pump(vec![], None).await;

        assert_eq!(result.unwrap(), "");
        assert_eq!(seen, "");
    }

    #[tokio::test]
    async fn test_disconnect_still_accumulates_full_reply() {
        let increments = vec![
            Ok("one ".to_string()),
            Ok("two ".to_string()),
            Ok("three".to_string()),
        ];

        // Caller reads a single increment then goes away.
        let (result, seen) = run_pump(increments, Some(1)).await;

        assert_eq!(result.unwrap(), "one two three");
        assert_eq!(seen, "one ");
    }

    #[tokio::test]
    async fn test_mid_stream_failure_propagates() {
        let increments = vec![
            Ok("partial".to_string()),
            Err(LlmError::StreamInterrupted("connection reset".to_string())),
        ];

        let (result, seen) = run_pump(increments, None).await;

        assert!(matches!(result, Err(LlmError::StreamInterrupted(_))));
        // The already-forwarded prefix stays sent.
        assert_eq!(seen, "partial");
    }
}
