use sqlx::{PgPool, Row};
use tracing::debug;

use crate::errors::AppError;
use crate::llm_client::{ChatMessage, LlmClient};

use super::store;

/// Maximum number of documents pulled into the prompt context.
pub const MATCH_COUNT: i64 = 5;
/// Maximum number of stored turns replayed into the prompt.
pub const HISTORY_LIMIT: i64 = 10;

/// A document returned by the similarity search. Ephemeral: discarded
/// after prompt assembly, never written back.
#[derive(Debug, Clone)]
pub struct RetrievedDocument {
    pub content: String,
    pub similarity: f64,
}

/// Everything the prompt assembler needs for one request.
#[derive(Debug)]
pub struct RequestContext {
    /// Retrieved document contents joined with blank lines; empty when the
    /// search matched nothing.
    pub rag_context: String,
    /// Up to [`HISTORY_LIMIT`] turns for this user, oldest first.
    pub history: Vec<ChatMessage>,
}

/// Builds the retrieval and memory context for one request.
///
/// Any collaborator failure (embedding call, document search, history query)
/// fails the whole request; there is no degraded memory-only fallback, so
/// "retrieval broken" stays distinguishable from "nothing matched".
pub async fn build_context(
    db: &PgPool,
    llm: &LlmClient,
    user_id: &str,
    question: &str,
) -> Result<RequestContext, AppError> {
    let embedding = llm.embed(question).await?;

    let documents = search_documents(db, &embedding, MATCH_COUNT).await?;
    debug!(
        user_id,
        matches = documents.len(),
        top_similarity = documents.first().map(|d| d.similarity),
        "Document search complete"
    );

    let rag_context = join_documents(&documents);

    let history = store::fetch_history(db, user_id, HISTORY_LIMIT).await?;
    debug!(user_id, turns = history.len(), "Conversation history loaded");

    Ok(RequestContext {
        rag_context,
        history,
    })
}

/// Vector similarity search over the `documents` table using pgvector's
/// cosine distance operator.
async fn search_documents(
    db: &PgPool,
    embedding: &[f32],
    limit: i64,
) -> Result<Vec<RetrievedDocument>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT content, 1.0 - (embedding <=> $1::vector) AS similarity \
         FROM documents \
         ORDER BY embedding <=> $1::vector ASC \
         LIMIT $2",
    )
    .bind(vector_literal(embedding))
    .bind(limit)
    .fetch_all(db)
    .await?;

    Ok(rows
        .iter()
        .map(|row| RetrievedDocument {
            content: row.get("content"),
            similarity: row.get("similarity"),
        })
        .collect())
}

/// Formats an embedding as a pgvector input literal: `[0.1,0.2,...]`.
fn vector_literal(embedding: &[f32]) -> String {
    format!(
        "[{}]",
        embedding
            .iter()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(",")
    )
}

/// Joins retrieved document contents with a blank-line separator.
/// No matches yields the empty string.
pub fn join_documents(documents: &[RetrievedDocument]) -> String {
    documents
        .iter()
        .map(|d| d.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
