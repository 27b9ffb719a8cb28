// Conversation persistence. The `conversations` table is append-only:
// turns are only ever INSERTed, never updated or deleted, and ordering by
// the store-assigned `created_at` defines conversation history.

use sqlx::{PgPool, Row};

use crate::llm_client::{ChatMessage, Role};

/// Loads up to `limit` turns for `user_id`, oldest first.
/// No rows is an empty history, never an error.
pub async fn fetch_history(
    db: &PgPool,
    user_id: &str,
    limit: i64,
) -> Result<Vec<ChatMessage>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT role, content FROM conversations \
         WHERE user_id = $1 \
         ORDER BY created_at ASC \
         LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(db)
    .await?;

    Ok(rows
        .iter()
        .map(|row| {
            let role: String = row.get("role");
            ChatMessage {
                role: role_from_db(&role),
                content: row.get("content"),
            }
        })
        .collect())
}

/// Appends one turn to the conversation log. `created_at` is assigned by
/// the store, so concurrent requests for the same user may interleave.
pub async fn append_turn(
    db: &PgPool,
    user_id: &str,
    role: Role,
    content: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO conversations (user_id, role, content) VALUES ($1, $2, $3)")
        .bind(user_id)
        .bind(role.as_str())
        .bind(content)
        .execute(db)
        .await?;

    Ok(())
}

// Rows are only ever written by `append_turn`, so any unrecognized role in
// the table is treated as user input rather than failing the request.
fn role_from_db(role: &str) -> Role {
    match role {
        "system" => Role::System,
        "assistant" => Role::Assistant,
        _ => Role::User,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // fetch_history's ordering and row cap live in the SQL
    // (ORDER BY created_at ASC LIMIT $2) and need a live Postgres to
    // exercise; only the row-mapping helpers are unit tested here.

    #[test]
    fn test_role_from_db_known_values() {
        assert_eq!(role_from_db("system"), Role::System);
        assert_eq!(role_from_db("user"), Role::User);
        assert_eq!(role_from_db("assistant"), Role::Assistant);
    }

    #[test]
    fn test_role_from_db_unknown_falls_back_to_user() {
        assert_eq!(role_from_db("moderator"), Role::User);
    }

    #[test]
    fn test_role_round_trips_through_db_representation() {
        for role in [Role::System, Role::User, Role::Assistant] {
            assert_eq!(role_from_db(role.as_str()), role);
        }
    }
}
