// Prompt construction for the chat endpoint. Purely structural: no
// truncation, no token budgeting. The assembled order is fixed:
// system message, stored history oldest-first, then the new question.

use crate::llm_client::{ChatMessage, Role};

/// Renders the system prompt with the retrieved document context
/// interpolated. Renders with an empty context section when nothing was
/// retrieved; the model is told to say it does not know rather than guess.
pub fn system_prompt(rag_context: &str) -> String {
    format!(
        "You are a crypto compliance assistant.\n\
         \n\
         Use this context to answer:\n\
         \n\
         {rag_context}\n\
         \n\
         If answer is not in context, say you don't know."
    )
}

/// Assembles the full message sequence sent to the completion API.
pub fn assemble_messages(
    rag_context: &str,
    history: &[ChatMessage],
    question: &str,
) -> Vec<ChatMessage> {
    let mut messages = Vec::with_capacity(history.len() + 2);

    messages.push(ChatMessage {
        role: Role::System,
        content: system_prompt(rag_context),
    });

    messages.extend_from_slice(history);

    messages.push(ChatMessage {
        role: Role::User,
        content: question.to_string(),
    });

    messages
}
