//! Retrieval-augmented chat pipeline.
//!
//! Per request: build context (embed + document search + history), assemble
//! the prompt, stream the completion to the caller, persist both turns.

pub mod context;
pub mod handlers;
pub mod prompts;
pub mod relay;
pub mod store;
