//! Completion-service client for ThreadRelay.
//!
//! Pure HTTP client. The service keeps conversation state server side; callers only hold
//! the opaque thread id it hands back.

mod client;
mod error;
mod openai;
mod types;

pub use client::{CompletionService, LlmClient};
pub use error::{LlmError, Result};
pub use types::{Completion, CompletionRequest, Usage};
