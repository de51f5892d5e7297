use serde::{Deserialize, Serialize};

/// One conversational turn sent to the completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,
    /// Absent for a brand-new conversation; the service assigns one.
    #[serde(default)]
    pub thread_id: Option<String>,
    pub system_prompt: String,
}

impl CompletionRequest {
    pub fn new(
        prompt: impl Into<String>,
        thread_id: Option<String>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            thread_id,
            system_prompt: system_prompt.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub text: String,
    /// Stable for the lifetime of the conversation once assigned.
    pub thread_id: String,
    pub usage: Usage,
}
