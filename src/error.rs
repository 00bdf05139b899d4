// Request-facing error taxonomy.
//
// Client errors (bad input, malformed transcript) map to 400 and never hold
// model state. Everything else is a server-side failure of the model call.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModerationError {
    #[error("No messages provided")]
    NoMessages,

    #[error("No user message found")]
    MissingUserTurn,

    /// The rendered transcript has no `<|im_start|>user ... <|im_end|>` span.
    #[error("Failed to parse user message")]
    MalformedTranscript,

    #[error("Tokenization failed: {0:#}")]
    Tokenizer(anyhow::Error),

    #[error("Model call failed: {0:#}")]
    Model(anyhow::Error),

    #[error("Model call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Model worker panicked")]
    WorkerPanicked,
}

impl ModerationError {
    /// True for errors caused by the request itself (HTTP 400).
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::NoMessages | Self::MissingUserTurn | Self::MalformedTranscript
        )
    }
}
