// Conversation model and ChatML rendering.
//
// The guard model was trained on Qwen3 ChatML transcripts rendered with
// thinking disabled, where the final assistant turn opens with an empty
// think block:
//   <|im_start|>user\n{content}<|im_end|>\n
//   <|im_start|>assistant\n<think>\n\n</think>\n\n{content}<|im_end|>
//
// Turns are joined by a newline. The stock template also ends the last turn
// with one; it is left off so a user-only transcript ends exactly at the
// user's <|im_end|> and has no tokens past the boundary.

use serde::{Deserialize, Serialize};

use crate::error::ModerationError;
use crate::guard::traits::Role;

pub const IM_START: &str = "<|im_start|>";
pub const IM_END: &str = "<|im_end|>";
/// The role marker that follows `IM_START` on a user turn.
pub const USER_MARKER: &str = "user";

/// Empty reasoning block placed before the final assistant reply.
pub const EMPTY_THINK: &str = "<think>\n\n</think>\n\n";

/// A chat message as received over the wire. Roles other than `user` and
/// `assistant` are accepted but ignored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    #[serde(default)]
    pub content: String,
}

/// At most two turns: the user prompt and, optionally, the assistant reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    user: String,
    assistant: Option<String>,
}

impl Conversation {
    pub fn new(user: impl Into<String>, assistant: Option<String>) -> Result<Self, ModerationError> {
        let user = user.into();
        if user.is_empty() {
            return Err(ModerationError::MissingUserTurn);
        }
        Ok(Self {
            user,
            assistant: assistant.filter(|a| !a.is_empty()),
        })
    }

    pub fn user_only(user: impl Into<String>) -> Result<Self, ModerationError> {
        Self::new(user, None)
    }

    /// Pick the first user and the first assistant message.
    pub fn from_messages(messages: &[ChatMessage]) -> Result<Self, ModerationError> {
        if messages.is_empty() {
            return Err(ModerationError::NoMessages);
        }
        let first = |role: &str| {
            messages
                .iter()
                .find(|m| m.role == role)
                .map(|m| m.content.clone())
        };
        let user = first(Role::User.as_str()).unwrap_or_default();
        Self::new(user, first(Role::Assistant.as_str()))
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn assistant(&self) -> Option<&str> {
        self.assistant.as_deref()
    }

    pub fn has_assistant(&self) -> bool {
        self.assistant.is_some()
    }

    /// Render in the chat template, without a generation prompt.
    pub fn render_chatml(&self) -> String {
        let mut text = render_turn(Role::User, &self.user);
        if let Some(ref assistant) = self.assistant {
            text.push('\n');
            text.push_str(&render_turn(Role::Assistant, &format!("{EMPTY_THINK}{assistant}")));
        }
        text
    }
}

fn render_turn(role: Role, content: &str) -> String {
    format!("{IM_START}{role}\n{content}{IM_END}")
}
