// Turn-boundary resolution over a tokenized transcript.
//
// The boundary is the `<|im_end|>` closing the most recent user turn. Tokens
// up to and including it are the user prefix; everything after belongs to
// the assistant turn and is moderated one token at a time.

use crate::error::ModerationError;

use super::template::Conversation;
use super::tokenizer::{ChatTokenizer, TurnMarkers};

/// Index of the turn-end marker closing the last user turn.
///
/// Scans backward for the last `(turn_start, user_role)` pair, then forward
/// from two past it for the first `turn_end`.
pub fn resolve_user_boundary(ids: &[u32], markers: &TurnMarkers) -> Result<usize, ModerationError> {
    let last_start = ids
        .windows(2)
        .rposition(|pair| pair[0] == markers.turn_start && pair[1] == markers.user_role)
        .ok_or(ModerationError::MalformedTranscript)?;

    let search_from = last_start + 2;
    ids[search_from..]
        .iter()
        .position(|&id| id == markers.turn_end)
        .map(|offset| search_from + offset)
        .ok_or(ModerationError::MalformedTranscript)
}

/// A tokenized conversation with its user/assistant boundary resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transcript {
    ids: Vec<u32>,
    boundary: usize,
}

impl Transcript {
    pub fn new(ids: Vec<u32>, markers: &TurnMarkers) -> Result<Self, ModerationError> {
        let boundary = resolve_user_boundary(&ids, markers)?;
        Ok(Self { ids, boundary })
    }

    /// Render, tokenize and resolve a conversation.
    pub fn from_conversation(
        conversation: &Conversation,
        tokenizer: &dyn ChatTokenizer,
        markers: &TurnMarkers,
    ) -> Result<Self, ModerationError> {
        let ids = tokenizer
            .encode_text(&conversation.render_chatml())
            .map_err(ModerationError::Tokenizer)?;
        Self::new(ids, markers)
    }

    pub fn ids(&self) -> &[u32] {
        &self.ids
    }

    pub fn boundary(&self) -> usize {
        self.boundary
    }

    /// Tokens up to and including the boundary.
    pub fn user_prefix(&self) -> &[u32] {
        &self.ids[..=self.boundary]
    }

    /// Tokens after the boundary; empty for a user-only transcript.
    pub fn assistant_tokens(&self) -> &[u32] {
        &self.ids[self.boundary + 1..]
    }
}
