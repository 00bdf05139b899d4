// Moderation events and reports.
//
// Incremental mode emits ModerationEvent values strictly in computation
// order: one User verdict, one AssistantToken per assistant token, then a
// terminal Done or Error. Aggregate mode folds the same events into a
// ConversationReport.

use serde::Serialize;

use crate::guard::traits::{Category, RiskLevel, Verdict};

/// Distinguishes events on the wire without looking at earlier records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    User,
    AssistantToken,
    Done,
    Error,
}

/// Verdict for a single assistant token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenVerdict {
    /// Position of the token in the full transcript.
    pub index: usize,
    pub token_id: u32,
    /// Decoded text of this token alone, special tokens included.
    pub token: String,
    #[serde(flatten)]
    pub verdict: Verdict,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ModerationEvent {
    User(Verdict),
    AssistantToken(TokenVerdict),
    Done,
    Error(String),
}

impl ModerationEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ModerationEvent::User(_) => EventKind::User,
            ModerationEvent::AssistantToken(_) => EventKind::AssistantToken,
            ModerationEvent::Done => EventKind::Done,
            ModerationEvent::Error(_) => EventKind::Error,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ModerationEvent::Done | ModerationEvent::Error(_))
    }

    pub fn verdict(&self) -> Option<&Verdict> {
        match self {
            ModerationEvent::User(v) => Some(v),
            ModerationEvent::AssistantToken(t) => Some(&t.verdict),
            _ => None,
        }
    }

    /// Console-style line for this event, newline-terminated for verdicts.
    pub fn summary_line(&self) -> String {
        match self {
            ModerationEvent::User(v) => format!("User moderation: -> {}\n", risk_bracket(v)),
            ModerationEvent::AssistantToken(t) => {
                format!("Token: {:?} -> {}\n", t.token, risk_bracket(&t.verdict))
            }
            ModerationEvent::Done => String::new(),
            ModerationEvent::Error(message) => format!("Error: {message}"),
        }
    }

    pub fn to_record(&self) -> StreamRecord {
        let verdict = self.verdict();
        let (token, index) = match self {
            ModerationEvent::AssistantToken(t) => (Some(t.token.clone()), Some(t.index)),
            _ => (None, None),
        };
        StreamRecord {
            kind: self.kind(),
            content: self.summary_line(),
            done: self.is_terminal(),
            risk_level: verdict.map(|v| v.risk_level),
            category: verdict.and_then(|v| v.category),
            token,
            index,
        }
    }
}

/// `[Risk: X]` or `[Risk: X - Category: Y]`.
pub fn risk_bracket(verdict: &Verdict) -> String {
    if verdict.risk_level.is_safe() {
        format!("[Risk: {}]", verdict.risk_level)
    } else {
        format!(
            "[Risk: {} - Category: {}]",
            verdict.risk_level,
            category_label(verdict.category)
        )
    }
}

fn category_label(category: Option<Category>) -> &'static str {
    category.map_or("N/A", |c| c.label())
}

/// One NDJSON line of `/api/moderate_conversation` in stream mode.
#[derive(Debug, Clone, Serialize)]
pub struct StreamRecord {
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub content: String,
    pub done: bool,
    pub risk_level: Option<RiskLevel>,
    pub category: Option<Category>,
    pub token: Option<String>,
    pub index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AssistantReport {
    /// Verdict after the final assistant token.
    #[serde(flatten)]
    pub verdict: Verdict,
    pub tokens: Vec<TokenVerdict>,
}

/// Aggregate result of moderating a conversation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationReport {
    pub user: Verdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant: Option<AssistantReport>,
}

impl ConversationReport {
    /// Human-readable summary, one line per moderated turn.
    pub fn summary(&self) -> String {
        let mut text = format!("User message moderation: {}", level_text(&self.user));
        if let Some(ref assistant) = self.assistant {
            text.push_str(&format!(
                "\nAssistant message moderation: {}",
                level_text(&assistant.verdict)
            ));
        }
        text
    }
}

fn level_text(verdict: &Verdict) -> String {
    if verdict.risk_level.is_safe() {
        format!("Risk Level: {}", verdict.risk_level)
    } else {
        format!(
            "Risk Level: {}, Category: {}",
            verdict.risk_level,
            category_label(verdict.category)
        )
    }
}
