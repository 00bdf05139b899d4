// Guard model trait — the boundary to the stateful streaming classifier.
//
// The model is a black box: given a token (or a run of tokens), the speaker
// role and an opaque stream state, it returns one verdict per fed token and
// the next state. The state lives on the model side and must be handed back
// through `close_stream` exactly once.

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Which side of the conversation the fed tokens belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Severity assigned by the guard model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RiskLevel {
    Safe,
    Controversial,
    Unsafe,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Safe => "Safe",
            RiskLevel::Controversial => "Controversial",
            RiskLevel::Unsafe => "Unsafe",
        }
    }

    pub fn is_safe(&self) -> bool {
        *self == RiskLevel::Safe
    }
}

impl fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unsafe content categories from the guard model's safety policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    #[serde(rename = "Violent")]
    Violent,
    #[serde(rename = "Non-violent Illegal Acts")]
    NonViolentIllegalActs,
    #[serde(rename = "Sexual Content or Sexual Acts")]
    SexualContent,
    #[serde(rename = "PII")]
    Pii,
    #[serde(rename = "Suicide & Self-Harm")]
    SuicideSelfHarm,
    #[serde(rename = "Unethical Acts")]
    UnethicalActs,
    #[serde(rename = "Politically Sensitive Topics")]
    PoliticallySensitive,
    #[serde(rename = "Copyright Violation")]
    CopyrightViolation,
    #[serde(rename = "Jailbreak")]
    Jailbreak,
}

impl Category {
    pub fn label(&self) -> &'static str {
        match self {
            Category::Violent => "Violent",
            Category::NonViolentIllegalActs => "Non-violent Illegal Acts",
            Category::SexualContent => "Sexual Content or Sexual Acts",
            Category::Pii => "PII",
            Category::SuicideSelfHarm => "Suicide & Self-Harm",
            Category::UnethicalActs => "Unethical Acts",
            Category::PoliticallySensitive => "Politically Sensitive Topics",
            Category::CopyrightViolation => "Copyright Violation",
            Category::Jailbreak => "Jailbreak",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One classification step. Only the most recent verdict of a stream is
/// authoritative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    pub risk_level: RiskLevel,
    /// Present for non-safe verdicts when the model names a category.
    pub category: Option<Category>,
}

impl Verdict {
    pub fn safe() -> Self {
        Self {
            risk_level: RiskLevel::Safe,
            category: None,
        }
    }

    pub fn flagged(risk_level: RiskLevel, category: Category) -> Self {
        Self {
            risk_level,
            category: Some(category),
        }
    }
}

impl Default for Verdict {
    fn default() -> Self {
        Self::safe()
    }
}

/// Opaque handle to model-side stream state.
///
/// Deliberately not `Clone`: a state is moved into each call and moved back
/// out in the result, so at most one owner can release it.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct StreamState(u64);

impl StreamState {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

/// The streaming guard model.
///
/// Calls are blocking and may be slow; the moderation service runs them on
/// the blocking pool. If `stream_moderate` fails, the model has already
/// released the state it was given.
pub trait GuardModel: Send + Sync {
    /// Human-readable model identifier for health output.
    fn name(&self) -> &str;

    /// Feed `token_ids` for `role`, continuing `state` (or opening a new
    /// stream when `None`). Returns one verdict per fed token.
    fn stream_moderate(
        &self,
        token_ids: &[u32],
        role: Role,
        state: Option<StreamState>,
    ) -> Result<(Vec<Verdict>, StreamState)>;

    /// Release model-side resources held by `state`.
    fn close_stream(&self, state: StreamState);

    /// Whether independent streams may call into the model concurrently.
    fn concurrent_safe(&self) -> bool {
        true
    }
}
