// Lexicon guard model — a rule-based stand-in for the neural guard.
//
// Needs only the tokenizer, so the service can run without the ONNX export.
// Stream state is the accumulated ids of each role; after every fed token the
// role's text so far is decoded and matched against the rule patterns. The
// strongest matching rule wins, earlier rules win ties.

use std::sync::Arc;

use anyhow::{Context, Result};
use regex_lite::Regex;
use tracing::debug;

use crate::chat::tokenizer::ChatTokenizer;

use super::streams::StreamTable;
use super::traits::{Category, GuardModel, RiskLevel, Role, StreamState, Verdict};

pub struct LexiconRule {
    pattern: Regex,
    level: RiskLevel,
    category: Category,
    user_only: bool,
}

impl LexiconRule {
    pub fn new(pattern: &str, level: RiskLevel, category: Category) -> Result<Self> {
        let pattern =
            Regex::new(pattern).with_context(|| format!("Invalid lexicon pattern {pattern:?}"))?;
        Ok(Self {
            pattern,
            level,
            category,
            user_only: false,
        })
    }

    /// Restrict the rule to the user turn (e.g. jailbreak phrasing).
    pub fn user_only(mut self) -> Self {
        self.user_only = true;
        self
    }

    fn applies_to(&self, role: Role) -> bool {
        !self.user_only || role == Role::User
    }
}

/// Built-in rules. Self-harm precedes violence so "kill myself" is
/// categorised as self-harm.
pub fn default_rules() -> Result<Vec<LexiconRule>> {
    use Category::*;
    use RiskLevel::*;

    Ok(vec![
        LexiconRule::new(
            r"(?i)\b(suicide|kill myself|self[- ]harm|end my life|cut myself)\b",
            Unsafe,
            SuicideSelfHarm,
        )?,
        LexiconRule::new(
            r"(?i)\b(bombs?|explosives?|detonat\w*|murder\w*|massacre|kill(ing)?|shoot(ing)? (up|people))\b",
            Unsafe,
            Violent,
        )?,
        LexiconRule::new(
            r"(?i)\b(launder(ing)? money|money laundering|counterfeit\w*|shoplift\w*|hotwire|hack into|steal(ing)?|meth)\b",
            Unsafe,
            NonViolentIllegalActs,
        )?,
        LexiconRule::new(
            r"(?i)\b(porn\w*|explicit sex\w*|nude (photos?|pictures?))\b",
            Unsafe,
            SexualContent,
        )?,
        LexiconRule::new(
            r"(?i)\b(social security number|credit card number|home address of|passport number)\b",
            Unsafe,
            Pii,
        )?,
        LexiconRule::new(
            r"(?i)(ignore (all )?(previous|prior) instructions|developer mode|pretend you have no rules|\bjailbreak\w*)",
            Unsafe,
            Jailbreak,
        )?
        .user_only(),
        LexiconRule::new(
            r"(?i)\b(blackmail\w*|cheat on|manipulat\w*|bully\w*|plagiari[sz]\w*)\b",
            Controversial,
            UnethicalActs,
        )?,
        LexiconRule::new(
            r"(?i)\b(election fraud|propaganda|coup|separatis\w*)\b",
            Controversial,
            PoliticallySensitive,
        )?,
        LexiconRule::new(
            r"(?i)\b(pirated?|torrent\w*|crack(ed)? software|full lyrics)\b",
            Controversial,
            CopyrightViolation,
        )?,
    ])
}

#[derive(Debug, Default)]
struct LexiconContext {
    user_ids: Vec<u32>,
    assistant_ids: Vec<u32>,
}

impl LexiconContext {
    fn ids_mut(&mut self, role: Role) -> &mut Vec<u32> {
        match role {
            Role::User => &mut self.user_ids,
            Role::Assistant => &mut self.assistant_ids,
        }
    }
}

pub struct LexiconGuardModel {
    tokenizer: Arc<dyn ChatTokenizer>,
    rules: Vec<LexiconRule>,
    streams: StreamTable<LexiconContext>,
}

impl LexiconGuardModel {
    pub fn new(tokenizer: Arc<dyn ChatTokenizer>) -> Result<Self> {
        Ok(Self::with_rules(tokenizer, default_rules()?))
    }

    pub fn with_rules(tokenizer: Arc<dyn ChatTokenizer>, rules: Vec<LexiconRule>) -> Self {
        Self {
            tokenizer,
            rules,
            streams: StreamTable::default(),
        }
    }

    /// Streams currently holding model-side state.
    pub fn open_streams(&self) -> usize {
        self.streams.open_count()
    }

    /// Classify decoded text for `role`.
    pub fn classify_text(&self, text: &str, role: Role) -> Verdict {
        let mut best: Option<&LexiconRule> = None;
        for rule in self.rules.iter().filter(|r| r.applies_to(role)) {
            if !rule.pattern.is_match(text) {
                continue;
            }
            if best.map_or(true, |b| rule.level > b.level) {
                best = Some(rule);
            }
        }
        match best {
            Some(rule) => Verdict::flagged(rule.level, rule.category),
            None => Verdict::safe(),
        }
    }

    fn step(&self, context: &mut LexiconContext, token_ids: &[u32], role: Role) -> Result<Vec<Verdict>> {
        let ids = context.ids_mut(role);
        let mut verdicts = Vec::with_capacity(token_ids.len());
        for &id in token_ids {
            ids.push(id);
            let text = self.tokenizer.decode(ids, true)?;
            verdicts.push(self.classify_text(&text, role));
        }
        Ok(verdicts)
    }
}

impl GuardModel for LexiconGuardModel {
    fn name(&self) -> &str {
        "lexicon"
    }

    fn stream_moderate(
        &self,
        token_ids: &[u32],
        role: Role,
        state: Option<StreamState>,
    ) -> Result<(Vec<Verdict>, StreamState)> {
        let (state, mut context) = self.streams.checkout(state)?;

        let verdicts = match self.step(&mut context, token_ids, role) {
            Ok(v) => v,
            Err(e) => {
                self.streams.close(state);
                return Err(e);
            }
        };

        if let Err(e) = self.streams.checkin(&state, context) {
            self.streams.close(state);
            return Err(e);
        }

        debug!(
            stream = state.id(),
            role = %role,
            fed = token_ids.len(),
            last = ?verdicts.last(),
            "Lexicon guard step"
        );
        Ok((verdicts, state))
    }

    fn close_stream(&self, state: StreamState) {
        self.streams.close(state);
    }
}
