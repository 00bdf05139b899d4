// Shared fixtures for the integration tests.
//
// WordTokenizer splits rendered ChatML into markers, whitespace characters
// and words, interning each distinct piece. CountingModel is a scripted guard
// model that counts every stream it opens and closes.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;

use guardstream::chat::template::{IM_END, IM_START};
use guardstream::chat::tokenizer::ChatTokenizer;
use guardstream::guard::traits::{Category, GuardModel, RiskLevel, Role, StreamState, Verdict};
use guardstream::moderation::service::{ModerationService, ServiceOptions};

pub const IM_START_ID: u32 = 1;
pub const IM_END_ID: u32 = 2;
pub const USER_ID: u32 = 3;

// ============================================================
// WordTokenizer
// ============================================================

pub struct WordTokenizer {
    vocab: Mutex<(HashMap<String, u32>, Vec<String>)>,
}

impl WordTokenizer {
    pub fn new() -> Self {
        let tokenizer = Self {
            vocab: Mutex::new((HashMap::new(), vec![String::new()])),
        };
        for piece in [IM_START, IM_END, "user", "assistant"] {
            tokenizer.intern(piece);
        }
        tokenizer
    }

    /// Id of `piece`, assigning the next free id if it is new.
    pub fn intern(&self, piece: &str) -> u32 {
        let mut guard = self.vocab.lock().unwrap();
        let (ids, pieces) = &mut *guard;
        if let Some(&id) = ids.get(piece) {
            return id;
        }
        let id = pieces.len() as u32;
        pieces.push(piece.to_string());
        ids.insert(piece.to_string(), id);
        id
    }

    fn pieces(text: &str) -> Vec<String> {
        let mut pieces = Vec::new();
        let mut word = String::new();
        let mut rest = text;
        while let Some(c) = rest.chars().next() {
            let marker = [IM_START, IM_END].into_iter().find(|m| rest.starts_with(m));
            if let Some(marker) = marker {
                if !word.is_empty() {
                    pieces.push(std::mem::take(&mut word));
                }
                pieces.push(marker.to_string());
                rest = &rest[marker.len()..];
                continue;
            }
            if c.is_whitespace() {
                if !word.is_empty() {
                    pieces.push(std::mem::take(&mut word));
                }
                pieces.push(c.to_string());
            } else {
                word.push(c);
            }
            rest = &rest[c.len_utf8()..];
        }
        if !word.is_empty() {
            pieces.push(word);
        }
        pieces
    }
}

impl ChatTokenizer for WordTokenizer {
    fn encode_text(&self, text: &str) -> Result<Vec<u32>> {
        Ok(Self::pieces(text).iter().map(|p| self.intern(p)).collect())
    }

    fn decode(&self, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
        let guard = self.vocab.lock().unwrap();
        let mut text = String::new();
        for &id in ids {
            if skip_special_tokens && (id == IM_START_ID || id == IM_END_ID) {
                continue;
            }
            match guard.1.get(id as usize) {
                Some(piece) => text.push_str(piece),
                None => anyhow::bail!("unknown token id {id}"),
            }
        }
        Ok(text)
    }

    fn token_to_id(&self, token: &str) -> Option<u32> {
        self.vocab.lock().unwrap().0.get(token).copied()
    }
}

// ============================================================
// CountingModel
// ============================================================

/// Scripted guard model: a stream turns Unsafe/Violent once `flag_token` has
/// been fed and stays that way.
#[derive(Default)]
pub struct CountingModel {
    pub flag_token: Option<u32>,
    /// 1-based call number that fails.
    pub fail_on_call: Option<usize>,
    /// 1-based call number that panics.
    pub panic_on_call: Option<usize>,
    pub delay: Option<Duration>,
    pub not_concurrent_safe: bool,
    next_id: AtomicU64,
    calls: AtomicUsize,
    opened: AtomicUsize,
    closed: AtomicUsize,
    double_closes: AtomicUsize,
    live: Mutex<HashMap<u64, bool>>,
    released: Mutex<HashSet<u64>>,
}

impl CountingModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag_on(mut self, id: u32) -> Self {
        self.flag_token = Some(id);
        self
    }

    pub fn fail_on(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    pub fn panic_on(mut self, call: usize) -> Self {
        self.panic_on_call = Some(call);
        self
    }

    /// Report the model as unsafe to call concurrently.
    pub fn serialized(mut self) -> Self {
        self.not_concurrent_safe = true;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn double_closes(&self) -> usize {
        self.double_closes.load(Ordering::SeqCst)
    }

    pub fn live_streams(&self) -> usize {
        self.live.lock().unwrap().len()
    }
}

impl GuardModel for CountingModel {
    fn name(&self) -> &str {
        "counting"
    }

    fn stream_moderate(
        &self,
        token_ids: &[u32],
        _role: Role,
        state: Option<StreamState>,
    ) -> Result<(Vec<Verdict>, StreamState)> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }

        if self.panic_on_call == Some(call) {
            panic!("scripted panic on call {call}");
        }

        if self.fail_on_call == Some(call) {
            if let Some(state) = state {
                self.close_stream(state);
            }
            anyhow::bail!("scripted failure on call {call}");
        }

        let state = match state {
            Some(state) => state,
            None => {
                let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
                self.opened.fetch_add(1, Ordering::SeqCst);
                self.live.lock().unwrap().insert(id, false);
                StreamState::new(id)
            }
        };

        let mut live = self.live.lock().unwrap();
        let flagged = live
            .get_mut(&state.id())
            .ok_or_else(|| anyhow::anyhow!("unknown stream {}", state.id()))?;
        let verdicts = token_ids
            .iter()
            .map(|&id| {
                if Some(id) == self.flag_token {
                    *flagged = true;
                }
                if *flagged {
                    Verdict::flagged(RiskLevel::Unsafe, Category::Violent)
                } else {
                    Verdict::safe()
                }
            })
            .collect();
        drop(live);

        Ok((verdicts, state))
    }

    fn close_stream(&self, state: StreamState) {
        if !self.released.lock().unwrap().insert(state.id()) {
            self.double_closes.fetch_add(1, Ordering::SeqCst);
            return;
        }
        self.live.lock().unwrap().remove(&state.id());
        self.closed.fetch_add(1, Ordering::SeqCst);
    }

    fn concurrent_safe(&self) -> bool {
        !self.not_concurrent_safe
    }
}

// ============================================================
// Helpers
// ============================================================

pub fn service_with(
    model: Arc<dyn GuardModel>,
    tokenizer: Arc<WordTokenizer>,
    options: ServiceOptions,
) -> Arc<ModerationService> {
    Arc::new(ModerationService::new(model, tokenizer, options).unwrap())
}

/// Poll until every stream the model opened has been closed.
pub async fn wait_for_release(model: &CountingModel) {
    for _ in 0..200 {
        if model.opened() > 0 && model.opened() == model.closed() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!(
        "streams not released: opened={} closed={}",
        model.opened(),
        model.closed()
    );
}
