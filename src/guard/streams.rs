// Model-side stream table.
//
// Backends keep per-stream context here, keyed by the id inside StreamState.
// Open/close counters make leaks visible in logs and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use anyhow::Result;
use tracing::warn;

use super::traits::StreamState;

pub struct StreamTable<T> {
    entries: Mutex<HashMap<u64, T>>,
    next_id: AtomicU64,
    closed: AtomicU64,
}

impl<T> Default for StreamTable<T> {
    fn default() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            closed: AtomicU64::new(0),
        }
    }
}

impl<T: Default> StreamTable<T> {
    /// Take ownership of the context behind `state`, or start a fresh one.
    ///
    /// The entry stays registered while checked out, so `close` still
    /// accounts for it if the caller fails midway.
    pub fn checkout(&self, state: Option<StreamState>) -> Result<(StreamState, T)> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Stream table lock poisoned: {}", e))?;
        match state {
            Some(state) => match entries.get_mut(&state.id()) {
                Some(slot) => Ok((state, std::mem::take(slot))),
                None => anyhow::bail!("Unknown or already closed stream {}", state.id()),
            },
            None => {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                entries.insert(id, T::default());
                Ok((StreamState::new(id), T::default()))
            }
        }
    }
}

impl<T> StreamTable<T> {
    /// Store updated context for an open stream.
    pub fn checkin(&self, state: &StreamState, context: T) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| anyhow::anyhow!("Stream table lock poisoned: {}", e))?;
        match entries.get_mut(&state.id()) {
            Some(slot) => {
                *slot = context;
                Ok(())
            }
            None => anyhow::bail!("Stream {} closed during a call", state.id()),
        }
    }

    pub fn close(&self, state: StreamState) {
        let removed = match self.entries.lock() {
            Ok(mut entries) => entries.remove(&state.id()).is_some(),
            Err(poisoned) => poisoned.into_inner().remove(&state.id()).is_some(),
        };
        if removed {
            self.closed.fetch_add(1, Ordering::Relaxed);
        } else {
            warn!(stream = state.id(), "close_stream on unknown stream");
        }
    }

    /// Streams currently holding model-side state.
    pub fn open_count(&self) -> usize {
        match self.entries.lock() {
            Ok(entries) => entries.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }
}
