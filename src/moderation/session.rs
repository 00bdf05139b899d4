// Scoped ownership of one conversation's model-side stream state.
//
// A ModerationSession threads the opaque StreamState through successive model
// calls and releases it on every exit path: normal completion, early return,
// error, timeout, panic, or the owning future being dropped.
//
// Each call moves the state into a blocking task. If the caller stops waiting
// (timeout or cancellation), the task finds the result channel closed and
// releases the state itself instead of running the model.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::error::ModerationError;
use crate::guard::traits::{GuardModel, Role, StreamState, Verdict};

/// Serializes model access for backends that are not safe to call
/// concurrently. Waiters queue on the runtime, not on blocking threads.
pub type InvocationGate = Arc<Mutex<()>>;

type CallOutcome = anyhow::Result<(Vec<Verdict>, StreamState)>;

pub struct ModerationSession {
    model: Arc<dyn GuardModel>,
    gate: Option<InvocationGate>,
    call_timeout: Duration,
    state: Option<StreamState>,
}

impl ModerationSession {
    pub fn new(
        model: Arc<dyn GuardModel>,
        gate: Option<InvocationGate>,
        call_timeout: Duration,
    ) -> Self {
        Self {
            model,
            gate,
            call_timeout,
            state: None,
        }
    }

    /// Whether the session currently holds model-side state.
    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Feed tokens for `role` and return the latest verdict.
    ///
    /// The first call opens the stream; later calls continue it. Waiting for
    /// the gate counts against the call timeout. On failure the session no
    /// longer holds any state.
    pub async fn feed(&mut self, token_ids: Vec<u32>, role: Role) -> Result<Verdict, ModerationError> {
        let deadline = Instant::now() + self.call_timeout;

        // The state stays in the session until the gate is held, so a timeout
        // or cancellation while queued leaves it for `release`.
        let permit: Option<OwnedMutexGuard<()>> = match self.gate.clone() {
            Some(gate) => match tokio::time::timeout_at(deadline, gate.lock_owned()).await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    warn!(timeout = ?self.call_timeout, role = %role, "Timed out waiting for the model gate");
                    return Err(ModerationError::Timeout(self.call_timeout));
                }
            },
            None => None,
        };

        let prior = self.state.take();
        let model = Arc::clone(&self.model);
        let (tx, rx) = oneshot::channel::<Option<CallOutcome>>();

        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            if tx.is_closed() {
                if let Some(state) = prior {
                    debug!(stream = state.id(), "Caller went away before the call, releasing stream");
                    model.close_stream(state);
                }
                return;
            }

            let prior_id = prior.as_ref().map(StreamState::id);
            let outcome = match catch_unwind(AssertUnwindSafe(|| {
                model.stream_moderate(&token_ids, role, prior)
            })) {
                Ok(outcome) => Some(outcome),
                Err(_) => {
                    // The handle was lost in the unwind; release it by id. A
                    // stream opened by the panicking call itself is unknown here.
                    error!(stream = ?prior_id, "Guard model panicked");
                    if let Some(id) = prior_id {
                        model.close_stream(StreamState::new(id));
                    }
                    None
                }
            };

            if let Err(Some(Ok((_, orphan)))) = tx.send(outcome) {
                debug!(stream = orphan.id(), "Caller went away, releasing stream");
                model.close_stream(orphan);
            }
        });

        let (verdicts, state) = match tokio::time::timeout_at(deadline, rx).await {
            Err(_) => {
                warn!(timeout = ?self.call_timeout, role = %role, "Model call timed out");
                return Err(ModerationError::Timeout(self.call_timeout));
            }
            // Sender dropped without sending: the blocking task itself died.
            Ok(Err(_)) | Ok(Ok(None)) => return Err(ModerationError::WorkerPanicked),
            Ok(Ok(Some(Err(e)))) => return Err(ModerationError::Model(e)),
            Ok(Ok(Some(Ok(result)))) => result,
        };
        self.state = Some(state);

        verdicts
            .last()
            .copied()
            .ok_or_else(|| ModerationError::Model(anyhow::anyhow!("Model returned no verdicts")))
    }

    /// Release the stream now instead of at drop.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        let Some(state) = self.state.take() else {
            return;
        };
        let Some(gate) = self.gate.clone() else {
            self.model.close_stream(state);
            return;
        };

        // Gated backends must not be entered while another call holds the
        // gate, so the release queues for it like any call.
        let model = Arc::clone(&self.model);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    let permit = gate.lock_owned().await;
                    let closed = tokio::task::spawn_blocking(move || {
                        let _permit = permit;
                        model.close_stream(state);
                    })
                    .await;
                    if closed.is_err() {
                        error!("Guard model panicked while closing a stream");
                    }
                });
            }
            Err(_) => {
                let _permit = gate.blocking_lock();
                model.close_stream(state);
            }
        }
    }
}

impl Drop for ModerationSession {
    fn drop(&mut self) {
        self.release();
    }
}
