// Moderation service — user-turn and token-by-token assistant moderation.
//
// Constructed once at startup with the guard model and tokenizer, then shared
// by every request handler. Each request gets its own ModerationSession, so
// stream state is never shared across requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info};

use crate::chat::boundary::Transcript;
use crate::chat::template::Conversation;
use crate::chat::tokenizer::{ChatTokenizer, TurnMarkers};
use crate::error::ModerationError;
use crate::guard::traits::{GuardModel, Role, Verdict};

use super::events::{AssistantReport, ConversationReport, ModerationEvent, TokenVerdict};
use super::session::{InvocationGate, ModerationSession};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Upper bound on a single model call.
    pub call_timeout: Duration,
    /// Serialize all model calls even if the backend claims to be
    /// concurrency-safe.
    pub serialize_calls: bool,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            serialize_calls: false,
        }
    }
}

pub struct ModerationService {
    model: Arc<dyn GuardModel>,
    tokenizer: Arc<dyn ChatTokenizer>,
    markers: TurnMarkers,
    call_timeout: Duration,
    gate: Option<InvocationGate>,
}

impl ModerationService {
    pub fn new(
        model: Arc<dyn GuardModel>,
        tokenizer: Arc<dyn ChatTokenizer>,
        options: ServiceOptions,
    ) -> anyhow::Result<Self> {
        let markers = TurnMarkers::resolve(tokenizer.as_ref())?;
        let gate = (options.serialize_calls || !model.concurrent_safe())
            .then(|| Arc::new(Mutex::new(())));

        info!(
            model = model.name(),
            serialized = gate.is_some(),
            timeout = ?options.call_timeout,
            "Moderation service ready"
        );

        Ok(Self {
            model,
            tokenizer,
            markers,
            call_timeout: options.call_timeout,
            gate,
        })
    }

    pub fn model_name(&self) -> &str {
        self.model.name()
    }

    fn session(&self) -> ModerationSession {
        ModerationSession::new(Arc::clone(&self.model), self.gate.clone(), self.call_timeout)
    }

    /// Render and tokenize a conversation and locate the user-turn boundary.
    pub fn transcribe(&self, conversation: &Conversation) -> Result<Transcript, ModerationError> {
        Transcript::from_conversation(conversation, self.tokenizer.as_ref(), &self.markers)
    }

    /// Decoded text of a single token, special tokens included.
    pub fn decode_token(&self, id: u32) -> Result<String, ModerationError> {
        self.tokenizer
            .decode(&[id], false)
            .map_err(ModerationError::Tokenizer)
    }

    /// Moderate the user prefix in a fresh stream, then release it.
    pub async fn moderate_user(&self, transcript: &Transcript) -> Result<Verdict, ModerationError> {
        let mut session = self.session();
        let verdict = session
            .feed(transcript.user_prefix().to_vec(), Role::User)
            .await?;
        session.close();
        Ok(verdict)
    }

    /// Moderate a lone user message.
    pub async fn moderate_message(&self, message: &str) -> Result<Verdict, ModerationError> {
        let conversation = Conversation::user_only(message)?;
        let transcript = self.transcribe(&conversation)?;
        self.moderate_user(&transcript).await
    }

    /// Run the whole conversation through one stream, sending a User event
    /// and then one AssistantToken event per assistant token.
    ///
    /// Returns early (Ok) when the receiver goes away; the session drop
    /// releases the stream either way. Terminal events are the caller's job.
    pub async fn produce(
        &self,
        transcript: &Transcript,
        events: &mpsc::Sender<ModerationEvent>,
    ) -> Result<(), ModerationError> {
        let mut session = self.session();

        let user = tokio::select! {
            verdict = session.feed(transcript.user_prefix().to_vec(), Role::User) => verdict?,
            _ = events.closed() => return Ok(()),
        };
        if events.send(ModerationEvent::User(user)).await.is_err() {
            debug!("Event consumer closed after user verdict");
            return Ok(());
        }

        let first_index = transcript.boundary() + 1;
        for (offset, &id) in transcript.assistant_tokens().iter().enumerate() {
            let verdict = tokio::select! {
                verdict = session.feed(vec![id], Role::Assistant) => verdict?,
                _ = events.closed() => {
                    debug!(offset, "Event consumer closed mid-stream");
                    return Ok(());
                }
            };
            let event = ModerationEvent::AssistantToken(TokenVerdict {
                index: first_index + offset,
                token_id: id,
                token: self.decode_token(id)?,
                verdict,
            });
            if events.send(event).await.is_err() {
                debug!(offset, "Event consumer closed mid-stream");
                return Ok(());
            }
        }

        session.close();
        Ok(())
    }

    /// Aggregate mode: the final user verdict plus, when the conversation has
    /// an assistant turn, every per-token verdict in order.
    pub async fn moderate_conversation(
        &self,
        conversation: &Conversation,
    ) -> Result<ConversationReport, ModerationError> {
        let transcript = self.transcribe(conversation)?;
        let (tx, mut rx) = mpsc::channel(1);

        let producer = async move { self.produce(&transcript, &tx).await };
        let collector = async move {
            let mut user = None;
            let mut tokens = Vec::new();
            while let Some(event) = rx.recv().await {
                match event {
                    ModerationEvent::User(v) => user = Some(v),
                    ModerationEvent::AssistantToken(t) => tokens.push(t),
                    ModerationEvent::Done | ModerationEvent::Error(_) => {}
                }
            }
            (user, tokens)
        };

        let (produced, (user, tokens)) = tokio::join!(producer, collector);
        produced?;

        let user = user.ok_or_else(|| {
            ModerationError::Model(anyhow::anyhow!("No user verdict was produced"))
        })?;
        let assistant = match tokens.last() {
            Some(last) if conversation.has_assistant() => Some(AssistantReport {
                verdict: last.verdict,
                tokens,
            }),
            _ => None,
        };

        Ok(ConversationReport { user, assistant })
    }

    /// Incremental mode: a lazy, ordered event stream ending in Done or Error.
    ///
    /// Input errors are returned before anything is streamed. Dropping the
    /// stream stops moderation and releases the model-side state.
    pub fn stream_conversation(
        self: &Arc<Self>,
        conversation: &Conversation,
    ) -> Result<ReceiverStream<ModerationEvent>, ModerationError> {
        let transcript = self.transcribe(conversation)?;
        let (tx, rx) = mpsc::channel(1);
        let service = Arc::clone(self);

        tokio::spawn(async move {
            let terminal = match service.produce(&transcript, &tx).await {
                Ok(()) => ModerationEvent::Done,
                Err(e) => {
                    error!(error = %e, "Streaming moderation failed");
                    ModerationEvent::Error(e.to_string())
                }
            };
            // Fails only if the consumer already left.
            let _ = tx.send(terminal).await;
        });

        Ok(ReceiverStream::new(rx))
    }
}
