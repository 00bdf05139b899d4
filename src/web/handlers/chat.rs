// POST /api/chat — moderation results in an Ollama-style chat envelope, so
// chat front ends can render them as an assistant reply.
//
// stream defaults to true. Streamed text is split into one chunk per
// character to mimic token streaming. An "Assistant streaming moderation:"
// header line precedes the first assistant token.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use serde::Serialize;

use crate::chat::template::ChatMessage;
use crate::guard::traits::Role;
use crate::moderation::events::ModerationEvent;
use crate::web::handlers::conversation::parse_request;
use crate::web::{moderation_error, AppState, NDJSON_CONTENT_TYPE};

const ASSISTANT_HEADER: &str = "Assistant streaming moderation:\n";

#[derive(Debug, Serialize)]
pub struct ChatChunk {
    pub model: String,
    pub created_at: String,
    pub message: ChatMessage,
    pub done: bool,
}

impl ChatChunk {
    pub fn new(model: &str, content: impl Into<String>, done: bool) -> Self {
        Self {
            model: model.to_string(),
            created_at: Utc::now().to_rfc3339(),
            message: ChatMessage {
                role: Role::Assistant.as_str().to_string(),
                content: content.into(),
            },
            done,
        }
    }

    fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_default();
        line.push('\n');
        line
    }
}

/// Expand one event into its chat chunks.
///
/// `header_sent` tracks whether the assistant header went out yet.
pub fn event_chunks(model: &str, event: &ModerationEvent, header_sent: &mut bool) -> Vec<ChatChunk> {
    let mut text = String::new();
    if matches!(event, ModerationEvent::AssistantToken(_)) && !*header_sent {
        *header_sent = true;
        text.push_str(ASSISTANT_HEADER);
    }
    text.push_str(&event.summary_line());

    match event {
        ModerationEvent::Done => vec![ChatChunk::new(model, "", true)],
        ModerationEvent::Error(_) => vec![ChatChunk::new(model, text, true)],
        _ => text
            .chars()
            .map(|c| ChatChunk::new(model, c.to_string(), false))
            .collect(),
    }
}

pub async fn chat(
    State(state): State<AppState>,
    body: Result<Json<super::conversation::ConversationRequest>, JsonRejection>,
) -> Response {
    let request = match parse_request(body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let conversation = match request.conversation() {
        Ok(c) => c,
        Err(e) => return moderation_error(&e),
    };
    let model = state.service.model_name().to_string();

    if !request.stream.unwrap_or(true) {
        return match state.service.moderate_conversation(&conversation).await {
            Ok(report) => Json(ChatChunk::new(&model, report.summary(), true)).into_response(),
            Err(e) => moderation_error(&e),
        };
    }

    let events = match state.service.stream_conversation(&conversation) {
        Ok(events) => events,
        Err(e) => return moderation_error(&e),
    };

    let mut header_sent = false;
    let lines = events.flat_map(move |event| {
        let chunks = event_chunks(&model, &event, &mut header_sent);
        stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<_, Infallible>(chunk.to_line())),
        )
    });

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(lines),
    )
        .into_response()
}
