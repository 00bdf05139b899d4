// POST /api/moderate_conversation — user turn plus optional assistant turn.
//
// stream=false: the aggregate ConversationReport as one JSON object.
// stream=true:  NDJSON StreamRecords — user, assistant_token x N, done. A
//               failure after the first line arrives as a final `error` record.

use std::convert::Infallible;

use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;

use crate::chat::template::{ChatMessage, Conversation};
use crate::web::{api_error, moderation_error, AppState, NDJSON_CONTENT_TYPE};

#[derive(Deserialize)]
pub struct ConversationRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub stream: Option<bool>,
}

impl ConversationRequest {
    pub fn conversation(&self) -> Result<Conversation, crate::error::ModerationError> {
        Conversation::from_messages(&self.messages)
    }
}

/// Unwrap the JSON body or answer with a 400 carrying axum's reason.
pub fn parse_request(
    body: Result<Json<ConversationRequest>, JsonRejection>,
) -> Result<ConversationRequest, Response> {
    body.map(|Json(req)| req)
        .map_err(|rejection| api_error(StatusCode::BAD_REQUEST, &rejection.body_text()))
}

pub async fn moderate_conversation(
    State(state): State<AppState>,
    body: Result<Json<ConversationRequest>, JsonRejection>,
) -> Response {
    let request = match parse_request(body) {
        Ok(r) => r,
        Err(response) => return response,
    };
    let conversation = match request.conversation() {
        Ok(c) => c,
        Err(e) => return moderation_error(&e),
    };

    if !request.stream.unwrap_or(false) {
        return match state.service.moderate_conversation(&conversation).await {
            Ok(report) => Json(report).into_response(),
            Err(e) => moderation_error(&e),
        };
    }

    let events = match state.service.stream_conversation(&conversation) {
        Ok(events) => events,
        Err(e) => return moderation_error(&e),
    };

    let lines = events.map(|event| {
        let mut line = serde_json::to_string(&event.to_record()).unwrap_or_default();
        line.push('\n');
        Ok::<_, Infallible>(line)
    });

    (
        [(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)],
        Body::from_stream(lines),
    )
        .into_response()
}
