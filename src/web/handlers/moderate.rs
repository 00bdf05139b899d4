// POST /api/moderate — moderate a single user message while it is typed.
//
// The body is parsed leniently: a non-JSON body or a missing/empty `message`
// is not an error, it yields a default Safe verdict. Whitespace is content
// and goes to the model.

use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::guard::traits::{Category, RiskLevel, Verdict};
use crate::output::truncate_chars;
use crate::web::{moderation_error, AppState};

#[derive(Deserialize, Default)]
pub struct ModerateRequest {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Serialize)]
pub struct ModerateResponse {
    pub risk_level: RiskLevel,
    pub category: Option<Category>,
    pub message: String,
}

impl ModerateResponse {
    fn new(verdict: Verdict, message: String) -> Self {
        Self {
            risk_level: verdict.risk_level,
            category: verdict.category,
            message,
        }
    }
}

pub async fn moderate(State(state): State<AppState>, body: Bytes) -> Response {
    let message = serde_json::from_slice::<ModerateRequest>(&body)
        .ok()
        .and_then(|req| req.message)
        .unwrap_or_default();

    if message.is_empty() {
        return Json(ModerateResponse::new(Verdict::safe(), String::new())).into_response();
    }

    match state.service.moderate_message(&message).await {
        Ok(verdict) => {
            debug!(
                risk_level = %verdict.risk_level,
                preview = %truncate_chars(&message, 50),
                "Moderated message"
            );
            Json(ModerateResponse::new(verdict, message)).into_response()
        }
        Err(e) => moderation_error(&e),
    }
}
