// Incremental moderation — the request-level protocol on top of a GuardModel.
//
// A request moves START -> USER_MODERATED -> ASSISTANT_TOKEN(i)... -> DONE,
// or ends in FAILED. The service drives that sequence; the session owns the
// model-side state for exactly one request.

pub mod events;
pub mod service;
pub mod session;
