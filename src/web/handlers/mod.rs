pub mod chat;
pub mod conversation;
pub mod moderate;
