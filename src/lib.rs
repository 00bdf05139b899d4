// guardstream: incremental content moderation over a streaming guard model
//
// This is the library root. Each module corresponds to one layer of the
// moderation service, from the model boundary up to the HTTP surface.

pub mod chat;
pub mod config;
pub mod error;
pub mod guard;
pub mod moderation;
pub mod output;
pub mod web;
