//! Page-context extraction and a chat relay for a browsing assistant.
//!
//! [`extract`] turns an HTML page into a labeled text bundle, [`relay`] sends
//! it with a user question to the assistant backend, and [`session`] keeps the
//! conversation state around those calls.

pub mod attributes;
pub mod config;
pub mod extract;
pub mod fetch;
pub mod messaging;
pub mod models;
pub mod product;
pub mod relay;
pub mod sanitize;
pub mod server;
pub mod session;
pub mod stream;
pub mod watcher;
