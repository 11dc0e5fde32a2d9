//! Taskchat core library: the per-task chat session controller, its STOMP transport,
//! the message store, and a development relay, used by the CLI.

pub mod config;
pub mod controller;
pub mod history;
pub mod message;
pub mod relay;
pub mod session;
pub mod stomp;
pub mod store;
pub mod transport;
