//! STOMP 1.2 framing for the chat transport.
//!
//! Frames travel one (or more) per WebSocket text message. The client side lives in
//! `transport`; the relay speaks the server side with the same codec.

mod frame;

pub use frame::{Command, Frame, FrameError};
