//! courier-protocol: Shared wire definitions for the courier gateway
//!
//! This crate defines the message value exchanged between a connected
//! device and the gateway, and the length-prefixed codec that frames it
//! on a byte stream.

pub mod codec;
pub mod messages;

// Re-export main types at crate root
pub use codec::{CodecError, MessageCodec, MAX_MESSAGE_SIZE};
pub use messages::{Action, LoginRequest, Message, PayloadError, SERVER_USER_ID};
