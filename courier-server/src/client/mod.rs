//! Live client sessions
//!
//! A client is one connected device. The [`Client`] trait is the capability
//! set the registry and manager rely on; [`ClientSession`] implements it on
//! top of a framed [`Connection`].

mod connection;
mod session;

pub use connection::{Connection, Transport};
pub use session::ClientSession;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use courier_protocol::Message;

/// Shared handle to a client
pub type ClientRef = Arc<dyn Client>;

/// Delivery failure reported to callers of the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    /// No registered device matches the target
    #[error("client does not exist")]
    ClientNotExist,
    /// The target was found but its session is already closed
    #[error("client closed")]
    ClientClosed,
    /// The session's send queue is full; the message was dropped
    #[error("client send queue full")]
    QueueFull,
    /// The message does not fit in one frame; the session is unaffected
    #[error("message too large: {size} bytes")]
    MessageTooLarge { size: usize },
}

impl ClientError {
    /// Stable label for metrics
    pub fn label(&self) -> &'static str {
        match self {
            ClientError::ClientNotExist => "client_not_exist",
            ClientError::ClientClosed => "client_closed",
            ClientError::QueueFull => "queue_full",
            ClientError::MessageTooLarge { .. } => "message_too_large",
        }
    }
}

/// The `(user, device)` pair a client is currently bound to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Identity {
    pub user_id: i64,
    pub device_id: i64,
}

impl Identity {
    pub fn new(user_id: i64, device_id: i64) -> Self {
        Self { user_id, device_id }
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.user_id, self.device_id)
    }
}

/// Point-in-time description of a client
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClientInfo {
    pub connection_id: Uuid,
    pub user_id: i64,
    pub device_id: i64,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    pub closed: bool,
}

/// Completion signal of a client's dispatch loop
#[derive(Debug, Clone)]
pub struct Termination {
    done: CancellationToken,
}

impl Termination {
    pub fn new(done: CancellationToken) -> Self {
        Self { done }
    }

    /// Whether the dispatch loop has finished and released its transport
    pub fn is_finished(&self) -> bool {
        self.done.is_cancelled()
    }

    /// Wait for the dispatch loop to finish
    pub async fn wait(&self) {
        self.done.cancelled().await
    }
}

/// Callbacks from a client's dispatch loop into its owner
pub trait SessionHooks: Send + Sync {
    /// An inbound message arrived from the device
    fn on_message(&self, client: &ClientRef, message: Message);

    /// The dispatch loop ended; the transport is released
    fn on_exit(&self, client: &ClientRef);
}

/// Capability set of one live connection
///
/// Every method is safe to call concurrently with the dispatch loop.
pub trait Client: Send + Sync + 'static {
    /// Rebind the client to a new identity
    fn set_identity(&self, user_id: i64, device_id: i64);

    /// Current identity
    fn identity(&self) -> Identity;

    /// Start background processing. Called exactly once.
    fn run(self: Arc<Self>, hooks: Arc<dyn SessionHooks>);

    /// Queue a message for delivery without blocking
    fn enqueue_message(&self, message: Message) -> Result<(), ClientError>;

    /// Ask the dispatch loop to terminate; returns immediately
    fn request_close(&self);

    /// Whether the client no longer accepts messages
    fn is_closed(&self) -> bool;

    fn info(&self) -> ClientInfo;

    /// Completion handle of the dispatch loop
    fn termination(&self) -> Termination;
}

/// Whether two handles point at the same client instance
pub fn same_client(a: &ClientRef, b: &ClientRef) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
