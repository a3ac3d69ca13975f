//! Message value exchanged with connected devices

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Origin user id used for messages generated by the gateway itself
pub const SERVER_USER_ID: i64 = 0;

/// What a message is for
///
/// The gateway only interprets the actions it owns (heartbeats, the
/// development login API and the notifications it emits); everything else
/// is passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    /// Keepalive, echoed back to the sender
    Heartbeat,
    /// Direct chat message
    Chat,
    /// Group chat message
    GroupChat,
    /// Delivery acknowledgement
    Ack,
    /// The receiving device was signed out because the account logged in elsewhere
    NotifyKickOut,
    /// Another device of the same account signed in
    NotifyAccountLogin,
    /// Development sign-in: payload is a [`LoginRequest`]
    TestLogin,
    /// Development sign-out of the sending device
    TestSignOut,
    /// Generic API response
    Response,
}

impl Action {
    /// Stable name used in logs and metrics labels
    pub fn name(&self) -> &'static str {
        match self {
            Action::Heartbeat => "heartbeat",
            Action::Chat => "chat",
            Action::GroupChat => "group_chat",
            Action::Ack => "ack",
            Action::NotifyKickOut => "notify_kick_out",
            Action::NotifyAccountLogin => "notify_account_login",
            Action::TestLogin => "test_login",
            Action::TestSignOut => "test_sign_out",
            Action::Response => "response",
        }
    }
}

/// Error decoding a structured payload
#[derive(Debug, thiserror::Error)]
#[error("invalid {action:?} payload: {source}")]
pub struct PayloadError {
    pub action: Action,
    #[source]
    pub source: serde_json::Error,
}

/// A message travelling to or from a device
///
/// `payload` is opaque to the session layer. Structured payloads are carried
/// as JSON text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// User the message originates from (`SERVER_USER_ID` for gateway notices)
    pub origin_user_id: i64,
    pub action: Action,
    pub payload: String,
}

impl Message {
    pub fn new(origin_user_id: i64, action: Action, payload: impl Into<String>) -> Self {
        Self {
            origin_user_id,
            action,
            payload: payload.into(),
        }
    }

    /// Message generated by the gateway itself
    pub fn server(action: Action, payload: impl Into<String>) -> Self {
        Self::new(SERVER_USER_ID, action, payload)
    }

    /// Build a message whose payload is `value` encoded as JSON
    pub fn with_json<T: Serialize>(
        origin_user_id: i64,
        action: Action,
        value: &T,
    ) -> Result<Self, PayloadError> {
        let payload =
            serde_json::to_string(value).map_err(|source| PayloadError { action, source })?;
        Ok(Self::new(origin_user_id, action, payload))
    }

    /// Decode the JSON payload into `T`
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, PayloadError> {
        serde_json::from_str(&self.payload).map_err(|source| PayloadError {
            action: self.action,
            source,
        })
    }
}

/// Payload of [`Action::TestLogin`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    pub uid: i64,
    pub device: i64,
}
