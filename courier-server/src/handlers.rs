//! Handlers for inbound device messages
//!
//! The session layer owns only heartbeats and the development login API.
//! Everything else is left to whatever [`MessageHandler`] the deployment
//! installs.

use tracing::{debug, warn};

use courier_protocol::{Action, LoginRequest, Message, SERVER_USER_ID};

use crate::client::{Client, ClientRef, Identity};
use crate::manager::ClientManager;

/// Routes a message received from `client`
///
/// Called from the client's dispatch loop, so it must not block.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, manager: &ClientManager, client: &ClientRef, message: Message);
}

/// Heartbeat echo plus the development login API
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHandler;

impl MessageHandler for DefaultHandler {
    fn handle(&self, manager: &ClientManager, client: &ClientRef, message: Message) {
        match message.action {
            Action::Heartbeat => handle_heartbeat(client),
            Action::TestLogin => handle_test_login(manager, client, &message),
            Action::TestSignOut => handle_test_sign_out(manager, client),
            other => debug!(
                "Dropping {} from {} (no handler)",
                other.name(),
                client.identity()
            ),
        }
    }
}

fn reply(client: &ClientRef, message: Message) {
    if let Err(e) = client.enqueue_message(message) {
        debug!("Reply to {} dropped: {}", client.identity(), e);
    }
}

fn handle_heartbeat(client: &ClientRef) {
    reply(client, Message::server(Action::Heartbeat, ""));
}

/// Sign the sending connection in as the requested account
fn handle_test_login(manager: &ClientManager, client: &ClientRef, message: &Message) {
    let request: LoginRequest = match message.json() {
        Ok(request) => request,
        Err(e) => {
            warn!("Rejecting login from {}: {}", client.identity(), e);
            return;
        }
    };

    let current = client.identity();
    if let Err(e) = manager.sign_in(current.user_id, request.uid, request.device) {
        warn!("Login of {} as {}/{} failed: {}", current, request.uid, request.device, e);
        return;
    }

    // A miss leaves the identity as it was; only a real login is confirmed
    let identity = client.identity();
    if identity != Identity::new(request.uid, request.device) {
        debug!("Login of {} as {}/{} not applied", current, request.uid, request.device);
        return;
    }

    match Message::with_json(SERVER_USER_ID, Action::Response, &identity) {
        Ok(response) => reply(client, response),
        Err(e) => warn!("Failed to encode login response: {}", e),
    }
}

fn handle_test_sign_out(manager: &ClientManager, client: &ClientRef) {
    let current = client.identity();
    if let Err(e) = manager.sign_out(current.user_id, current.device_id) {
        warn!("Sign out of {} failed: {}", current, e);
    }
}
