//! Client manager
//!
//! Owns the registry of live sessions and moves sessions between the
//! temporary and account namespaces: connect, sign-in (with the one
//! session per device rule), sign-out, disconnect cleanup and delivery.
//!
//! `online` and `max_online` are plain atomics updated next to, not inside,
//! the registry mutation they accompany. Under concurrent sign-in/sign-out
//! they can briefly disagree with the registry contents.
//!
//! `online` counts sessions currently registered under an account. A login
//! that evicts the slot's previous occupant replaces it one for one and
//! leaves `online` untouched, so `online` equals sign-ins minus sign-outs
//! minus exits only when no eviction took place.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, warn};

use courier_protocol::{Action, Message};

use crate::client::{
    same_client, Client, ClientError, ClientInfo, ClientRef, ClientSession, Connection,
    Identity, SessionHooks,
};
use crate::config::SessionConfig;
use crate::handlers::{DefaultHandler, MessageHandler};
use crate::identity::IdGenerator;
use crate::observability::ConnectionStats;
use crate::registry::{Claim, Registry};

/// Payload sent to a session pushed out of its slot
pub const KICK_OUT_NOTICE: &str = "Your account is logged in on another device";

fn account_login_notice(device_id: i64) -> String {
    format!("multi device login, device={}", device_id)
}

/// Point-in-time read of the manager counters
///
/// The fields are read one by one, not as a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ManagerSnapshot {
    /// Authenticated sessions currently registered
    pub online: i64,
    /// High-watermark of `online`
    pub max_online: i64,
    /// Enqueue calls, successful or not
    pub messages_sent: i64,
    /// Start time in unix seconds
    pub started_at: i64,
}

/// Shared coordinator for every live session
pub struct ClientManager {
    registry: Registry,
    ids: Arc<dyn IdGenerator>,
    stats: Arc<dyn ConnectionStats>,
    handler: Box<dyn MessageHandler>,
    session: SessionConfig,
    online: AtomicI64,
    max_online: AtomicI64,
    messages_sent: AtomicI64,
    started_at: DateTime<Utc>,
}

impl ClientManager {
    pub fn new(
        ids: Arc<dyn IdGenerator>,
        stats: Arc<dyn ConnectionStats>,
        session: SessionConfig,
    ) -> Self {
        Self {
            registry: Registry::new(),
            ids,
            stats,
            handler: Box::new(DefaultHandler),
            session,
            online: AtomicI64::new(0),
            max_online: AtomicI64::new(0),
            messages_sent: AtomicI64::new(0),
            started_at: Utc::now(),
        }
    }

    /// Replace the handler for inbound messages
    pub fn with_handler(mut self, handler: impl MessageHandler + 'static) -> Self {
        self.handler = Box::new(handler);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    // ==================== Connection Lifecycle ====================

    /// Wrap `connection` in a session, register it under a fresh temporary
    /// id and start its dispatch loop. Returns the temporary id.
    pub fn connect(self: &Arc<Self>, connection: Connection) -> i64 {
        let peer = connection.peer().to_string();
        let session = ClientSession::new(
            connection,
            self.session.send_queue_capacity,
            self.session.close_flush_timeout(),
        );
        let temp_id = self.accept(session);
        debug!("Connection from {} registered as {}", peer, temp_id);
        temp_id
    }

    /// Register an already constructed client under a fresh temporary id and
    /// start it
    pub fn accept(self: &Arc<Self>, client: ClientRef) -> i64 {
        let temp_id = self.ids.generate_temporary();
        client.set_identity(temp_id, 0);
        self.registry.add(temp_id, 0, Arc::clone(&client));
        self.stats.on_connection_opened();

        let hooks: Arc<dyn SessionHooks> = Arc::clone(self) as Arc<dyn SessionHooks>;
        client.run(hooks);
        temp_id
    }

    /// Register `client` directly at device 0 of `user_id`
    ///
    /// The caller owns the client's processing; it is not started here.
    pub fn add_client(&self, user_id: i64, client: ClientRef) {
        client.set_identity(user_id, 0);
        match self
            .registry
            .claim(user_id, 0, client, |existing| self.evict(existing))
        {
            Claim::Bound { evicted, .. } => {
                self.stats.on_connection_opened();
                match evicted {
                    Some(evicted) => self.retire_evicted(&evicted, Identity::new(user_id, 0)),
                    None => self.count_sign_in(),
                }
                info!("Registered client for {}/0", user_id);
            }
            Claim::AlreadyBound => debug!("Client already registered at {}/0", user_id),
        }
    }

    /// Move the session registered under `temp_id` into `(user_id, device_id)`
    ///
    /// A different session occupying that slot is evicted: it gets a new
    /// temporary identity, a kick-out notice and a close request. The user's
    /// other devices are told about the new login. An unknown `temp_id` is
    /// logged and counted but not reported as an error.
    pub fn sign_in(&self, temp_id: i64, user_id: i64, device_id: i64) -> Result<(), ClientError> {
        debug!(
            "Sign in temp-id={}, uid={}, device={}",
            temp_id, user_id, device_id
        );

        // Detaching the temporary slot first makes a duplicate sign-in miss
        let detached = if self.ids.is_temporary(temp_id) && !self.ids.is_temporary(user_id) {
            self.registry.delete(temp_id, 0)
        } else {
            None
        };
        let Some(client) = detached else {
            warn!(
                "Sign in for nonexistent temporary client {} (uid={}, device={})",
                temp_id, user_id, device_id
            );
            self.stats.on_sign_in_miss();
            return Ok(());
        };

        // Set before the slot makes it reachable
        client.set_identity(user_id, device_id);

        let identity = Identity::new(user_id, device_id);
        let claim = self
            .registry
            .claim(user_id, device_id, Arc::clone(&client), |existing| {
                debug!("Multi device login mutex on {}", identity);
                self.evict(existing)
            });
        let Claim::Bound { evicted, others } = claim else {
            debug!("Temporary client {} already bound to {}", temp_id, identity);
            return Ok(());
        };

        match evicted {
            Some(evicted) => self.retire_evicted(&evicted, identity),
            None => self.count_sign_in(),
        }

        if !others.is_empty() {
            let notice = Message::server(Action::NotifyAccountLogin, account_login_notice(device_id));
            for other in &others {
                if let Err(e) = other.enqueue_message(notice.clone()) {
                    debug!("Login notice to {} dropped: {}", other.identity(), e);
                }
            }
        }

        info!("{} signed in (temp-id={})", identity, temp_id);

        // The transport may have died while the session was between slots
        if client.is_closed() {
            self.release(&client);
        }
        Ok(())
    }

    /// Detach the session at `(user_id, device_id)` and ask it to close
    ///
    /// Signing out a slot that is not registered is logged, counted and
    /// otherwise ignored, so repeating a sign-out is harmless.
    pub fn sign_out(&self, user_id: i64, device_id: i64) -> Result<(), ClientError> {
        let removed = if self.ids.is_temporary(user_id) {
            None
        } else {
            self.registry.delete(user_id, device_id)
        };
        let Some(client) = removed else {
            warn!("Sign out of unregistered device {}/{}", user_id, device_id);
            self.stats.on_sign_out_miss();
            return Ok(());
        };

        info!("{}/{} signed out", user_id, device_id);
        client.set_identity(self.ids.generate_temporary(), 0);
        client.request_close();
        self.online.fetch_sub(1, Ordering::SeqCst);
        self.stats.on_connection_closed();
        Ok(())
    }

    /// Dispatch-loop exit of `client`: drop it from the slot it still holds
    pub fn client_exited(&self, client: &ClientRef) {
        if !self.release(client) {
            debug!("Session {} exited outside the registry", client.identity());
        }
    }

    // ==================== Delivery ====================

    /// Queue `message` for `user_id`
    ///
    /// `device_id = 0` targets every registered device of the user. A
    /// broadcast keeps going past a failing device and reports the first
    /// failure.
    pub fn enqueue_message(
        &self,
        user_id: i64,
        device_id: i64,
        message: Message,
    ) -> Result<(), ClientError> {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);

        let result = self.deliver(user_id, device_id, message);
        if let Err(e) = &result {
            self.stats.on_delivery_failure(e.label());
        }
        result
    }

    fn deliver(&self, user_id: i64, device_id: i64, message: Message) -> Result<(), ClientError> {
        let devices = self
            .registry
            .get(user_id)
            .ok_or(ClientError::ClientNotExist)?;

        if device_id != 0 {
            let client = devices
                .get(device_id)
                .ok_or(ClientError::ClientNotExist)?;
            return client.enqueue_message(message);
        }

        let mut result = Ok(());
        for (device, client) in devices.iter() {
            let outcome = if client.is_closed() {
                Err(ClientError::ClientClosed)
            } else {
                client.enqueue_message(message.clone())
            };
            if let Err(e) = outcome {
                debug!("Delivery to {}/{} failed: {}", user_id, device, e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    // ==================== Queries ====================

    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            online: self.online.load(Ordering::SeqCst),
            max_online: self.max_online.load(Ordering::SeqCst),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            started_at: self.started_at.timestamp(),
        }
    }

    /// Up to `count` authenticated sessions, one per user
    pub fn list_sample(&self, count: usize) -> Vec<ClientInfo> {
        self.registry
            .sample(count, |user_id| self.ids.is_temporary(user_id))
    }

    pub fn is_online(&self, user_id: i64) -> bool {
        self.registry.get(user_id).is_some()
    }

    pub fn is_device_online(&self, user_id: i64, device_id: i64) -> bool {
        self.registry.get_device(user_id, device_id).is_some()
    }

    // ==================== Internals ====================

    /// Sever `client` from its slot. Runs under the slot owner's entry lock.
    fn evict(&self, client: &ClientRef) {
        let previous = client.identity();
        client.set_identity(self.ids.generate_temporary(), 0);
        let notice = Message::server(Action::NotifyKickOut, KICK_OUT_NOTICE);
        if let Err(e) = client.enqueue_message(notice) {
            debug!("Kick-out notice to {} dropped: {}", previous, e);
        }
        client.request_close();
    }

    /// Account for a session replaced at `slot`; `online` is unchanged
    fn retire_evicted(&self, evicted: &ClientRef, slot: Identity) {
        self.stats.on_eviction();
        self.stats.on_connection_closed();
        info!(
            "Evicted session at {} (now {})",
            slot,
            evicted.identity()
        );
    }

    fn count_sign_in(&self) {
        let online = self.online.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_online.fetch_max(online, Ordering::SeqCst);
    }

    /// Remove `client` from the slot its identity names, if it still holds
    /// it. Returns whether anything was removed.
    fn release(&self, client: &ClientRef) -> bool {
        let identity = client.identity();
        let removed = self
            .registry
            .delete_if(identity.user_id, identity.device_id, |occupant| {
                same_client(occupant, client)
            });
        if removed.is_none() {
            return false;
        }

        if self.ids.is_temporary(identity.user_id) {
            debug!("Temporary session {} disconnected", identity);
        } else {
            self.online.fetch_sub(1, Ordering::SeqCst);
            info!("{} disconnected", identity);
        }
        self.stats.on_connection_closed();
        true
    }
}

impl SessionHooks for ClientManager {
    fn on_message(&self, client: &ClientRef, message: Message) {
        self.handler.handle(self, client, message);
    }

    fn on_exit(&self, client: &ClientRef) {
        self.client_exited(client);
    }
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("registry", &self.registry)
            .field("snapshot", &self.snapshot())
            .finish()
    }
}
