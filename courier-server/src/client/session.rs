//! Connection-backed client session
//!
//! Each session owns a bounded outbound queue and a dispatch task that
//! multiplexes three things: close requests, queued outbound messages and
//! inbound frames from the device. Inbound frames are handed to the owner's
//! [`SessionHooks`]; the owner is told when the loop ends.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use uuid::Uuid;

use courier_protocol::{CodecError, Message, MessageCodec};

use super::{Client, ClientError, ClientInfo, ClientRef, Connection, Identity, SessionHooks, Termination};

/// Pieces consumed when the dispatch loop starts
struct Pending {
    connection: Connection,
    outbound: mpsc::Receiver<Message>,
}

/// A client session running over a [`Connection`]
pub struct ClientSession {
    connection_id: Uuid,
    peer: String,
    connected_at: DateTime<Utc>,
    identity: RwLock<Identity>,
    sender: mpsc::Sender<Message>,
    pending: Mutex<Option<Pending>>,
    closed: AtomicBool,
    close_token: CancellationToken,
    done_token: CancellationToken,
    flush_timeout: Duration,
}

impl ClientSession {
    /// Create a session with an outbound queue of `queue_capacity` messages
    ///
    /// `flush_timeout` bounds how long queued messages are still written
    /// after a close request.
    pub fn new(connection: Connection, queue_capacity: usize, flush_timeout: Duration) -> Arc<Self> {
        let (sender, outbound) = mpsc::channel(queue_capacity.max(1));
        Arc::new(Self {
            connection_id: Uuid::new_v4(),
            peer: connection.peer().to_string(),
            connected_at: Utc::now(),
            identity: RwLock::new(Identity::new(0, 0)),
            sender,
            pending: Mutex::new(Some(Pending {
                connection,
                outbound,
            })),
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
            done_token: CancellationToken::new(),
            flush_timeout,
        })
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    async fn dispatch(
        self: Arc<Self>,
        pending: Pending,
        hooks: Arc<dyn SessionHooks>,
    ) {
        let me: ClientRef = self.clone();
        let Pending {
            connection,
            mut outbound,
        } = pending;
        let mut framed = connection.into_framed();

        let close_requested = loop {
            tokio::select! {
                biased;

                _ = self.close_token.cancelled() => break true,

                Some(message) = outbound.recv() => {
                    trace!("Writing {} to {}", message.action.name(), self.identity());
                    match framed.send(message).await {
                        Ok(()) => {}
                        // Rejected before anything was buffered
                        Err(e @ CodecError::MessageTooLarge { .. }) => {
                            warn!("Dropping frame for {}: {}", self.identity(), e);
                        }
                        Err(e) => {
                            warn!("Write to {} ({}) failed: {}", self.identity(), self.peer, e);
                            break false;
                        }
                    }
                }

                inbound = framed.next() => match inbound {
                    Some(Ok(message)) => hooks.on_message(&me, message),
                    Some(Err(e)) => {
                        warn!("Read from {} ({}) failed: {}", self.identity(), self.peer, e);
                        break false;
                    }
                    None => {
                        debug!("Peer {} closed connection for {}", self.peer, self.identity());
                        break false;
                    }
                },
            }
        };

        self.closed.store(true, Ordering::SeqCst);
        outbound.close();

        if close_requested {
            // Best effort: deliver what was queued before the close request
            let flush = async {
                while let Some(message) = outbound.recv().await {
                    framed.feed(message).await?;
                }
                SinkExt::<Message>::flush(&mut framed).await
            };
            match tokio::time::timeout(self.flush_timeout, flush).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Final flush to {} failed: {}", self.peer, e),
                Err(_) => debug!("Final flush to {} timed out", self.peer),
            }
        }

        let _ = SinkExt::<Message>::close(&mut framed).await;
        drop(framed);

        debug!(
            "Session {} for {} finished (close requested: {})",
            self.connection_id,
            self.identity(),
            close_requested
        );
        hooks.on_exit(&me);
        self.done_token.cancel();
    }
}

impl Client for ClientSession {
    fn set_identity(&self, user_id: i64, device_id: i64) {
        *self.identity.write() = Identity::new(user_id, device_id);
    }

    fn identity(&self) -> Identity {
        *self.identity.read()
    }

    fn run(self: Arc<Self>, hooks: Arc<dyn SessionHooks>) {
        let Some(pending) = self.pending.lock().take() else {
            warn!("Session {} already started or closed", self.connection_id);
            return;
        };
        tokio::spawn(self.dispatch(pending, hooks));
    }

    fn enqueue_message(&self, message: Message) -> Result<(), ClientError> {
        if self.is_closed() {
            return Err(ClientError::ClientClosed);
        }
        if let Err(CodecError::MessageTooLarge { size, .. }) = MessageCodec::check_size(&message) {
            warn!(
                "Rejecting {} of {} bytes for {}",
                message.action.name(),
                size,
                self.identity()
            );
            return Err(ClientError::MessageTooLarge { size });
        }
        match self.sender.try_send(message) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(message)) => {
                warn!(
                    "Send queue of {} full, dropping {}",
                    self.identity(),
                    message.action.name()
                );
                Err(ClientError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(ClientError::ClientClosed),
        }
    }

    fn request_close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.close_token.cancel();

        // Never started: nothing will complete the termination otherwise
        if self.pending.lock().take().is_some() {
            self.done_token.cancel();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn info(&self) -> ClientInfo {
        let identity = self.identity();
        ClientInfo {
            connection_id: self.connection_id,
            user_id: identity.user_id,
            device_id: identity.device_id,
            peer: self.peer.clone(),
            connected_at: self.connected_at,
            closed: self.is_closed(),
        }
    }

    fn termination(&self) -> Termination {
        Termination::new(self.done_token.clone())
    }
}

impl std::fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSession")
            .field("connection_id", &self.connection_id)
            .field("identity", &self.identity())
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::{Action, MessageCodec};
    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    /// Hooks that record what the dispatch loop reports
    #[derive(Default)]
    struct RecordingHooks {
        inbound: Mutex<Vec<Message>>,
        exits: Mutex<Vec<Identity>>,
    }

    impl SessionHooks for RecordingHooks {
        fn on_message(&self, _client: &ClientRef, message: Message) {
            self.inbound.lock().push(message);
        }

        fn on_exit(&self, client: &ClientRef) {
            self.exits.lock().push(client.identity());
        }
    }

    fn setup(capacity: usize) -> (Arc<ClientSession>, Framed<DuplexStream, MessageCodec>) {
        let (server_io, device_io) = tokio::io::duplex(64 * 1024);
        let session = ClientSession::new(
            Connection::new(server_io, "test-peer"),
            capacity,
            Duration::from_millis(200),
        );
        (session, Framed::new(device_io, MessageCodec::new()))
    }

    #[tokio::test]
    async fn test_outbound_delivery() {
        let (session, mut device) = setup(8);
        let hooks = Arc::new(RecordingHooks::default());
        session.clone().run(hooks);

        session
            .enqueue_message(Message::new(7, Action::Chat, "hi"))
            .unwrap();

        let received = device.next().await.unwrap().unwrap();
        assert_eq!(received, Message::new(7, Action::Chat, "hi"));
    }

    #[tokio::test]
    async fn test_inbound_reaches_hooks() {
        let (session, mut device) = setup(8);
        let hooks = Arc::new(RecordingHooks::default());
        session.clone().run(hooks.clone());

        device
            .send(Message::new(0, Action::Heartbeat, ""))
            .await
            .unwrap();
        drop(device);

        session.termination().wait().await;
        assert_eq!(hooks.inbound.lock().len(), 1);
        assert_eq!(hooks.inbound.lock()[0].action, Action::Heartbeat);
    }

    #[tokio::test]
    async fn test_peer_disconnect_reports_exit() {
        let (session, device) = setup(8);
        let hooks = Arc::new(RecordingHooks::default());
        session.set_identity(5001, 1);
        session.clone().run(hooks.clone());

        drop(device);
        session.termination().wait().await;

        assert!(session.is_closed());
        assert_eq!(*hooks.exits.lock(), vec![Identity::new(5001, 1)]);
        assert_eq!(
            session.enqueue_message(Message::server(Action::Chat, "late")),
            Err(ClientError::ClientClosed)
        );
    }

    #[tokio::test]
    async fn test_close_flushes_queued_messages() {
        let (session, mut device) = setup(8);
        let hooks = Arc::new(RecordingHooks::default());
        session.clone().run(hooks.clone());

        session
            .enqueue_message(Message::server(Action::NotifyKickOut, "bye"))
            .unwrap();
        session.request_close();
        session.termination().wait().await;

        let received = device.next().await.unwrap().unwrap();
        assert_eq!(received.action, Action::NotifyKickOut);
        // Transport released after the flush
        assert!(device.next().await.is_none());
        assert_eq!(hooks.exits.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let (session, mut device) = setup(8);
        let hooks = Arc::new(RecordingHooks::default());
        session.clone().run(hooks.clone());

        let oversized = Message::new(7, Action::Chat, "x".repeat(2 * 1024 * 1024));
        assert!(matches!(
            session.enqueue_message(oversized),
            Err(ClientError::MessageTooLarge { .. })
        ));

        // The session keeps serving
        assert!(!session.is_closed());
        session
            .enqueue_message(Message::new(7, Action::Chat, "after"))
            .unwrap();
        let received = device.next().await.unwrap().unwrap();
        assert_eq!(received.payload, "after");
        assert!(hooks.exits.lock().is_empty());
    }

    #[tokio::test]
    async fn test_queue_full_is_reported() {
        let (session, _device) = setup(1);

        // Not running yet, so nothing drains the queue
        session
            .enqueue_message(Message::server(Action::Chat, "1"))
            .unwrap();
        assert_eq!(
            session.enqueue_message(Message::server(Action::Chat, "2")),
            Err(ClientError::QueueFull)
        );
    }

    #[tokio::test]
    async fn test_close_before_run_finishes_termination() {
        let (session, _device) = setup(4);
        session.request_close();

        assert!(session.is_closed());
        assert!(session.termination().is_finished());
    }

    #[tokio::test]
    async fn test_run_twice_is_ignored() {
        let (session, device) = setup(4);
        let hooks = Arc::new(RecordingHooks::default());
        session.clone().run(hooks.clone());
        session.clone().run(hooks.clone());

        drop(device);
        session.termination().wait().await;
        assert_eq!(hooks.exits.lock().len(), 1);
    }

    #[test]
    fn test_info_reflects_identity() {
        let (server_io, _device_io) = tokio::io::duplex(64);
        let session = ClientSession::new(
            Connection::new(server_io, "10.0.0.1:5555"),
            4,
            Duration::from_millis(10),
        );
        session.set_identity(42, 3);

        let info = session.info();
        assert_eq!(info.user_id, 42);
        assert_eq!(info.device_id, 3);
        assert_eq!(info.peer, "10.0.0.1:5555");
        assert_eq!(info.connection_id, session.connection_id());
        assert!(!info.closed);
    }
}
