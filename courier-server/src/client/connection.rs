//! Transport handle wrapped by a client session

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use courier_protocol::MessageCodec;

/// Any bidirectional byte stream a session can run over
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A live connection framed with [`MessageCodec`]
pub struct Connection {
    framed: Framed<Box<dyn Transport>, MessageCodec>,
    peer: String,
}

impl Connection {
    /// Wrap a stream (TCP socket, in-memory duplex, ...) for `peer`
    pub fn new<T: Transport>(io: T, peer: impl Into<String>) -> Self {
        let io: Box<dyn Transport> = Box::new(io);
        Self {
            framed: Framed::new(io, MessageCodec::new()),
            peer: peer.into(),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub(crate) fn into_framed(self) -> Framed<Box<dyn Transport>, MessageCodec> {
        self.framed
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection").field("peer", &self.peer).finish()
    }
}
