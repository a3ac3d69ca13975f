//! TCP listener for device connections

use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

use courier_utils::{CourierError, Result};

use crate::client::Connection;
use crate::SharedState;

/// Bind `addr` and run the accept loop until shutdown
pub async fn run_tcp_accept_loop(addr: String, shared_state: SharedState) -> Result<()> {
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|source| CourierError::Bind {
            addr: addr.clone(),
            source,
        })?;

    info!("TCP listener bound to {}", addr);
    serve(listener, shared_state).await;
    Ok(())
}

/// Accept connections from `listener` and hand each to the client manager
pub async fn serve(listener: TcpListener, shared_state: SharedState) {
    let mut shutdown_rx = shared_state.subscribe_shutdown();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        if let Err(e) = stream.set_nodelay(true) {
                            warn!("Failed to set TCP_NODELAY for {}: {}", peer_addr, e);
                        }
                        let connection = Connection::new(stream, peer_addr.to_string());
                        let temp_id = shared_state.manager.connect(connection);
                        debug!("New TCP connection from {} as {}", peer_addr, temp_id);
                    }
                    Err(e) => {
                        error!("TCP accept error: {}", e);
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, stopping TCP accept loop");
                break;
            }
        }
    }
}
