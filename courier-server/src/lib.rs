//! courier-server: session gateway for long-lived device connections
//!
//! Tracks every connected device in a registry keyed by user and device,
//! promotes connections from a temporary id to an account on sign-in and
//! delivers messages to one or all devices of an account.

pub mod client;
pub mod config;
pub mod handlers;
pub mod identity;
pub mod manager;
pub mod observability;
pub mod registry;
pub mod tcp;

use std::sync::Arc;

use tokio::sync::broadcast;

pub use client::{Client, ClientError, ClientInfo, ClientRef, ClientSession, Connection, Identity};
pub use manager::{ClientManager, ManagerSnapshot};
pub use registry::{DeviceSet, Registry};

use config::AppConfig;
use identity::TempIdGenerator;
use observability::Metrics;

/// State shared by the listener tasks
#[derive(Clone)]
pub struct SharedState {
    pub manager: Arc<ClientManager>,
    pub metrics: Arc<Metrics>,
    pub config: Arc<AppConfig>,
    pub shutdown_tx: broadcast::Sender<()>,
}

impl SharedState {
    pub fn new(config: AppConfig) -> Self {
        let metrics = Arc::new(Metrics::new());
        let manager = ClientManager::new(
            Arc::new(TempIdGenerator::new()),
            metrics.clone(),
            config.session.clone(),
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            manager: Arc::new(manager),
            metrics,
            config: Arc::new(config),
            shutdown_tx,
        }
    }

    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Tell every listener to stop accepting
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}
