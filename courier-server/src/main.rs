//! courier server - session gateway daemon

use std::path::PathBuf;

use tracing::{error, info};

use courier_server::config::{AppConfig, ConfigLoader};
use courier_server::observability::run_stats_server;
use courier_server::tcp::run_tcp_accept_loop;
use courier_server::SharedState;
use courier_utils::{CourierError, LogConfig, Result};

const USAGE: &str = "usage: courier-server [--config PATH]";

/// Optional `--config PATH` argument
fn config_path_arg() -> Result<Option<PathBuf>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => Ok(None),
        [flag, path] if flag == "--config" => Ok(Some(PathBuf::from(path))),
        _ => Err(CourierError::config(USAGE)),
    }
}

fn load_config(path: Option<PathBuf>) -> Result<AppConfig> {
    match path {
        Some(path) => ConfigLoader::load_path_and_validate(&path),
        None => ConfigLoader::load_and_validate(),
    }
}

/// Run the main server daemon
async fn run_daemon(config: AppConfig) -> Result<()> {
    info!("courier server starting");

    let state = SharedState::new(config);

    let mut listener = tokio::spawn(run_tcp_accept_loop(
        state.config.server.listen_addr.clone(),
        state.clone(),
    ));

    let stats = if state.config.stats.enabled {
        let addr = state.config.stats.listen_addr.clone();
        let state = state.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_stats_server(addr, state).await {
                error!("Stats server failed: {}", e);
            }
        }))
    } else {
        info!("Stats server disabled");
        None
    };

    let result = tokio::select! {
        joined = &mut listener => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(CourierError::internal(format!("listener task failed: {}", e))),
        },
        signal = tokio::signal::ctrl_c() => {
            info!("Shutdown requested");
            signal.map_err(CourierError::from)
        }
    };

    state.shutdown();
    if !listener.is_finished() {
        let _ = listener.await;
    }
    if let Some(stats) = stats {
        let _ = stats.await;
    }

    let snapshot = state.manager.snapshot();
    info!(
        "courier server stopped (online={}, max_online={}, messages_sent={})",
        snapshot.online, snapshot.max_online, snapshot.messages_sent
    );
    result
}

#[tokio::main]
async fn main() -> Result<()> {
    courier_utils::init_logging_with_config(LogConfig::server())?;

    let config = load_config(config_path_arg()?)?;
    run_daemon(config).await
}
