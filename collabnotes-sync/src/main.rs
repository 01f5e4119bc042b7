//! Collaboration sync server binary.
//!
//! Configuration comes from the environment (see [`ServerConfig::from_env`]).
//! The process stops accepting connections on SIGINT/SIGTERM, flushes every
//! open room best-effort, and exits.

use std::process::ExitCode;
use std::sync::Arc;

use collabnotes_sync::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!("CollabNotes sync server starting on ws://{}", config.bind_addr);

    let server = match SyncServer::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            log::error!("Failed to initialize server: {e}");
            return ExitCode::FAILURE;
        }
    };

    // Stop accepting and flush open rooms on SIGINT/SIGTERM
    let signal_target = server.clone();
    tokio::spawn(async move {
        wait_for_termination().await;
        log::info!("Termination signal received, shutting down");
        signal_target.trigger_shutdown();
    });

    if let Err(e) = server.run().await {
        log::error!("Server error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Resolve on SIGINT or SIGTERM, whichever arrives first.
async fn wait_for_termination() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                log::warn!("Failed to install SIGTERM handler: {e}");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
