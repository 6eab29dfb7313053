// ============================================================================
// Courier - transactional staging/public relay
// ============================================================================
//
// Messages are published atomically to two staging topics, then relayed to
// their public topics by two workers that commit the public write and the
// consumer offset in one producer transaction.
//
// ============================================================================

pub mod bootstrap;
pub mod context;
pub mod kafka;
pub mod metrics;
pub mod publisher;
pub mod relay;
pub mod routes;
pub mod transaction;

pub use courier_config::Config;
pub use courier_error::{AppError, AppResult};

use tracing::info;

/// Resolves on SIGTERM or Ctrl-C
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, initiating graceful shutdown...");
                    }
                    _ = tokio::signal::ctrl_c() => {
                        info!("SIGINT received, initiating graceful shutdown...");
                    }
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to register SIGTERM handler, using Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                info!("Ctrl-C received, initiating graceful shutdown...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, initiating graceful shutdown...");
    }
}
