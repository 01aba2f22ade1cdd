use nightshift_scheduler::{SchedulerHandle, Selection};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
///
/// The in-flight batch still commits; handlers stop before their next one.
pub fn spawn_shutdown_listener(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("failed to install Ctrl-C handler: {e}");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    error!("failed to install SIGTERM handler: {e}");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("received Ctrl-C, shutting down"),
            _ = terminate => info!("received SIGTERM, shutting down"),
            _ = shutdown.cancelled() => return,
        }
        shutdown.cancel();
    });
}

/// Request an immediate run of every handler on each SIGUSR1.
#[cfg(unix)]
pub fn spawn_run_now_listener(handle: SchedulerHandle, shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut usr1 = match signal::unix::signal(signal::unix::SignalKind::user_defined1()) {
            Ok(sig) => sig,
            Err(e) => {
                warn!("failed to install SIGUSR1 handler: {e}");
                return;
            }
        };
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                received = usr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("received SIGUSR1, requesting immediate run");
                    let handle = handle.clone();
                    tokio::spawn(async move {
                        match handle.run_now(Selection::All).await {
                            Ok(summary) if summary.any_failed() => {
                                warn!(run_id = %summary.run_id, "immediate run finished with failures")
                            }
                            Ok(summary) => info!(run_id = %summary.run_id, "immediate run finished"),
                            Err(e) => error!(error = %e, "immediate run rejected"),
                        }
                    });
                }
            }
        }
    });
}

#[cfg(not(unix))]
pub fn spawn_run_now_listener(_handle: SchedulerHandle, _shutdown: CancellationToken) {}
