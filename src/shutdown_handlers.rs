use std::future::Future;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::shutdown::{ShutdownCause, ShutdownReceiver, ShutdownSender};

#[cfg(unix)]
use tokio::signal::unix::{SignalKind, signal};

/// One cause is ever sent per process.
const SHUTDOWN_CHANNEL_CAPACITY: usize = 1;

#[must_use]
pub fn shutdown_channel() -> (ShutdownSender, ShutdownReceiver) {
    broadcast::channel(SHUTDOWN_CHANNEL_CAPACITY)
}

/// Completes on Ctrl+C. Never completes if the handler cannot be installed.
async fn interrupted() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {}", err);
        std::future::pending::<()>().await;
    }
}

#[cfg(unix)]
async fn next_signal() -> ShutdownCause {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => Some(terminate),
        Err(err) => {
            warn!("Failed to register SIGTERM handler: {}", err);
            None
        }
    };
    let terminated = async {
        match terminate.as_mut() {
            Some(terminate) => {
                terminate.recv().await;
            }
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        () = interrupted() => ShutdownCause::Interrupt,
        () = terminated => ShutdownCause::Terminate,
    }
}

#[cfg(not(unix))]
async fn next_signal() -> ShutdownCause {
    interrupted().await;
    ShutdownCause::Interrupt
}

/// Turns the first SIGINT or SIGTERM into a shutdown broadcast. The task
/// ends without sending once anything else has broadcast a shutdown.
pub fn setup_signal_shutdown_handler(shutdown_tx: &ShutdownSender) -> JoinHandle<()> {
    let shutdown_tx = shutdown_tx.clone();
    let mut shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        tokio::select! {
            _ = shutdown_rx.recv() => debug!("signal handler stopping"),
            cause = next_signal() => {
                info!("{} received", cause);
                if shutdown_tx.send(cause).is_err() {
                    debug!("Nobody is listening for shutdown");
                }
            }
        }
    })
}

/// Runs `action` with the first shutdown cause received. A channel closed
/// without a cause never runs it.
pub fn on_shutdown<F, Fut>(mut shutdown_rx: ShutdownReceiver, action: F) -> JoinHandle<()>
where
    F: FnOnce(ShutdownCause) -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match shutdown_rx.recv().await {
                Ok(cause) => {
                    action(cause).await;
                    return;
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!("Skipped {} shutdown notification(s)", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}
