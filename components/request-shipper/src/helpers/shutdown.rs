// External crates
use std::future::Future;
use tokio::sync::broadcast;
use tracing::instrument;

/// Global shutdown manager, built on-top of a broadcast channel
///
/// - `tx` is cloned by each request shipper component.
/// - Each component calls `.subscribe()` to get its own receiver.
/// - Calling `.trigger()` sends the shutdown signal to all components.
///
/// Unlike `Notify`, every receiver gets the same message and new subscribers
/// can be added at runtime, which fits `tokio::select!` loops.
#[derive(Debug, Clone)]
pub struct Shutdown {
    pub tx: broadcast::Sender<()>,
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Shutdown {
    /// Creates a new shutdown broadcast channel.
    /// A small buffer size is sufficient since only one message is sent.
    #[instrument(
        name = "request_shipper_shutdown_channel",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn new() -> Self {
        tracing::trace!("Creating new global shutdown channel");
        let (tx, _rx) = broadcast::channel(16);
        Self { tx }
    }

    /// Returns a new receiver handle for a component
    #[instrument(
        name = "request_shipper_shutdown_subscriber",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        tracing::trace!("Shutdown subscriber created for shutdown channel");
        self.tx.subscribe()
    }

    /// Trigger shutdown event, notifying all components with Receivers
    #[instrument(
        name = "request_shipper_shutdown_trigger",
        target = "helpers::shutdown",
        level = "trace"
    )]
    pub fn trigger(&self) {
        tracing::trace!("Shutdown triggered, notify global shutdown channel subscribers");
        let _ = self.tx.send(());
    }

    /// Future resolving once `.trigger()` is called.
    ///
    /// The receiver is subscribed immediately, so a trigger that happens
    /// before the future is first polled is not missed.
    pub fn wait_for_shutdown(&self) -> impl Future<Output = ()> + Send + use<> {
        let mut rx = self.tx.subscribe();
        async move {
            tracing::trace!("Waiting for shutdown signal");
            let _ = rx.recv().await;
            tracing::trace!("Shutdown signal received");
        }
    }
}

/// Trigger `shutdown` on Ctrl+C or SIGTERM.
#[instrument(
    name = "request_shipper_signal_listener",
    target = "helpers::shutdown",
    skip_all,
    level = "debug"
)]
pub async fn listen_for_signals(shutdown: Shutdown) {
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Could not install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                tracing::warn!(error = %e, "Could not listen for Ctrl+C");
                return;
            }
            tracing::info!("Exit signal detected, closing");
        }
        _ = terminate => {
            tracing::info!("Termination signal detected, closing");
        }
    }

    shutdown.trigger();
}
