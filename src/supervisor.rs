use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// How supervision ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorExit {
    /// The consumer ended on its own; shutdown was triggered.
    ConsumerDied,
    /// Shutdown was requested and the consumer finished in time.
    Stopped,
    /// Shutdown was requested and the consumer was abandoned after the join timeout.
    TimedOut,
}

/// Watch the consumer task.
///
/// A consumer that ends while nobody asked it to flips `shutdown` so the rest
/// of the process stops too. Once shutdown is requested the consumer gets
/// `join_timeout` to finish.
pub async fn supervise(
    mut consumer: JoinHandle<()>,
    shutdown: Arc<watch::Sender<bool>>,
    join_timeout: Duration,
) -> SupervisorExit {
    let mut requested = shutdown.subscribe();

    tokio::select! {
        joined = &mut consumer => {
            if *shutdown.borrow() {
                return SupervisorExit::Stopped;
            }
            match joined {
                Ok(()) => tracing::error!("Consumer exited unexpectedly, shutting down"),
                Err(e) => tracing::error!(error = %e, "Consumer task failed, shutting down"),
            }
            shutdown.send_replace(true);
            SupervisorExit::ConsumerDied
        }
        _ = async { requested.wait_for(|stop| *stop).await.map(|_| ()) } => {
            tracing::info!(timeout_secs = join_timeout.as_secs(), "Shutdown requested, waiting for consumer");
            match tokio::time::timeout(join_timeout, &mut consumer).await {
                Ok(_) => SupervisorExit::Stopped,
                Err(_) => {
                    tracing::warn!("Consumer did not stop in time, abandoning it");
                    consumer.abort();
                    SupervisorExit::TimedOut
                }
            }
        }
    }
}
