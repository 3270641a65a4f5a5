use metrics::counter;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use super::resilience::{
    Backoff, CircuitBreaker, CircuitBreakerConfig, CircuitSnapshot, ReconnectPolicy,
};
use super::{BrokerChannel, BrokerError, Connector};
use crate::config::AppConfig;

struct ActiveChannel {
    channel: Arc<dyn BrokerChannel>,
    connection_id: Uuid,
}

/// Owns the broker connection: lazy connect, reconnect with backoff, and a
/// circuit breaker over failed connect cycles.
///
/// Construct once and share through `Arc`; the consumer and publisher ask it
/// for the current channel on every operation instead of holding one.
pub struct ConnectionManager {
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    breaker: CircuitBreaker,
    active: Mutex<Option<ActiveChannel>>,
    closed: AtomicBool,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        Self {
            connector,
            policy,
            breaker: CircuitBreaker::new(breaker),
            active: Mutex::new(None),
            closed: AtomicBool::new(false),
        }
    }

    pub fn from_config(connector: Arc<dyn Connector>, config: &AppConfig) -> Self {
        let policy = ReconnectPolicy {
            backoff: Backoff::new(
                Duration::from_secs(config.reconnect_base_secs),
                Duration::from_secs(config.reconnect_max_secs),
            ),
            max_attempts: config.reconnect_max_retries.max(1),
        };
        let breaker = CircuitBreakerConfig::default()
            .with_failure_threshold(config.circuit_failure_threshold)
            .with_recovery_timeout(Duration::from_secs(config.circuit_recovery_secs));
        Self::new(connector, policy, breaker)
    }

    /// Current channel, connecting first if there is none.
    ///
    /// Fails fast with [`BrokerError::CircuitOpen`] while the breaker is open.
    pub async fn get_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Closed);
        }

        let mut active = self.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Ok(current.channel.clone());
        }

        // Cancellation mid-cycle drops the permit, which releases a half-open trial.
        let Some(permit) = self.breaker.try_acquire() else {
            return Err(BrokerError::CircuitOpen);
        };

        match self.connect_cycle().await {
            Ok(channel) => {
                permit.succeed();
                let connection_id = Uuid::new_v4();
                info!(connection_id = %connection_id, "Broker connection established");
                *active = Some(ActiveChannel {
                    channel: channel.clone(),
                    connection_id,
                });
                Ok(channel)
            }
            Err(e) => {
                permit.fail();
                counter!("broker_connect_failures_total").increment(1);
                Err(e)
            }
        }
    }

    async fn connect_cycle(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let mut last_error = String::new();

        for attempt in 0..self.policy.max_attempts {
            match self.open_and_declare().await {
                Ok(channel) => return Ok(channel),
                Err(e) => {
                    warn!(
                        attempt = attempt + 1,
                        max_attempts = self.policy.max_attempts,
                        error = %e,
                        "Broker connection attempt failed"
                    );
                    last_error = e.to_string();
                }
            }

            if attempt + 1 < self.policy.max_attempts {
                tokio::time::sleep(self.policy.backoff.delay(attempt)).await;
            }
        }

        Err(BrokerError::ConnectFailed {
            attempts: self.policy.max_attempts,
            last_error,
        })
    }

    async fn open_and_declare(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let channel = self.connector.connect().await?;
        if let Err(e) = channel.declare().await {
            channel.close().await;
            return Err(e);
        }
        Ok(channel)
    }

    /// Drop `channel` if it is still the current one, so the next caller reconnects.
    pub async fn invalidate(&self, channel: &Arc<dyn BrokerChannel>) {
        let mut active = self.active.lock().await;
        let is_current = active
            .as_ref()
            .is_some_and(|current| Arc::ptr_eq(&current.channel, channel));
        if is_current {
            if let Some(old) = active.take() {
                warn!(connection_id = %old.connection_id, "Broker connection lost, invalidating");
                old.channel.close().await;
            }
        }
    }

    /// Ping the current channel and reconnect if it is dead. Returns whether a
    /// usable channel exists afterwards.
    pub async fn check_connection(&self) -> bool {
        let current = self
            .active
            .lock()
            .await
            .as_ref()
            .map(|a| a.channel.clone());

        if let Some(channel) = current {
            if channel.ping().await.is_ok() {
                return true;
            }
            self.invalidate(&channel).await;
        }
        self.get_channel().await.is_ok()
    }

    pub async fn is_connected(&self) -> bool {
        self.active.lock().await.is_some()
    }

    pub async fn connection_id(&self) -> Option<Uuid> {
        self.active.lock().await.as_ref().map(|a| a.connection_id)
    }

    pub fn circuit(&self) -> CircuitSnapshot {
        self.breaker.snapshot()
    }

    /// Release the channel. Later `get_channel` calls fail with [`BrokerError::Closed`].
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(old) = self.active.lock().await.take() {
            info!(connection_id = %old.connection_id, "Closing broker connection");
            old.channel.close().await;
        }
    }
}
