use metrics::counter;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use super::connection::ConnectionManager;
use super::resilience::Backoff;
use super::{BrokerError, OutboundMessage};
use crate::config::AppConfig;
use crate::models::envelope::ResponseEnvelope;

/// Publishes correlated responses, retrying through fresh channels.
pub struct ResponsePublisher {
    connection: Arc<ConnectionManager>,
    max_retries: u32,
    backoff: Backoff,
}

impl ResponsePublisher {
    pub fn new(connection: Arc<ConnectionManager>, max_retries: u32, backoff: Backoff) -> Self {
        Self {
            connection,
            max_retries,
            backoff,
        }
    }

    pub fn from_config(connection: Arc<ConnectionManager>, config: &AppConfig) -> Self {
        Self::new(
            connection,
            config.publish_max_retries,
            Backoff::new(
                Duration::from_secs(config.publish_base_secs),
                Duration::from_secs(config.publish_max_secs),
            ),
        )
    }

    /// Publish `envelope` tagged with `correlation_id`.
    ///
    /// Makes one attempt plus up to `max_retries` retries. Serialization
    /// failures are returned immediately.
    pub async fn publish(
        &self,
        correlation_id: &str,
        envelope: &ResponseEnvelope,
    ) -> Result<(), BrokerError> {
        let body = serde_json::to_string(envelope)?;
        let message = OutboundMessage::response(correlation_id, body);
        let attempts = self.max_retries + 1;
        let mut last_error = String::new();

        for attempt in 0..attempts {
            if attempt > 0 {
                let delay = self.backoff.delay(attempt - 1);
                debug!(correlation_id = %correlation_id, delay_ms = delay.as_millis() as u64, "Retrying publish");
                tokio::time::sleep(delay).await;
            }

            match self.try_publish(&message).await {
                Ok(entry_id) => {
                    counter!("responses_published_total", "kind" => envelope.kind()).increment(1);
                    debug!(
                        correlation_id = %correlation_id,
                        entry_id = %entry_id,
                        kind = envelope.kind(),
                        "Response published"
                    );
                    return Ok(());
                }
                Err(e) => {
                    warn!(
                        correlation_id = %correlation_id,
                        attempt = attempt + 1,
                        error = %e,
                        "Failed to publish response"
                    );
                    last_error = e.to_string();
                    if matches!(e, BrokerError::Closed) {
                        break;
                    }
                }
            }
        }

        counter!("responses_publish_failed_total").increment(1);
        error!(correlation_id = %correlation_id, "Giving up on response publish");
        Err(BrokerError::Unavailable {
            attempts,
            last_error,
        })
    }

    async fn try_publish(&self, message: &OutboundMessage) -> Result<String, BrokerError> {
        let channel = self.connection.get_channel().await?;
        match channel.publish(message).await {
            Ok(entry_id) => Ok(entry_id),
            Err(e) => {
                if e.is_stream_lost() {
                    self.connection.invalidate(&channel).await;
                }
                Err(e)
            }
        }
    }

    /// Single best-effort write to the progress stream.
    pub async fn publish_progress(&self, client_id: &str, event: &str, data: &serde_json::Value) {
        let message = OutboundMessage::progress(client_id, event, data.to_string());
        if let Err(e) = self.try_publish(&message).await {
            debug!(client_id = %client_id, event = %event, error = %e, "Dropped progress event");
        }
    }
}
