use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use super::connection::ConnectionManager;
use super::publisher::ResponsePublisher;
use super::{BrokerError, Delivery, QueueKind};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::jobs::JobRunner;
use crate::models::envelope::ResponseEnvelope;
use crate::models::job::Job;

/// What to do with a delivery once it has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    /// Leave it pending so it is delivered again.
    Requeue,
}

/// Reads the inbound streams and turns every entry into exactly one response.
pub struct Consumer {
    connection: Arc<ConnectionManager>,
    publisher: Arc<ResponsePublisher>,
    runner: Arc<JobRunner>,
    poll_block: Duration,
    error_pause: Duration,
}

impl Consumer {
    pub fn new(
        connection: Arc<ConnectionManager>,
        publisher: Arc<ResponsePublisher>,
        runner: Arc<JobRunner>,
        poll_block: Duration,
    ) -> Self {
        Self {
            connection,
            publisher,
            runner,
            poll_block,
            error_pause: Duration::from_secs(1),
        }
    }

    pub fn from_config(
        connection: Arc<ConnectionManager>,
        publisher: Arc<ResponsePublisher>,
        runner: Arc<JobRunner>,
        config: &AppConfig,
    ) -> Self {
        Self::new(
            connection,
            publisher,
            runner,
            Duration::from_millis(config.poll_block_ms),
        )
    }

    /// Pause after a failed poll before trying again.
    pub fn with_error_pause(mut self, pause: Duration) -> Self {
        self.error_pause = pause;
        self
    }

    /// Consume until `shutdown` flips to true (or its sender goes away).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Consumer started");
        loop {
            let stop = *shutdown.borrow();
            if stop {
                break;
            }
            match self.poll_once().await {
                Ok(0) => trace!("No deliveries"),
                Ok(n) => debug!(deliveries = n, "Processed deliveries"),
                Err(e) => {
                    error!(error = %e, "Consumer iteration failed, will retry");
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() {
                                break;
                            }
                        }
                        _ = tokio::time::sleep(self.error_pause) => {}
                    }
                }
            }
        }
        info!("Consumer stopped");
    }

    /// One fetch-dispatch-settle round. Returns how many entries were handled.
    pub async fn poll_once(&self) -> Result<usize, BrokerError> {
        let channel = self.connection.get_channel().await?;
        let deliveries = match channel.fetch(self.poll_block).await {
            Ok(deliveries) => deliveries,
            Err(e) => {
                if e.is_stream_lost() {
                    self.connection.invalidate(&channel).await;
                }
                return Err(e);
            }
        };

        let count = deliveries.len();
        for delivery in deliveries {
            let settlement = self.dispatch(&delivery).await;
            self.settle(&delivery, settlement).await?;
        }
        Ok(count)
    }

    /// Handle one delivery and publish its response.
    ///
    /// Handler failures are answered with an error envelope and acked; only a
    /// response that could not be published leaves the entry pending.
    pub async fn dispatch(&self, delivery: &Delivery) -> Settlement {
        let started = Instant::now();
        debug!(
            queue = %delivery.queue,
            entry_id = %delivery.entry_id,
            correlation_id = %delivery.correlation_id,
            "Dispatching delivery"
        );

        let (job, envelope) = match self.decode_job(delivery) {
            Ok(job) => {
                debug!(
                    correlation_id = %delivery.correlation_id,
                    operation = %job.operation(),
                    "Running job"
                );
                match self.runner.run(&job).await {
                    Ok(envelope) => (Some(job), envelope),
                    Err(e) => (Some(job), self.failure(delivery, e)),
                }
            }
            Err(e) => (None, self.failure(delivery, e)),
        };

        let (settlement, outcome) = match self
            .publisher
            .publish(&delivery.correlation_id, &envelope)
            .await
        {
            Ok(()) => {
                if let (Some(Job::Export(job)), ResponseEnvelope::Exported { exported_path, .. }) =
                    (&job, &envelope)
                {
                    self.runner.notify_export_complete(job, exported_path).await;
                }
                let outcome = if envelope.is_error() { "failed" } else { "ok" };
                (Settlement::Ack, outcome)
            }
            Err(BrokerError::Serialize(e)) => {
                error!(correlation_id = %delivery.correlation_id, error = %e, "Response is not serializable, dropping");
                (Settlement::Ack, "dropped")
            }
            Err(e) => {
                error!(
                    correlation_id = %delivery.correlation_id,
                    error = %e,
                    "Response not delivered, leaving entry for redelivery"
                );
                (Settlement::Requeue, "requeued")
            }
        };

        let queue = delivery.queue.to_string();
        counter!("broker_messages_total", "queue" => queue.clone(), "outcome" => outcome)
            .increment(1);
        histogram!("job_processing_seconds", "queue" => queue)
            .record(started.elapsed().as_secs_f64());
        settlement
    }

    fn failure(&self, delivery: &Delivery, error: AppError) -> ResponseEnvelope {
        warn!(
            queue = %delivery.queue,
            correlation_id = %delivery.correlation_id,
            code = error.code(),
            error = %error,
            "Job failed"
        );
        ResponseEnvelope::Failed {
            error: error.to_error_body(Some(delivery.correlation_id.clone())),
        }
    }

    fn decode_job(&self, delivery: &Delivery) -> Result<Job, AppError> {
        let value = decode_body(&delivery.body)?;
        let defaults = self.runner.defaults();
        Ok(match delivery.queue {
            QueueKind::Classify => Job::Classify(payload(value)?),
            QueueKind::Train => Job::Train(defaults.train_job(payload(value)?)?),
            QueueKind::Export => Job::Export(defaults.export_job(payload(value)?)?),
        })
    }

    async fn settle(&self, delivery: &Delivery, settlement: Settlement) -> Result<(), BrokerError> {
        let channel = self.connection.get_channel().await?;
        let result = match settlement {
            Settlement::Ack => channel.ack(delivery).await,
            Settlement::Requeue => channel.nack(delivery, true).await,
        };
        if let Err(e) = &result {
            if e.is_stream_lost() {
                self.connection.invalidate(&channel).await;
            }
        }
        result
    }
}

/// Parse an entry body into a JSON object.
///
/// Producers double-encode (a JSON string holding the object); a bare object
/// is accepted as well.
pub fn decode_body(body: &str) -> Result<Value, AppError> {
    let value = match serde_json::from_str::<Value>(body)? {
        Value::String(inner) => serde_json::from_str::<Value>(&inner)?,
        other => other,
    };
    if !value.is_object() {
        return Err(AppError::JsonDecode("expected a JSON object".to_string()));
    }
    Ok(value)
}

/// Well-formed JSON with the wrong shape is a processing error, not a decode error.
fn payload<T: DeserializeOwned>(value: Value) -> Result<T, AppError> {
    serde_json::from_value(value).map_err(|e| AppError::MessageProcessing(e.to_string()))
}
