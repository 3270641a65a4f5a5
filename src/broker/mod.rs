//! Message broker plumbing on top of Redis Streams.
//!
//! The consumer, publisher and connection manager only see the [`Connector`]
//! and [`BrokerChannel`] traits; [`channel`] holds the Redis implementation.

pub mod channel;
pub mod connection;
pub mod consumer;
pub mod publisher;
pub mod resilience;

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use strum::{AsRefStr, Display};

use crate::config::AppConfig;

/// Inbound work queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum QueueKind {
    Classify,
    Train,
    Export,
}

impl QueueKind {
    pub const ALL: [QueueKind; 3] = [QueueKind::Classify, QueueKind::Train, QueueKind::Export];
}

/// Stream and group names the gateway declares and reads.
#[derive(Debug, Clone)]
pub struct Topology {
    pub classify_stream: String,
    pub train_stream: String,
    pub export_stream: String,
    pub response_stream: String,
    pub progress_stream: String,
    pub consumer_group: String,
    pub response_group: String,
    pub progress_group: String,
    pub consumer_name: String,
    pub max_len: u64,
    pub claim_idle_ms: u64,
}

impl Topology {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            classify_stream: config.classify_stream.clone(),
            train_stream: config.train_stream.clone(),
            export_stream: config.export_stream.clone(),
            response_stream: config.response_stream.clone(),
            progress_stream: config.progress_stream.clone(),
            consumer_group: config.consumer_group.clone(),
            response_group: config.response_group.clone(),
            progress_group: config.progress_group.clone(),
            consumer_name: config
                .consumer_name
                .clone()
                .unwrap_or_else(|| format!("gateway-{}", uuid::Uuid::new_v4())),
            max_len: config.response_max_len,
            claim_idle_ms: config.claim_idle_ms,
        }
    }

    pub fn stream_for(&self, queue: QueueKind) -> &str {
        match queue {
            QueueKind::Classify => &self.classify_stream,
            QueueKind::Train => &self.train_stream,
            QueueKind::Export => &self.export_stream,
        }
    }

    pub fn queue_for(&self, stream: &str) -> Option<QueueKind> {
        QueueKind::ALL
            .into_iter()
            .find(|queue| self.stream_for(*queue) == stream)
    }

    pub fn target_stream(&self, target: Target) -> &str {
        match target {
            Target::Responses => &self.response_stream,
            Target::Progress => &self.progress_stream,
        }
    }
}

/// One unacknowledged entry handed to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub queue: QueueKind,
    pub entry_id: String,
    /// Caller's correlation id; the entry id when the caller sent none.
    pub correlation_id: String,
    pub body: String,
}

/// Outbound stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Target {
    Responses,
    Progress,
}

/// Entry to append to an outbound stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub target: Target,
    pub fields: Vec<(String, String)>,
}

impl OutboundMessage {
    pub fn response(correlation_id: &str, body: String) -> Self {
        Self {
            target: Target::Responses,
            fields: vec![
                ("correlation_id".to_string(), correlation_id.to_string()),
                ("body".to_string(), body),
            ],
        }
    }

    pub fn progress(client_id: &str, event: &str, body: String) -> Self {
        Self {
            target: Target::Progress,
            fields: vec![
                ("client_id".to_string(), client_id.to_string()),
                ("event".to_string(), event.to_string()),
                ("body".to_string(), body),
            ],
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// An open session with the broker.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotently create every stream and group, and take over abandoned entries.
    async fn declare(&self) -> Result<(), BrokerError>;

    /// Fetch at most one entry per inbound queue, waiting up to `block`.
    async fn fetch(&self, block: Duration) -> Result<Vec<Delivery>, BrokerError>;

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError>;

    /// Reject an entry. With `requeue` it stays pending and is delivered again.
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError>;

    /// Append a message; returns the new entry id.
    async fn publish(&self, message: &OutboundMessage) -> Result<String, BrokerError>;

    async fn ping(&self) -> Result<(), BrokerError>;

    async fn close(&self);
}

/// Opens broker channels.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Circuit breaker is open")]
    CircuitOpen,

    #[error("Broker connection failed after {attempts} attempts: {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Connection manager is closed")]
    Closed,

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Publish failed after {attempts} attempts: {last_error}")]
    Unavailable { attempts: u32, last_error: String },
}

impl BrokerError {
    /// Whether the underlying connection is gone and must be re-established.
    pub fn is_stream_lost(&self) -> bool {
        match self {
            BrokerError::Redis(e) => {
                e.is_connection_dropped()
                    || e.is_io_error()
                    || e.is_connection_refusal()
                    || e.is_timeout()
            }
            BrokerError::ConnectionLost(_) => true,
            _ => false,
        }
    }
}
