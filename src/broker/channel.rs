//! Redis Streams implementation of the broker traits.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::RedisResult;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{BrokerChannel, BrokerError, Connector, Delivery, OutboundMessage, QueueKind, Topology};

/// XREADGROUP reply. Field lists are nil for pending entries trimmed from the stream.
type StreamReply = Option<Vec<(String, Vec<(String, Option<Vec<(String, String)>>)>)>>;

/// Entries taken over from dead consumers per stream on each declare.
const CLAIM_BATCH: usize = 10;

pub struct RedisConnector {
    client: redis::Client,
    topology: Arc<Topology>,
}

impl RedisConnector {
    pub fn new(redis_url: &str, topology: Arc<Topology>) -> Result<Self, BrokerError> {
        let client = redis::Client::open(redis_url)?;
        Ok(Self { client, topology })
    }
}

#[async_trait]
impl Connector for RedisConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        let conn = self.client.get_multiplexed_async_connection().await?;
        debug!(consumer = %self.topology.consumer_name, "Opened Redis connection");
        Ok(Arc::new(RedisChannel {
            conn,
            topology: self.topology.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

pub struct RedisChannel {
    conn: MultiplexedConnection,
    topology: Arc<Topology>,
    closed: AtomicBool,
}

impl RedisChannel {
    fn conn(&self) -> Result<MultiplexedConnection, BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::ConnectionLost("channel closed".to_string()));
        }
        Ok(self.conn.clone())
    }

    async fn ensure_group(&self, stream: &str, group: &str, start: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let result: RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg(start)
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %stream, group = %group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Move long-idle pending entries of other consumers onto this one.
    async fn claim_abandoned(&self, stream: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let _: redis::Value = redis::cmd("XAUTOCLAIM")
            .arg(stream)
            .arg(&self.topology.consumer_group)
            .arg(&self.topology.consumer_name)
            .arg(self.topology.claim_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(CLAIM_BATCH)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn read(&self, ids: &str, block: Option<Duration>) -> Result<Vec<Delivery>, BrokerError> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(&self.topology.consumer_group)
            .arg(&self.topology.consumer_name);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("COUNT").arg(1).arg("STREAMS");
        for queue in QueueKind::ALL {
            cmd.arg(self.topology.stream_for(queue));
        }
        for _ in QueueKind::ALL {
            cmd.arg(ids);
        }

        let reply: StreamReply = cmd.query_async(&mut conn).await?;
        let mut deliveries = Vec::new();

        for (stream, entries) in reply.unwrap_or_default() {
            let Some(queue) = self.topology.queue_for(&stream) else {
                continue;
            };
            for (entry_id, fields) in entries {
                match fields {
                    Some(fields) => deliveries.push(to_delivery(queue, entry_id, fields)),
                    None => {
                        warn!(stream = %stream, entry_id = %entry_id, "Pending entry was trimmed, dropping");
                        self.xack(&stream, &entry_id).await?;
                    }
                }
            }
        }
        Ok(deliveries)
    }

    async fn xack(&self, stream: &str, entry_id: &str) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(&self.topology.consumer_group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }
}

fn to_delivery(queue: QueueKind, entry_id: String, fields: Vec<(String, String)>) -> Delivery {
    let mut body = String::new();
    let mut correlation_id = None;
    for (name, value) in fields {
        match name.as_str() {
            "body" => body = value,
            "correlation_id" if !value.is_empty() => correlation_id = Some(value),
            _ => {}
        }
    }
    Delivery {
        queue,
        correlation_id: correlation_id.unwrap_or_else(|| entry_id.clone()),
        entry_id,
        body,
    }
}

#[async_trait]
impl BrokerChannel for RedisChannel {
    async fn declare(&self) -> Result<(), BrokerError> {
        let topo = &self.topology;
        for queue in QueueKind::ALL {
            self.ensure_group(topo.stream_for(queue), &topo.consumer_group, "0")
                .await?;
        }
        self.ensure_group(&topo.response_stream, &topo.response_group, "$")
            .await?;
        self.ensure_group(&topo.progress_stream, &topo.progress_group, "$")
            .await?;

        for queue in QueueKind::ALL {
            if let Err(e) = self.claim_abandoned(topo.stream_for(queue)).await {
                warn!(queue = %queue, error = %e, "Failed to claim abandoned entries");
            }
        }
        Ok(())
    }

    async fn fetch(&self, block: Duration) -> Result<Vec<Delivery>, BrokerError> {
        // Redeliveries first: anything still pending for this consumer.
        let pending = self.read("0", None).await?;
        if !pending.is_empty() {
            return Ok(pending);
        }
        self.read(">", Some(block)).await
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.xack(self.topology.stream_for(delivery.queue), &delivery.entry_id)
            .await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        if requeue {
            debug!(entry_id = %delivery.entry_id, "Leaving entry pending for redelivery");
            return Ok(());
        }
        self.ack(delivery).await
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<String, BrokerError> {
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(self.topology.target_stream(message.target))
            .arg("MAXLEN")
            .arg("~")
            .arg(self.topology.max_len)
            .arg("*");
        for (name, value) in &message.fields {
            cmd.arg(name).arg(value);
        }
        let entry_id: String = cmd.query_async(&mut conn).await?;
        Ok(entry_id)
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        let mut conn = self.conn()?;
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_uses_correlation_field() {
        let d = to_delivery(
            QueueKind::Classify,
            "1-0".into(),
            vec![
                ("correlation_id".into(), "corr".into()),
                ("body".into(), "{}".into()),
            ],
        );
        assert_eq!(d.correlation_id, "corr");
        assert_eq!(d.body, "{}");
    }

    #[test]
    fn test_delivery_falls_back_to_entry_id() {
        let d = to_delivery(QueueKind::Train, "5-1".into(), vec![("body".into(), "x".into())]);
        assert_eq!(d.correlation_id, "5-1");
        assert_eq!(d.queue, QueueKind::Train);
    }
}
