//! In-memory broker and scripted collaborators shared by the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use classify_gateway::broker::connection::ConnectionManager;
use classify_gateway::broker::consumer::Consumer;
use classify_gateway::broker::publisher::ResponsePublisher;
use classify_gateway::broker::resilience::{Backoff, CircuitBreakerConfig, ReconnectPolicy};
use classify_gateway::broker::{
    BrokerChannel, BrokerError, Connector, Delivery, OutboundMessage, QueueKind, Target,
};
use classify_gateway::jobs::{JobDefaults, JobRunner};
use classify_gateway::models::envelope::TrainResult;
use classify_gateway::models::job::{Identifier, ImageRef, TrainJob};
use classify_gateway::services::batch::{BatchProcessor, BatchSettings};
use classify_gateway::services::classification::ClassificationService;
use classify_gateway::services::classifier::{ClassificationClient, ClassifyError};
use classify_gateway::services::events::EventHub;
use classify_gateway::services::image_probe::ImageProbe;
use classify_gateway::services::providers::{ProviderConfig, ProviderKind, ProviderSelector};
use classify_gateway::services::storage::{ImageStore, StoreError};
use classify_gateway::services::trainer::{Trainer, TrainerError};

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemoryBroker {
    queued: Mutex<VecDeque<Delivery>>,
    published: Mutex<Vec<OutboundMessage>>,
    acked: Mutex<Vec<String>>,
    requeued: Mutex<Vec<String>>,
    publish_failures: AtomicU32,
    connect_failures: AtomicU32,
    connects: AtomicU32,
    next_id: AtomicU32,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Enqueue an entry; returns its entry id.
    pub fn push(&self, queue: QueueKind, correlation_id: &str, body: &str) -> String {
        let entry_id = format!("{}-0", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.queued.lock().unwrap().push_back(Delivery {
            queue,
            entry_id: entry_id.clone(),
            correlation_id: correlation_id.to_string(),
            body: body.to_string(),
        });
        entry_id
    }

    /// Enqueue `payload` double-encoded, the way producers send it.
    pub fn push_json(&self, queue: QueueKind, correlation_id: &str, payload: &Value) -> String {
        let body = serde_json::to_string(&payload.to_string()).unwrap();
        self.push(queue, correlation_id, &body)
    }

    pub fn fail_next_publishes(&self, n: u32) {
        self.publish_failures.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_connects(&self, n: u32) {
        self.connect_failures.store(n, Ordering::SeqCst);
    }

    pub fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn queued_len(&self) -> usize {
        self.queued.lock().unwrap().len()
    }

    pub fn acked(&self) -> Vec<String> {
        self.acked.lock().unwrap().clone()
    }

    pub fn requeued(&self) -> Vec<String> {
        self.requeued.lock().unwrap().clone()
    }

    /// `(correlation_id, parsed body)` of every published response.
    pub fn responses(&self) -> Vec<(String, Value)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.target == Target::Responses)
            .map(|m| {
                let correlation_id = m.field("correlation_id").unwrap_or_default().to_string();
                let body = serde_json::from_str(m.field("body").unwrap_or("null")).unwrap();
                (correlation_id, body)
            })
            .collect()
    }

    /// `(client_id, event, parsed body)` of every progress entry.
    pub fn progress(&self) -> Vec<(String, String, Value)> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.target == Target::Progress)
            .map(|m| {
                (
                    m.field("client_id").unwrap_or_default().to_string(),
                    m.field("event").unwrap_or_default().to_string(),
                    serde_json::from_str(m.field("body").unwrap_or("null")).unwrap(),
                )
            })
            .collect()
    }
}

/// Consumes one unit from `counter` if it is positive.
fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct MemoryChannel {
    broker: Arc<MemoryBroker>,
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn fetch(&self, block: Duration) -> Result<Vec<Delivery>, BrokerError> {
        let next = self.broker.queued.lock().unwrap().pop_front();
        match next {
            Some(delivery) => Ok(vec![delivery]),
            None => {
                tokio::time::sleep(block.min(Duration::from_millis(10))).await;
                Ok(Vec::new())
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), BrokerError> {
        self.broker
            .acked
            .lock()
            .unwrap()
            .push(delivery.entry_id.clone());
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<(), BrokerError> {
        if !requeue {
            return self.ack(delivery).await;
        }
        self.broker
            .requeued
            .lock()
            .unwrap()
            .push(delivery.entry_id.clone());
        self.broker
            .queued
            .lock()
            .unwrap()
            .push_back(delivery.clone());
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<String, BrokerError> {
        if take_failure(&self.broker.publish_failures) {
            return Err(BrokerError::ConnectionLost("injected publish failure".into()));
        }
        let mut published = self.broker.published.lock().unwrap();
        published.push(message.clone());
        Ok(format!("{}-0", published.len()))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }

    async fn close(&self) {}
}

pub struct MemoryConnector(pub Arc<MemoryBroker>);

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        if take_failure(&self.0.connect_failures) {
            return Err(BrokerError::ConnectionLost("injected connect failure".into()));
        }
        self.0.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryChannel {
            broker: self.0.clone(),
        }))
    }
}

pub fn fast_backoff() -> Backoff {
    Backoff::new(Duration::from_millis(1), Duration::from_millis(2))
}

pub fn connection(broker: &Arc<MemoryBroker>) -> Arc<ConnectionManager> {
    Arc::new(ConnectionManager::new(
        Arc::new(MemoryConnector(broker.clone())),
        ReconnectPolicy {
            backoff: fast_backoff(),
            max_attempts: 2,
        },
        CircuitBreakerConfig::default(),
    ))
}

pub fn publisher(connection: &Arc<ConnectionManager>, max_retries: u32) -> Arc<ResponsePublisher> {
    Arc::new(ResponsePublisher::new(
        connection.clone(),
        max_retries,
        fast_backoff(),
    ))
}

// ---------------------------------------------------------------------------
// Collaborators
// ---------------------------------------------------------------------------

/// Labels an image with the first category its URL mentions, else NONE.
/// Providers listed in `failing` always error.
#[derive(Default)]
pub struct ScriptedClient {
    pub failing: Vec<ProviderKind>,
    calls: Mutex<Vec<(ProviderKind, usize)>>,
}

impl ScriptedClient {
    pub fn failing(kinds: &[ProviderKind]) -> Self {
        Self {
            failing: kinds.to_vec(),
            ..Self::default()
        }
    }

    /// `(provider, images in the call)` for every call made.
    pub fn calls(&self) -> Vec<(ProviderKind, usize)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ClassificationClient for ScriptedClient {
    async fn classify(
        &self,
        images: &[String],
        categories: &[String],
        config: &ProviderConfig,
    ) -> Result<Vec<String>, ClassifyError> {
        self.calls.lock().unwrap().push((config.kind, images.len()));
        if self.failing.contains(&config.kind) {
            return Err(ClassifyError::Status {
                provider: config.kind.to_string(),
                status: 500,
                body: "scripted failure".into(),
            });
        }
        Ok(images
            .iter()
            .map(|url| {
                categories
                    .iter()
                    .find(|c| url.contains(c.as_str()))
                    .cloned()
                    .unwrap_or_else(|| "NONE".to_string())
            })
            .collect())
    }
}

/// Accepts `.png`/`.jpg`/`.jpeg` URLs.
pub struct ExtensionProbe;

#[async_trait]
impl ImageProbe for ExtensionProbe {
    async fn is_url_image(&self, url: &str) -> bool {
        [".png", ".jpg", ".jpeg"].iter().any(|ext| url.ends_with(ext))
    }
}

/// Records saves in memory; URLs containing "broken" fail to download.
#[derive(Default)]
pub struct RecordingStore {
    saved: Mutex<Vec<(Identifier, String)>>,
}

impl RecordingStore {
    pub fn saved(&self) -> Vec<(Identifier, String)> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl ImageStore for RecordingStore {
    async fn save_image(
        &self,
        image: &ImageRef,
        label: &str,
        workspace_id: &Identifier,
    ) -> Result<PathBuf, StoreError> {
        if image.url.contains("broken") {
            return Err(StoreError::Download(format!("{} returned HTTP 404", image.url)));
        }
        self.saved
            .lock()
            .unwrap()
            .push((image.id.clone(), label.to_string()));
        Ok(PathBuf::from(format!("workspace/{workspace_id}/{label}/{}", image.file_stem())))
    }
}

/// Emits two progress reports per training run. Workspace "missing" has no
/// data; exports for workspace "untrained" find no model.
pub struct FakeTrainer;

#[async_trait]
impl Trainer for FakeTrainer {
    async fn train(
        &self,
        job: &TrainJob,
        progress: mpsc::UnboundedSender<Value>,
    ) -> Result<TrainResult, TrainerError> {
        if job.workspace_id.to_string() == "missing" {
            return Err(TrainerError::WorkspaceNotFound("missing".into()));
        }
        let _ = progress.send(json!({"epoch": 1, "epochs": job.epochs}));
        let _ = progress.send(json!({"status": "completed", "metrics": {"map50": 0.9}}));
        Ok(TrainResult {
            model_path: format!("models/model_{}_20250101_000000.pt", job.workspace_id),
            version: "20250101_000000".into(),
            metrics: json!({"map50": 0.9}),
        })
    }

    async fn export_model(
        &self,
        workspace_id: &Identifier,
        version: Option<String>,
        format: &str,
    ) -> Result<String, TrainerError> {
        if workspace_id.to_string() == "untrained" {
            return Err(TrainerError::ModelNotFound {
                workspace: workspace_id.to_string(),
                version,
            });
        }
        let version = version.unwrap_or_else(|| "20250101_000000".into());
        Ok(format!(
            "models/exported_{workspace_id}_{version}.{}",
            format.to_ascii_lowercase()
        ))
    }
}

pub fn provider(kind: ProviderKind) -> ProviderConfig {
    ProviderConfig {
        kind,
        model: format!("{kind}-model"),
        api_key: "key".into(),
        base_url: "http://localhost".into(),
    }
}

pub fn image(id: i64, url: &str) -> ImageRef {
    ImageRef {
        id: Identifier::Num(id),
        url: url.to_string(),
        file_name: None,
    }
}

/// Everything a consumer test needs, wired to the in-memory broker.
pub struct Harness {
    pub broker: Arc<MemoryBroker>,
    pub connection: Arc<ConnectionManager>,
    pub publisher: Arc<ResponsePublisher>,
    pub client: Arc<ScriptedClient>,
    pub store: Arc<RecordingStore>,
    pub events: Arc<EventHub>,
    pub runner: Arc<JobRunner>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_client(ScriptedClient::default())
    }

    pub fn with_client(client: ScriptedClient) -> Self {
        let broker = MemoryBroker::new();
        let connection = connection(&broker);
        let publisher = publisher(&connection, 2);
        let client = Arc::new(client);
        let store = Arc::new(RecordingStore::default());
        let events = Arc::new(EventHub::new());

        let selector = ProviderSelector::new(vec![
            provider(ProviderKind::OpenRouter),
            provider(ProviderKind::Gemini),
        ]);
        let classifier = Arc::new(ClassificationService::new(client.clone(), selector));
        let batch = BatchProcessor::new(
            classifier,
            Arc::new(ExtensionProbe),
            store.clone(),
            BatchSettings::default(),
        );
        let runner = Arc::new(JobRunner::new(
            batch,
            Arc::new(FakeTrainer),
            events.clone(),
            publisher.clone(),
            JobDefaults::default(),
        ));

        Self {
            broker,
            connection,
            publisher,
            client,
            store,
            events,
            runner,
        }
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            self.connection.clone(),
            self.publisher.clone(),
            self.runner.clone(),
            Duration::from_millis(10),
        )
        .with_error_pause(Duration::from_millis(5))
    }
}
