use std::sync::Arc;
use std::time::Duration;

use crate::broker::channel::RedisConnector;
use crate::broker::connection::ConnectionManager;
use crate::broker::consumer::Consumer;
use crate::broker::publisher::ResponsePublisher;
use crate::broker::{Connector, Topology};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::jobs::{JobDefaults, JobRunner};
use crate::services::{
    batch::{BatchProcessor, BatchSettings},
    classification::ClassificationService,
    classifier::HttpClassificationClient,
    events::EventHub,
    image_probe::HttpImageProbe,
    providers::ProviderSelector,
    storage::FsImageStore,
    trainer::ProcessTrainer,
};

/// Image HEAD probes should answer quickly; slow hosts count as "not an image".
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared application state passed to route handlers and the consumer.
#[derive(Clone)]
pub struct AppState {
    pub api_key: Arc<str>,
    pub connection: Arc<ConnectionManager>,
    pub publisher: Arc<ResponsePublisher>,
    pub runner: Arc<JobRunner>,
    poll_block: Duration,
}

impl AppState {
    pub fn new(
        api_key: &str,
        connection: Arc<ConnectionManager>,
        publisher: Arc<ResponsePublisher>,
        runner: Arc<JobRunner>,
        poll_block: Duration,
    ) -> Self {
        Self {
            api_key: api_key.into(),
            connection,
            publisher,
            runner,
            poll_block,
        }
    }

    /// Wire the production collaborators: Redis broker, HTTP providers,
    /// filesystem store and the external trainer command.
    pub fn build(config: &AppConfig) -> Result<Self, AppError> {
        let topology = Arc::new(Topology::from_config(config));
        let connector: Arc<dyn Connector> =
            Arc::new(RedisConnector::new(&config.redis_url, topology)?);
        let connection = Arc::new(ConnectionManager::from_config(connector, config));
        let publisher = Arc::new(ResponsePublisher::from_config(connection.clone(), config));

        let selector = ProviderSelector::from_config(config);
        if selector.available_configs().is_empty() {
            tracing::warn!("No AI provider API keys configured; classification will label everything NONE");
        }
        let client = HttpClassificationClient::new(config.provider_timeout())?;
        let classifier = Arc::new(ClassificationService::new(Arc::new(client), selector));

        let probe = HttpImageProbe::new(PROBE_TIMEOUT)
            .map_err(|e| AppError::Configuration(format!("image probe client: {e}")))?;
        let store = FsImageStore::new(&config.base_dir, config.provider_timeout())?;
        let batch = BatchProcessor::new(
            classifier,
            Arc::new(probe),
            Arc::new(store),
            BatchSettings::from_config(config),
        );

        let trainer = ProcessTrainer::new(&config.trainer_command, &config.base_dir);
        let runner = Arc::new(JobRunner::new(
            batch,
            Arc::new(trainer),
            Arc::new(EventHub::new()),
            publisher.clone(),
            JobDefaults::from_config(config),
        ));

        Ok(Self::new(
            &config.api_key,
            connection,
            publisher,
            runner,
            Duration::from_millis(config.poll_block_ms),
        ))
    }

    pub fn events(&self) -> &Arc<EventHub> {
        self.runner.events()
    }

    pub fn consumer(&self) -> Consumer {
        Consumer::new(
            self.connection.clone(),
            self.publisher.clone(),
            self.runner.clone(),
            self.poll_block,
        )
    }
}
