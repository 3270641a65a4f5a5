//! Chunked, concurrent classification of one job's images.

use futures::stream::{self, StreamExt};
use metrics::counter;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::classification::ClassificationService;
use super::classifier::ClassifyError;
use super::image_probe::ImageProbe;
use super::storage::{ImageStore, StoreError};
use crate::config::AppConfig;
use crate::models::job::{Identifier, ImageRef, Operation};
use crate::models::label::{LabelToIds, NONE_LABEL};

/// Hard upper bound on images per provider call.
pub const MAX_CHUNK_SIZE: usize = 10;

/// Failed chunks log at most this many URLs.
const LOGGED_URLS: usize = 3;

#[derive(Debug, Clone, Copy)]
pub struct BatchSettings {
    pub chunk_size: usize,
    pub max_concurrent_chunks: usize,
    pub probe_concurrency: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            chunk_size: 8,
            max_concurrent_chunks: 10,
            probe_concurrency: 16,
        }
    }
}

impl BatchSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        if config.chunk_size > MAX_CHUNK_SIZE {
            tracing::warn!(
                chunk_size = config.chunk_size,
                max = MAX_CHUNK_SIZE,
                "Configured chunk size exceeds the maximum, clamping"
            );
        }
        Self {
            chunk_size: config.chunk_size.clamp(1, MAX_CHUNK_SIZE),
            max_concurrent_chunks: config.max_concurrent_chunks.max(1),
            probe_concurrency: config.probe_concurrency.max(1),
        }
    }
}

/// Chunking recommendation for a batch of a given size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessingPlan {
    pub total_images: usize,
    pub chunk_size: usize,
    pub estimated_chunks: usize,
    pub recommended_concurrency: usize,
}

#[derive(Debug, thiserror::Error)]
enum ChunkError {
    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Expected {expected} labels, got {actual}")]
    LabelCount { expected: usize, actual: usize },
}

/// Splits a job into chunks, classifies them concurrently and folds the
/// results into one [`LabelToIds`]. A failing chunk degrades to `NONE`.
#[derive(Clone)]
pub struct BatchProcessor {
    classifier: Arc<ClassificationService>,
    probe: Arc<dyn ImageProbe>,
    store: Arc<dyn ImageStore>,
    settings: BatchSettings,
}

impl BatchProcessor {
    pub fn new(
        classifier: Arc<ClassificationService>,
        probe: Arc<dyn ImageProbe>,
        store: Arc<dyn ImageStore>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            classifier,
            probe,
            store,
            settings,
        }
    }

    pub fn classifier(&self) -> &ClassificationService {
        &self.classifier
    }

    /// Adaptive chunk size: small jobs use tiny chunks, large jobs the maximum.
    pub fn chunk_size(&self, total_images: usize) -> usize {
        let default = self.settings.chunk_size.clamp(1, MAX_CHUNK_SIZE);
        match total_images {
            0 => 1,
            1..=5 => total_images.min(3),
            6..=15 => default.min(total_images),
            _ => MAX_CHUNK_SIZE,
        }
    }

    pub fn processing_plan(&self, total_images: usize) -> ProcessingPlan {
        let chunk_size = self.chunk_size(total_images);
        let estimated_chunks = total_images.div_ceil(chunk_size);
        let cap = self.settings.max_concurrent_chunks;
        let recommended_concurrency = match estimated_chunks {
            0..=3 => estimated_chunks.min(3),
            4..=10 => cap.min(5),
            _ => cap.min(8),
        };
        ProcessingPlan {
            total_images,
            chunk_size,
            estimated_chunks,
            recommended_concurrency,
        }
    }

    /// Classify `images` into `categories`. Never fails: every image that
    /// passes the type probe ends up under exactly one label.
    pub async fn process_job(
        &self,
        images: &[ImageRef],
        categories: &[String],
        operation: Operation,
        workspace_id: &Identifier,
    ) -> LabelToIds {
        let started = Instant::now();
        let filtered = self.filter_images(images).await;
        let dropped = images.len() - filtered.len();
        if dropped > 0 {
            counter!("classify_images_filtered_total").increment(dropped as u64);
        }

        let mut labels = LabelToIds::new();
        if filtered.is_empty() {
            info!(total = images.len(), "No classifiable images in job");
            return labels;
        }

        let plan = self.processing_plan(filtered.len());
        let chunks: Vec<Vec<ImageRef>> = filtered
            .chunks(plan.chunk_size)
            .map(<[_]>::to_vec)
            .collect();
        info!(
            images = plan.total_images,
            filtered_out = dropped,
            chunks = plan.estimated_chunks,
            chunk_size = plan.chunk_size,
            operation = %operation,
            "Processing classification job"
        );

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_chunks.max(1)));
        let categories: Arc<[String]> = categories.into();
        let mut unsettled: Vec<Option<Vec<ImageRef>>> = Vec::with_capacity(chunks.len());
        let mut tasks = JoinSet::new();

        for (index, chunk) in chunks.into_iter().enumerate() {
            unsettled.push(Some(chunk.clone()));
            let semaphore = semaphore.clone();
            let classifier = self.classifier.clone();
            let store = self.store.clone();
            let categories = categories.clone();
            let workspace_id = workspace_id.clone();

            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let result = classify_chunk(
                    &classifier,
                    store.as_ref(),
                    &chunk,
                    &categories,
                    operation,
                    &workspace_id,
                )
                .await;
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    let Some(chunk) = unsettled.get_mut(index).and_then(Option::take) else {
                        continue;
                    };
                    match result {
                        Ok(assignments) => {
                            for (label, id) in assignments {
                                labels.insert(&label, id);
                            }
                        }
                        Err(e) => degrade_chunk(&mut labels, &chunk, &e.to_string()),
                    }
                }
                Err(e) => error!(error = %e, "Chunk task aborted"),
            }
        }

        // Chunks whose task panicked never reported back.
        for chunk in unsettled.into_iter().flatten() {
            degrade_chunk(&mut labels, &chunk, "chunk task did not complete");
        }

        metrics::histogram!("classify_job_seconds").record(started.elapsed().as_secs_f64());
        info!(
            labeled = labels.total_ids(),
            labels = labels.groups().len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classification job complete"
        );
        labels
    }

    /// Keep only images whose URL probes as png/jpeg, preserving order.
    async fn filter_images(&self, images: &[ImageRef]) -> Vec<ImageRef> {
        let probe = self.probe.clone();
        stream::iter(images.iter().cloned())
            .map(|image| {
                let probe = probe.clone();
                async move {
                    let keep = probe.is_url_image(&image.url).await;
                    (image, keep)
                }
            })
            .buffered(self.settings.probe_concurrency.max(1))
            .filter_map(|(image, keep)| async move { keep.then_some(image) })
            .collect()
            .await
    }
}

async fn classify_chunk(
    classifier: &ClassificationService,
    store: &dyn ImageStore,
    chunk: &[ImageRef],
    categories: &[String],
    operation: Operation,
    workspace_id: &Identifier,
) -> Result<Vec<(String, Identifier)>, ChunkError> {
    let urls: Vec<String> = chunk.iter().map(|image| image.url.clone()).collect();
    let labels = classifier.classify_images(&urls, categories).await?;
    if labels.len() != chunk.len() {
        return Err(ChunkError::LabelCount {
            expected: chunk.len(),
            actual: labels.len(),
        });
    }

    let mut assignments = Vec::with_capacity(chunk.len());
    for (image, label) in chunk.iter().zip(labels) {
        if operation.persists_images() {
            store.save_image(image, &label, workspace_id).await?;
        }
        assignments.push((label, image.id.clone()));
    }
    Ok(assignments)
}

fn degrade_chunk(labels: &mut LabelToIds, chunk: &[ImageRef], reason: &str) {
    counter!("classify_chunks_failed_total").increment(1);
    let sample: Vec<&str> = chunk
        .iter()
        .take(LOGGED_URLS)
        .map(|image| image.url.as_str())
        .collect();
    error!(
        error = %reason,
        images = chunk.len(),
        sample_urls = ?sample,
        truncated = chunk.len() > LOGGED_URLS,
        "Chunk failed, labeling its images NONE"
    );
    for image in chunk {
        labels.insert(NONE_LABEL, image.id.clone());
    }
}
