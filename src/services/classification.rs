use metrics::counter;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

use super::classifier::{ClassificationClient, ClassifyError};
use super::providers::ProviderSelector;

/// Classification with ordered provider fallback.
pub struct ClassificationService {
    client: Arc<dyn ClassificationClient>,
    selector: ProviderSelector,
    fallbacks: AtomicU64,
}

impl ClassificationService {
    pub fn new(client: Arc<dyn ClassificationClient>, selector: ProviderSelector) -> Self {
        Self {
            client,
            selector,
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Try each configured provider in priority order; the first success wins.
    pub async fn classify_images(
        &self,
        images: &[String],
        categories: &[String],
    ) -> Result<Vec<String>, ClassifyError> {
        let configs = self.selector.available_configs();
        if configs.is_empty() {
            return Err(ClassifyError::NoProviders);
        }

        let mut last_error = String::new();
        for (position, config) in configs.iter().enumerate() {
            match self.client.classify(images, categories, config).await {
                Ok(labels) => {
                    debug!(provider = %config.kind, images = images.len(), "Classification succeeded");
                    return Ok(labels);
                }
                Err(e) => {
                    warn!(
                        provider = %config.kind,
                        model = %config.model,
                        error = %e,
                        "Provider failed"
                    );
                    last_error = e.to_string();
                    if position + 1 < configs.len() {
                        self.fallbacks.fetch_add(1, Ordering::Relaxed);
                        counter!("provider_fallbacks_total", "from" => config.kind.as_ref().to_string())
                            .increment(1);
                    }
                }
            }
        }

        Err(ClassifyError::AllProvidersFailed {
            attempted: configs.len(),
            last_error,
        })
    }

    /// Number of times a later provider was tried after an earlier one failed.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    pub fn provider_count(&self) -> usize {
        self.selector.available_configs().len()
    }
}

#[cfg(test)]
mod tests {
    use super::super::classifier::MockClassificationClient;
    use super::super::providers::{ProviderConfig, ProviderKind};
    use super::*;

    fn provider(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            kind,
            model: format!("{kind}-model"),
            api_key: "key".to_string(),
            base_url: "http://localhost".to_string(),
        }
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_falls_back_to_second_provider() {
        let mut client = MockClassificationClient::new();
        client
            .expect_classify()
            .withf(|_, _, config| config.kind == ProviderKind::OpenRouter)
            .times(1)
            .returning(|_, _, _| {
                Err(ClassifyError::Status {
                    provider: "openrouter".into(),
                    status: 500,
                    body: "boom".into(),
                })
            });
        client
            .expect_classify()
            .withf(|_, _, config| config.kind == ProviderKind::OpenAi)
            .times(1)
            .returning(|_, _, _| Ok(vec!["cat".to_string()]));

        let service = ClassificationService::new(
            Arc::new(client),
            ProviderSelector::new(vec![provider(ProviderKind::OpenRouter), provider(ProviderKind::OpenAi)]),
        );

        let labels = service
            .classify_images(&strings(&["http://x/1.png"]), &strings(&["cat", "dog"]))
            .await
            .unwrap();
        assert_eq!(labels, vec!["cat"]);
        assert_eq!(service.fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_first_success_stops_iteration() {
        let mut client = MockClassificationClient::new();
        client
            .expect_classify()
            .times(1)
            .returning(|images, _, _| Ok(vec!["dog".to_string(); images.len()]));

        let service = ClassificationService::new(
            Arc::new(client),
            ProviderSelector::new(vec![provider(ProviderKind::Gemini), provider(ProviderKind::Anthropic)]),
        );
        let labels = service
            .classify_images(&strings(&["a", "b"]), &strings(&["dog"]))
            .await
            .unwrap();
        assert_eq!(labels, vec!["dog", "dog"]);
        assert_eq!(service.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_all_providers_failing() {
        let mut client = MockClassificationClient::new();
        client.expect_classify().times(2).returning(|_, _, config| {
            Err(ClassifyError::Request {
                provider: config.kind.to_string(),
                message: "timeout".into(),
            })
        });

        let service = ClassificationService::new(
            Arc::new(client),
            ProviderSelector::new(vec![provider(ProviderKind::OpenAi), provider(ProviderKind::Anthropic)]),
        );
        let err = service
            .classify_images(&strings(&["a"]), &strings(&["cat"]))
            .await
            .unwrap_err();

        match err {
            ClassifyError::AllProvidersFailed { attempted, last_error } => {
                assert_eq!(attempted, 2);
                assert!(last_error.contains("anthropic"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(service.fallback_count(), 1);
    }

    #[tokio::test]
    async fn test_no_providers() {
        let client = MockClassificationClient::new();
        let service = ClassificationService::new(Arc::new(client), ProviderSelector::default());
        let err = service
            .classify_images(&strings(&["a"]), &strings(&["cat"]))
            .await
            .unwrap_err();
        assert_eq!(err, ClassifyError::NoProviders);
    }
}
