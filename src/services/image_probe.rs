use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use std::time::Duration;

/// Media types accepted for classification.
pub const ACCEPTED_MEDIA_TYPES: [&str; 3] = ["image/png", "image/jpeg", "image/jpg"];

/// Cheap check that a URL points at a supported image.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageProbe: Send + Sync {
    async fn is_url_image(&self, url: &str) -> bool;
}

/// Probes with a HEAD request and inspects the `Content-Type` header.
pub struct HttpImageProbe {
    http: Client,
}

impl HttpImageProbe {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ImageProbe for HttpImageProbe {
    async fn is_url_image(&self, url: &str) -> bool {
        let response = match self.http.head(url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(url = %url, error = %e, "Image probe failed");
                return false;
            }
        };

        if !response.status().is_success() {
            return false;
        }

        response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .is_some_and(is_accepted_media_type)
    }
}

/// Whether a `Content-Type` value names an accepted image type. Parameters
/// such as `; charset=` are ignored.
pub fn is_accepted_media_type(content_type: &str) -> bool {
    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    ACCEPTED_MEDIA_TYPES.contains(&media_type.as_str())
}
