use std::time;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

/// Reserved category applied when classification fails. Canonical records
/// always carry a category; this is the floor.
pub const FALLBACK_CATEGORY: &str = "UNCATEGORIZED";

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub category: String,
    pub confidence: f64,
}

impl Classification {
    pub fn fallback() -> Self {
        Self {
            category: FALLBACK_CATEGORY.to_owned(),
            confidence: 0.0,
        }
    }
}

/// Enumeration of errors from the scoring service. None of these fail a
/// message: the pipeline recovers with `Classification::fallback`.
#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("classifier request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("classifier returned an unusable response: {0}")]
    InvalidResponse(String),
}

/// Capability interface over the pre-trained scoring model. The model is
/// pinned and served externally; swapping implementations must not touch
/// the pipeline.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError>;
}

#[derive(Debug, Deserialize)]
struct ScoreResponse {
    category: String,
    confidence: f64,
}

/// Classifier calling an external scoring service over HTTP.
pub struct HttpClassifier {
    client: reqwest::Client,
    url: String,
}

impl HttpClassifier {
    /// The timeout bounds the whole request: classification latency must
    /// never stall a worker indefinitely.
    pub fn new(url: &str, timeout: time::Duration) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("news-consumer")
            .timeout(timeout)
            .build()
            .expect("failed to construct reqwest client for classifier");

        Self {
            client,
            url: url.to_owned(),
        }
    }
}

#[async_trait]
impl Classifier for HttpClassifier {
    async fn classify(&self, text: &str) -> Result<Classification, ClassifierError> {
        let response = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?
            .error_for_status()?;

        let scored: ScoreResponse = response.json().await?;
        if scored.category.trim().is_empty() {
            return Err(ClassifierError::InvalidResponse(
                "empty category".to_owned(),
            ));
        }

        Ok(Classification {
            category: scored.category,
            confidence: scored.confidence.clamp(0.0, 1.0),
        })
    }
}
