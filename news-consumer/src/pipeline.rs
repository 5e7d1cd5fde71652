use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use news_common::message::RawItem;
use news_common::retry::RetryPolicy;

use crate::classifier::{Classification, Classifier};
use crate::dedup::{self, DedupIndex, Fingerprint, Verdict};
use crate::error::PipelineError;
use crate::store::{ArticleStore, CanonicalArticle, UpsertOutcome};

/// Terminal outcome for one delivery. The worker maps these to broker
/// acknowledgments: `Persisted` and `Merged` ack, `DeadLettered` publishes
/// the original payload to the dead letter queue and then acks.
#[derive(Debug, PartialEq)]
pub enum Outcome {
    /// A distinct story was persisted, or a redelivery of one re-acked.
    Persisted { canonical_id: String },
    /// A near-duplicate was merged into an existing story.
    Merged { canonical_id: String },
    /// Permanent failure, or the retry budget ran out.
    DeadLettered { reason: String },
}

/// Sequences one message through validate → dedup → classify → persist,
/// applying the retry policy at the stages that can fail transiently.
pub struct Pipeline<S, C> {
    store: S,
    classifier: C,
    dedup: Arc<DedupIndex>,
    retry_policy: RetryPolicy,
}

impl<S: ArticleStore, C: Classifier> Pipeline<S, C> {
    pub fn new(store: S, classifier: C, dedup: Arc<DedupIndex>, retry_policy: RetryPolicy) -> Self {
        Self {
            store,
            classifier,
            dedup,
            retry_policy,
        }
    }

    /// Process one message body to a terminal outcome. Infallible by
    /// design: every failure maps to `DeadLettered` so the worker always
    /// has a disposition for the delivery.
    pub async fn process(&self, body: &[u8]) -> Outcome {
        let item = match RawItem::from_bytes(body) {
            Ok(item) => item,
            Err(error) => {
                warn!(error = %error, "rejecting malformed message");
                return Outcome::DeadLettered {
                    reason: error.to_string(),
                };
            }
        };

        let canonical_id = dedup::canonical_id(&item.link);
        let fingerprint = Fingerprint::of(&item);

        // Evaluate + reservation happen atomically inside the index; from
        // here on concurrent near-duplicates resolve to this canonical id.
        let verdict = self.dedup.evaluate(&canonical_id, &fingerprint);
        metrics::gauge!("news_dedup_window_entries").set(self.dedup.len() as f64);

        match verdict {
            Verdict::Duplicate {
                canonical_id: existing,
                score,
            } if existing == canonical_id => {
                // Same link, already in the window: a redelivery, not a
                // second source covering the story. Nothing to merge.
                info!(canonical_id = %existing, score, link = %item.link, "redelivered link, acking");
                Outcome::Persisted {
                    canonical_id: existing,
                }
            }
            Verdict::Duplicate {
                canonical_id: existing,
                score,
            } => self.merge(&item, existing, score).await,
            Verdict::New { .. } => self.persist_new(item, canonical_id).await,
        }
    }

    async fn merge(&self, item: &RawItem, existing: String, score: f64) -> Outcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.record_merge(&existing).await {
                Ok(()) => {
                    info!(
                        canonical_id = %existing,
                        score,
                        link = %item.link,
                        "merged duplicate coverage"
                    );
                    metrics::counter!("news_articles_merged_total").increment(1);
                    return Outcome::Merged {
                        canonical_id: existing,
                    };
                }
                Err(error) => {
                    let error = PipelineError::from(error);
                    if self.backoff(attempt, &error).await {
                        continue;
                    }
                    error!(canonical_id = %existing, error = %error, "merge failed terminally");
                    return Outcome::DeadLettered {
                        reason: error.to_string(),
                    };
                }
            }
        }
    }

    async fn persist_new(&self, item: RawItem, canonical_id: String) -> Outcome {
        // Classification runs outside the dedup lock and never fails the
        // message; a broken or slow model costs us a category, not a story.
        let classification = match self.classifier.classify(&item.text()).await {
            Ok(classification) => classification,
            Err(error) => {
                warn!(error = %error, link = %item.link, "classification failed, using fallback");
                metrics::counter!("news_classifier_fallbacks_total").increment(1);
                Classification::fallback()
            }
        };

        let article = CanonicalArticle {
            canonical_id,
            title: item.title,
            description: item.description,
            source: item.source,
            link: item.link,
            category: classification.category,
            confidence: classification.confidence,
            picture: item.picture,
            provider: item.provider,
            original_category: item.category,
            published_date: item.published_date,
            first_seen_at: Utc::now(),
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.store.upsert_new(&article).await {
                Ok(outcome) => {
                    match outcome {
                        UpsertOutcome::Created => info!(
                            canonical_id = %article.canonical_id,
                            category = %article.category,
                            "persisted new story"
                        ),
                        UpsertOutcome::AlreadyExists => info!(
                            canonical_id = %article.canonical_id,
                            "story already persisted, upsert was a no-op"
                        ),
                    }
                    metrics::counter!("news_articles_persisted_total").increment(1);
                    return Outcome::Persisted {
                        canonical_id: article.canonical_id,
                    };
                }
                Err(error) => {
                    let error = PipelineError::from(error);
                    if self.backoff(attempt, &error).await {
                        continue;
                    }
                    // Release the reservation: a dead-lettered story must
                    // not suppress a later copy as its duplicate.
                    self.dedup.remove(&article.canonical_id);
                    error!(canonical_id = %article.canonical_id, error = %error, "persist failed terminally");
                    return Outcome::DeadLettered {
                        reason: error.to_string(),
                    };
                }
            }
        }
    }

    /// Decide whether a failed stage should be retried; sleeps the backoff
    /// if so. `attempt` counts completed attempts.
    async fn backoff(&self, attempt: u32, error: &PipelineError) -> bool {
        if !error.is_transient() || !self.retry_policy.should_retry(attempt) {
            return false;
        }
        let delay = self.retry_policy.time_until_next_retry(attempt);
        warn!(attempt, error = %error, "transient failure, retrying after {:?}", delay);
        metrics::counter!("news_messages_retried_total").increment(1);
        tokio::time::sleep(delay).await;
        true
    }
}
