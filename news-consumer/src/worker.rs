use std::sync::Arc;
use std::time;

use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tokio::sync::{watch, Semaphore};
use tracing::{error, info, warn};

use news_common::health::HealthHandle;

use crate::broker::Broker;
use crate::classifier::Classifier;
use crate::error::WorkerError;
use crate::pipeline::{Outcome, Pipeline};
use crate::store::ArticleStore;

/// Pulls deliveries from the queue and runs each through the pipeline on a
/// bounded pool of tasks. All workers share one dedup index through the
/// pipeline, so concurrency is capped here and correctness lives there.
pub struct Worker<S, C> {
    /// An identifier for this worker, used as the consumer tag.
    name: String,
    broker: Broker,
    pipeline: Arc<Pipeline<S, C>>,
    /// Maximum number of messages being processed concurrently.
    max_concurrent_messages: usize,
    /// How long in-flight messages may keep running after shutdown.
    drain_timeout: time::Duration,
    /// The liveness check handle, reported on a schedule while consuming.
    liveness: HealthHandle,
    shutdown: watch::Receiver<bool>,
}

impl<S, C> Worker<S, C>
where
    S: ArticleStore + Send + Sync + 'static,
    C: Classifier + Send + Sync + 'static,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        broker: Broker,
        pipeline: Arc<Pipeline<S, C>>,
        max_concurrent_messages: usize,
        drain_timeout: time::Duration,
        liveness: HealthHandle,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            name: name.to_owned(),
            broker,
            pipeline,
            max_concurrent_messages,
            drain_timeout,
            liveness,
            shutdown,
        }
    }

    /// Consume until shutdown is requested, then drain.
    pub async fn run(mut self) -> Result<(), WorkerError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_messages));
        let mut consumer = self.broker.consume(&self.name).await?;
        let mut heartbeat = tokio::time::interval(time::Duration::from_secs(10));

        info!(queue = self.broker.queue(), "consumer started, waiting for messages");
        loop {
            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = heartbeat.tick() => self.liveness.report_healthy().await,
                delivery = consumer.next() => {
                    let Some(delivery) = delivery else { break };
                    let delivery = match delivery {
                        Ok(delivery) => delivery,
                        Err(error) => {
                            // One bad delivery must not take the worker
                            // down; a dead connection ends the stream and
                            // breaks the loop above.
                            error!(error = %error, "delivery error, skipping");
                            continue;
                        }
                    };
                    self.liveness.report_healthy().await;

                    metrics::counter!("news_messages_received_total").increment(1);
                    metrics::gauge!("news_worker_saturation_percent").set(
                        1f64 - semaphore.available_permits() as f64
                            / self.max_concurrent_messages as f64,
                    );

                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("semaphore has been closed");
                    let pipeline = self.pipeline.clone();
                    let broker = self.broker.clone();
                    tokio::spawn(async move {
                        let start = tokio::time::Instant::now();
                        let outcome = pipeline.process(&delivery.data).await;
                        settle(&broker, delivery, outcome).await;
                        metrics::histogram!("news_message_processing_duration_seconds")
                            .record(start.elapsed().as_secs_f64());
                        drop(permit);
                    });
                }
            }
        }

        // Stop pulling, let in-flight messages finish up to the drain
        // timeout. Whatever is still unacked afterwards is redelivered.
        info!("shutting down, draining in-flight messages");
        let drained = tokio::time::timeout(
            self.drain_timeout,
            semaphore.acquire_many(self.max_concurrent_messages as u32),
        )
        .await;
        if drained.is_err() {
            warn!("drain timeout reached, remaining messages will be redelivered");
        }

        Ok(())
    }
}

/// Map a pipeline outcome to its broker acknowledgment. Terminal success
/// acks; a dead-lettered message is parked first and acked only once the
/// park is confirmed, so the payload is never lost.
async fn settle(broker: &Broker, delivery: Delivery, outcome: Outcome) {
    match outcome {
        Outcome::Persisted { .. } | Outcome::Merged { .. } => {
            if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
                error!(error = %error, "failed to ack delivery");
            }
        }
        Outcome::DeadLettered { reason } => {
            metrics::counter!("news_messages_dead_lettered_total").increment(1);
            match broker.publish_dead_letter(&delivery.data, &reason).await {
                Ok(()) => {
                    if let Err(error) = delivery.ack(BasicAckOptions::default()).await {
                        error!(error = %error, "failed to ack dead-lettered delivery");
                    }
                }
                Err(error) => {
                    error!(error = %error, "failed to publish dead letter, requeueing");
                    let requeue = BasicNackOptions {
                        requeue: true,
                        ..BasicNackOptions::default()
                    };
                    if let Err(error) = delivery.nack(requeue).await {
                        error!(error = %error, "failed to nack delivery");
                    }
                }
            }
        }
    }
}
