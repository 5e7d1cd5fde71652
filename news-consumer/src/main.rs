//! Consume raw article messages: deduplicate, classify, persist canonical stories.
use std::sync::Arc;

use envconfig::Envconfig;
use tokio::sync::watch;
use tracing::info;

use news_common::health::HealthRegistry;
use news_common::metrics::{serve, setup_status_router};
use news_consumer::broker::Broker;
use news_consumer::classifier::HttpClassifier;
use news_consumer::config::Config;
use news_consumer::dedup::DedupIndex;
use news_consumer::error::WorkerError;
use news_consumer::pipeline::Pipeline;
use news_consumer::store::MongoStore;
use news_consumer::worker::Worker;

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), ::time::Duration::seconds(30))
        .await;

    let store = MongoStore::new(&config.mongo_uri, &config.db_name, &config.article_collection)
        .await?;
    let classifier = HttpClassifier::new(&config.classifier_url, config.classifier_timeout.0);
    let dedup = Arc::new(DedupIndex::new(
        config.similarity_threshold,
        config.deduplication_window_hours,
    ));
    let pipeline = Arc::new(Pipeline::new(
        store,
        classifier,
        dedup,
        config.retry_policy(),
    ));

    let broker = Broker::connect(
        &config.amqp_uri(),
        config.rabbitmq_queue.as_str(),
        config.prefetch_count,
    )
    .await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }
        info!("shutdown requested");
        _ = shutdown_tx.send(true);
    });

    let bind = config.bind();
    tokio::task::spawn(async move {
        let router = setup_status_router(liveness);
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    let worker = Worker::new(
        &config.consumer_name,
        broker,
        pipeline,
        config.max_concurrent_messages,
        config.drain_timeout.0,
        worker_liveness,
        shutdown_rx,
    );

    worker.run().await?;

    info!("consumer stopped");
    Ok(())
}
