//! Consume trigger events, deduplicate them by scope, and forward first
//! occurrences with the ids of the records created.
use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use time::Duration;

use dedup_common::health::HealthRegistry;
use dedup_common::metrics::setup_metrics_routes;

use config::Config;
use forward::KafkaSink;
use kafka::{create_kafka_producer, TriggerConsumer};
use store::PgExecutionStore;
use worker::DedupWorker;

mod config;
mod error;
mod forward;
mod kafka;
mod store;
mod worker;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    axum::serve(listener, app).await?;

    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("failed to load configuration from env");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("consumer".to_string(), Duration::seconds(60))
        .await;

    let store = PgExecutionStore::new(
        &config.database_url,
        config.max_pg_connections,
        config.max_result_window,
    )
    .await
    .expect("failed to connect to the execution store");
    store
        .bootstrap()
        .await
        .expect("failed to bootstrap the executions table");

    let consumer =
        TriggerConsumer::new(&config.kafka).expect("failed to create the trigger consumer");
    let producer = create_kafka_producer(&config.kafka)
        .await
        .expect("failed to create kafka producer");
    let sink = KafkaSink::new(producer, config.kafka.kafka_answer_topic.clone());

    let worker = DedupWorker::new(consumer, store, sink, worker_liveness);
    let worker_loop = Box::pin(async move { worker.run().await });

    let router = Router::new().route(
        "/_liveness",
        get(move || std::future::ready(liveness.get_status())),
    );
    let router = setup_metrics_routes(router);
    let http_server = Box::pin(listen(router, config.bind()));

    match select(http_server, worker_loop).await {
        Either::Left((listen_result, _)) => match listen_result {
            Ok(_) => {}
            Err(e) => tracing::error!("failed to start dedup-worker http server, {}", e),
        },
        Either::Right((worker_result, _)) => match worker_result {
            Ok(_) => {}
            Err(e) => tracing::error!("dedup worker exited: {}", e),
        },
    };
}
