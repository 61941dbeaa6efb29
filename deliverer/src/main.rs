use std::{process, sync::Arc};

use courier_deliverer::{
    config::DelivererServiceConfig,
    deliver::{Deliverer, DelivererConfig},
};
use courier_helpers::{
    env::EnvSource, redis::get_redis_connection, telemetry::setup_tracing, time::DefaultClock,
};
use courier_status::{start_status_server, StatusEndpointConfig, WorkerStatus};
use futures::future::join_all;
use tokio::{signal, sync::broadcast};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    let env = EnvSource::process();
    let json_logs = env
        .var("LOG_JSON")
        .map(|value| value == "true")
        .unwrap_or(false);
    setup_tracing(json_logs);

    let config = match DelivererServiceConfig::from_env(&env) {
        Ok(config) => config,
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    };
    let status_config = match StatusEndpointConfig::from_env(&env) {
        Ok(status_config) => status_config,
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    };

    info!(
        "starting outbound message delivery service with topics: {outbound}, {retry}",
        outbound = config.outbound_topic(),
        retry = config.retry_topic(),
    );

    let connection = match get_redis_connection(&config.connection_config()).await {
        Ok(connection) => connection,
        Err(err) => {
            error!("Unable to connect to Redis, {err}");
            process::exit(1);
        }
    };

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let deliverer = match Deliverer::new(
        Box::new(connection),
        Arc::new(DefaultClock::new()),
        shutdown_tx.clone(),
        DelivererConfig {
            outbound_topic: config.outbound_topic(),
            retry_topic: config.retry_topic(),
            blpop_timeout_ms: None,
            empty_queue_wait_ms: None,
            redis_retry_wait_ms: None,
            retry_check_interval_ms: None,
            promotion_batch_size: None,
            dispatch_timeout_secs: None,
            max_retries: None,
            retry: None,
        },
    ) {
        Ok(deliverer) => deliverer,
        Err(err) => {
            error!("{err}");
            process::exit(1);
        }
    };

    let mut task_handles = Vec::new();
    let deliverer_for_start = deliverer.clone();
    task_handles.push(tokio::spawn(async move {
        if let Err(err) = deliverer_for_start.start().await {
            error!("{err}");
        }
    }));

    if let Some(status_config) = status_config {
        let workers: Vec<Arc<dyn WorkerStatus>> = vec![Arc::new(deliverer.clone())];
        let status_shutdown_rx = shutdown_tx.subscribe();
        task_handles.push(tokio::spawn(async move {
            if let Err(err) = start_status_server(status_config, workers, status_shutdown_rx).await
            {
                error!("status endpoint server failed: {err}");
            }
        }));
    }

    let mut workers_finished = join_all(task_handles);
    tokio::select! {
        _ = wait_for_shutdown_signal() => {
            info!("shutdown signal received, stopping workers");
            let _ = shutdown_tx.send(());
            let _ = (&mut workers_finished).await;
        }
        _ = &mut workers_finished => {}
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("failed to install SIGINT handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
