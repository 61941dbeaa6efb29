use std::{process, sync::Arc};

use courier_helpers::{
    env::EnvSource,
    redis::{get_redis_connection, BusConnection},
    telemetry::setup_tracing,
    time::DefaultClock,
};
use courier_relay::{
    config::RelayServiceConfig,
    relay::{Relay, RelayConfig},
    server::RelayServer,
};
use courier_status::{start_status_server, StatusEndpointConfig, WorkerStatus};
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

    let config = match RelayServiceConfig::from_env(&env) {
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

    let connection = match get_redis_connection(&config.connection_config()).await {
        Ok(connection) => connection,
        Err(err) => {
            error!("Unable to connect to Redis, {err}");
            process::exit(1);
        }
    };
    let connection: Box<dyn BusConnection> = Box::new(connection);
    let clock = Arc::new(DefaultClock::new());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let mut servers = Vec::new();
    let mut workers: Vec<Arc<dyn WorkerStatus>> = Vec::new();
    for binding in &config.transports {
        info!(
            "starting inbound relay for {transport:?} on {host}:{port}",
            transport = binding.transport,
            host = binding.host,
            port = binding.port,
        );
        let relay = Arc::new(Relay::new(
            connection.clone(),
            clock.clone(),
            RelayConfig {
                inbound_topic: config.inbound_topic(),
                direct_response_topic: config.direct_response_topic(),
                mediator_mode: config.mediator_mode,
                blpop_timeout_ms: None,
                redis_retry_wait_ms: None,
                poll_interval_ms: None,
                direct_response_timeout_ms: None,
                ws_heartbeat_interval_ms: None,
                ws_receive_timeout_ms: None,
            },
        ));
        workers.push(relay.clone());
        let mut server = RelayServer::new(binding.clone(), relay, shutdown_tx.clone());
        if let Err(err) = server.run().await {
            error!("{err}");
            process::exit(1);
        }
        servers.push(server);
    }

    let mut status_handle = None;
    if let Some(status_config) = status_config {
        let status_shutdown_rx = shutdown_tx.subscribe();
        status_handle = Some(tokio::spawn(async move {
            if let Err(err) = start_status_server(status_config, workers, status_shutdown_rx).await
            {
                error!("status endpoint server failed: {err}");
            }
        }));
    }

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping relay instances");
    let _ = shutdown_tx.send(());

    for server in &mut servers {
        server.join().await;
    }
    if let Some(handle) = status_handle {
        let _ = handle.await;
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
