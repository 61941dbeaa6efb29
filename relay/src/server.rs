use std::{net::SocketAddr, sync::Arc};

use tokio::{net::TcpListener, sync::broadcast, task::JoinHandle};
use tracing::{error, info};

use crate::{
    config::{TransportBinding, TransportKind},
    errors::WorkerError,
    http::create_http_router,
    relay::Relay,
    ws::create_ws_router,
};

/// One running relay instance: an HTTP or WebSocket server bound to a
/// configured address plus the background direct-response consumer that
/// feeds its transaction map.
pub struct RelayServer {
    binding: TransportBinding,
    relay: Arc<Relay>,
    shutdown_broadcast_tx: broadcast::Sender<()>,
    task_handles: Vec<JoinHandle<()>>,
}

impl RelayServer {
    pub fn new(
        binding: TransportBinding,
        relay: Arc<Relay>,
        shutdown_broadcast_tx: broadcast::Sender<()>,
    ) -> Self {
        RelayServer {
            binding,
            relay,
            shutdown_broadcast_tx,
            task_handles: Vec::new(),
        }
    }

    /// The shared relay state, used to register the instance with the
    /// status endpoints.
    pub fn relay(&self) -> Arc<Relay> {
        self.relay.clone()
    }

    /// Binds the configured address and spawns the server and the
    /// direct-response consumer, returning the bound address. Both tasks
    /// stop when shutdown is broadcast.
    pub async fn run(&mut self) -> Result<SocketAddr, WorkerError> {
        let router = match self.binding.transport {
            TransportKind::Http => create_http_router(self.relay.clone()),
            TransportKind::Ws => create_ws_router(self.relay.clone()),
        };

        let listener =
            TcpListener::bind((self.binding.host.as_str(), self.binding.port)).await?;
        let local_addr = listener.local_addr()?;
        info!(
            "starting {transport:?} relay on {local_addr}",
            transport = self.binding.transport
        );
        self.relay.mark_started();

        let consumer_relay = self.relay.clone();
        let consumer_shutdown_tx = self.shutdown_broadcast_tx.clone();
        self.task_handles.push(tokio::spawn(
            consumer_relay.process_direct_responses(consumer_shutdown_tx),
        ));

        let mut serve_shutdown_rx = self.shutdown_broadcast_tx.subscribe();
        let serve_relay = self.relay.clone();
        self.task_handles.push(tokio::spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move {
                    let _ = serve_shutdown_rx.recv().await;
                })
                .await;
            if let Err(err) = result {
                error!("relay server failed: {err}");
            }
            serve_relay.mark_stopped();
        }));

        Ok(local_addr)
    }

    /// Waits for the server and consumer tasks to finish.
    pub async fn join(&mut self) {
        for handle in self.task_handles.drain(..) {
            if let Err(err) = handle.await {
                error!("relay task panicked: {err}");
            }
        }
    }
}
