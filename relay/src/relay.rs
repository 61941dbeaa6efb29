use std::{
    collections::HashMap,
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_helpers::{
    envelope::{DirectResponse, InboundEnvelope, ResponseData, TransportType},
    redis::BusConnection,
    time::Clock,
};
use courier_router::{errors::RouterError, routing::route_payload_recip_key};
use courier_status::WorkerStatus;
use tokio::{sync::broadcast, time::sleep};
use tracing::{debug, error, info, info_span, Instrument};

/// Configuration for one inbound relay instance.
#[derive(Debug)]
pub struct RelayConfig {
    /// The base topic that accepted inbound messages are enqueued onto,
    /// suffixed with the recipient key in mediator mode.
    pub inbound_topic: String,
    /// The queue that direct responses produced by the agent arrive on.
    pub direct_response_topic: String,
    /// When enabled, inbound messages are routed to recipient-key-suffixed
    /// queues through the mediator routing tables.
    pub mediator_mode: bool,
    /// The maximum time to block on each direct-response queue pop.
    ///
    /// Defaults to 200 milliseconds.
    pub blpop_timeout_ms: Option<u64>,
    /// The time to wait after a transient Redis error before retrying.
    /// A relay never fails an accepted inbound request over transient
    /// Redis trouble.
    ///
    /// Defaults to 1,000 milliseconds.
    pub redis_retry_wait_ms: Option<u64>,
    /// The interval at which waiting handlers poll for their transaction's
    /// response, and the pace of the direct-response consumer loop.
    ///
    /// Defaults to 1,000 milliseconds.
    pub poll_interval_ms: Option<u64>,
    /// How long a handler waits for a direct response before returning an
    /// empty reply to the peer.
    ///
    /// Defaults to 15,000 milliseconds.
    pub direct_response_timeout_ms: Option<u64>,
    /// The interval between heartbeat pings on relay WebSocket
    /// connections.
    ///
    /// Defaults to 3,000 milliseconds.
    pub ws_heartbeat_interval_ms: Option<u64>,
    /// The idle timeout after which a relay WebSocket connection is
    /// closed.
    ///
    /// Defaults to 15,000 milliseconds.
    pub ws_receive_timeout_ms: Option<u64>,
}

#[derive(Debug)]
pub(crate) struct RelayFinalisedConfig {
    pub inbound_topic: String,
    pub direct_response_topic: String,
    pub mediator_mode: bool,
    pub blpop_timeout_ms: u64,
    pub redis_retry_wait_ms: u64,
    pub poll_interval_ms: u64,
    pub direct_response_timeout_ms: u64,
    pub ws_heartbeat_interval_ms: u64,
    pub ws_receive_timeout_ms: u64,
}

/// Shared state for one relay instance: the transaction map correlating
/// direct responses to waiting connection handlers, plus the queue
/// plumbing used by the HTTP and WebSocket handlers.
///
/// The transaction map is process-local by design, a response is only
/// ever useful to the relay instance holding the originating connection.
pub struct Relay {
    connection: Box<dyn BusConnection>,
    clock: Arc<dyn Clock + Send + Sync>,
    response_map: Mutex<HashMap<String, ResponseData>>,
    running: AtomicBool,
    ready: AtomicBool,
    pub(crate) config: RelayFinalisedConfig,
}

impl Debug for Relay {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Relay({topic})",
            topic = self.config.inbound_topic
        )
    }
}

impl Relay {
    pub fn new(
        connection: Box<dyn BusConnection>,
        clock: Arc<dyn Clock + Send + Sync>,
        config: RelayConfig,
    ) -> Self {
        let final_config = RelayFinalisedConfig {
            inbound_topic: config.inbound_topic,
            direct_response_topic: config.direct_response_topic,
            mediator_mode: config.mediator_mode,
            blpop_timeout_ms: config.blpop_timeout_ms.unwrap_or(200),
            redis_retry_wait_ms: config.redis_retry_wait_ms.unwrap_or(1000),
            poll_interval_ms: config.poll_interval_ms.unwrap_or(1000),
            direct_response_timeout_ms: config.direct_response_timeout_ms.unwrap_or(15000),
            ws_heartbeat_interval_ms: config.ws_heartbeat_interval_ms.unwrap_or(3000),
            ws_receive_timeout_ms: config.ws_receive_timeout_ms.unwrap_or(15000),
        };

        Relay {
            connection,
            clock,
            response_map: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            config: final_config,
        }
    }

    pub(crate) fn mark_started(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
    }

    pub(crate) fn mark_stopped(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Consumes the direct-response queue into the transaction map until
    /// shutdown is broadcast.
    pub async fn process_direct_responses(
        self: Arc<Self>,
        shutdown_tx: broadcast::Sender<()>,
    ) {
        let mut conn = self.connection.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();

        async {
            loop {
                if let Ok(()) = shutdown_rx.try_recv() {
                    info!("received shutdown signal, stopping direct response consumer");
                    break;
                }

                let popped = self.pop_direct_response(&mut conn).await;
                let Some(raw_record) = popped else {
                    sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                    continue;
                };

                match DirectResponse::from_json(&raw_record) {
                    Ok(record) => {
                        debug!(
                            "recorded direct response for transaction {txn_id}",
                            txn_id = record.txn_id
                        );
                        self.response_map
                            .lock()
                            .unwrap()
                            .insert(record.txn_id, record.response_data);
                        sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
                    }
                    Err(err) => {
                        error!("received invalid direct response record: {err}");
                    }
                }
            }
        }
        .instrument(info_span!("direct_response_consumer"))
        .await
    }

    async fn pop_direct_response(&self, conn: &mut Box<dyn BusConnection>) -> Option<String> {
        loop {
            match conn
                .blpop(
                    &self.config.direct_response_topic,
                    self.config.blpop_timeout_ms,
                )
                .await
            {
                Ok(popped) => return popped,
                Err(err) => {
                    error!("unexpected redis client exception (blpop): {err}");
                    sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                }
            }
        }
    }

    /// Waits for the direct response correlated with a transaction id,
    /// polling the transaction map until the response arrives or the
    /// timeout elapses. The map entry is consumed on pickup.
    pub(crate) async fn wait_for_direct_response(&self, txn_id: &str) -> Option<ResponseData> {
        let wait = Duration::from_millis(self.config.direct_response_timeout_ms);
        tokio::time::timeout(wait, async {
            loop {
                let resolved = self.response_map.lock().unwrap().remove(txn_id);
                if let Some(response_data) = resolved {
                    return response_data;
                }
                sleep(Duration::from_millis(self.config.poll_interval_ms)).await;
            }
        })
        .await
        .ok()
    }

    /// Enqueues an accepted inbound message for the agent, retrying
    /// forever on transient Redis errors. In mediator mode the routing is
    /// recomputed on each attempt so a reassignment that happens mid-retry
    /// is picked up.
    ///
    /// Only an envelope that cannot be routed at all (no recipient key can
    /// be extracted in mediator mode) is surfaced to the caller.
    pub(crate) async fn enqueue_inbound(
        &self,
        payload: &[u8],
        txn_id: Option<String>,
        transport_type: TransportType,
    ) -> Result<(), RouterError> {
        let envelope = InboundEnvelope::new(payload, txn_id, transport_type);
        let message = envelope.to_json().map_err(RouterError::Envelope)?;
        let mut conn = self.connection.clone();

        loop {
            let topic = if self.config.mediator_mode {
                match route_payload_recip_key(
                    conn.as_mut(),
                    self.clock.as_ref(),
                    payload,
                    &self.config.inbound_topic,
                )
                .await
                {
                    Ok(topic) => topic,
                    Err(RouterError::Redis(err)) => {
                        error!("unexpected redis client exception (routing): {err}");
                        sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                        continue;
                    }
                    Err(err) => return Err(err),
                }
            } else {
                self.config.inbound_topic.clone()
            };

            match conn.rpush(&topic, &message).await {
                Ok(()) => return Ok(()),
                Err(err) => {
                    error!("unexpected redis client exception (rpush): {err}");
                    sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                }
            }
        }
    }
}

#[async_trait]
impl WorkerStatus for Relay {
    fn ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    async fn is_running(&self) -> bool {
        if !self.running.load(Ordering::SeqCst) {
            return false;
        }
        let mut conn = self.connection.clone();
        conn.ping().await.is_ok()
    }
}
