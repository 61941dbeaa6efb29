use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use courier_helpers::{
    envelope::{b64_encode, DirectResponse, InboundEnvelope, ResponseData},
    redis::BusConnection,
    time::{format_timestamp, Clock},
};
use nanoid::nanoid;
use tokio::{sync::broadcast, time::sleep};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::{
    errors::{MessageHandlerError, WorkerError},
    routing::{
        decode_recip_keys, encode_recip_keys, pending_count_field, PENDING_MSG_COUNT_MAP,
        UID_LAST_ACCESS_MAP, UID_RECIP_KEYS_MAP,
    },
};

/// Configuration for an agent-side consumer of recipient-keyed inbound
/// queues.
#[derive(Debug)]
pub struct RecipientConsumerConfig {
    /// The base inbound topic, per-key queues are derived as
    /// `<inbound_topic>_<recipKey>`.
    pub inbound_topic: String,
    /// The queue that direct responses produced by the agent are pushed
    /// onto for the relay to correlate.
    pub direct_response_topic: String,
    /// The maximum time to block on each per-key pop.
    ///
    /// Defaults to 200 milliseconds.
    pub blpop_timeout_ms: Option<u64>,
    /// The time to wait before re-reading the instance's key list when it
    /// has not been populated yet, keys arrive over time as producers
    /// assign them.
    ///
    /// Defaults to 200 milliseconds.
    pub key_list_poll_wait_ms: Option<u64>,
    /// The time to wait after a transient Redis error before retrying.
    ///
    /// Defaults to 1,000 milliseconds.
    pub redis_retry_wait_ms: Option<u64>,
    /// The number of consecutive Redis failures tolerated before the
    /// consumer escalates with a fatal error, leaving the restart to the
    /// process supervisor.
    ///
    /// Defaults to 5.
    pub consecutive_failure_limit: Option<u32>,
}

#[derive(Debug)]
struct RecipientConsumerFinalisedConfig {
    inbound_topic: String,
    direct_response_topic: String,
    blpop_timeout_ms: u64,
    key_list_poll_wait_ms: u64,
    redis_retry_wait_ms: u64,
    consecutive_failure_limit: u32,
}

/// The reply produced by an agent handler when the sender requested a
/// direct response.
#[derive(Debug, Clone)]
pub struct AgentResponse {
    pub body: Vec<u8>,
    pub content_type: String,
}

/// A handler for inbound envelopes dequeued for one agent instance.
///
/// Returning `Some(response)` for an envelope carrying a transaction id
/// produces a direct-response record for the relay holding the originating
/// connection.
#[async_trait]
pub trait RecipientMessageHandler {
    async fn handle(
        &self,
        envelope: &InboundEnvelope,
        payload: &[u8],
    ) -> Result<Option<AgentResponse>, MessageHandlerError>;
}

impl Debug for dyn RecipientMessageHandler + Send + Sync {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RecipientMessageHandler")
    }
}

/// Consumes recipient-keyed inbound queues for one agent worker instance.
///
/// On start the consumer registers its own instance UID with an empty key
/// list; producers then assign recipient keys to it through the routing
/// tables. Each successful pop refreshes the instance's last-activity
/// timestamp so producers do not treat it as stale.
pub struct RecipientConsumer {
    uid: String,
    handler: Option<Arc<dyn RecipientMessageHandler + Send + Sync>>,
    connection: Box<dyn BusConnection>,
    clock: Arc<dyn Clock + Send + Sync>,
    shutdown_broadcast_tx: broadcast::Sender<()>,
    config: Arc<RecipientConsumerFinalisedConfig>,
}

impl Debug for RecipientConsumer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RecipientConsumer({})", self.uid)
    }
}

impl RecipientConsumer {
    pub fn new(
        connection: Box<dyn BusConnection>,
        clock: Arc<dyn Clock + Send + Sync>,
        shutdown_broadcast_tx: broadcast::Sender<()>,
        config: RecipientConsumerConfig,
    ) -> Self {
        let final_config = RecipientConsumerFinalisedConfig {
            inbound_topic: config.inbound_topic,
            direct_response_topic: config.direct_response_topic,
            blpop_timeout_ms: config.blpop_timeout_ms.unwrap_or(200),
            key_list_poll_wait_ms: config.key_list_poll_wait_ms.unwrap_or(200),
            redis_retry_wait_ms: config.redis_retry_wait_ms.unwrap_or(1000),
            consecutive_failure_limit: config.consecutive_failure_limit.unwrap_or(5),
        };

        RecipientConsumer {
            uid: nanoid!(),
            handler: None,
            connection,
            clock,
            shutdown_broadcast_tx,
            config: Arc::new(final_config),
        }
    }

    /// The instance UID registered in the routing tables.
    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn register_handler(&mut self, handler: Arc<dyn RecipientMessageHandler + Send + Sync>) {
        self.handler = Some(handler);
    }

    #[instrument(name = "recipient_consumer", skip(self))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        let mut conn = self.connection.clone();
        let mut shutdown_rx = self.shutdown_broadcast_tx.subscribe();

        conn.hset(UID_RECIP_KEYS_MAP, &self.uid, &encode_recip_keys(&[])?)
            .await?;
        info!("new agent instance {} registered", self.uid);

        let mut key_list_failures: u32 = 0;
        async {
            loop {
                if let Ok(()) = shutdown_rx.try_recv() {
                    info!("received shutdown signal, stopping recipient consumer");
                    break Ok(());
                }

                let recip_keys = match conn.hget(UID_RECIP_KEYS_MAP, &self.uid).await {
                    Ok(Some(encoded)) => match decode_recip_keys(&encoded) {
                        Ok(keys) => {
                            key_list_failures = 0;
                            keys
                        }
                        Err(err) => {
                            error!("received corrupt recipient key list: {err}");
                            sleep(Duration::from_millis(self.config.key_list_poll_wait_ms)).await;
                            continue;
                        }
                    },
                    Ok(None) => {
                        sleep(Duration::from_millis(self.config.key_list_poll_wait_ms)).await;
                        continue;
                    }
                    Err(err) => {
                        key_list_failures += 1;
                        if key_list_failures > self.config.consecutive_failure_limit {
                            return Err(WorkerError::new(format!(
                                "unable to read recipient keys for instance {uid}: {err}",
                                uid = self.uid
                            )));
                        }
                        warn!("failed to read recipient key list: {err}");
                        sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                        continue;
                    }
                };

                if recip_keys.is_empty() {
                    sleep(Duration::from_millis(self.config.key_list_poll_wait_ms)).await;
                    continue;
                }

                for recip_key in &recip_keys {
                    let popped = self.pop_next_message(&mut conn, recip_key).await?;
                    if let Some(raw) = popped {
                        self.process_message(&mut conn, recip_key, &raw).await;
                    }
                }
            }
        }
        .instrument(info_span!("recipient_consumer_loop", uid = %self.uid))
        .await
    }

    /// Pops the next message for one recipient key, tolerating transient
    /// Redis errors up to the consecutive failure limit.
    async fn pop_next_message(
        &self,
        conn: &mut Box<dyn BusConnection>,
        recip_key: &str,
    ) -> Result<Option<String>, WorkerError> {
        let queue = format!(
            "{topic}_{recip_key}",
            topic = self.config.inbound_topic
        );
        let mut pop_failures: u32 = 0;
        loop {
            match conn.blpop(&queue, self.config.blpop_timeout_ms).await {
                Ok(popped) => return Ok(popped),
                Err(err) => {
                    warn!("failed to pop from {queue}: {err}");
                    pop_failures += 1;
                    if pop_failures > self.config.consecutive_failure_limit {
                        return Err(WorkerError::new(format!(
                            "unexpected exception while popping from {queue}: {err}"
                        )));
                    }
                    sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                }
            }
        }
    }

    async fn process_message(
        &self,
        conn: &mut Box<dyn BusConnection>,
        recip_key: &str,
        raw_message: &str,
    ) {
        let now = format_timestamp(self.clock.now());
        if let Err(err) = conn.hset(UID_LAST_ACCESS_MAP, &self.uid, &now).await {
            error!("failed to refresh last-access timestamp: {err}");
        }

        self.decrement_pending_count(conn, recip_key).await;

        let envelope = match InboundEnvelope::from_json(raw_message) {
            Ok(envelope) => envelope,
            Err(err) => {
                error!("received invalid inbound message record: {err}");
                return;
            }
        };
        let payload = match envelope.payload_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                error!("received inbound message with invalid payload encoding: {err}");
                return;
            }
        };

        let handler = match &self.handler {
            Some(handler) => handler.clone(),
            None => {
                error!("no message handler registered, dropping inbound message");
                return;
            }
        };

        let span = info_span!("handle_inbound_message", recip_key = %recip_key);
        match handler.handle(&envelope, &payload).instrument(span).await {
            Ok(Some(response)) => {
                if let Some(txn_id) = &envelope.txn_id {
                    self.push_direct_response(conn, txn_id, response).await;
                }
            }
            Ok(None) => debug!("inbound message processed without a direct response"),
            Err(err) => error!("failed to process inbound message: {err}"),
        }
    }

    /// Decrements the pending counter for the instance/key pair, flooring
    /// at zero. The counter is advisory so failures are only logged.
    async fn decrement_pending_count(&self, conn: &mut Box<dyn BusConnection>, recip_key: &str) {
        let field = pending_count_field(&self.uid, recip_key);
        match conn.hget(PENDING_MSG_COUNT_MAP, &field).await {
            Ok(Some(count)) => {
                let count = count.parse::<i64>().unwrap_or(0);
                if count >= 1 {
                    if let Err(err) = conn
                        .hset(PENDING_MSG_COUNT_MAP, &field, &(count - 1).to_string())
                        .await
                    {
                        error!("failed to decrement pending message count: {err}");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => error!("failed to read pending message count: {err}"),
        }
    }

    async fn push_direct_response(
        &self,
        conn: &mut Box<dyn BusConnection>,
        txn_id: &str,
        response: AgentResponse,
    ) {
        let record = DirectResponse {
            txn_id: txn_id.to_string(),
            response_data: ResponseData {
                response: b64_encode(&response.body),
                content_type: Some(response.content_type),
            },
        };
        let raw = match record.to_json() {
            Ok(raw) => raw,
            Err(err) => {
                error!("failed to serialize direct response: {err}");
                return;
            }
        };
        if let Err(err) = conn.rpush(&self.config.direct_response_topic, &raw).await {
            error!("failed to push direct response for transaction {txn_id}: {err}");
        }
    }
}
