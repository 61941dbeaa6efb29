use std::{
    fmt::Debug,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_helpers::{
    envelope::OutboundJob,
    redis::BusConnection,
    retries::{calculate_retry_wait, RetryConfig},
    time::Clock,
};
use courier_status::WorkerStatus;
use futures::{future::join_all, SinkExt};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::{sync::broadcast, time::sleep};
use tracing::{debug, error, info, info_span, instrument, warn, Instrument};

use crate::errors::WorkerError;

/// Configuration for the outbound deliverer.
#[derive(Debug)]
pub struct DelivererConfig {
    /// The queue that prepared outbound jobs are popped from.
    pub outbound_topic: String,
    /// The sorted set that holds jobs awaiting redelivery, scored by the
    /// unix timestamp at which they become eligible.
    pub retry_topic: String,
    /// The maximum time to block on each outbound queue pop.
    ///
    /// Defaults to 200 milliseconds.
    pub blpop_timeout_ms: Option<u64>,
    /// The time to wait before polling again when the outbound queue is
    /// empty.
    ///
    /// Defaults to 1,000 milliseconds.
    pub empty_queue_wait_ms: Option<u64>,
    /// The time to wait after a transient Redis error before retrying the
    /// failed operation. Redis errors are always retried, a job must never
    /// be lost to transient infrastructure trouble.
    ///
    /// Defaults to 1,000 milliseconds.
    pub redis_retry_wait_ms: Option<u64>,
    /// The interval between queries of the retry set for due entries.
    ///
    /// Defaults to 1,000 milliseconds.
    pub retry_check_interval_ms: Option<u64>,
    /// The maximum number of due retry entries promoted per iteration.
    ///
    /// Defaults to 10 entries.
    pub promotion_batch_size: Option<usize>,
    /// The hard timeout for each HTTP dispatch in seconds.
    ///
    /// Defaults to 10 seconds.
    pub dispatch_timeout_secs: Option<u64>,
    /// The number of redelivery attempts allowed per job after the initial
    /// dispatch.
    ///
    /// Defaults to 5.
    pub max_retries: Option<u32>,
    /// The backoff configuration used to compute redelivery delays.
    pub retry: Option<RetryConfig>,
}

#[derive(Debug)]
struct DelivererFinalisedConfig {
    outbound_topic: String,
    retry_topic: String,
    blpop_timeout_ms: u64,
    empty_queue_wait_ms: u64,
    redis_retry_wait_ms: u64,
    retry_check_interval_ms: u64,
    promotion_batch_size: usize,
    max_retries: u32,
    retry: RetryConfig,
}

/// Drains the outbound queue and dispatches each job to its target
/// endpoint over HTTP or WebSocket.
///
/// A failed HTTP dispatch is rescheduled onto the delayed-redelivery
/// sorted set with an incremented retry count until the retry budget is
/// exhausted; a companion promotion loop moves due entries back onto the
/// outbound queue. WebSocket dispatches are fire-and-forget.
pub struct Deliverer {
    connection: Box<dyn BusConnection>,
    clock: Arc<dyn Clock + Send + Sync>,
    http_client: reqwest::Client,
    running: Arc<AtomicBool>,
    ready: Arc<AtomicBool>,
    shutdown_broadcast_tx: broadcast::Sender<()>,
    config: Arc<DelivererFinalisedConfig>,
}

impl Debug for Deliverer {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Deliverer")
    }
}

impl Clone for Deliverer {
    fn clone(&self) -> Self {
        Deliverer {
            connection: self.connection.clone(),
            clock: self.clock.clone(),
            http_client: self.http_client.clone(),
            running: self.running.clone(),
            ready: self.ready.clone(),
            shutdown_broadcast_tx: self.shutdown_broadcast_tx.clone(),
            config: self.config.clone(),
        }
    }
}

impl Deliverer {
    pub fn new(
        connection: Box<dyn BusConnection>,
        clock: Arc<dyn Clock + Send + Sync>,
        shutdown_broadcast_tx: broadcast::Sender<()>,
        config: DelivererConfig,
    ) -> Result<Self, WorkerError> {
        let dispatch_timeout = Duration::from_secs(config.dispatch_timeout_secs.unwrap_or(10));
        let http_client = reqwest::Client::builder()
            .timeout(dispatch_timeout)
            .build()?;

        let final_config = DelivererFinalisedConfig {
            outbound_topic: config.outbound_topic,
            retry_topic: config.retry_topic,
            blpop_timeout_ms: config.blpop_timeout_ms.unwrap_or(200),
            empty_queue_wait_ms: config.empty_queue_wait_ms.unwrap_or(1000),
            redis_retry_wait_ms: config.redis_retry_wait_ms.unwrap_or(1000),
            retry_check_interval_ms: config.retry_check_interval_ms.unwrap_or(1000),
            promotion_batch_size: config.promotion_batch_size.unwrap_or(10),
            max_retries: config.max_retries.unwrap_or(5),
            retry: config.retry.unwrap_or_default(),
        };

        Ok(Deliverer {
            connection,
            clock,
            http_client,
            running: Arc::new(AtomicBool::new(false)),
            ready: Arc::new(AtomicBool::new(false)),
            shutdown_broadcast_tx,
            config: Arc::new(final_config),
        })
    }

    /// Runs the dispatch and retry-promotion loops until shutdown is
    /// broadcast.
    #[instrument(name = "outbound_deliverer", skip(self))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        self.ready.store(true, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);

        let deliverer_arc = Arc::new(self.clone());
        let mut worker_handles = Vec::new();

        let dispatcher = deliverer_arc.clone();
        let mut dispatch_conn = self.connection.clone();
        let dispatch_shutdown_tx = self.shutdown_broadcast_tx.clone();
        worker_handles.push(tokio::spawn(async move {
            dispatcher
                .dispatch_loop(&mut dispatch_conn, &dispatch_shutdown_tx)
                .await
        }));

        let promoter = deliverer_arc.clone();
        let mut promotion_conn = self.connection.clone();
        let promotion_shutdown_tx = self.shutdown_broadcast_tx.clone();
        worker_handles.push(tokio::spawn(async move {
            promoter
                .promotion_loop(&mut promotion_conn, &promotion_shutdown_tx)
                .await
        }));

        let results = join_all(worker_handles).await;
        self.running.store(false, Ordering::SeqCst);

        let mut errors = Vec::new();
        for (worker_id, result) in results.into_iter().enumerate() {
            match result {
                Ok(_) => info!("Worker {worker_id} finished successfully"),
                Err(err) => {
                    error!("Worker {worker_id} panicked: {err}");
                    errors.push(err.to_string());
                }
            }
        }

        if !errors.is_empty() {
            return Err(WorkerError::new(format!("Workers failed: {errors:?}")));
        }

        Ok(())
    }

    async fn dispatch_loop(
        self: Arc<Self>,
        conn: &mut Box<dyn BusConnection>,
        shutdown_tx: &broadcast::Sender<()>,
    ) {
        let mut shutdown_rx = shutdown_tx.subscribe();

        async {
            loop {
                if let Ok(()) = shutdown_rx.try_recv() {
                    info!("received shutdown signal, stopping dispatch loop");
                    break;
                }

                let popped = self.pop_outbound(conn).await;
                match popped {
                    Some(raw_job) => self.dispatch_message(conn, &raw_job).await,
                    None => {
                        sleep(Duration::from_millis(self.config.empty_queue_wait_ms)).await;
                    }
                }
            }
        }
        .instrument(info_span!("dispatch_loop"))
        .await
    }

    /// Pops one job from the outbound queue, retrying forever on transient
    /// Redis errors.
    async fn pop_outbound(&self, conn: &mut Box<dyn BusConnection>) -> Option<String> {
        loop {
            match conn
                .blpop(&self.config.outbound_topic, self.config.blpop_timeout_ms)
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

    async fn dispatch_message(&self, conn: &mut Box<dyn BusConnection>, raw_job: &str) {
        let job = match OutboundJob::from_json(raw_job) {
            Ok(job) => job,
            Err(err) => {
                error!("received invalid outbound message record: {err}");
                return;
            }
        };
        let payload = match job.payload_bytes() {
            Ok(payload) => payload,
            Err(err) => {
                error!("received outbound message with invalid payload encoding: {err}");
                return;
            }
        };

        let scheme = job.endpoint_scheme().map(str::to_string);
        match scheme.as_deref() {
            Some("http") | Some("https") => {
                let delivered = self.dispatch_http(&job, payload).await;
                if delivered {
                    info!("message dispatched to {}", job.service.url);
                } else if job.retries < self.config.max_retries {
                    let mut retry_job = job;
                    retry_job.retries += 1;
                    self.add_retry(conn, &retry_job).await;
                } else {
                    error!("exceeded max retries for {}", job.service.url);
                }
            }
            Some("ws") => self.dispatch_ws(&job, payload).await,
            other => error!(
                "unsupported scheme `{scheme}` for {url}",
                scheme = other.unwrap_or(""),
                url = job.service.url
            ),
        }
    }

    async fn dispatch_http(&self, job: &OutboundJob, payload: Vec<u8>) -> bool {
        let headers = build_header_map(job);
        let result = self
            .http_client
            .post(&job.service.url)
            .headers(headers)
            .body(payload)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => true,
            Ok(response) => {
                error!(
                    "invalid response from {url}: {status} - {reason}",
                    url = job.service.url,
                    status = response.status().as_u16(),
                    reason = response.status().canonical_reason().unwrap_or("unknown"),
                );
                false
            }
            Err(err) => {
                error!("delivery failed for {url}: {err}", url = job.service.url);
                false
            }
        }
    }

    /// Sends the payload over a fresh WebSocket connection and closes it.
    /// WebSocket dispatches are not retried.
    async fn dispatch_ws(&self, job: &OutboundJob, payload: Vec<u8>) {
        use tokio_tungstenite::tungstenite::{
            client::IntoClientRequest,
            http::{HeaderName as WsHeaderName, HeaderValue as WsHeaderValue},
            Message,
        };

        let mut request = match job.service.url.clone().into_client_request() {
            Ok(request) => request,
            Err(err) => {
                error!(
                    "invalid WebSocket endpoint {url}: {err}",
                    url = job.service.url
                );
                return;
            }
        };
        for (name, value) in &job.headers {
            match (
                name.parse::<WsHeaderName>(),
                WsHeaderValue::from_str(value),
            ) {
                (Ok(header_name), Ok(header_value)) => {
                    request.headers_mut().insert(header_name, header_value);
                }
                _ => warn!("skipping invalid header `{name}` on WebSocket dispatch"),
            }
        }

        match tokio_tungstenite::connect_async(request).await {
            Ok((mut stream, _)) => {
                if let Err(err) = stream.send(Message::Binary(payload)).await {
                    error!(
                        "failed to send WS message to {url}: {err}",
                        url = job.service.url
                    );
                } else {
                    info!("WS message dispatched to {}", job.service.url);
                }
                let _ = stream.close(None).await;
            }
            Err(err) => error!(
                "failed to open WebSocket connection to {url}: {err}",
                url = job.service.url
            ),
        }
    }

    /// Schedules a job whose retry count has already been incremented onto
    /// the delayed-redelivery set, retrying forever on transient Redis
    /// errors so a retry is never silently lost.
    async fn add_retry(&self, conn: &mut Box<dyn BusConnection>, job: &OutboundJob) {
        let raw_job = match job.to_json() {
            Ok(raw) => raw,
            Err(err) => {
                error!("failed to serialize retry entry: {err}");
                return;
            }
        };
        let wait = calculate_retry_wait(&self.config.retry, job.retries);

        loop {
            let score = self.clock.now() + wait.as_secs();
            match conn.zadd(&self.config.retry_topic, &raw_job, score).await {
                Ok(()) => {
                    debug!(
                        "scheduled retry {retries} for {url} in ~{wait}s",
                        retries = job.retries,
                        url = job.service.url,
                        wait = wait.as_secs(),
                    );
                    return;
                }
                Err(err) => {
                    error!("unexpected redis client exception (zadd): {err}");
                    sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                }
            }
        }
    }

    /// Promotes due retry entries back onto the outbound queue. The
    /// zrem-reported deletion count establishes ownership, a zero result
    /// means another promoter claimed the entry and it is skipped.
    async fn promotion_loop(
        self: Arc<Self>,
        conn: &mut Box<dyn BusConnection>,
        shutdown_tx: &broadcast::Sender<()>,
    ) {
        let mut shutdown_rx = shutdown_tx.subscribe();

        async {
            loop {
                if let Ok(()) = shutdown_rx.try_recv() {
                    info!("received shutdown signal, stopping retry promotion loop");
                    break;
                }

                let due_entries = self.due_retry_entries(conn).await;
                if due_entries.is_empty() {
                    sleep(Duration::from_millis(self.config.retry_check_interval_ms)).await;
                    continue;
                }

                for entry in due_entries {
                    let removed = self.claim_retry_entry(conn, &entry).await;
                    if removed == 0 {
                        // Claimed by another promoter.
                        continue;
                    }
                    self.push_promoted_entry(conn, &entry).await;
                }
            }
        }
        .instrument(info_span!("retry_promotion_loop"))
        .await
    }

    async fn due_retry_entries(&self, conn: &mut Box<dyn BusConnection>) -> Vec<String> {
        loop {
            let max_score = self.clock.now();
            match conn
                .zrangebyscore(
                    &self.config.retry_topic,
                    max_score,
                    self.config.promotion_batch_size,
                )
                .await
            {
                Ok(entries) => return entries,
                Err(err) => {
                    error!("unexpected redis client exception (zrangebyscore): {err}");
                    sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                }
            }
        }
    }

    async fn claim_retry_entry(&self, conn: &mut Box<dyn BusConnection>, entry: &str) -> usize {
        loop {
            match conn.zrem(&self.config.retry_topic, entry).await {
                Ok(removed) => return removed,
                Err(err) => {
                    error!("unexpected redis client exception (zrem): {err}");
                    sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                }
            }
        }
    }

    async fn push_promoted_entry(&self, conn: &mut Box<dyn BusConnection>, entry: &str) {
        loop {
            match conn.rpush(&self.config.outbound_topic, entry).await {
                Ok(()) => return,
                Err(err) => {
                    error!("unexpected redis client exception (rpush): {err}");
                    sleep(Duration::from_millis(self.config.redis_retry_wait_ms)).await;
                }
            }
        }
    }
}

#[async_trait]
impl WorkerStatus for Deliverer {
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

fn build_header_map(job: &OutboundJob) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in &job.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(header_name), Ok(header_value)) => {
                headers.insert(header_name, header_value);
            }
            _ => warn!("skipping invalid header `{name}` on HTTP dispatch"),
        }
    }
    headers
}
