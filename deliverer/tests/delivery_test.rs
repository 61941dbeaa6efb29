use std::{sync::Arc, time::Duration};

use courier_deliverer::deliver::{Deliverer, DelivererConfig};
use courier_helpers::{
    envelope::{b64_encode, OutboundJob},
    memory::InMemoryBus,
    redis::BusConnection,
    time::ManualClock,
};
use httptest::{all_of, cycle, matchers::*, responders::*, Expectation, Server};
use pretty_assertions::assert_eq;
use tokio::sync::broadcast;

const OUTBOUND_TOPIC: &str = "acapy_outbound";
const RETRY_TOPIC: &str = "acapy_outbound_retry";
const CLOCK_START: u64 = 1_700_000_000;

fn test_deliverer(
    bus: &InMemoryBus,
    clock: Arc<ManualClock>,
    shutdown_tx: broadcast::Sender<()>,
) -> Deliverer {
    Deliverer::new(
        Box::new(bus.clone()),
        clock,
        shutdown_tx,
        DelivererConfig {
            outbound_topic: OUTBOUND_TOPIC.to_string(),
            retry_topic: RETRY_TOPIC.to_string(),
            blpop_timeout_ms: Some(20),
            empty_queue_wait_ms: Some(20),
            redis_retry_wait_ms: Some(20),
            retry_check_interval_ms: Some(20),
            promotion_batch_size: None,
            dispatch_timeout_secs: None,
            max_retries: None,
            retry: None,
        },
    )
    .unwrap()
}

fn outbound_job_json(url: &str, payload: &[u8], retries: u32) -> String {
    let mut job = OutboundJob::new(url, payload, Default::default());
    job.retries = retries;
    job.to_json().unwrap()
}

async fn wait_until<F>(mut condition: F, description: &str)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {description}"));
}

#[test_log::test(tokio::test)]
async fn test_delivers_job_and_drains_queue_on_success() {
    let server = Server::run();
    server.expect(
        Expectation::matching(all_of![
            request::method_path("POST", "/endpoint"),
            request::body("x"),
        ])
        .times(1)
        .respond_with(status_code(200)),
    );

    let bus = InMemoryBus::new();
    let clock = Arc::new(ManualClock::new(CLOCK_START));
    let (shutdown_tx, _) = broadcast::channel(1);
    let deliverer = test_deliverer(&bus, clock, shutdown_tx.clone());

    let mut producer = bus.clone();
    producer
        .rpush(
            OUTBOUND_TOPIC,
            &outbound_job_json(&server.url("/endpoint").to_string(), b"x", 0),
        )
        .await
        .unwrap();

    let handle = tokio::spawn(async move { deliverer.start().await });

    wait_until(
        || bus.list(OUTBOUND_TOPIC).is_empty(),
        "the outbound queue to drain",
    )
    .await;
    // Allow a full dispatch cycle to complete before checking that no
    // retry was scheduled.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.sorted_set(RETRY_TOPIC), vec![]);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn test_failed_delivery_is_retried_then_succeeds() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/endpoint"))
            .times(2)
            .respond_with(cycle![status_code(500), status_code(200)]),
    );

    let bus = InMemoryBus::new();
    let clock = Arc::new(ManualClock::new(CLOCK_START));
    let (shutdown_tx, _) = broadcast::channel(1);
    let deliverer = test_deliverer(&bus, clock.clone(), shutdown_tx.clone());

    let mut producer = bus.clone();
    producer
        .rpush(
            OUTBOUND_TOPIC,
            &outbound_job_json(&server.url("/endpoint").to_string(), b"x", 0),
        )
        .await
        .unwrap();

    let handle = tokio::spawn(async move { deliverer.start().await });

    // The first failure schedules a retry roughly five seconds out with an
    // incremented retry count.
    wait_until(
        || !bus.sorted_set(RETRY_TOPIC).is_empty(),
        "the retry entry to be scheduled",
    )
    .await;
    let (member, score) = bus.sorted_set(RETRY_TOPIC).remove(0);
    assert_eq!(score, CLOCK_START + 5);
    let retry_job = OutboundJob::from_json(&member).unwrap();
    assert_eq!(retry_job.retries, 1);

    // Once the clock passes the score, the promoter re-queues the job and
    // the second attempt succeeds.
    clock.advance(10);
    wait_until(
        || bus.sorted_set(RETRY_TOPIC).is_empty() && bus.list(OUTBOUND_TOPIC).is_empty(),
        "the retry to be promoted and delivered",
    )
    .await;

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn test_drops_job_after_exhausting_retry_budget() {
    let server = Server::run();
    // Initial dispatch plus five redelivery attempts.
    server.expect(
        Expectation::matching(request::method_path("POST", "/endpoint"))
            .times(6)
            .respond_with(status_code(400)),
    );

    let bus = InMemoryBus::new();
    let clock = Arc::new(ManualClock::new(CLOCK_START));
    let (shutdown_tx, _) = broadcast::channel(1);
    let deliverer = test_deliverer(&bus, clock.clone(), shutdown_tx.clone());

    let mut producer = bus.clone();
    producer
        .rpush(
            OUTBOUND_TOPIC,
            &outbound_job_json(&server.url("/endpoint").to_string(), b"x", 0),
        )
        .await
        .unwrap();

    let handle = tokio::spawn(async move { deliverer.start().await });

    // Step time forward past every backoff window until the budget is
    // exhausted and no further state remains.
    for _ in 0..100 {
        clock.advance(60);
        tokio::time::sleep(Duration::from_millis(50)).await;
        if bus.sorted_set(RETRY_TOPIC).is_empty() && bus.list(OUTBOUND_TOPIC).is_empty() {
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(bus.sorted_set(RETRY_TOPIC), vec![]);
    assert_eq!(bus.list(OUTBOUND_TOPIC), Vec::<String>::new());

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
    // Dropping the server asserts exactly six dispatch attempts were made.
}

#[test_log::test(tokio::test)]
async fn test_due_retry_entry_is_promoted_by_exactly_one_promoter() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/endpoint"))
            .times(1)
            .respond_with(status_code(200)),
    );

    let bus = InMemoryBus::new();
    let clock = Arc::new(ManualClock::new(CLOCK_START));
    let (shutdown_tx, _) = broadcast::channel(1);

    // A retry entry that became due in the past, with two deliverer
    // processes racing to promote it.
    let mut producer = bus.clone();
    producer
        .zadd(
            RETRY_TOPIC,
            &outbound_job_json(&server.url("/endpoint").to_string(), b"x", 1),
            CLOCK_START - 30,
        )
        .await
        .unwrap();

    let first = test_deliverer(&bus, clock.clone(), shutdown_tx.clone());
    let second = test_deliverer(&bus, clock.clone(), shutdown_tx.clone());
    let first_handle = tokio::spawn(async move { first.start().await });
    let second_handle = tokio::spawn(async move { second.start().await });

    wait_until(
        || bus.sorted_set(RETRY_TOPIC).is_empty() && bus.list(OUTBOUND_TOPIC).is_empty(),
        "the retry entry to be promoted and delivered once",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    shutdown_tx.send(()).unwrap();
    first_handle.await.unwrap().unwrap();
    second_handle.await.unwrap().unwrap();
    // Dropping the server asserts the job was dispatched exactly once.
}

#[test_log::test(tokio::test)]
async fn test_malformed_records_are_dropped_without_stopping_the_worker() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/endpoint"))
            .times(1)
            .respond_with(status_code(200)),
    );

    let bus = InMemoryBus::new();
    let clock = Arc::new(ManualClock::new(CLOCK_START));
    let (shutdown_tx, _) = broadcast::channel(1);
    let deliverer = test_deliverer(&bus, clock, shutdown_tx.clone());

    let mut producer = bus.clone();
    producer.rpush(OUTBOUND_TOPIC, "not json").await.unwrap();
    producer
        .rpush(OUTBOUND_TOPIC, "{\"payload\":\"eA==\"}")
        .await
        .unwrap();
    // A job with an unsupported scheme is dropped as well.
    producer
        .rpush(
            OUTBOUND_TOPIC,
            &outbound_job_json("ftp://example.com/inbox", b"x", 0),
        )
        .await
        .unwrap();
    producer
        .rpush(
            OUTBOUND_TOPIC,
            &outbound_job_json(&server.url("/endpoint").to_string(), b"x", 0),
        )
        .await
        .unwrap();

    let handle = tokio::spawn(async move { deliverer.start().await });

    wait_until(
        || bus.list(OUTBOUND_TOPIC).is_empty(),
        "all records to be consumed",
    )
    .await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bus.sorted_set(RETRY_TOPIC), vec![]);

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn test_transient_redis_errors_never_lose_an_accepted_job() {
    let server = Server::run();
    server.expect(
        Expectation::matching(request::method_path("POST", "/endpoint"))
            .times(1)
            .respond_with(status_code(200)),
    );

    let bus = InMemoryBus::new();
    let clock = Arc::new(ManualClock::new(CLOCK_START));
    let (shutdown_tx, _) = broadcast::channel(1);
    let deliverer = test_deliverer(&bus, clock, shutdown_tx.clone());

    let mut producer = bus.clone();
    producer
        .rpush(
            OUTBOUND_TOPIC,
            &outbound_job_json(&server.url("/endpoint").to_string(), b"x", 0),
        )
        .await
        .unwrap();
    // Both worker loops hit simulated connection failures before the
    // dispatch happens.
    bus.fail_next(4);

    let handle = tokio::spawn(async move { deliverer.start().await });

    wait_until(
        || bus.list(OUTBOUND_TOPIC).is_empty(),
        "the job to survive transient errors and be delivered",
    )
    .await;

    shutdown_tx.send(()).unwrap();
    handle.await.unwrap().unwrap();
}

#[test_log::test(tokio::test)]
async fn test_b64_payload_round_trips_through_the_queue() {
    // The queue envelope carries the payload as URL-safe base64.
    let job = OutboundJob::new("http://example.com/endpoint", b"wire-bytes", Default::default());
    assert_eq!(job.payload, b64_encode(b"wire-bytes"));
    let decoded = OutboundJob::from_json(&job.to_json().unwrap()).unwrap();
    assert_eq!(decoded.payload_bytes().unwrap(), b"wire-bytes");
}
