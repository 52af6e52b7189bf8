use super::{consume, run_listener, ListenerExit};
use crate::broker::memory::{MemoryBroker, MemoryConsumer};
use crate::broker::{BrokerError, Delivery, DeliveryTag, QueueConsumer, QueuePublisher};
use crate::channel::{ChannelId, ChannelSpec};
use crate::handler::test_support::MemorySink;
use crate::handler::ChannelContext;
use crate::sink::CsvSink;
use crate::stall::StallWindow;
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const QUEUE: &str = "temp3";

async fn publish(broker: &MemoryBroker, bodies: impl IntoIterator<Item = String>) {
    let mut publisher = broker.publisher();
    publisher.declare_queue(QUEUE).await.unwrap();
    for body in bodies {
        publisher.publish(QUEUE, Bytes::from(body)).await.unwrap();
    }
}

async fn cancel_when_drained(broker: &MemoryBroker, shutdown: &CancellationToken) {
    while broker.depth(QUEUE) > 0 {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    shutdown.cancel();
}

fn food_b_context(sink: MemorySink) -> ChannelContext<MemorySink> {
    ChannelContext::new(
        ChannelSpec::new(ChannelId::FoodB, QUEUE),
        StallWindow::new(20, 1.0),
        sink,
    )
}

/// Fails the first acknowledgment as if the connection dropped right before the ack left.
struct AckDropsOnce {
    inner: MemoryConsumer,
    failed: bool,
}

impl QueueConsumer for AckDropsOnce {
    async fn next_delivery(&mut self) -> Result<Delivery, BrokerError> {
        self.inner.next_delivery().await
    }

    async fn ack(&mut self, tag: DeliveryTag) -> Result<(), BrokerError> {
        if !self.failed {
            self.failed = true;
            return Err(BrokerError::Disconnected("connection reset".into()));
        }
        self.inner.ack(tag).await
    }

    fn in_flight(&self) -> usize {
        self.inner.in_flight()
    }

    async fn close(self) -> Result<(), BrokerError> {
        self.inner.close().await
    }
}

#[tokio::test]
async fn plateau_alerts_on_every_insertion_once_the_window_is_full() {
    let broker = MemoryBroker::new();
    publish(&broker, (1..=25).map(|i| format!("t{i},100.0"))).await;

    let consumer = broker.consumer(QUEUE, 1).unwrap();
    let mut ctx = food_b_context(MemorySink::default());
    let shutdown = CancellationToken::new();

    let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            consume(consumer, &mut ctx, &shutdown),
            cancel_when_drained(&broker, &shutdown)
        )
    })
    .await
    .expect("listener drained the queue");

    assert_eq!(result.unwrap(), ListenerExit::Cancelled);
    assert_eq!(ctx.processed(), 25);
    assert_eq!(ctx.alerts_raised(), 6);
    let timestamps: Vec<_> = ctx.sink().rows.iter().map(|row| row[0].clone()).collect();
    let expected: Vec<_> = (1..=25).map(|i| format!("t{i}")).collect();
    assert_eq!(timestamps, expected);
    assert_eq!(broker.max_in_flight(QUEUE), 1);
    assert_eq!(broker.open_consumers(QUEUE), 0);
    assert!(ctx.sink().flushes >= 1);
}

#[tokio::test]
async fn rising_temperatures_never_alert() {
    let broker = MemoryBroker::new();
    publish(&broker, (0..30).map(|i| format!("t{i},{}", i as f64 * 5.0))).await;

    let consumer = broker.consumer(QUEUE, 1).unwrap();
    let mut ctx = food_b_context(MemorySink::default());
    let shutdown = CancellationToken::new();

    let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            consume(consumer, &mut ctx, &shutdown),
            cancel_when_drained(&broker, &shutdown)
        )
    })
    .await
    .expect("listener drained the queue");

    assert!(result.is_ok());
    assert_eq!(ctx.processed(), 30);
    assert_eq!(ctx.alerts_raised(), 0);
}

#[tokio::test]
async fn non_numeric_values_are_logged_and_acknowledged() {
    let broker = MemoryBroker::new();
    publish(
        &broker,
        [
            "Time (UTC),Channel3 Food B Temp".to_string(),
            "t1,N/A".to_string(),
            "t2,68.4".to_string(),
        ],
    )
    .await;

    let consumer = broker.consumer(QUEUE, 1).unwrap();
    let mut ctx = food_b_context(MemorySink::default());
    let shutdown = CancellationToken::new();

    let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            consume(consumer, &mut ctx, &shutdown),
            cancel_when_drained(&broker, &shutdown)
        )
    })
    .await
    .expect("listener drained the queue");

    assert!(result.is_ok());
    assert_eq!(ctx.raw_readings(), 2);
    assert_eq!(ctx.window().len(), 1);
    assert_eq!(
        ctx.sink().rows,
        vec![
            vec!["Time (UTC)", "Channel3 Food B Temp"],
            vec!["t1", "N/A"],
            vec!["t2", "68.4"],
        ]
    );
    assert_eq!(broker.depth(QUEUE), 0);
}

#[tokio::test]
async fn cancellation_before_the_first_wait_consumes_nothing() {
    let broker = MemoryBroker::new();
    publish(&broker, ["t1,70.0".to_string()]).await;

    let consumer = broker.consumer(QUEUE, 1).unwrap();
    let mut ctx = food_b_context(MemorySink::default());
    let shutdown = CancellationToken::new();
    shutdown.cancel();

    let exit = consume(consumer, &mut ctx, &shutdown).await.unwrap();
    assert_eq!(exit, ListenerExit::Cancelled);
    assert_eq!(ctx.processed(), 0);
    assert_eq!(broker.depth(QUEUE), 1);
    assert_eq!(broker.open_consumers(QUEUE), 0);
}

#[tokio::test]
async fn cancellation_while_idle_stops_the_wait() {
    let broker = MemoryBroker::new();
    broker.declare_queue(QUEUE).unwrap();
    let mut consumer = broker.consumer(QUEUE, 1).unwrap();
    let mut ctx = food_b_context(MemorySink::default());
    let shutdown = CancellationToken::new();

    let canceller = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        canceller.cancel();
    });

    let exit = tokio::time::timeout(
        Duration::from_secs(5),
        run_listener(&mut consumer, &mut ctx, &shutdown),
    )
    .await
    .expect("cancellation interrupts the wait")
    .unwrap();
    assert_eq!(exit, ListenerExit::Cancelled);
}

#[tokio::test]
async fn handler_failure_leaves_the_message_for_redelivery() {
    let broker = MemoryBroker::new();
    publish(&broker, ["t1,70.0", "t2,70.1", "t3,70.2"].map(String::from)).await;

    let consumer = broker.consumer(QUEUE, 1).unwrap();
    let mut ctx = food_b_context(MemorySink::failing_after(1));
    let shutdown = CancellationToken::new();

    let err = consume(consumer, &mut ctx, &shutdown).await.unwrap_err();
    assert!(format!("{err:#}").contains("disk full"));
    assert_eq!(ctx.processed(), 1);
    assert_eq!(broker.open_consumers(QUEUE), 0);
    assert_eq!(broker.ready_bodies(QUEUE), vec!["t2,70.1", "t3,70.2"]);

    let mut consumer = broker.consumer(QUEUE, 1).unwrap();
    let delivery = consumer.next_delivery().await.unwrap();
    assert_eq!(delivery.body, "t2,70.1");
    assert!(delivery.redelivered);
}

#[tokio::test]
async fn lost_ack_means_the_reading_is_processed_twice() {
    let dir = tempfile::tempdir().unwrap();
    let sink_path = dir.path().join("FoodB.csv");
    let broker = MemoryBroker::new();
    publish(&broker, ["t1,70.0".to_string()]).await;

    {
        let consumer = AckDropsOnce {
            inner: broker.consumer(QUEUE, 1).unwrap(),
            failed: false,
        };
        let mut ctx = ChannelContext::new(
            ChannelSpec::new(ChannelId::FoodB, QUEUE),
            StallWindow::new(20, 1.0),
            CsvSink::open(&sink_path).unwrap(),
        );
        let shutdown = CancellationToken::new();
        let err = consume(consumer, &mut ctx, &shutdown).await.unwrap_err();
        assert!(format!("{err:#}").contains("failed to acknowledge"));
    }
    assert_eq!(broker.depth(QUEUE), 1);

    let consumer = broker.consumer(QUEUE, 1).unwrap();
    let mut ctx = ChannelContext::new(
        ChannelSpec::new(ChannelId::FoodB, QUEUE),
        StallWindow::new(20, 1.0),
        CsvSink::open(&sink_path).unwrap(),
    );
    let shutdown = CancellationToken::new();
    let (result, _) = tokio::time::timeout(Duration::from_secs(5), async {
        tokio::join!(
            consume(consumer, &mut ctx, &shutdown),
            cancel_when_drained(&broker, &shutdown)
        )
    })
    .await
    .expect("listener drained the queue");
    assert!(result.is_ok());

    let contents = std::fs::read_to_string(&sink_path).unwrap();
    assert_eq!(contents, "t1,70.0\nt1,70.0\n");
}
