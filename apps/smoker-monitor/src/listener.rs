use crate::broker::mqtt::{MqttConsumer, MqttSettings};
use crate::broker::QueueConsumer;
use crate::channel::ChannelSpec;
use crate::config::Config;
use crate::handler::ChannelContext;
use crate::sink::{CsvSink, RecordSink};
use crate::stall::StallWindow;
use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The operator asked us to stop.
    Cancelled,
}

/// Receive loop: one delivery at a time, acknowledged only after the handler finished.
///
/// Cancellation is observed before every wait for the next delivery, never in the middle of
/// handling one. Any broker or sink error ends the loop with the current delivery still
/// unacknowledged.
pub async fn run_listener<C, S>(
    consumer: &mut C,
    ctx: &mut ChannelContext<S>,
    shutdown: &CancellationToken,
) -> Result<ListenerExit>
where
    C: QueueConsumer,
    S: RecordSink,
{
    tracing::info!(
        channel = %ctx.channel().id,
        queue = %ctx.channel().queue,
        "ready for work; press CTRL+C to exit"
    );

    loop {
        if shutdown.is_cancelled() {
            return Ok(ListenerExit::Cancelled);
        }

        let delivery = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(ListenerExit::Cancelled),
            delivery = consumer.next_delivery() => delivery.context("failed to receive message")?,
        };

        tracing::info!(
            queue = %ctx.channel().queue,
            tag = delivery.tag,
            redelivered = delivery.redelivered,
            body = %String::from_utf8_lossy(&delivery.body),
            "received"
        );

        ctx.handle(&delivery.body)?;

        consumer
            .ack(delivery.tag)
            .await
            .with_context(|| format!("failed to acknowledge delivery {}", delivery.tag))?;
        tracing::debug!(tag = delivery.tag, "done");
    }
}

/// Runs the receive loop and then releases the connection and flushes the sink, whichever
/// way the loop ended.
pub async fn consume<C, S>(
    mut consumer: C,
    ctx: &mut ChannelContext<S>,
    shutdown: &CancellationToken,
) -> Result<ListenerExit>
where
    C: QueueConsumer,
    S: RecordSink,
{
    let result = run_listener(&mut consumer, ctx, shutdown).await;

    match &result {
        Ok(ListenerExit::Cancelled) => {
            tracing::info!("user interrupted continuous listening process")
        }
        Err(err) => tracing::error!(error = %format!("{err:#}"), "listener failed"),
    }

    tracing::info!(
        queue = %ctx.channel().queue,
        unacked = consumer.in_flight(),
        "closing connection"
    );
    if let Err(err) = consumer.close().await {
        tracing::warn!(error = %err, "broker connection did not close cleanly");
    }
    if let Err(err) = ctx.flush() {
        tracing::warn!(error = %format!("{err:#}"), "failed to flush channel sink");
    }

    tracing::info!(
        processed = ctx.processed(),
        raw = ctx.raw_readings(),
        alerts = ctx.alerts_raised(),
        "listener stopped"
    );
    result
}

/// Wires a listener for one channel against the configured MQTT broker.
pub async fn serve(
    config: &Config,
    channel: ChannelSpec,
    shutdown: CancellationToken,
) -> Result<ListenerExit> {
    let sink_path = config.sink_path(channel.id);
    let sink = CsvSink::open(&sink_path)?;
    tracing::info!(channel = %channel.id, sink = %sink.path().display(), "logging readings");
    let window = StallWindow::new(config.window_size, config.stall_threshold);
    let mut ctx = ChannelContext::new(channel.clone(), window, sink);

    let settings = MqttSettings::from_config(config, config.listener_client_id(&channel.queue));
    let consumer = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            tracing::info!("user interrupted listener before the broker connection was up");
            return Ok(ListenerExit::Cancelled);
        }
        consumer = MqttConsumer::connect(&settings, &channel.queue, config.prefetch) => consumer
            .with_context(|| format!("verify the broker is running on host={}", config.mqtt_host))?,
    };

    consume(consumer, &mut ctx, &shutdown).await
}

#[cfg(test)]
mod tests;
