use crate::broker::mqtt::{MqttPublisher, MqttSettings};
use crate::broker::QueuePublisher;
use crate::channel::ChannelSpec;
use crate::config::Config;
use crate::source::{CsvSource, SourceRecord};
use anyhow::{Context, Result};
use bytes::Bytes;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct ProducerPlan {
    pub channels: Vec<ChannelSpec>,
    /// Pause between consecutive source records.
    pub send_interval: Duration,
    /// Sent verbatim to every channel in place of the record's own fields.
    pub override_message: Option<String>,
}

impl ProducerPlan {
    pub fn from_config(config: &Config, override_message: Option<String>) -> Self {
        Self {
            channels: config.channels(),
            send_interval: config.send_interval(),
            override_message: override_message.filter(|m| !m.is_empty()),
        }
    }

    fn body_for(&self, record: &SourceRecord, channel: &ChannelSpec) -> String {
        match &self.override_message {
            Some(message) => message.clone(),
            None => record.channel_message(channel.id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProducerSummary {
    pub records: u64,
    pub published: u64,
    pub failed: u64,
    pub cancelled: bool,
}

/// Publishes one message per channel for every source record, pacing between records.
pub async fn run_producer<P, I>(
    publisher: &mut P,
    records: I,
    plan: &ProducerPlan,
    shutdown: &CancellationToken,
) -> Result<ProducerSummary>
where
    P: QueuePublisher,
    I: IntoIterator<Item = Result<SourceRecord>>,
{
    for channel in &plan.channels {
        publisher
            .declare_queue(&channel.queue)
            .await
            .with_context(|| format!("failed to declare queue {}", channel.queue))?;
    }

    let mut summary = ProducerSummary::default();
    for record in records {
        if summary.records > 0 {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    summary.cancelled = true;
                    break;
                }
                _ = tokio::time::sleep(plan.send_interval) => {}
            }
        } else if shutdown.is_cancelled() {
            summary.cancelled = true;
            break;
        }

        let record = record?;
        for channel in &plan.channels {
            let body = plan.body_for(&record, channel);
            match publisher.publish(&channel.queue, Bytes::from(body.clone())).await {
                Ok(()) => {
                    summary.published += 1;
                    tracing::info!(queue = %channel.queue, message = %body, "sent");
                }
                Err(err) if err.is_fatal() => {
                    return Err(err).with_context(|| format!("failed to publish to {}", channel.queue));
                }
                Err(err) => {
                    summary.failed += 1;
                    tracing::warn!(queue = %channel.queue, error = %err, "publish failed; not retrying");
                }
            }
        }
        summary.records += 1;
    }

    Ok(summary)
}

/// Streams the configured CSV file to the configured MQTT broker.
pub async fn serve(
    config: &Config,
    override_message: Option<String>,
    shutdown: CancellationToken,
) -> Result<ProducerSummary> {
    let source = CsvSource::open(&config.source_path)?;
    let plan = ProducerPlan::from_config(config, override_message);

    let settings = MqttSettings::from_config(config, config.producer_client_id());
    let mut publisher = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            tracing::info!("user interrupted producer before the broker connection was up");
            return Ok(ProducerSummary {
                cancelled: true,
                ..ProducerSummary::default()
            });
        }
        publisher = MqttPublisher::connect(&settings) => publisher
            .with_context(|| format!("verify the broker is running on host={}", config.mqtt_host))?,
    };

    let result = run_producer(&mut publisher, source, &plan, &shutdown).await;

    if let Err(err) = publisher.close().await {
        tracing::warn!(error = %err, "broker connection did not close cleanly");
    }

    let summary = result?;
    tracing::info!(
        records = summary.records,
        published = summary.published,
        failed = summary.failed,
        cancelled = summary.cancelled,
        "producer finished"
    );
    Ok(summary)
}
