use crate::channel::ChannelSpec;
use crate::reading::{Reading, Value};
use crate::sink::RecordSink;
use crate::stall::{StallAlert, StallWindow};
use anyhow::{Context, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct HandleOutcome {
    pub reading: Reading,
    pub alert: Option<StallAlert>,
}

/// Everything one listener owns for its channel: the stall window and the record log.
pub struct ChannelContext<S> {
    channel: ChannelSpec,
    window: StallWindow,
    sink: S,
    processed: u64,
    raw_readings: u64,
    alerts_raised: u64,
}

impl<S: RecordSink> ChannelContext<S> {
    pub fn new(channel: ChannelSpec, window: StallWindow, sink: S) -> Self {
        Self {
            channel,
            window,
            sink,
            processed: 0,
            raw_readings: 0,
            alerts_raised: 0,
        }
    }

    /// Decodes one message body, feeds numeric values to the stall window and appends the raw
    /// fields to the sink. Only sink I/O can fail.
    pub fn handle(&mut self, body: &[u8]) -> Result<HandleOutcome> {
        let reading = Reading::decode(self.channel.id, body);

        let alert = match &reading.value {
            Value::Numeric(value) => self.window.insert(*value),
            Value::Raw(raw) => {
                self.raw_readings += 1;
                tracing::debug!(
                    channel = %self.channel.id,
                    value = %raw,
                    "non-numeric reading; skipping stall check"
                );
                None
            }
        };

        if let Some(alert) = &alert {
            self.alerts_raised += 1;
            tracing::warn!(
                channel = %self.channel.id,
                queue = %self.channel.queue,
                timestamp = %reading.timestamp,
                oldest = alert.oldest,
                newest = alert.newest,
                delta = alert.delta,
                window = self.window.capacity(),
                "{}!",
                self.channel.id.alert_label()
            );
        }

        self.sink
            .append(&reading.raw_fields)
            .with_context(|| format!("failed to log reading for channel {}", self.channel.id))?;
        self.processed += 1;

        Ok(HandleOutcome { reading, alert })
    }

    pub fn flush(&mut self) -> Result<()> {
        self.sink.flush()
    }

    pub fn channel(&self) -> &ChannelSpec {
        &self.channel
    }

    pub fn window(&self) -> &StallWindow {
        &self.window
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    pub fn raw_readings(&self) -> u64 {
        self.raw_readings
    }

    pub fn alerts_raised(&self) -> u64 {
        self.alerts_raised
    }
}
