use crate::channel::ChannelId;
use crate::config::Config;
use clap::Parser;
use std::path::PathBuf;

/// Flags override the `SMOKER_*` environment; anything left unset keeps the configured value.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "smoker-producer",
    version,
    about = "Replays smoker temperature samples onto the per-channel queues"
)]
pub struct ProducerArgs {
    /// Broker host.
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// CSV file with `time, smoker, food_a, food_b` rows.
    #[arg(long)]
    pub source: Option<PathBuf>,
    #[arg(long)]
    pub interval_secs: Option<u64>,
    /// Sent verbatim to every queue instead of the file's values.
    #[arg(trailing_var_arg = true)]
    pub message: Vec<String>,
}

impl ProducerArgs {
    pub fn apply(&self, config: &mut Config) {
        apply_broker(config, self.host.as_ref(), self.port);
        if let Some(source) = &self.source {
            config.source_path = source.clone();
        }
        if let Some(interval) = self.interval_secs {
            config.send_interval_secs = interval;
        }
    }

    pub fn override_message(&self) -> Option<String> {
        let message = self.message.join(" ");
        (!message.is_empty()).then_some(message)
    }
}

#[derive(Parser, Debug, Clone)]
#[command(
    name = "smoker-listener",
    version,
    about = "Consumes one channel queue, watches for temperature stalls and logs every reading"
)]
pub struct ListenerArgs {
    #[arg(long, value_enum)]
    pub channel: ChannelId,
    #[arg(long)]
    pub host: Option<String>,
    #[arg(long)]
    pub port: Option<u16>,
    /// Queue to consume; defaults to the channel's configured queue.
    #[arg(long)]
    pub queue: Option<String>,
    #[arg(long)]
    pub prefetch: Option<u16>,
    #[arg(long)]
    pub window_size: Option<usize>,
    #[arg(long)]
    pub threshold: Option<f64>,
    /// Directory the channel's CSV log is appended to.
    #[arg(long)]
    pub sink_dir: Option<PathBuf>,
}

impl ListenerArgs {
    pub fn apply(&self, config: &mut Config) {
        apply_broker(config, self.host.as_ref(), self.port);
        if let Some(queue) = &self.queue {
            config.set_queue(self.channel, queue.clone());
        }
        if let Some(prefetch) = self.prefetch {
            config.prefetch = prefetch;
        }
        if let Some(window_size) = self.window_size {
            config.window_size = window_size;
        }
        if let Some(threshold) = self.threshold {
            config.stall_threshold = threshold;
        }
        if let Some(sink_dir) = &self.sink_dir {
            config.sink_dir = sink_dir.clone();
        }
    }
}

fn apply_broker(config: &mut Config, host: Option<&String>, port: Option<u16>) {
    if let Some(host) = host {
        config.mqtt_host = host.clone();
    }
    if let Some(port) = port {
        config.mqtt_port = port;
    }
}
