use crate::broker::mqtt::queue_session_id;
use crate::broker::validate_queue_name;
use crate::channel::{ChannelId, ChannelSpec};
use crate::stall::{DEFAULT_STALL_THRESHOLD, DEFAULT_WINDOW_SIZE};
use anyhow::{bail, Context, Result};
use dotenvy::dotenv;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_SETUP_CONFIG_PATH: &str = "smoker-setup.json";

fn setup_config_path() -> PathBuf {
    env_optional("SMOKER_SETUP_CONFIG_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SETUP_CONFIG_PATH))
}

/// Optional JSON file with the same knobs as the environment. Environment variables win.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct SetupConfigOverrides {
    #[serde(default)]
    mqtt_host: Option<String>,
    #[serde(default)]
    mqtt_port: Option<u16>,
    #[serde(default)]
    mqtt_username: Option<String>,
    #[serde(default)]
    mqtt_password: Option<String>,
    #[serde(default)]
    mqtt_topic_prefix: Option<String>,
    #[serde(default)]
    smoker_queue: Option<String>,
    #[serde(default)]
    food_a_queue: Option<String>,
    #[serde(default)]
    food_b_queue: Option<String>,
    #[serde(default)]
    source_path: Option<String>,
    #[serde(default)]
    send_interval_secs: Option<u64>,
    #[serde(default)]
    prefetch: Option<u16>,
    #[serde(default)]
    window_size: Option<usize>,
    #[serde(default)]
    stall_threshold: Option<f64>,
    #[serde(default)]
    sink_dir: Option<String>,
}

fn load_setup_config_overrides(path: &Path) -> Option<SetupConfigOverrides> {
    if !path.exists() {
        return None;
    }
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "failed to read setup config; using env defaults"
            );
            return None;
        }
    };
    parse_setup_config_overrides(contents).or_else(|| {
        tracing::warn!(
            path = %path.display(),
            "failed to parse setup config; using env defaults"
        );
        None
    })
}

pub(crate) fn parse_setup_config_overrides(contents: String) -> Option<SetupConfigOverrides> {
    let mut bytes = contents.into_bytes();
    simd_json::serde::from_slice(&mut bytes).ok()
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

pub(crate) fn apply_setup_overrides(
    config: &mut Config,
    overrides: &SetupConfigOverrides,
    env_allows: impl Fn(&str) -> bool,
) {
    if env_allows("SMOKER_MQTT_HOST") {
        if let Some(host) = non_empty(overrides.mqtt_host.as_deref()) {
            config.mqtt_host = host;
        }
    }
    if env_allows("SMOKER_MQTT_PORT") {
        if let Some(port) = overrides.mqtt_port.filter(|v| *v != 0) {
            config.mqtt_port = port;
        }
    }
    if env_allows("SMOKER_MQTT_USERNAME") {
        if let Some(username) = overrides.mqtt_username.as_deref() {
            config.mqtt_username = non_empty(Some(username));
        }
    }
    if env_allows("SMOKER_MQTT_PASSWORD") {
        if let Some(password) = overrides.mqtt_password.as_deref() {
            config.mqtt_password = non_empty(Some(password));
        }
    }
    if env_allows("SMOKER_MQTT_TOPIC_PREFIX") {
        if let Some(prefix) = overrides.mqtt_topic_prefix.as_deref() {
            config.mqtt_topic_prefix = prefix.trim().to_string();
        }
    }
    if env_allows("SMOKER_QUEUE_SMOKER") {
        if let Some(queue) = non_empty(overrides.smoker_queue.as_deref()) {
            config.smoker_queue = queue;
        }
    }
    if env_allows("SMOKER_QUEUE_FOOD_A") {
        if let Some(queue) = non_empty(overrides.food_a_queue.as_deref()) {
            config.food_a_queue = queue;
        }
    }
    if env_allows("SMOKER_QUEUE_FOOD_B") {
        if let Some(queue) = non_empty(overrides.food_b_queue.as_deref()) {
            config.food_b_queue = queue;
        }
    }
    if env_allows("SMOKER_SOURCE_PATH") {
        if let Some(path) = non_empty(overrides.source_path.as_deref()) {
            config.source_path = PathBuf::from(path);
        }
    }
    if env_allows("SMOKER_SEND_INTERVAL_SECS") {
        if let Some(value) = overrides.send_interval_secs {
            config.send_interval_secs = value;
        }
    }
    if env_allows("SMOKER_PREFETCH") {
        if let Some(value) = overrides.prefetch.filter(|v| *v != 0) {
            config.prefetch = value;
        }
    }
    if env_allows("SMOKER_WINDOW_SIZE") {
        if let Some(value) = overrides.window_size.filter(|v| *v != 0) {
            config.window_size = value;
        }
    }
    if env_allows("SMOKER_STALL_THRESHOLD") {
        if let Some(value) = overrides.stall_threshold {
            config.stall_threshold = value;
        }
    }
    if env_allows("SMOKER_SINK_DIR") {
        if let Some(dir) = non_empty(overrides.sink_dir.as_deref()) {
            config.sink_dir = PathBuf::from(dir);
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_topic_prefix: String,
    pub mqtt_keepalive_secs: u64,
    pub mqtt_connect_timeout_secs: u64,
    pub mqtt_client_id: String,
    /// How long the broker keeps a queue's session while no listener is attached.
    pub mqtt_session_expiry_secs: u32,
    pub smoker_queue: String,
    pub food_a_queue: String,
    pub food_b_queue: String,
    pub source_path: PathBuf,
    pub send_interval_secs: u64,
    pub prefetch: u16,
    pub window_size: usize,
    pub stall_threshold: f64,
    pub sink_dir: PathBuf,
    pub otlp_endpoint: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_topic_prefix: "smoker".to_string(),
            mqtt_keepalive_secs: 30,
            mqtt_connect_timeout_secs: 10,
            mqtt_client_id: "smoker-monitor".to_string(),
            mqtt_session_expiry_secs: u32::MAX,
            smoker_queue: ChannelId::Smoker.default_queue().to_string(),
            food_a_queue: ChannelId::FoodA.default_queue().to_string(),
            food_b_queue: ChannelId::FoodB.default_queue().to_string(),
            source_path: PathBuf::from("smoker-temps.csv"),
            send_interval_secs: 30,
            prefetch: 1,
            window_size: DEFAULT_WINDOW_SIZE,
            stall_threshold: DEFAULT_STALL_THRESHOLD,
            sink_dir: PathBuf::from("."),
            otlp_endpoint: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv().ok();

        let defaults = Self::default();
        let mut config = Self {
            mqtt_host: env_string("SMOKER_MQTT_HOST", defaults.mqtt_host),
            mqtt_port: env_parse("SMOKER_MQTT_PORT", defaults.mqtt_port)?,
            mqtt_username: env_optional("SMOKER_MQTT_USERNAME"),
            mqtt_password: env_optional("SMOKER_MQTT_PASSWORD"),
            mqtt_topic_prefix: env_string("SMOKER_MQTT_TOPIC_PREFIX", defaults.mqtt_topic_prefix),
            mqtt_keepalive_secs: env_parse(
                "SMOKER_MQTT_KEEPALIVE_SECS",
                defaults.mqtt_keepalive_secs,
            )?,
            mqtt_connect_timeout_secs: env_parse(
                "SMOKER_MQTT_CONNECT_TIMEOUT_SECS",
                defaults.mqtt_connect_timeout_secs,
            )?,
            mqtt_client_id: env_string("SMOKER_MQTT_CLIENT_ID", defaults.mqtt_client_id),
            mqtt_session_expiry_secs: env_parse(
                "SMOKER_MQTT_SESSION_EXPIRY_SECS",
                defaults.mqtt_session_expiry_secs,
            )?,
            smoker_queue: env_string("SMOKER_QUEUE_SMOKER", defaults.smoker_queue),
            food_a_queue: env_string("SMOKER_QUEUE_FOOD_A", defaults.food_a_queue),
            food_b_queue: env_string("SMOKER_QUEUE_FOOD_B", defaults.food_b_queue),
            source_path: env_optional("SMOKER_SOURCE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.source_path),
            send_interval_secs: env_parse(
                "SMOKER_SEND_INTERVAL_SECS",
                defaults.send_interval_secs,
            )?,
            prefetch: env_parse("SMOKER_PREFETCH", defaults.prefetch)?,
            window_size: env_parse("SMOKER_WINDOW_SIZE", defaults.window_size)?,
            stall_threshold: env_parse("SMOKER_STALL_THRESHOLD", defaults.stall_threshold)?,
            sink_dir: env_optional("SMOKER_SINK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.sink_dir),
            otlp_endpoint: env_optional("OTEL_EXPORTER_OTLP_ENDPOINT"),
        };

        if let Some(overrides) = load_setup_config_overrides(&setup_config_path()) {
            apply_setup_overrides(&mut config, &overrides, |key| env_optional(key).is_none());
        }

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefetch == 0 {
            bail!("prefetch must be at least 1");
        }
        if self.window_size == 0 {
            bail!("window size must be at least 1");
        }
        if !self.stall_threshold.is_finite() || self.stall_threshold < 0.0 {
            bail!(
                "stall threshold must be a finite, non-negative number (got {})",
                self.stall_threshold
            );
        }
        for channel in self.channels() {
            validate_queue_name(&channel.queue)
                .with_context(|| format!("bad queue name for channel {}", channel.id))?;
        }
        Ok(())
    }

    pub fn queue_for(&self, channel: ChannelId) -> &str {
        match channel {
            ChannelId::Smoker => &self.smoker_queue,
            ChannelId::FoodA => &self.food_a_queue,
            ChannelId::FoodB => &self.food_b_queue,
        }
    }

    pub fn set_queue(&mut self, channel: ChannelId, queue: String) {
        match channel {
            ChannelId::Smoker => self.smoker_queue = queue,
            ChannelId::FoodA => self.food_a_queue = queue,
            ChannelId::FoodB => self.food_b_queue = queue,
        }
    }

    pub fn channel(&self, channel: ChannelId) -> ChannelSpec {
        ChannelSpec::new(channel, self.queue_for(channel))
    }

    pub fn channels(&self) -> Vec<ChannelSpec> {
        ChannelId::ALL.iter().map(|id| self.channel(*id)).collect()
    }

    pub fn sink_path(&self, channel: ChannelId) -> PathBuf {
        self.sink_dir.join(channel.sink_file_name())
    }

    /// Listeners need a stable client id per queue so the broker can resume their session.
    pub fn listener_client_id(&self, queue: &str) -> String {
        queue_session_id(&self.mqtt_client_id, queue)
    }

    pub fn producer_client_id(&self) -> String {
        format!("{}-producer-{}", self.mqtt_client_id, std::process::id())
    }

    pub fn send_interval(&self) -> Duration {
        Duration::from_secs(self.send_interval_secs)
    }

    pub fn mqtt_keepalive(&self) -> Duration {
        Duration::from_secs(self.mqtt_keepalive_secs)
    }

    pub fn mqtt_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.mqtt_connect_timeout_secs.max(1))
    }
}

fn env_string(key: &str, default: String) -> String {
    env_optional(key).unwrap_or(default)
}

fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_optional(key) {
        Some(value) => value.parse::<T>().with_context(|| format!("invalid {key}")),
        None => Ok(default),
    }
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}
