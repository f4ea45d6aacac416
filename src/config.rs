use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, Result, anyhow};
use jsonschema::{JSONSchema, ValidationError};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Knobs the reducer reads on every transition. Immutable after startup;
/// handed to each component at composition time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_fallback_form")]
    pub fallback_form: String,
    #[serde(default = "default_reset_shortcode")]
    pub reset_shortcode: String,
    /// Hosting application id; hand-overs addressed to anyone else are
    /// ignored.
    #[serde(default)]
    pub app_id: Option<String>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fallback_form: default_fallback_form(),
            reset_shortcode: default_reset_shortcode(),
            app_id: None,
        }
    }
}

fn default_fallback_form() -> String {
    "FALLBACK".to_string()
}

fn default_reset_shortcode() -> String {
    "reset".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub base_url: String,
    #[serde(default = "default_send_retries")]
    pub retries: u32,
    #[serde(with = "humantime_serde", default = "default_backoff_base")]
    pub backoff_base: Duration,
    #[serde(default = "default_transient_codes")]
    pub transient_codes: Vec<i64>,
}

fn default_send_retries() -> u32 {
    5
}

fn default_backoff_base() -> Duration {
    Duration::from_millis(400)
}

fn default_transient_codes() -> Vec<i64> {
    vec![1200, 551]
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL of derived state snapshots; expiry forces a log replay.
    #[serde(with = "humantime_serde", default = "default_state_ttl")]
    pub state_ttl: Duration,
    /// TTL of form, credential and profile lookups.
    #[serde(with = "humantime_serde", default = "default_lookup_ttl")]
    pub lookup_ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            state_ttl: default_state_ttl(),
            lookup_ttl: default_lookup_ttl(),
        }
    }
}

fn default_state_ttl() -> Duration {
    Duration::from_secs(60 * 60)
}

fn default_lookup_ttl() -> Duration {
    Duration::from_secs(10 * 60)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateStoreConfig {
    /// How many recent log entries a replay may fetch.
    #[serde(default = "default_replay_window")]
    pub replay_window: usize,
}

impl Default for StateStoreConfig {
    fn default() -> Self {
        Self {
            replay_window: default_replay_window(),
        }
    }
}

fn default_replay_window() -> usize {
    500
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    #[serde(default = "default_lanes")]
    pub lanes: usize,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: usize,
    #[serde(with = "humantime_serde", default = "default_restart_window")]
    pub restart_window: Duration,
    #[serde(with = "humantime_serde", default = "default_cooldown")]
    pub cooldown: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            lanes: default_lanes(),
            max_restarts: default_max_restarts(),
            restart_window: default_restart_window(),
            cooldown: default_cooldown(),
        }
    }
}

fn default_lanes() -> usize {
    8
}

fn default_max_restarts() -> usize {
    5
}

fn default_restart_window() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_cooldown() -> Duration {
    Duration::from_secs(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngressConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
    #[serde(default = "default_lane_queue_capacity")]
    pub lane_queue_capacity: usize,
}

impl Default for IngressConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            lane_queue_capacity: default_lane_queue_capacity(),
        }
    }
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("replyflow.sock")
}

fn default_lane_queue_capacity() -> usize {
    64
}

/// Survey-management service the orchestrator fetches forms and page
/// credentials from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    pub base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinksConfig {
    pub nats_url: String,
    /// Intake endpoint machine reports are posted back to.
    pub feedback_url: String,
    #[serde(default = "default_state_subject")]
    pub state_subject: String,
    #[serde(default = "default_responses_subject")]
    pub responses_subject: String,
    #[serde(default = "default_payments_subject")]
    pub payments_subject: String,
    #[serde(default = "default_handoffs_subject")]
    pub handoffs_subject: String,
}

fn default_state_subject() -> String {
    "replyflow.states".to_string()
}

fn default_responses_subject() -> String {
    "replyflow.responses".to_string()
}

fn default_payments_subject() -> String {
    "replyflow.payments".to_string()
}

fn default_handoffs_subject() -> String {
    "replyflow.handoffs".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LoggingRotation {
    Daily,
    Hourly,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_logging_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_logging_filter")]
    pub filter: String,
    #[serde(default = "default_logging_rotation")]
    pub rotation: LoggingRotation,
    #[serde(default = "default_logging_retention_days")]
    pub retention_days: usize,
    #[serde(default = "default_enabled_true")]
    pub stderr_warn_enabled: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_logging_dir(),
            filter: default_logging_filter(),
            rotation: default_logging_rotation(),
            retention_days: default_logging_retention_days(),
            stderr_warn_enabled: true,
        }
    }
}

fn default_logging_dir() -> PathBuf {
    PathBuf::from("./logs/replyflow")
}

fn default_logging_filter() -> String {
    "info".to_string()
}

fn default_logging_rotation() -> LoggingRotation {
    LoggingRotation::Daily
}

fn default_logging_retention_days() -> usize {
    14
}

fn default_enabled_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineSettings,
    pub channel: ChannelConfig,
    #[serde(default)]
    pub caches: CacheConfig,
    #[serde(default)]
    pub statestore: StateStoreConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub ingress: IngressConfig,
    pub resources: ResourcesConfig,
    pub sinks: SinksConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    pub fn load(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("failed to read {}", config_path.display()))?;
        let config_value: Value = json5::from_str(&config_content)
            .with_context(|| format!("failed to parse {}", config_path.display()))?;

        let config_base = config_path.parent().unwrap_or_else(|| Path::new("."));
        let schema_path = resolve_schema_path(config_base, &config_value)?;
        validate_against_schema(&config_value, &schema_path)?;

        let mut config: Config =
            serde_json::from_value(config_value).context("failed to deserialize config")?;

        if !config.ingress.socket_path.is_absolute() {
            config.ingress.socket_path = config_base.join(&config.ingress.socket_path);
        }

        Ok(config)
    }
}

fn resolve_schema_path(config_base: &Path, config_value: &Value) -> Result<PathBuf> {
    if let Some(path_text) = config_value.get("$schema").and_then(|value| value.as_str()) {
        let configured = PathBuf::from(path_text);
        if configured.is_absolute() {
            return Ok(configured);
        }
        return Ok(config_base.join(&configured));
    }

    let local_default = config_base.join("replyflow.schema.json");
    if local_default.exists() {
        return Ok(local_default);
    }

    Err(anyhow!(
        "unable to resolve schema path: expected $schema in config or replyflow.schema.json"
    ))
}

fn validate_against_schema(config_value: &Value, schema_path: &Path) -> Result<()> {
    let schema_content = fs::read_to_string(schema_path)
        .with_context(|| format!("failed to read schema {}", schema_path.display()))?;
    let schema: Value = serde_json::from_str(&schema_content)
        .with_context(|| format!("failed to parse schema {}", schema_path.display()))?;

    let compiled =
        JSONSchema::compile(&schema).map_err(|e| anyhow!("failed to compile schema: {e}"))?;

    match compiled.validate(config_value) {
        Ok(()) => Ok(()),
        Err(errors_iter) => {
            let validation_errors: Vec<ValidationError> = errors_iter.collect();
            let messages: Vec<String> = validation_errors
                .into_iter()
                .map(|error| error.to_string())
                .collect();
            Err(anyhow!("config validation failed: {}", messages.join("; ")))
        }
    }
}
