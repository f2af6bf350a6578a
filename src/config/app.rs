//! Root configuration and loaders.

use serde::{Deserialize, Serialize};

use super::{ExporterConfig, ProcessorConfig, SchedulerConfig, StoreBackendConfig};

/// Environment variable prefix understood by [`AppConfig::from_env`].
pub const ENV_PREFIX: &str = "RESERVATION_";

/// Root configuration for a scheduler deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Provider limits and reservation tunables.
    pub scheduler: SchedulerConfig,
    /// Request processor and worker pool settings.
    pub processor: ProcessorConfig,
    /// Metrics exporter settings.
    pub exporter: ExporterConfig,
    /// Store backend selection.
    pub store: StoreBackendConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.scheduler
            .validate()
            .map_err(|e| format!("scheduler invalid: {e}"))?;
        self.processor
            .validate()
            .map_err(|e| format!("processor invalid: {e}"))?;
        self.exporter
            .validate()
            .map_err(|e| format!("exporter invalid: {e}"))?;
        if let StoreBackendConfig::Redis { url } = &self.store {
            if url.is_empty() {
                return Err("store invalid: redis url must not be empty".into());
            }
        }
        Ok(())
    }

    /// Parse configuration from a JSON string and validate.
    pub fn from_json_str(input: &str) -> Result<Self, String> {
        let cfg: Self = serde_json::from_str(input).map_err(|e| format!("parse error: {e}"))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load `.env` (if present) and overlay `RESERVATION_*` variables on the defaults.
    pub fn from_env() -> Result<Self, String> {
        // A missing .env file is the normal case outside development.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup, e.g. a map in tests.
    ///
    /// Recognised keys (all prefixed with [`ENV_PREFIX`]): `MAX_RPM`, `MAX_TPM`,
    /// `HEADROOM`, `WORKER_SLOT_PENALTY_MS`, `TPM_BACKOFF_SCALE`, `KEY_PREFIX`,
    /// `WORKER_COUNT`, `QUEUE_DEPTH`, `EXPECTED_OUTPUT_TOKENS`,
    /// `INSTRUCTION_OVERHEAD_TOKENS`, `HARD_TOKEN_CEILING`, `MAX_JITTER_MS`,
    /// `MAX_RATE_LIMIT_RETRIES`, `METRICS_INTERVAL_SECS`, `METRICS_NAMESPACE`,
    /// `REDIS_URL`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, String>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));
        let mut cfg = Self::default();

        if let Some(v) = get("MAX_RPM") {
            cfg.scheduler.max_requests_per_minute = parse_var("MAX_RPM", &v)?;
        }
        if let Some(v) = get("MAX_TPM") {
            cfg.scheduler.max_tokens_per_minute = parse_var("MAX_TPM", &v)?;
        }
        if let Some(v) = get("HEADROOM") {
            cfg.scheduler.headroom = parse_var("HEADROOM", &v)?;
        }
        if let Some(v) = get("WORKER_SLOT_PENALTY_MS") {
            cfg.scheduler.worker_slot_penalty_ms = parse_var("WORKER_SLOT_PENALTY_MS", &v)?;
        }
        if let Some(v) = get("TPM_BACKOFF_SCALE") {
            cfg.scheduler.tpm_backoff_scale = parse_var("TPM_BACKOFF_SCALE", &v)?;
        }
        if let Some(v) = get("KEY_PREFIX") {
            cfg.scheduler.key_prefix = v;
        }
        if let Some(v) = get("WORKER_COUNT") {
            cfg.processor.worker_count = parse_var("WORKER_COUNT", &v)?;
        }
        if let Some(v) = get("QUEUE_DEPTH") {
            cfg.processor.queue_depth = parse_var("QUEUE_DEPTH", &v)?;
        }
        if let Some(v) = get("EXPECTED_OUTPUT_TOKENS") {
            cfg.processor.expected_output_tokens = parse_var("EXPECTED_OUTPUT_TOKENS", &v)?;
        }
        if let Some(v) = get("INSTRUCTION_OVERHEAD_TOKENS") {
            cfg.processor.instruction_overhead_tokens =
                parse_var("INSTRUCTION_OVERHEAD_TOKENS", &v)?;
        }
        if let Some(v) = get("HARD_TOKEN_CEILING") {
            cfg.processor.hard_token_ceiling = parse_var("HARD_TOKEN_CEILING", &v)?;
        }
        if let Some(v) = get("MAX_JITTER_MS") {
            cfg.processor.max_jitter_ms = parse_var("MAX_JITTER_MS", &v)?;
        }
        if let Some(v) = get("MAX_RATE_LIMIT_RETRIES") {
            cfg.processor.retry.max_rate_limit_retries =
                Some(parse_var("MAX_RATE_LIMIT_RETRIES", &v)?);
        }
        if let Some(v) = get("METRICS_INTERVAL_SECS") {
            cfg.exporter.interval_secs = parse_var("METRICS_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = get("METRICS_NAMESPACE") {
            cfg.exporter.namespace = v;
        }
        if let Some(url) = get("REDIS_URL") {
            cfg.store = StoreBackendConfig::Redis { url };
        }

        cfg.validate()?;
        Ok(cfg)
    }
}

fn parse_var<T>(name: &str, raw: &str) -> Result<T, String>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e| format!("{ENV_PREFIX}{name}: cannot parse `{raw}`: {e}"))
}
