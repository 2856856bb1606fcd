use std::env;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u16(profile: &str, key: &str, default: u16) -> u16 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u32(profile: &str, key: &str, default: u32) -> u32 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_list(profile: &str, key: &str, default: &str) -> Vec<String> {
    profiled_env_or(profile, key, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub store: StoreConfig,
    pub broker: BrokerConfig,
    pub scheduler: SchedulerSettings,
    pub consumer: ConsumerSettings,
    pub source: SourceConfig,
    pub admin: AdminConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `SIPHON_PROFILE` env var. When set (e.g. `PROD`),
    /// every key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("SIPHON_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            store: StoreConfig::from_env_profiled(p),
            broker: BrokerConfig::from_env_profiled(p),
            scheduler: SchedulerSettings::from_env_profiled(p),
            consumer: ConsumerSettings::from_env_profiled(p),
            source: SourceConfig::from_env_profiled(p),
            admin: AdminConfig::from_env_profiled(p),
        }
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a redacted summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  store:      url={}", redact_url(&self.store.database_url));
        tracing::info!(
            "  broker:     topic={}, partitions={}, durable={}",
            self.broker.topic, self.broker.partitions, self.broker.durable
        );
        tracing::info!(
            "  scheduler:  tick={}s, workers={}, max_attempts={}",
            self.scheduler.tick_interval_secs, self.scheduler.worker_pool_size, self.scheduler.max_attempts
        );
        tracing::info!(
            "  consumer:   group={}, max_batch={}",
            self.consumer.group_id, self.consumer.max_batch
        );
        tracing::info!(
            "  source:     url={}, collections={}",
            self.source.base_url.as_deref().unwrap_or("(static)"),
            self.source.collections.join(",")
        );
        tracing::info!("  admin:      {}:{}", self.admin.host, self.admin.port);
    }
}

/// Strip userinfo from a connection URL before logging it.
pub fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}

// ── State store ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl StoreConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            database_url: profiled_env_or(p, "DATABASE_URL", "sqlite://data/siphon.db?mode=rwc"),
            max_connections: profiled_env_u32(p, "DB_MAX_CONNECTIONS", 5),
        }
    }
}

// ── Broker ────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Topic carrying serialized records.
    pub topic: String,
    pub partitions: u32,
    /// Keep the topic log in the state store database instead of memory.
    pub durable: bool,
    pub publish_timeout_ms: u64,
}

impl BrokerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            topic: profiled_env_or(p, "BROKER_TOPIC", "records"),
            partitions: profiled_env_u32(p, "BROKER_PARTITIONS", 4),
            durable: profiled_env_or(p, "BROKER_DURABLE", "true") == "true",
            publish_timeout_ms: profiled_env_u64(p, "BROKER_PUBLISH_TIMEOUT_MS", 60_000),
        }
    }
}

// ── Scheduler ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSettings {
    /// Optional TOML pipeline definition; a built-in pipeline is used when unset.
    pub pipeline_file: Option<String>,
    pub tick_interval_secs: u64,
    pub worker_pool_size: usize,
    pub liveness_factor: u32,
    pub max_attempts: u32,
    pub backoff_base_secs: u64,
    pub backoff_cap_secs: u64,
    pub max_catchup_runs: usize,
}

impl SchedulerSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            pipeline_file: profiled_env_opt(p, "PIPELINE_FILE"),
            tick_interval_secs: profiled_env_u64(p, "SCHEDULER_TICK_SECS", 30),
            worker_pool_size: profiled_env_u32(p, "SCHEDULER_WORKERS", 4) as usize,
            liveness_factor: profiled_env_u32(p, "SCHEDULER_LIVENESS_FACTOR", 3),
            max_attempts: profiled_env_u32(p, "TASK_MAX_ATTEMPTS", 2),
            backoff_base_secs: profiled_env_u64(p, "TASK_BACKOFF_BASE_SECS", 300),
            backoff_cap_secs: profiled_env_u64(p, "TASK_BACKOFF_CAP_SECS", 3600),
            max_catchup_runs: profiled_env_u32(p, "SCHEDULER_MAX_CATCHUP_RUNS", 100) as usize,
        }
    }
}

// ── Consumer ──────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerSettings {
    pub group_id: String,
    pub max_batch: usize,
    pub poll_timeout_ms: u64,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_cap_ms: u64,
    /// Consecutive failures of one batch before it is dead-lettered (unset = never).
    pub dead_letter_after: Option<u32>,
    pub dead_letter_topic: Option<String>,
}

impl ConsumerSettings {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            group_id: profiled_env_or(p, "CONSUMER_GROUP", "siphon-consumer-group"),
            max_batch: profiled_env_u32(p, "CONSUMER_MAX_BATCH", 100) as usize,
            poll_timeout_ms: profiled_env_u64(p, "CONSUMER_POLL_TIMEOUT_MS", 10_000),
            retry_backoff_base_ms: profiled_env_u64(p, "CONSUMER_BACKOFF_BASE_MS", 500),
            retry_backoff_cap_ms: profiled_env_u64(p, "CONSUMER_BACKOFF_CAP_MS", 30_000),
            dead_letter_after: profiled_env_opt(p, "CONSUMER_DEAD_LETTER_AFTER")
                .and_then(|v| v.parse().ok()),
            dead_letter_topic: profiled_env_opt(p, "CONSUMER_DEAD_LETTER_TOPIC"),
        }
    }
}

// ── External source ───────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the item listing API. `None` means no HTTP source is wired.
    pub base_url: Option<String>,
    /// Collections to harvest; one producer task pair per collection.
    pub collections: Vec<String>,
    pub page_size: u32,
    pub max_items_per_run: usize,
    pub request_timeout_ms: u64,
    pub id_field: String,
    /// Item field naming the scope of the natural key (defaults to the collection).
    pub scope_field: Option<String>,
    pub api_token: Option<String>,
}

impl SourceConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            base_url: profiled_env_opt(p, "SOURCE_BASE_URL"),
            collections: profiled_env_list(p, "SOURCE_COLLECTIONS", "default"),
            page_size: profiled_env_u32(p, "SOURCE_PAGE_SIZE", 100),
            max_items_per_run: profiled_env_u32(p, "SOURCE_MAX_ITEMS", 1000) as usize,
            request_timeout_ms: profiled_env_u64(p, "SOURCE_TIMEOUT_MS", 30_000),
            id_field: profiled_env_or(p, "SOURCE_ID_FIELD", "id"),
            scope_field: profiled_env_opt(p, "SOURCE_SCOPE_FIELD"),
            api_token: profiled_env_opt(p, "SOURCE_API_TOKEN"),
        }
    }

    pub fn is_configured(&self) -> bool {
        self.base_url.is_some()
    }
}

// ── Admin surface ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminConfig {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
}

impl AdminConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            host: profiled_env_or(p, "ADMIN_HOST", "0.0.0.0"),
            port: profiled_env_u16(p, "ADMIN_PORT", 8080),
            cors_origin: profiled_env_or(p, "CORS_ORIGIN", "*"),
        }
    }
}
