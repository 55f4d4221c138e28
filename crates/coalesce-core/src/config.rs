use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_BIND: &str = "0.0.0.0";
pub const DEFAULT_WINDOW_MS: u64 = 2000;
/// Added to the debounce window to size the leader lease (one round-trip).
pub const DEFAULT_LOCK_MARGIN_MS: u64 = 1000;
/// Longest a burst may keep sliding before it is flushed regardless.
pub const DEFAULT_MAX_WAIT_MS: u64 = 10_000;
/// Safety expiry for abandoned buffers, independent of the window.
pub const DEFAULT_BUFFER_TTL_SECS: u64 = 300;
pub const DEFAULT_SINK_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_STORE_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_KEY_PREFIX: &str = "coalesce";

/// Pre-existing environment variable names, mapped onto config paths.
const LEGACY_ENV: &[(&str, &str)] = &[
    ("WHATSAPP_VERIFY_TOKEN", "webhook.verify_token"),
    ("WHATSAPP_APP_SECRET", "webhook.app_secret"),
    ("N8N_WEBHOOK_URL", "sink.url"),
    ("DEBOUNCE_WINDOW_MS", "debounce.window_ms"),
    ("UPSTASH_REDIS_REST_URL", "store.upstash_url"),
    ("UPSTASH_REDIS_REST_TOKEN", "store.upstash_token"),
];

/// Top-level config (coalesce.toml + COALESCE_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoalesceConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub debounce: DebounceConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub sink: SinkConfig,
    #[serde(default)]
    pub filter: FilterConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

/// Inbound webhook authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Token echoed back during the `hub.mode=subscribe` handshake.
    pub verify_token: Option<String>,
    /// App secret used for `X-Hub-Signature-256` verification.
    pub app_secret: Option<String>,
    /// When true, a missing `app_secret` rejects every POST as misconfigured.
    /// When false, unsigned delivery is accepted (local testing only).
    #[serde(default = "bool_true")]
    pub require_signature: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            verify_token: None,
            app_secret: None,
            require_signature: true,
        }
    }
}

/// Which coordination model drives debouncing.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum DebounceMode {
    /// Single long-lived process, in-memory countdown per sender.
    #[default]
    Timer,
    /// Many stateless instances coordinating through a shared store lease.
    Lock,
}

impl std::fmt::Display for DebounceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timer => write!(f, "timer"),
            Self::Lock => write!(f, "lock"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebounceConfig {
    #[serde(default)]
    pub mode: DebounceMode,
    /// Quiet period after the last fragment before a burst is flushed.
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    /// Lease TTL = window + margin.
    #[serde(default = "default_lock_margin_ms")]
    pub lock_margin_ms: u64,
    /// Cap on a burst's age: a sender who never pauses for a full window
    /// is flushed this long after the burst's first fragment.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for DebounceConfig {
    fn default() -> Self {
        Self {
            mode: DebounceMode::default(),
            window_ms: DEFAULT_WINDOW_MS,
            lock_margin_ms: DEFAULT_LOCK_MARGIN_MS,
            max_wait_ms: DEFAULT_MAX_WAIT_MS,
        }
    }
}

impl DebounceConfig {
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.window_ms + self.lock_margin_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    /// Process-local; coordinates tasks in one process only.
    #[default]
    Memory,
    /// SQLite file shared by every process on the host.
    Sqlite,
    /// Upstash Redis over its REST API.
    Upstash,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory => write!(f, "memory"),
            Self::Sqlite => write!(f, "sqlite"),
            Self::Upstash => write!(f, "upstash"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
    pub upstash_url: Option<String>,
    pub upstash_token: Option<String>,
    #[serde(default = "default_buffer_ttl_secs")]
    pub buffer_ttl_secs: u64,
    /// Namespace for shared-store keys (`<prefix>:buf:<sender>`).
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Per-request timeout for remote stores.
    #[serde(default = "default_store_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sqlite_path: default_sqlite_path(),
            upstash_url: None,
            upstash_token: None,
            buffer_ttl_secs: DEFAULT_BUFFER_TTL_SECS,
            key_prefix: default_key_prefix(),
            request_timeout_ms: DEFAULT_STORE_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    pub fn buffer_ttl(&self) -> Duration {
        Duration::from_secs(self.buffer_ttl_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Downstream consumer receiving consolidated records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    pub url: Option<String>,
    #[serde(default = "default_sink_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            url: None,
            timeout_ms: DEFAULT_SINK_TIMEOUT_MS,
        }
    }
}

impl SinkConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Raw sender id allow/block lists. Block wins when a sender is in both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Empty means every sender is allowed.
    #[serde(default)]
    pub allow: Vec<String>,
    #[serde(default)]
    pub block: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,
}

fn bool_true() -> bool {
    true
}
fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_window_ms() -> u64 {
    DEFAULT_WINDOW_MS
}
fn default_lock_margin_ms() -> u64 {
    DEFAULT_LOCK_MARGIN_MS
}
fn default_max_wait_ms() -> u64 {
    DEFAULT_MAX_WAIT_MS
}
fn default_store_timeout_ms() -> u64 {
    DEFAULT_STORE_TIMEOUT_MS
}
fn default_buffer_ttl_secs() -> u64 {
    DEFAULT_BUFFER_TTL_SECS
}
fn default_sink_timeout_ms() -> u64 {
    DEFAULT_SINK_TIMEOUT_MS
}
fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}
fn default_sqlite_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.coalesce/buffers.db", home)
}

impl CoalesceConfig {
    /// Load config from a TOML file with env var overrides.
    ///
    /// Precedence (last wins):
    ///   1. serde defaults
    ///   2. TOML file (explicit path, else ~/.coalesce/coalesce.toml)
    ///   3. legacy names (N8N_WEBHOOK_URL, DEBOUNCE_WINDOW_MS, ...)
    ///   4. COALESCE_* with `__` as the section separator
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: CoalesceConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(legacy_env())
            .merge(Env::prefixed("COALESCE_").split("__"))
            .extract()
            .map_err(|e| crate::error::CoalesceError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Capability-level problems. None of these stop the service; each one
    /// turns the affected capability into a logged no-op.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.sink.url.is_none() {
            warnings.push("sink.url is not set: every outbound record will be dropped".to_string());
        }
        if self.webhook.verify_token.is_none() {
            warnings.push(
                "webhook.verify_token is not set: subscription handshake will be refused"
                    .to_string(),
            );
        }
        if self.webhook.app_secret.is_none() && self.webhook.require_signature {
            warnings.push(
                "webhook.app_secret is not set: inbound deliveries will be rejected".to_string(),
            );
        }
        if self.debounce.window_ms == 0 {
            warnings.push("debounce.window_ms is 0: bursts will not be coalesced".to_string());
        }
        if self.debounce.max_wait_ms < self.debounce.window_ms {
            warnings.push(
                "debounce.max_wait_ms is below debounce.window_ms: every burst is cut at max_wait_ms"
                    .to_string(),
            );
        }
        if self.debounce.mode == DebounceMode::Lock {
            if self.debounce.lock_margin_ms == 0 {
                warnings.push(
                    "debounce.lock_margin_ms is 0: a slow leader can be preempted by its own lease expiry"
                        .to_string(),
                );
            }
            if self.store.backend == StoreBackend::Memory {
                warnings.push(
                    "lock mode with the memory store only coordinates within this process"
                        .to_string(),
                );
            }
            if self.store.buffer_ttl() <= self.debounce.max_wait() + self.debounce.lock_ttl() {
                warnings.push(
                    "store.buffer_ttl_secs does not exceed max_wait plus the lease TTL: buffers may expire before their leader drains them"
                        .to_string(),
                );
            }
        }
        if self.store.backend == StoreBackend::Upstash
            && (self.store.upstash_url.is_none() || self.store.upstash_token.is_none())
        {
            warnings.push(
                "upstash backend selected without store.upstash_url / store.upstash_token"
                    .to_string(),
            );
        }
        warnings
    }
}

fn legacy_env() -> Env {
    let names: Vec<&str> = LEGACY_ENV.iter().map(|(name, _)| *name).collect();
    Env::raw().only(&names).map(|key| {
        LEGACY_ENV
            .iter()
            .find(|(name, _)| key.as_str().eq_ignore_ascii_case(name))
            .map(|(_, path)| (*path).into())
            .unwrap_or_else(|| key.as_str().to_string().into())
    })
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.coalesce/coalesce.toml", home)
}
