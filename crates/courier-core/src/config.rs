use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18990;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Ceiling on the graceful-shutdown wait for in-flight requests.
pub const SHUTDOWN_WAIT_SECS: u64 = 30;
/// Config file poll cadence for hot reload.
pub const RELOAD_POLL_SECS: u64 = 5;
/// Heartbeat log cadence.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 30;

/// Top-level config (courier.toml + COURIER_* env overrides).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CourierConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub agent: AgentConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Bearer token required on POST /hooks/* and GET /metrics.
    /// Unset → hooks accept unauthenticated requests, metrics stays open.
    pub hooks_token: Option<String>,
    /// Log filter directive applied at startup and on hot reload.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            hooks_token: None,
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// API key or OAuth access token (detected by the `sk-ant-oat` prefix).
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Optional secondary credentials; when set the provider is wrapped in a
    /// failover pair tried once after any primary turn error.
    pub fallback: Option<FallbackConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackConfig {
    pub api_key: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChannelsConfig {
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: String,
    /// Deny-by-default allowlist: usernames, numeric IDs, or "*".
    #[serde(default)]
    pub allow_users: Vec<String>,
    /// Render replies incrementally by editing a placeholder message.
    #[serde(default = "bool_true")]
    pub streaming: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Messages admitted per user per minute. 0 or negative disables limiting.
    #[serde(default = "default_rate")]
    pub rate_per_minute: i64,
    /// Token budget above which a conversation head is compacted away.
    #[serde(default = "default_compact_threshold")]
    pub compact_threshold_tokens: usize,
    /// Messages preserved verbatim at the tail during compaction.
    #[serde(default = "default_compact_keep")]
    pub compact_keep_last: usize,
    /// Agentic-loop iteration cap.
    #[serde(default = "default_max_iterations")]
    pub max_tool_iterations: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            rate_per_minute: default_rate(),
            compact_threshold_tokens: default_compact_threshold(),
            compact_keep_last: default_compact_keep(),
            max_tool_iterations: default_max_iterations(),
        }
    }
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
fn default_log_level() -> String {
    "courier_gateway=info,tower_http=debug".to_string()
}
fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_model() -> String {
    "claude-sonnet-4-6".to_string()
}
fn default_max_tokens() -> u32 {
    4096
}
fn default_rate() -> i64 {
    20
}
fn default_compact_threshold() -> usize {
    60_000
}
fn default_compact_keep() -> usize {
    10
}
fn default_max_iterations() -> usize {
    10
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.courier/courier.db", home)
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.courier/courier.toml", home)
}

impl CourierConfig {
    /// The concrete config file path: the explicit argument when given,
    /// otherwise `~/.courier/courier.toml`.
    pub fn resolve_path(config_path: Option<&str>) -> String {
        config_path
            .map(String::from)
            .unwrap_or_else(default_config_path)
    }

    /// Load config from a TOML file with COURIER_* env var overrides.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = Self::resolve_path(config_path);

        let config: CourierConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("COURIER_").split("_"))
            .extract()
            .map_err(|e| crate::error::CourierError::Config(e.to_string()))?;

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> CourierConfig {
        CourierConfig {
            gateway: GatewayConfig::default(),
            agent: AgentConfig {
                api_key: "sk-test".to_string(),
                base_url: default_base_url(),
                model: default_model(),
                max_tokens: default_max_tokens(),
                fallback: None,
            },
            database: DatabaseConfig::default(),
            channels: ChannelsConfig::default(),
            limits: LimitsConfig::default(),
        }
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = minimal();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.limits.max_tool_iterations, 10);
        assert!(cfg.limits.rate_per_minute > 0);
        assert!(cfg.limits.compact_keep_last < cfg.limits.compact_threshold_tokens);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = minimal();
        let json = serde_json::to_string(&cfg).unwrap();
        let back: CourierConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, cfg);
    }

    #[test]
    fn missing_optional_sections_default() {
        let json = r#"{"agent": {"api_key": "sk-x"}}"#;
        let cfg: CourierConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.agent.model, default_model());
        assert!(cfg.channels.telegram.is_none());
        assert_eq!(cfg.limits.rate_per_minute, default_rate());
    }
}
