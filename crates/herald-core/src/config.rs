use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 18790;
pub const DEFAULT_BIND: &str = "127.0.0.1";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BATCH_SIZE: usize = 20;
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_SEND_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
pub const DEFAULT_STUCK_AFTER_SECS: u64 = 300; // 10x the send timeout

/// Top-level config (herald.toml + HERALD_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HeraldConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub sweep: SweepConfig,
    #[serde(default)]
    pub sender: SenderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth: AuthConfig::default(),
        }
    }
}

/// Management API auth. No token means the API is open (bind to localhost!).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
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

/// Dispatcher loop tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Seconds between polls for due messages.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Max due messages pulled per poll.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Max concurrent sends.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Per-send budget; a send that takes longer is recorded as failed.
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            batch_size: DEFAULT_BATCH_SIZE,
            workers: DEFAULT_WORKERS,
            send_timeout_secs: DEFAULT_SEND_TIMEOUT_SECS,
        }
    }
}

/// Stuck-job sweep tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepConfig {
    #[serde(default = "default_sweep_interval")]
    pub interval_secs: u64,
    /// A message left in `sending` this long is assumed abandoned.
    #[serde(default = "default_stuck_after")]
    pub stuck_after_secs: u64,
    /// Optional ceiling: stuck messages with this many attempts are failed
    /// rather than re-queued. Unset (or 0) disables the ceiling.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            stuck_after_secs: DEFAULT_STUCK_AFTER_SECS,
            max_attempts: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SenderConfig {
    pub webhook: Option<WebhookSenderConfig>,
}

/// HTTP delivery provider: `POST url` with the message as JSON.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookSenderConfig {
    pub url: String,
    /// Sent as `Authorization: Bearer <token>` when set.
    pub token: Option<String>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}
fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}
fn default_workers() -> usize {
    DEFAULT_WORKERS
}
fn default_send_timeout() -> u64 {
    DEFAULT_SEND_TIMEOUT_SECS
}
fn default_sweep_interval() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}
fn default_stuck_after() -> u64 {
    DEFAULT_STUCK_AFTER_SECS
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.db", home)
}

impl HeraldConfig {
    /// Load config from a TOML file with HERALD_* env var overrides.
    ///
    /// Nested keys use a double underscore:
    /// `HERALD_DISPATCHER__BATCH_SIZE=50` sets `dispatcher.batch_size`.
    /// A missing file is not an error; defaults fill every gap.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: HeraldConfig = Figment::from(Serialized::defaults(HeraldConfig::default()))
            .merge(Toml::file(&path))
            .merge(Env::prefixed("HERALD_").split("__"))
            .extract()
            .map_err(|e| crate::error::HeraldError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Settings that load fine but are likely mistakes.
    pub fn warnings(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.sweep.stuck_after_secs < self.dispatcher.send_timeout_secs.saturating_mul(2) {
            out.push(format!(
                "sweep.stuck_after_secs ({}) is less than twice dispatcher.send_timeout_secs ({}); \
                 slow sends may be revived and sent twice",
                self.sweep.stuck_after_secs, self.dispatcher.send_timeout_secs
            ));
        }
        if self.sender.webhook.is_none() {
            out.push("no sender configured; every dispatch will fail".to_string());
        }
        out
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.herald/herald.toml", home)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        let cfg = HeraldConfig::load(path.to_str()).unwrap();
        assert_eq!(cfg.gateway.port, DEFAULT_PORT);
        assert_eq!(cfg.dispatcher.batch_size, DEFAULT_BATCH_SIZE);
        assert_eq!(cfg.sweep.stuck_after_secs, DEFAULT_STUCK_AFTER_SECS);
        assert!(cfg.sweep.max_attempts.is_none());
        assert!(cfg.sender.webhook.is_none());
    }

    #[test]
    fn toml_overrides_partial_sections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[dispatcher]
workers = 8

[sweep]
max_attempts = 5

[sender.webhook]
url = "http://localhost:9000/send"
"#
        )
        .unwrap();

        let cfg = HeraldConfig::load(file.path().to_str()).unwrap();
        assert_eq!(cfg.dispatcher.workers, 8);
        assert_eq!(cfg.dispatcher.send_timeout_secs, DEFAULT_SEND_TIMEOUT_SECS);
        assert_eq!(cfg.sweep.max_attempts, Some(5));
        let webhook = cfg.sender.webhook.unwrap();
        assert_eq!(webhook.url, "http://localhost:9000/send");
        assert!(webhook.token.is_none());
    }

    #[test]
    fn malformed_file_is_a_config_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dispatcher]\nworkers = \"many\"").unwrap();

        let err = HeraldConfig::load(file.path().to_str()).unwrap_err();
        assert_eq!(err.code(), "CONFIG_ERROR");
    }

    #[test]
    fn defaults_have_no_threshold_warning() {
        let mut cfg = HeraldConfig::default();
        cfg.sender.webhook = Some(WebhookSenderConfig {
            url: "http://localhost".into(),
            token: None,
        });
        assert!(cfg.warnings().is_empty());

        cfg.sweep.stuck_after_secs = cfg.dispatcher.send_timeout_secs;
        assert_eq!(cfg.warnings().len(), 1);
    }
}
