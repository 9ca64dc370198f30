use chatflow_core::{BackoffPolicy, CallRetryPolicy, SessionConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

const CONFIG_DIR: &str = "chatflow";
const CONFIG_FILE: &str = "config.json";

#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub polling: PollingConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct GatewayConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: "https://open.bigmodel.cn/api/paas/v4".to_string(),
            api_key: String::new(),
            model: "glm-4-flash".to_string(),
            system_prompt: None,
            request_timeout_secs: 60,
        }
    }
}

impl GatewayConfig {
    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct SessionSettings {
    pub inactivity_timeout_secs: u64,
    pub call_retry: CallRetryConfig,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            inactivity_timeout_secs: 60,
            call_retry: CallRetryConfig::default(),
        }
    }
}

impl SessionSettings {
    #[must_use]
    pub const fn session_config(&self) -> SessionConfig {
        SessionConfig::new(Duration::from_secs(self.inactivity_timeout_secs))
    }
}

/// Retry policy for gateway calls made by sessions.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct CallRetryConfig {
    pub initial_interval_ms: u64,
    pub backoff_coefficient: f64,
    pub maximum_interval_ms: u64,
    /// 0 retries until the call succeeds or fails fatally.
    pub maximum_attempts: u32,
}

impl Default for CallRetryConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 1_000,
            backoff_coefficient: 2.0,
            maximum_interval_ms: 100_000,
            maximum_attempts: 0,
        }
    }
}

impl CallRetryConfig {
    #[must_use]
    pub const fn policy(&self) -> CallRetryPolicy {
        CallRetryPolicy {
            backoff: BackoffPolicy::new(
                Duration::from_millis(self.initial_interval_ms),
                self.backoff_coefficient,
                Duration::from_millis(self.maximum_interval_ms),
            ),
            maximum_attempts: self.maximum_attempts,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct HostConfig {
    pub listen_addr: String,
    /// When set, sessions are journaled here and recovered on start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub journal_dir: Option<PathBuf>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7233".to_string(),
            journal_dir: None,
        }
    }
}

impl HostConfig {
    /// Base URL clients use to reach the worker.
    #[must_use]
    pub fn base_url(&self) -> String {
        format!("http://{}", self.listen_addr)
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(default)]
pub struct PollingConfig {
    pub base_ms: u64,
    pub multiplier: f64,
    pub cap_ms: u64,
    pub jitter: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deadline_secs: Option<u64>,
    pub failures_before_success: u32,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            multiplier: 2.0,
            cap_ms: 30_000,
            jitter: false,
            deadline_secs: None,
            failures_before_success: 5,
        }
    }
}

impl PollingConfig {
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_millis(self.base_ms),
            self.multiplier,
            Duration::from_millis(self.cap_ms),
        )
        .with_jitter(self.jitter)
    }

    #[must_use]
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline_secs.map(Duration::from_secs)
    }
}

impl Config {
    pub fn config_path() -> anyhow::Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
            .join(CONFIG_DIR)
            .join(CONFIG_FILE))
    }

    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            anyhow::bail!(
                "Config file not found at: {}. Please run 'chatflow init' to create config.",
                config_path.display()
            );
        }

        Self::load_from(&config_path)
    }

    /// Like [`Self::load`], but a missing file yields the defaults.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let config_path = Self::config_path()?;
        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            debug!(
                "No config file at {}, using defaults",
                config_path.display()
            );
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Invalid config file {}: {e}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let retry = &self.session.call_retry;
        if !retry.backoff_coefficient.is_finite() || retry.backoff_coefficient < 1.0 {
            anyhow::bail!("session.call_retry.backoff_coefficient must be at least 1.0");
        }
        if retry.maximum_interval_ms < retry.initial_interval_ms {
            anyhow::bail!(
                "session.call_retry.maximum_interval_ms must not be below initial_interval_ms"
            );
        }
        if !self.polling.multiplier.is_finite() || self.polling.multiplier < 1.0 {
            anyhow::bail!("polling.multiplier must be at least 1.0");
        }
        if self.polling.cap_ms < self.polling.base_ms {
            anyhow::bail!("polling.cap_ms must not be below polling.base_ms");
        }
        Ok(())
    }

    pub fn ensure_config_dir() -> anyhow::Result<PathBuf> {
        let config_dir = dirs::home_dir()
            .ok_or_else(|| anyhow::anyhow!("Cannot find home directory"))?
            .join(CONFIG_DIR);

        std::fs::create_dir_all(&config_dir)?;
        Ok(config_dir)
    }

    pub fn create_config() -> anyhow::Result<()> {
        let config_dir = Self::ensure_config_dir()?;
        let config_path = Self::write_template(&config_dir)?;

        println!("✅ Created config file at: {}", config_path.display());
        println!();
        println!("📝 Next steps:");
        println!("   1. Edit the config file and add your API key");
        println!("   2. Run 'chatflow worker' to start the session host");
        println!("   3. Run 'chatflow send-message \"hello\"' from another terminal");
        println!();
        println!("🔧 Configuration options:");
        println!("   - session.inactivity_timeout_secs: idle time before a session summarizes");
        println!("   - host.journal_dir: keep sessions across worker restarts");
        println!("   - polling.failures_before_success: outages of the simulated test service");
        println!();
        Ok(())
    }

    /// Write the template into `config_dir`, refusing to overwrite.
    pub fn write_template(config_dir: &Path) -> anyhow::Result<PathBuf> {
        let config_path = config_dir.join(CONFIG_FILE);

        if config_path.exists() {
            anyhow::bail!(
                "Config file already exists at: {}. Please edit it directly.",
                config_path.display()
            );
        }

        std::fs::write(&config_path, CONFIG_TEMPLATE)?;
        Ok(config_path)
    }
}

const CONFIG_TEMPLATE: &str = r#"{
  "gateway": {
    "base_url": "https://open.bigmodel.cn/api/paas/v4",
    "api_key": "your-api-key-here",
    "model": "glm-4-flash",
    "system_prompt": "You are a helpful AI assistant. Provide clear, concise responses.",
    "request_timeout_secs": 60
  },
  "session": {
    "inactivity_timeout_secs": 60,
    "call_retry": {
      "initial_interval_ms": 1000,
      "backoff_coefficient": 2.0,
      "maximum_interval_ms": 100000,
      "maximum_attempts": 0
    }
  },
  "host": {
    "listen_addr": "127.0.0.1:7233",
    "journal_dir": null
  },
  "polling": {
    "base_ms": 1000,
    "multiplier": 2.0,
    "cap_ms": 30000,
    "jitter": false,
    "deadline_secs": 300,
    "failures_before_success": 5
  }
}"#;
