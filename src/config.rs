use anyhow::{bail, Context, Result};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

use crate::types::DestinationId;

/// Top-level configuration
#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub dispatcher: DispatcherConfig,
    #[serde(default)]
    pub telegram: Option<TelegramConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AgentConfig {
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            hostname: default_hostname(),
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DispatcherConfig {
    /// Directory the detector writes marker files into
    #[serde(default = "default_marker_dir")]
    pub marker_dir: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound on events handled at once within a phase
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_events: usize,
    /// Chats every broadcast goes to
    #[serde(default, deserialize_with = "deserialize_destinations")]
    pub destinations: Vec<DestinationId>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            marker_dir: default_marker_dir(),
            poll_interval_secs: default_poll_interval(),
            max_concurrent_events: default_max_concurrent(),
            destinations: vec![],
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Empty string sends plain text
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl Config {
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        // Expand environment variables
        let expanded = expand_env_vars(content);

        let config: Config = toml::from_str(&expanded)
            .with_context(|| "Failed to parse configuration")?;

        Ok(config)
    }

    /// Reject settings the dispatcher cannot run with
    pub fn validate(&self, dry_run: bool) -> Result<()> {
        if self.dispatcher.marker_dir.trim().is_empty() {
            bail!("dispatcher.marker_dir must not be empty");
        }
        if self.dispatcher.poll_interval_secs == 0 {
            bail!("dispatcher.poll_interval_secs must be at least 1");
        }
        if self.dispatcher.max_concurrent_events == 0 {
            bail!("dispatcher.max_concurrent_events must be at least 1");
        }
        if !dry_run {
            match &self.telegram {
                None => bail!("[telegram] section is required unless running with --dry-run"),
                Some(tg) if tg.bot_token.trim().is_empty() => {
                    bail!("telegram.bot_token is empty (is the environment variable set?)")
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

/// Expand ${ENV_VAR} references in config string
fn expand_env_vars(input: &str) -> String {
    static ENV_REF: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ENV_REF.get_or_init(|| {
        regex::Regex::new(r"\$\{([^}]+)\}").expect("static pattern is valid")
    });
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .to_string()
}

/// Telegram chat ids are integers; channel handles are strings. Accept both.
fn deserialize_destinations<'de, D>(deserializer: D) -> std::result::Result<Vec<DestinationId>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawDestination {
        Int(i64),
        Text(String),
    }

    let raw = Vec::<RawDestination>::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|d| match d {
            RawDestination::Int(id) => DestinationId(id.to_string()),
            RawDestination::Text(s) => DestinationId(s),
        })
        .collect())
}

// Default value functions
fn default_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string())
}
fn default_log_level() -> String { "info".to_string() }
fn default_marker_dir() -> String { "/var/lib/xenoeye/telemsg".to_string() }
fn default_poll_interval() -> u64 { 10 }
fn default_max_concurrent() -> usize { 4 }
fn default_api_url() -> String { "https://api.telegram.org".to_string() }
fn default_parse_mode() -> String { "HTML".to_string() }
fn default_timeout() -> u64 { 30 }
