use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

/// Backing store the daemon connects to.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    #[default]
    Redis,
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub backend: Backend,

    #[serde(default = "defaults::redis_addr")]
    pub redis_addr: String,
    #[serde(default)]
    pub redis_password: Option<SecretString>,
    #[serde(default)]
    pub redis_db: i64,

    pub db_path: Option<String>,

    #[serde(default = "defaults::visibility_secs")]
    pub default_visibility_secs: u64,
    #[serde(default = "defaults::max_retries")]
    pub max_retries: u32,
    #[serde(default = "defaults::dead_letter_queue")]
    pub dead_letter_queue: String,

    #[serde(default = "defaults::reaper_interval_ms")]
    pub reaper_interval_ms: u64,
    #[serde(default = "defaults::reaper_grace_secs")]
    pub reaper_grace_secs: u64,
}

mod defaults {
    pub fn redis_addr() -> String {
        "localhost:6379".to_owned()
    }

    pub fn visibility_secs() -> u64 {
        30
    }

    pub fn max_retries() -> u32 {
        3
    }

    pub fn dead_letter_queue() -> String {
        "dead-letter".to_owned()
    }

    pub fn reaper_interval_ms() -> u64 {
        1000
    }

    pub fn reaper_grace_secs() -> u64 {
        30
    }
}

impl Config {
    pub fn load() -> eyre::Result<Self> {
        Ok(envy::prefixed("LEASEMQ_").from_env::<Self>()?)
    }

    pub fn db_path(&self) -> &str {
        self.db_path
            .as_ref()
            .map(|s| s.as_str())
            .unwrap_or("leasemq.db")
    }

    pub fn default_visibility(&self) -> Duration {
        Duration::from_secs(self.default_visibility_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    /// How long an in-flight message may sit without a lease before the
    /// reaper hands it back.
    pub fn reaper_grace(&self) -> Duration {
        Duration::from_secs(self.reaper_grace_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend: Backend::default(),
            redis_addr: defaults::redis_addr(),
            redis_password: None,
            redis_db: 0,
            db_path: None,
            default_visibility_secs: defaults::visibility_secs(),
            max_retries: defaults::max_retries(),
            dead_letter_queue: defaults::dead_letter_queue(),
            reaper_interval_ms: defaults::reaper_interval_ms(),
            reaper_grace_secs: defaults::reaper_grace_secs(),
        }
    }
}
