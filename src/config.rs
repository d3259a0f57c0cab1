//! Engine configuration
//!
//! Loaded from a TOML file or string, or built in code.
//!
//! # Example callrank.toml
//!
//! ```toml
//! enabled_by_default = true
//! global_top_k = 10
//! thread_top_k = 5
//! housekeeping_interval_ms = 2000
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_GLOBAL_TOP_K: usize = 10;
pub const DEFAULT_THREAD_TOP_K: usize = 5;
pub const DEFAULT_HOUSEKEEPING_INTERVAL_MS: u64 = 2_000;

/// Upper bound on a top-K setting; larger values are a configuration mistake
pub const MAX_TOP_K: usize = 10_000;

/// Settings consumed by the engine
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// Whether newly seen operations are timed without an explicit enable
    pub enabled_by_default: bool,
    /// Number of global publish slots
    pub global_top_k: usize,
    /// Number of publish slots per worker thread
    pub thread_top_k: usize,
    /// Period of the housekeeping tick
    pub housekeeping_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            enabled_by_default: true,
            global_top_k: DEFAULT_GLOBAL_TOP_K,
            thread_top_k: DEFAULT_THREAD_TOP_K,
            housekeeping_interval_ms: DEFAULT_HOUSEKEEPING_INTERVAL_MS,
        }
    }
}

impl EngineConfig {
    /// Load and validate a configuration file
    ///
    /// # Example
    ///
    /// ```no_run
    /// use callrank::config::EngineConfig;
    ///
    /// # fn main() -> anyhow::Result<()> {
    /// let config = EngineConfig::from_file("callrank.toml")?;
    /// println!("global top-{}", config.global_top_k);
    /// # Ok(())
    /// # }
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid configuration in {}", path.display()))
    }

    /// Parse and validate a TOML string; missing keys take their defaults
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.housekeeping_interval_ms == 0 {
            bail!("housekeeping_interval_ms must be > 0");
        }
        if self.global_top_k > MAX_TOP_K {
            bail!(
                "global_top_k {} exceeds maximum {}",
                self.global_top_k,
                MAX_TOP_K
            );
        }
        if self.thread_top_k > MAX_TOP_K {
            bail!(
                "thread_top_k {} exceeds maximum {}",
                self.thread_top_k,
                MAX_TOP_K
            );
        }
        Ok(())
    }

    pub fn housekeeping_interval(&self) -> Duration {
        Duration::from_millis(self.housekeeping_interval_ms)
    }

    pub fn with_top_k(mut self, global: usize, per_thread: usize) -> Self {
        self.global_top_k = global;
        self.thread_top_k = per_thread;
        self
    }

    pub fn with_enabled_by_default(mut self, enabled: bool) -> Self {
        self.enabled_by_default = enabled;
        self
    }

    pub fn with_housekeeping_interval(mut self, interval: Duration) -> Self {
        self.housekeeping_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }
}
