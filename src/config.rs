use anyhow::{Context, Result, bail};
use declarative::{EngineOptions, ResourceKind, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// File name looked up in the working directory
pub const CONFIG_FILE: &str = "gantry.toml";

/// Get the config directory path
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".config").join("gantry"))
}

// ============================================================================
// Gantry Config
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GantryConfig {
    pub engine: EngineConfig,
    pub retry: RetrySettings,
    pub state: StateConfig,
    pub stack: StackConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum resources provisioned at once
    pub max_in_flight: usize,
    /// Cancel a run after this many seconds (0 = no limit)
    pub timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_in_flight: declarative::DEFAULT_MAX_IN_FLIGHT,
            timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub backoff_factor: f64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            base_delay_ms: defaults.base_delay.as_millis() as u64,
            backoff_factor: defaults.backoff_factor,
            max_delay_ms: defaults.max_delay.as_millis() as u64,
        }
    }
}

impl RetrySettings {
    pub fn to_retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay: Duration::from_millis(self.base_delay_ms),
            backoff_factor: self.backoff_factor,
            max_delay: Duration::from_millis(self.max_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// State file; `.toml` selects TOML, anything else JSON
    pub path: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from(".gantry").join("state.json"),
        }
    }
}

/// Parameters of the web-service stack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub name: String,
    pub region: String,
    pub vpc_cidr: String,
    pub container_port: u16,
    pub desired_count: u32,
    pub cpu: String,
    pub memory: String,
    pub platform: String,
}

impl Default for StackConfig {
    fn default() -> Self {
        Self {
            name: "web".to_string(),
            region: "us-east-1".to_string(),
            vpc_cidr: "10.0.0.0/16".to_string(),
            container_port: 80,
            desired_count: 1,
            cpu: "256".to_string(),
            memory: "512".to_string(),
            platform: "linux/arm64".to_string(),
        }
    }
}

/// Behavior of the local sandbox provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Simulated latency of every provider call
    pub latency_ms: u64,
    /// Resource kinds whose creation always fails
    pub fail_kinds: BTreeSet<ResourceKind>,
}

impl GantryConfig {
    /// Load config from an explicit path, `./gantry.toml`, or the user config
    /// directory, in that order. Missing files yield defaults.
    pub fn load(explicit: Option<&Path>) -> Result<(Self, Option<PathBuf>)> {
        if let Some(path) = explicit {
            if !path.exists() {
                bail!("Config file not found: {}", path.display());
            }
            return Ok((Self::load_from(path)?, Some(path.to_path_buf())));
        }

        let mut candidates = vec![PathBuf::from(CONFIG_FILE)];
        if let Ok(dir) = config_dir() {
            candidates.push(dir.join("config.toml"));
        }

        for path in candidates {
            if path.exists() {
                let config = Self::load_from(&path)?;
                return Ok((config, Some(path)));
            }
        }

        log::debug!("No config file found, using defaults");
        Ok((Self::default(), None))
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Could not read {}", path.display()))?;
        let config = Self::parse(&content)
            .with_context(|| format!("Invalid config in {}", path.display()))?;
        log::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.stack.name.trim().is_empty() {
            bail!("stack.name must not be empty");
        }
        if self.retry.backoff_factor < 1.0 {
            bail!("retry.backoff_factor must be at least 1.0");
        }
        Ok(())
    }

    /// Engine options, with command-line overrides applied.
    pub fn engine_options(&self, jobs: Option<usize>, timeout_secs: Option<u64>) -> EngineOptions {
        let timeout = timeout_secs.unwrap_or(self.engine.timeout_secs);
        EngineOptions {
            max_in_flight: jobs.unwrap_or(self.engine.max_in_flight).max(1),
            retry: self.retry.to_retry_config(),
            timeout: (timeout > 0).then(|| Duration::from_secs(timeout)),
        }
    }
}
