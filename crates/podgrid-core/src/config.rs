//! podgrid.toml configuration parser.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use thiserror::Error;

/// Errors raised while loading or validating a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodgridConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    /// Per-workload-type pool settings, keyed by workload type.
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadTypeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between scheduling ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: String,
    /// Upper bound for any single provider call.
    #[serde(default = "default_provider_timeout")]
    pub provider_timeout: String,
    /// Run an immediate scheduling pass when work is submitted.
    #[serde(default = "default_true")]
    pub nudge_on_submit: bool,
    /// What the timeout sweep does when a pause/terminate call fails.
    #[serde(default)]
    pub sweep_policy: SweepPolicy,
}

/// Reaction of the timeout sweep to a failed provider call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepPolicy {
    /// Apply the local transition anyway so the scheduler never stalls on
    /// an unreachable provider. Local and provider state may drift.
    #[default]
    BestEffort,
    /// Keep local state unchanged and retry on the next tick.
    Strict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessConfig {
    /// Poll interval while waiting for the provider to report the node running.
    #[serde(default = "default_infra_interval")]
    pub infra_interval: String,
    #[serde(default = "default_infra_attempts")]
    pub infra_attempts: u32,
    /// Poll interval while waiting for the node's service to answer health checks.
    #[serde(default = "default_service_interval")]
    pub service_interval: String,
    #[serde(default = "default_service_attempts")]
    pub service_attempts: u32,
    /// HTTP path probed during the service phase.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Timeout for a single health probe.
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Maximum number of completed/failed requests kept for lookup.
    #[serde(default = "default_max_terminal")]
    pub max_terminal_requests: usize,
    /// How long a completed/failed request stays queryable.
    #[serde(default = "default_terminal_ttl")]
    pub terminal_ttl: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Base URL of the compute provider REST API.
    #[serde(default)]
    pub base_url: String,
    /// Environment variable holding the provider API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
}

/// Pool settings for one workload type.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadTypeConfig {
    /// Maximum concurrent requests per node.
    pub capacity: u32,
    /// Idle time before a running node with no work is paused.
    #[serde(default = "default_pause_timeout")]
    pub pause_timeout: String,
    /// Time a paused node is kept before it is terminated.
    #[serde(default = "default_terminate_timeout")]
    pub terminate_timeout: String,
    /// Container image (or template reference) the node boots.
    pub image: String,
    /// Optional storage volume (id or name) attached to new nodes.
    #[serde(default)]
    pub storage: Option<String>,
    #[serde(default = "default_disk_gb")]
    pub disk_gb: u32,
    /// Port the workload service listens on inside the node.
    #[serde(default = "default_service_port")]
    pub service_port: u16,
    /// Hardware variants to try, most preferred first.
    #[serde(default)]
    pub hardware: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_tick_interval() -> String {
    "5s".to_string()
}
fn default_provider_timeout() -> String {
    "30s".to_string()
}
fn default_true() -> bool {
    true
}
fn default_infra_interval() -> String {
    "5s".to_string()
}
fn default_infra_attempts() -> u32 {
    60
}
fn default_service_interval() -> String {
    "10s".to_string()
}
fn default_service_attempts() -> u32 {
    60
}
fn default_health_path() -> String {
    "/health".to_string()
}
fn default_probe_timeout() -> String {
    "5s".to_string()
}
fn default_max_terminal() -> usize {
    1000
}
fn default_terminal_ttl() -> String {
    "1h".to_string()
}
fn default_api_key_env() -> String {
    "PODGRID_PROVIDER_API_KEY".to_string()
}
fn default_pause_timeout() -> String {
    "5m".to_string()
}
fn default_terminate_timeout() -> String {
    "30m".to_string()
}
fn default_disk_gb() -> u32 {
    50
}
fn default_service_port() -> u16 {
    8000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            provider_timeout: default_provider_timeout(),
            nudge_on_submit: true,
            sweep_policy: SweepPolicy::default(),
        }
    }
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            infra_interval: default_infra_interval(),
            infra_attempts: default_infra_attempts(),
            service_interval: default_service_interval(),
            service_attempts: default_service_attempts(),
            health_path: default_health_path(),
            probe_timeout: default_probe_timeout(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            max_terminal_requests: default_max_terminal(),
            terminal_ttl: default_terminal_ttl(),
        }
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key_env: default_api_key_env(),
        }
    }
}

impl SchedulerConfig {
    pub fn tick_interval(&self) -> Duration {
        parse_duration(&self.tick_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn provider_timeout(&self) -> Duration {
        parse_duration(&self.provider_timeout).unwrap_or(Duration::from_secs(30))
    }
}

impl ReadinessConfig {
    pub fn infra_interval(&self) -> Duration {
        parse_duration(&self.infra_interval).unwrap_or(Duration::from_secs(5))
    }

    pub fn service_interval(&self) -> Duration {
        parse_duration(&self.service_interval).unwrap_or(Duration::from_secs(10))
    }

    pub fn probe_timeout(&self) -> Duration {
        parse_duration(&self.probe_timeout).unwrap_or(Duration::from_secs(5))
    }
}

impl RetentionConfig {
    pub fn terminal_ttl(&self) -> Duration {
        parse_duration(&self.terminal_ttl).unwrap_or(Duration::from_secs(3600))
    }
}

impl WorkloadTypeConfig {
    /// Minimal config for a workload type: defaults for everything but
    /// capacity, image and hardware.
    pub fn new(capacity: u32, image: &str, hardware: &[&str]) -> Self {
        Self {
            capacity,
            pause_timeout: default_pause_timeout(),
            terminate_timeout: default_terminate_timeout(),
            image: image.to_string(),
            storage: None,
            disk_gb: default_disk_gb(),
            service_port: default_service_port(),
            hardware: hardware.iter().map(|h| h.to_string()).collect(),
            env: BTreeMap::new(),
        }
    }

    pub fn pause_timeout(&self) -> Duration {
        parse_duration(&self.pause_timeout).unwrap_or(Duration::from_secs(300))
    }

    pub fn terminate_timeout(&self) -> Duration {
        parse_duration(&self.terminate_timeout).unwrap_or(Duration::from_secs(1800))
    }
}

impl PodgridConfig {
    pub fn from_file(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate a config document.
    pub fn from_toml_str(content: &str) -> ConfigResult<Self> {
        let config: PodgridConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> ConfigResult<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn workload(&self, workload_type: &str) -> Option<&WorkloadTypeConfig> {
        self.workloads.get(workload_type)
    }

    /// Add a workload type (builder style, mostly for tests and embedding).
    pub fn with_workload(mut self, workload_type: &str, config: WorkloadTypeConfig) -> Self {
        self.workloads.insert(workload_type.to_string(), config);
        self
    }

    /// Reject configs the scheduler cannot run with.
    pub fn validate(&self) -> ConfigResult<()> {
        check_duration("scheduler.tick_interval", &self.scheduler.tick_interval)?;
        check_duration("scheduler.provider_timeout", &self.scheduler.provider_timeout)?;
        check_duration("readiness.infra_interval", &self.readiness.infra_interval)?;
        check_duration("readiness.service_interval", &self.readiness.service_interval)?;
        check_duration("readiness.probe_timeout", &self.readiness.probe_timeout)?;
        check_duration("retention.terminal_ttl", &self.retention.terminal_ttl)?;

        if self.readiness.infra_attempts == 0 || self.readiness.service_attempts == 0 {
            return Err(ConfigError::Invalid(
                "readiness attempt counts must be at least 1".to_string(),
            ));
        }
        if !self.readiness.health_path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "readiness.health_path must start with '/': {}",
                self.readiness.health_path
            )));
        }

        for (name, workload) in &self.workloads {
            if workload.capacity == 0 {
                return Err(ConfigError::Invalid(format!(
                    "workloads.{name}.capacity must be at least 1"
                )));
            }
            if workload.hardware.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "workloads.{name}.hardware must list at least one variant"
                )));
            }
            if workload.image.trim().is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "workloads.{name}.image is empty"
                )));
            }
            check_duration(&format!("workloads.{name}.pause_timeout"), &workload.pause_timeout)?;
            check_duration(
                &format!("workloads.{name}.terminate_timeout"),
                &workload.terminate_timeout,
            )?;
        }

        Ok(())
    }
}

/// Longest duration any setting accepts (one year).
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 3600);

fn check_duration(field: &str, value: &str) -> ConfigResult<()> {
    let duration = parse_duration(value)
        .ok_or_else(|| ConfigError::Invalid(format!("{field}: unparsable duration {value:?}")))?;
    if duration > MAX_DURATION {
        return Err(ConfigError::Invalid(format!(
            "{field}: {value:?} exceeds the one year limit"
        )));
    }
    Ok(())
}

/// Parse a duration string like "500ms", "5s", "2m", "1h".
///
/// A bare number is read as seconds. Values that overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        mins.parse::<u64>()
            .ok()?
            .checked_mul(60)
            .map(Duration::from_secs)
    } else if let Some(hours) = s.strip_suffix('h') {
        hours
            .parse::<u64>()
            .ok()?
            .checked_mul(3600)
            .map(Duration::from_secs)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}
