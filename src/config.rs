use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;

/// Environment variable selecting the shortest-queue strategy
pub const FIND_STRATEGY_ENV: &str = "STAGE_DISPATCH_FIND_STRATEGY";
/// Environment variable enabling queue monitoring
pub const MONITOR_ENV: &str = "STAGE_DISPATCH_MONITOR";
/// Environment variable for the monitor sampling delay in milliseconds
pub const MONITOR_DELAY_ENV: &str = "STAGE_DISPATCH_MONITOR_DELAY_MS";
/// Environment variable disabling direct (inline) sinks
pub const DISABLE_DIRECT_ENV: &str = "STAGE_DISPATCH_DISABLE_DIRECT";

/// How a multi-queue stage picks the shortest queue for unkeyed events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindStrategy {
    /// Scan every queue from a rotating cursor; stop at the first empty one
    Brute,
    /// Scan a small rotating partition of queues only
    #[default]
    Partition,
}

impl FindStrategy {
    /// Parse a strategy name, case-insensitively
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "brute" => Some(FindStrategy::Brute),
            "partition" => Some(FindStrategy::Partition),
            _ => None,
        }
    }
}

/// Per-stage debugging knobs, read once when the stage is created
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageOverrides {
    /// Artificial sleep after every handled event, in milliseconds
    pub sleep_ms: u64,
    /// Create the stage paused; workers idle until unpaused
    pub paused: bool,
}

impl StageOverrides {
    pub fn sleep(&self) -> Option<Duration> {
        (self.sleep_ms > 0).then(|| Duration::from_millis(self.sleep_ms))
    }
}

/// Engine-wide configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    pub find_strategy: FindStrategy,
    /// Collect queue statistics and run the periodic stats logger
    pub monitor_enabled: bool,
    /// Stats logger period in milliseconds
    pub monitor_delay_ms: u64,
    /// Worker poll timeout in milliseconds; bounds how long shutdown checks wait
    pub poll_interval_ms: u64,
    /// Allow `DirectSink` to run handlers inline when the stage is idle
    pub direct_sinks: bool,
    /// Overrides keyed by stage name
    pub stages: HashMap<String, StageOverrides>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            find_strategy: FindStrategy::default(),
            monitor_enabled: false,
            monitor_delay_ms: 5_000,
            poll_interval_ms: 50,
            direct_sinks: true,
            stages: HashMap::new(),
        }
    }
}

impl DispatchConfig {
    /// Defaults overlaid with the `STAGE_DISPATCH_*` environment variables
    pub fn from_env() -> Self {
        Self::default().with_lookup(|key| std::env::var(key).ok())
    }

    /// Overlay values from an arbitrary property lookup
    pub fn with_lookup<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(name) = lookup(FIND_STRATEGY_ENV) {
            match FindStrategy::parse(&name) {
                Some(strategy) => self.find_strategy = strategy,
                None => warn!(
                    value = %name,
                    default = ?self.find_strategy,
                    "Unrecognized {} value; using default",
                    FIND_STRATEGY_ENV
                ),
            }
        }
        if let Some(flag) = lookup(MONITOR_ENV) {
            self.monitor_enabled = parse_flag(&flag);
        }
        if let Some(delay) = lookup(MONITOR_DELAY_ENV) {
            match delay.trim().parse::<u64>() {
                Ok(ms) => self.monitor_delay_ms = ms,
                Err(_) => warn!(value = %delay, "Ignoring invalid {}", MONITOR_DELAY_ENV),
            }
        }
        if let Some(flag) = lookup(DISABLE_DIRECT_ENV) {
            self.direct_sinks = !parse_flag(&flag);
        }
        self
    }

    pub fn with_find_strategy(mut self, strategy: FindStrategy) -> Self {
        self.find_strategy = strategy;
        self
    }

    pub fn with_monitoring(mut self, enabled: bool, delay: Duration) -> Self {
        self.monitor_enabled = enabled;
        self.monitor_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = interval.as_millis().max(1) as u64;
        self
    }

    pub fn with_direct_sinks(mut self, enabled: bool) -> Self {
        self.direct_sinks = enabled;
        self
    }

    pub fn with_stage_overrides(mut self, stage: impl Into<String>, overrides: StageOverrides) -> Self {
        self.stages.insert(stage.into(), overrides);
        self
    }

    pub fn monitor_delay(&self) -> Duration {
        Duration::from_millis(self.monitor_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Overrides for a stage, or the defaults if none are configured
    pub fn stage(&self, name: &str) -> StageOverrides {
        self.stages.get(name).cloned().unwrap_or_default()
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
