//! Runtime feature flags

use config::RuntimeConfig;
use std::collections::HashMap;

/// Percentage-based feature flags
pub trait Runtime: Send + Sync {
    /// Roll against the flag's percentage, `default_percent` when unset
    fn feature_enabled(&self, key: &str, default_percent: f64) -> bool;
}

/// Immutable set of flag overrides
#[derive(Debug, Clone, Default)]
pub struct SnapshotRuntime {
    overrides: HashMap<String, f64>,
}

impl SnapshotRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self {
            overrides: config.overrides.clone(),
        }
    }

    pub fn with_override(mut self, key: &str, percent: f64) -> Self {
        self.overrides.insert(key.to_string(), percent);
        self
    }

    /// Effective percentage for a flag
    pub fn percent(&self, key: &str, default_percent: f64) -> f64 {
        self.overrides.get(key).copied().unwrap_or(default_percent)
    }
}

impl Runtime for SnapshotRuntime {
    fn feature_enabled(&self, key: &str, default_percent: f64) -> bool {
        let percent = self.percent(key, default_percent);
        if percent >= 100.0 {
            return true;
        }
        if percent <= 0.0 {
            return false;
        }
        fastrand::f64() * 100.0 < percent
    }
}
