//! Outlier detection for upstream hosts
//!
//! The upstream request reports connect and request outcomes for the host it
//! used. A [`ConsecutiveFailureDetector`] ejects a host after a run of
//! failures and lets it back in once it has proven itself again:
//!
//! - Healthy: results are counted, the host takes traffic
//! - Ejected: the host sits out for the ejection time
//! - Probing: after the ejection time, successes restore the host and any
//!   failure ejects it again

use config::OutlierDetectionConfig;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Outcome reported for one connect attempt or request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierResult {
    LocalOriginConnectSuccess,
    LocalOriginConnectFailed,
    LocalOriginTimeout,
    ExtOriginRequestSuccess,
    ExtOriginRequestFailed,
}

impl OutlierResult {
    /// Connect outcomes originate at the proxy, request outcomes at the upstream
    pub fn is_local_origin(&self) -> bool {
        matches!(
            self,
            OutlierResult::LocalOriginConnectSuccess
                | OutlierResult::LocalOriginConnectFailed
                | OutlierResult::LocalOriginTimeout
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self,
            OutlierResult::LocalOriginConnectSuccess | OutlierResult::ExtOriginRequestSuccess
        )
    }
}

/// Health scoring sink for one host
pub trait OutlierDetector: Send + Sync {
    fn put_result(&self, result: OutlierResult);

    /// Whether the host is currently ejected
    fn ejected(&self) -> bool;
}

/// Host health state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HostHealth {
    Healthy = 0,
    Ejected = 1,
    Probing = 2,
}

impl From<u8> for HostHealth {
    fn from(v: u8) -> Self {
        match v {
            1 => HostHealth::Ejected,
            2 => HostHealth::Probing,
            _ => HostHealth::Healthy,
        }
    }
}

/// Ejection thresholds
#[derive(Debug, Clone)]
pub struct DetectorSettings {
    /// Consecutive upstream request failures before ejection
    pub consecutive_failures: u32,
    /// Consecutive connect failures or timeouts before ejection
    pub consecutive_local_origin_failures: u32,
    /// Successes while probing needed to restore the host
    pub success_threshold: u32,
    /// How long an ejected host stays out
    pub base_ejection_time: Duration,
}

impl Default for DetectorSettings {
    fn default() -> Self {
        Self {
            consecutive_failures: 5,
            consecutive_local_origin_failures: 5,
            success_threshold: 2,
            base_ejection_time: Duration::from_secs(30),
        }
    }
}

impl From<&OutlierDetectionConfig> for DetectorSettings {
    fn from(config: &OutlierDetectionConfig) -> Self {
        Self {
            consecutive_failures: config.consecutive_failures,
            consecutive_local_origin_failures: config.consecutive_local_origin_failures,
            success_threshold: config.success_threshold,
            base_ejection_time: Duration::from_millis(config.base_ejection_time_ms),
        }
    }
}

/// Ejects a host after consecutive failures
pub struct ConsecutiveFailureDetector {
    settings: DetectorSettings,
    state: AtomicU8,
    ext_failures: AtomicU64,
    local_failures: AtomicU64,
    successes: AtomicU64,
    ejections: AtomicU64,
    ejected_at: RwLock<Option<Instant>>,
    host: String,
}

impl ConsecutiveFailureDetector {
    pub fn new(host: &str, settings: DetectorSettings) -> Self {
        Self {
            settings,
            state: AtomicU8::new(HostHealth::Healthy as u8),
            ext_failures: AtomicU64::new(0),
            local_failures: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            ejections: AtomicU64::new(0),
            ejected_at: RwLock::new(None),
            host: host.to_string(),
        }
    }

    /// Current health, moving an ejected host to probing once its time is up
    pub fn health(&self) -> HostHealth {
        let state = HostHealth::from(self.state.load(Ordering::Relaxed));

        if state == HostHealth::Ejected {
            if let Some(ejected) = *self.ejected_at.read() {
                if ejected.elapsed() >= self.settings.base_ejection_time {
                    self.state.store(HostHealth::Probing as u8, Ordering::Relaxed);
                    info!(host = %self.host, "Host ejection expired, probing");
                    return HostHealth::Probing;
                }
            }
        }

        state
    }

    /// Number of times the host has been ejected
    pub fn ejections(&self) -> u64 {
        self.ejections.load(Ordering::Relaxed)
    }

    fn record_success(&self) {
        match self.health() {
            HostHealth::Healthy => {
                self.ext_failures.store(0, Ordering::Relaxed);
                self.local_failures.store(0, Ordering::Relaxed);
            }
            HostHealth::Probing => {
                let count = self.successes.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(host = %self.host, count, threshold = self.settings.success_threshold, "Host success while probing");

                if count >= self.settings.success_threshold as u64 {
                    self.state.store(HostHealth::Healthy as u8, Ordering::Relaxed);
                    self.ext_failures.store(0, Ordering::Relaxed);
                    self.local_failures.store(0, Ordering::Relaxed);
                    self.successes.store(0, Ordering::Relaxed);
                    *self.ejected_at.write() = None;
                    info!(host = %self.host, "Host restored");
                }
            }
            HostHealth::Ejected => {}
        }
    }

    fn record_failure(&self, local_origin: bool) {
        let now = Instant::now();

        match self.health() {
            HostHealth::Healthy => {
                let (counter, threshold) = if local_origin {
                    (&self.local_failures, self.settings.consecutive_local_origin_failures)
                } else {
                    (&self.ext_failures, self.settings.consecutive_failures)
                };
                let count = counter.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(host = %self.host, count, threshold, local_origin, "Host failure recorded");

                if count >= threshold as u64 {
                    self.eject(now);
                    warn!(host = %self.host, failures = count, local_origin, "Host ejected");
                }
            }
            HostHealth::Probing => {
                self.successes.store(0, Ordering::Relaxed);
                self.eject(now);
                warn!(host = %self.host, "Host ejected again after failure while probing");
            }
            HostHealth::Ejected => {
                *self.ejected_at.write() = Some(now);
            }
        }
    }

    fn eject(&self, now: Instant) {
        self.state.store(HostHealth::Ejected as u8, Ordering::Relaxed);
        self.ejections.fetch_add(1, Ordering::Relaxed);
        *self.ejected_at.write() = Some(now);
    }

    /// Snapshot for logging and admin output
    pub fn stats(&self) -> DetectorStats {
        DetectorStats {
            host: self.host.clone(),
            health: self.health(),
            ext_failures: self.ext_failures.load(Ordering::Relaxed),
            local_failures: self.local_failures.load(Ordering::Relaxed),
            ejections: self.ejections(),
        }
    }
}

impl OutlierDetector for ConsecutiveFailureDetector {
    fn put_result(&self, result: OutlierResult) {
        if result.is_success() {
            self.record_success();
        } else {
            self.record_failure(result.is_local_origin());
        }
    }

    fn ejected(&self) -> bool {
        self.health() == HostHealth::Ejected
    }
}

#[derive(Debug, Clone)]
pub struct DetectorStats {
    pub host: String,
    pub health: HostHealth,
    pub ext_failures: u64,
    pub local_failures: u64,
    pub ejections: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn detector(settings: DetectorSettings) -> ConsecutiveFailureDetector {
        ConsecutiveFailureDetector::new("10.0.0.1:9090", settings)
    }

    #[test]
    fn test_detector_starts_healthy() {
        let d = detector(DetectorSettings::default());
        assert_eq!(d.health(), HostHealth::Healthy);
        assert!(!d.ejected());
    }

    #[test]
    fn test_ejects_after_consecutive_request_failures() {
        let d = detector(DetectorSettings {
            consecutive_failures: 3,
            ..Default::default()
        });

        d.put_result(OutlierResult::ExtOriginRequestFailed);
        d.put_result(OutlierResult::ExtOriginRequestFailed);
        assert!(!d.ejected());

        d.put_result(OutlierResult::ExtOriginRequestFailed);
        assert!(d.ejected());
        assert_eq!(d.ejections(), 1);
    }

    #[test]
    fn test_local_and_external_failures_count_separately() {
        let d = detector(DetectorSettings {
            consecutive_failures: 2,
            consecutive_local_origin_failures: 3,
            ..Default::default()
        });

        d.put_result(OutlierResult::LocalOriginConnectFailed);
        d.put_result(OutlierResult::ExtOriginRequestFailed);
        d.put_result(OutlierResult::LocalOriginTimeout);
        assert!(!d.ejected());

        let stats = d.stats();
        assert_eq!(stats.local_failures, 2);
        assert_eq!(stats.ext_failures, 1);

        d.put_result(OutlierResult::LocalOriginConnectFailed);
        assert!(d.ejected());
    }

    #[test]
    fn test_success_resets_failure_runs() {
        let d = detector(DetectorSettings {
            consecutive_failures: 3,
            ..Default::default()
        });

        d.put_result(OutlierResult::ExtOriginRequestFailed);
        d.put_result(OutlierResult::ExtOriginRequestFailed);
        d.put_result(OutlierResult::LocalOriginConnectSuccess);

        d.put_result(OutlierResult::ExtOriginRequestFailed);
        d.put_result(OutlierResult::ExtOriginRequestFailed);
        assert!(!d.ejected());

        d.put_result(OutlierResult::ExtOriginRequestFailed);
        assert!(d.ejected());
    }

    #[test]
    fn test_ejected_host_half_opens_after_ejection_time() {
        let d = detector(DetectorSettings {
            consecutive_failures: 1,
            success_threshold: 2,
            base_ejection_time: Duration::from_millis(10),
            ..Default::default()
        });

        d.put_result(OutlierResult::ExtOriginRequestFailed);
        assert_eq!(d.health(), HostHealth::Ejected);

        thread::sleep(Duration::from_millis(20));
        assert_eq!(d.health(), HostHealth::Probing);
        assert!(!d.ejected());

        d.put_result(OutlierResult::ExtOriginRequestSuccess);
        assert_eq!(d.health(), HostHealth::Probing);

        d.put_result(OutlierResult::ExtOriginRequestSuccess);
        assert_eq!(d.health(), HostHealth::Healthy);
    }

    #[test]
    fn test_failure_while_probing_ejects_again() {
        let d = detector(DetectorSettings {
            consecutive_failures: 1,
            base_ejection_time: Duration::from_millis(10),
            ..Default::default()
        });

        d.put_result(OutlierResult::ExtOriginRequestFailed);
        thread::sleep(Duration::from_millis(20));
        assert_eq!(d.health(), HostHealth::Probing);

        d.put_result(OutlierResult::LocalOriginTimeout);
        assert_eq!(d.health(), HostHealth::Ejected);
        assert_eq!(d.ejections(), 2);
    }

    #[test]
    fn test_settings_from_config() {
        let config = OutlierDetectionConfig {
            consecutive_failures: 7,
            consecutive_local_origin_failures: 3,
            success_threshold: 4,
            base_ejection_time_ms: 1500,
        };
        let settings = DetectorSettings::from(&config);
        assert_eq!(settings.consecutive_failures, 7);
        assert_eq!(settings.consecutive_local_origin_failures, 3);
        assert_eq!(settings.success_threshold, 4);
        assert_eq!(settings.base_ejection_time, Duration::from_millis(1500));
    }
}
