//! Upstream clusters built from configuration

use crate::error::{Result, RouterError};
use crate::host::Host;
use crate::outlier::{DetectorSettings, OutlierDetector};
use crate::protocol::{ProtocolType, TransportType};
use config::ClusterConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A named group of hosts sharing transport and protocol settings
pub struct Cluster {
    name: String,
    hosts: Vec<Arc<Host>>,
    transport: TransportType,
    protocol: ProtocolType,
    close_downstream_on_error: bool,
    max_connections: usize,
    connect_timeout: Duration,
    counter: AtomicUsize,
}

impl Cluster {
    pub fn from_config(config: &ClusterConfig) -> Result<Self> {
        if config.hosts.is_empty() {
            return Err(RouterError::NoHosts(config.name.clone()));
        }

        let settings = DetectorSettings::from(&config.outlier_detection);
        let hosts = config
            .hosts
            .iter()
            .map(|address| Arc::new(Host::with_settings(address.as_str(), config.name.as_str(), settings.clone())))
            .collect();

        Ok(Self {
            name: config.name.clone(),
            hosts,
            transport: config.transport.into(),
            protocol: config.protocol.into(),
            close_downstream_on_error: config.close_downstream_on_error,
            max_connections: config.max_connections,
            connect_timeout: Duration::from_secs(config.connect_timeout),
            counter: AtomicUsize::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.hosts
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn protocol(&self) -> ProtocolType {
        self.protocol
    }

    pub fn close_downstream_on_error(&self) -> bool {
        self.close_downstream_on_error
    }

    /// Connection budget of each host, enforced by its pool
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Round-robin over hosts that are not ejected
    pub fn choose_host(&self) -> Result<Arc<Host>> {
        let healthy: Vec<_> = self
            .hosts
            .iter()
            .filter(|h| !h.outlier_detector().ejected())
            .collect();

        if healthy.is_empty() {
            return Err(RouterError::NoHealthyHost(self.name.clone()));
        }

        let idx = self.counter.fetch_add(1, Ordering::Relaxed) % healthy.len();
        let host = healthy[idx].clone();
        debug!(cluster = %self.name, host = %host.address(), "Selected upstream host");
        Ok(host)
    }
}

/// Clusters by name
#[derive(Default)]
pub struct ClusterManager {
    clusters: Vec<Arc<Cluster>>,
}

impl ClusterManager {
    pub fn from_config(configs: &[ClusterConfig]) -> Result<Self> {
        let clusters = configs
            .iter()
            .map(|c| Cluster::from_config(c).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { clusters })
    }

    pub fn get(&self, name: &str) -> Result<Arc<Cluster>> {
        self.clusters
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| RouterError::UnknownCluster(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outlier::OutlierResult;
    use config::{OutlierDetectionConfig, ProtocolKind, TransportKind};

    fn cluster_config(hosts: &[&str]) -> ClusterConfig {
        ClusterConfig {
            name: "users".to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            transport: TransportKind::Unframed,
            protocol: ProtocolKind::Compact,
            close_downstream_on_error: false,
            max_connections: 16,
            connect_timeout: 1,
            outlier_detection: OutlierDetectionConfig {
                consecutive_failures: 1,
                ..Default::default()
            },
        }
    }

    #[test]
    fn test_cluster_from_config() {
        let cluster = Cluster::from_config(&cluster_config(&["10.0.0.1:9090", "10.0.0.2:9090"])).unwrap();
        assert_eq!(cluster.name(), "users");
        assert_eq!(cluster.hosts().len(), 2);
        assert_eq!(cluster.transport(), TransportType::Unframed);
        assert_eq!(cluster.protocol(), ProtocolType::Compact);
        assert!(!cluster.close_downstream_on_error());
        assert_eq!(cluster.max_connections(), 16);
        assert_eq!(cluster.connect_timeout(), Duration::from_secs(1));
        assert_eq!(cluster.hosts()[1].stat_name(), "users/10.0.0.2:9090");
    }

    #[test]
    fn test_cluster_without_hosts_is_rejected() {
        let result = Cluster::from_config(&cluster_config(&[]));
        assert!(matches!(result, Err(RouterError::NoHosts(name)) if name == "users"));
    }

    #[test]
    fn test_choose_host_round_robin_skips_ejected() {
        let cluster = Cluster::from_config(&cluster_config(&["a:1", "b:1", "c:1"])).unwrap();

        let picked: Vec<_> = (0..3)
            .map(|_| cluster.choose_host().unwrap().address().to_string())
            .collect();
        assert_eq!(picked, vec!["a:1", "b:1", "c:1"]);

        cluster.hosts()[1]
            .outlier_detector()
            .put_result(OutlierResult::ExtOriginRequestFailed);
        for _ in 0..4 {
            assert_ne!(cluster.choose_host().unwrap().address(), "b:1");
        }
    }

    #[test]
    fn test_choose_host_all_ejected() {
        let cluster = Cluster::from_config(&cluster_config(&["a:1"])).unwrap();
        cluster.hosts()[0]
            .outlier_detector()
            .put_result(OutlierResult::ExtOriginRequestFailed);
        assert!(matches!(cluster.choose_host(), Err(RouterError::NoHealthyHost(_))));
    }

    #[test]
    fn test_cluster_manager_lookup() {
        let manager = ClusterManager::from_config(&[cluster_config(&["a:1"])]).unwrap();
        assert_eq!(manager.len(), 1);
        assert!(manager.get("users").is_ok());
        assert!(matches!(manager.get("orders"), Err(RouterError::UnknownCluster(_))));
    }
}
