//! Upstream hosts

use crate::outlier::{ConsecutiveFailureDetector, DetectorSettings, OutlierDetector};
use proxy::metrics::Gauge;
use std::fmt;
use std::sync::Arc;

/// One upstream endpoint of a cluster
pub struct Host {
    address: String,
    cluster: String,
    outlier_detector: Arc<dyn OutlierDetector>,
    active_requests: Gauge,
}

impl Host {
    pub fn new(
        address: impl Into<String>,
        cluster: impl Into<String>,
        outlier_detector: Arc<dyn OutlierDetector>,
    ) -> Self {
        Self {
            address: address.into(),
            cluster: cluster.into(),
            outlier_detector,
            active_requests: Gauge::new(),
        }
    }

    /// Host with a consecutive-failure detector built from `settings`
    pub fn with_settings(
        address: impl Into<String>,
        cluster: impl Into<String>,
        settings: DetectorSettings,
    ) -> Self {
        let address = address.into();
        let detector = Arc::new(ConsecutiveFailureDetector::new(&address, settings));
        Self::new(address, cluster, detector)
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    pub fn outlier_detector(&self) -> &dyn OutlierDetector {
        self.outlier_detector.as_ref()
    }

    /// Requests currently holding a connection to this host
    pub fn active_requests(&self) -> &Gauge {
        &self.active_requests
    }

    /// Stat label of the form `cluster/address`
    pub fn stat_name(&self) -> String {
        format!("{}/{}", self.cluster, self.address)
    }
}

impl fmt::Debug for Host {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Host")
            .field("address", &self.address)
            .field("cluster", &self.cluster)
            .field("ejected", &self.outlier_detector.ejected())
            .field("active_requests", &self.active_requests.get())
            .finish()
    }
}
