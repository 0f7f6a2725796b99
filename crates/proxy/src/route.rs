//! Route matching and routing table

use config::RouteConfig;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::codec::{Request, Status, StatusCode};
use crate::error::Result;

/// Where a matched request goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    name: String,
    cluster: Option<String>,
    direct_response: Option<Status>,
    metadata: HashMap<String, String>,
}

impl RouteEntry {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            cluster: None,
            direct_response: None,
            metadata: HashMap::new(),
        }
    }

    pub fn with_cluster(mut self, cluster: impl Into<String>) -> Self {
        self.cluster = Some(cluster.into());
        self
    }

    pub fn with_direct_response(mut self, status: Status) -> Self {
        self.direct_response = Some(status);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    pub fn from_config(config: &RouteConfig) -> Result<Self> {
        let mut entry = Self::new(&config.name);
        entry.cluster = config.cluster.clone();
        if let Some(direct) = &config.direct_response {
            let code: StatusCode = direct.status.parse()?;
            entry.direct_response = Some(Status::new(code, &direct.message));
        }
        entry.metadata = config.metadata.clone();
        Ok(entry)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn cluster(&self) -> Option<&str> {
        self.cluster.as_deref()
    }

    /// Status to answer with locally, if the route does not proxy
    pub fn direct_response(&self) -> Option<&Status> {
        self.direct_response.as_ref()
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }
}

/// Resolves the route for a decoded request
pub trait RouteMatcher: Send + Sync {
    fn route_entry(&self, request: &dyn Request) -> Option<Arc<RouteEntry>>;
}

/// Request predicate; unset fields match anything
#[derive(Debug, Clone, Default)]
pub struct RouteMatch {
    pub service: Option<String>,
    pub method: Option<String>,
    pub properties: HashMap<String, String>,
}

impl RouteMatch {
    pub fn matches(&self, request: &dyn Request) -> bool {
        if let Some(service) = &self.service {
            if service != request.host() {
                return false;
            }
        }
        if let Some(method) = &self.method {
            if method != request.method() {
                return false;
            }
        }
        self.properties
            .iter()
            .all(|(key, value)| request.get(key) == Some(value.as_str()))
    }
}

/// Ordered routes for one listener, first match wins
pub struct RouteTable {
    listener: String,
    routes: Vec<(RouteMatch, Arc<RouteEntry>)>,
}

impl RouteTable {
    pub fn new(listener: impl Into<String>) -> Self {
        Self {
            listener: listener.into(),
            routes: Vec::new(),
        }
    }

    pub fn from_config(listener: &str, routes: &[RouteConfig]) -> Result<Self> {
        let mut table = Self::new(listener);
        for route in routes {
            let matcher = RouteMatch {
                service: route.service.clone(),
                method: route.method.clone(),
                properties: route.properties.clone(),
            };
            table.add_route(matcher, RouteEntry::from_config(route)?);
        }
        debug!(listener = %listener, routes = table.len(), "Built route table");
        Ok(table)
    }

    pub fn add_route(&mut self, matcher: RouteMatch, entry: RouteEntry) {
        self.routes.push((matcher, Arc::new(entry)));
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl RouteMatcher for RouteTable {
    fn route_entry(&self, request: &dyn Request) -> Option<Arc<RouteEntry>> {
        let service = request.host();
        let method = request.method();

        for (matcher, entry) in &self.routes {
            if matcher.matches(request) {
                debug!(listener = %self.listener, service = %service, method = %method, route = %entry.name(), "Route matched");
                return Some(entry.clone());
            }
        }

        debug!(listener = %self.listener, service = %service, method = %method, "No route matched");
        None
    }
}
