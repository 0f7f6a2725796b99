//! Built-in stream filters, looked up by configured name

pub mod access_log;
pub mod direct_response;
pub mod set_metadata;

use config::FilterEntry;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ProxyError, Result};
use crate::filter::FilterChainFactory;

pub use access_log::{AccessLogEntry, AccessLogFactory, AccessLogFilter, AccessLogger, LogFormat};
pub use direct_response::{DirectResponseFactory, DirectResponseFilter};
pub use set_metadata::SetMetadataFactory;

/// Build the factory for one configured filter
pub fn filter_factory(entry: &FilterEntry) -> Result<Arc<dyn FilterChainFactory>> {
    let factory: Arc<dyn FilterChainFactory> = match entry.name.as_str() {
        access_log::FILTER_NAME => Arc::new(AccessLogFactory::from_config(entry)?),
        direct_response::FILTER_NAME => Arc::new(DirectResponseFactory),
        set_metadata::FILTER_NAME => Arc::new(SetMetadataFactory::from_config(entry)),
        other => return Err(ProxyError::UnknownFilter(other.to_string())),
    };
    Ok(factory)
}

/// Builds a filter factory from its configuration entry
pub type FactoryBuilder =
    Arc<dyn Fn(&FilterEntry) -> Result<Arc<dyn FilterChainFactory>> + Send + Sync>;

/// Filters provided outside this crate, keyed by configured name
///
/// Names registered here take precedence over the built-in filters.
#[derive(Clone, Default)]
pub struct FilterRegistry {
    builders: HashMap<String, FactoryBuilder>,
}

impl FilterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, builder: F)
    where
        F: Fn(&FilterEntry) -> Result<Arc<dyn FilterChainFactory>> + Send + Sync + 'static,
    {
        self.builders.insert(name.into(), Arc::new(builder));
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.builders.contains_key(name)
    }

    /// Build the factory for one configured filter
    pub fn build(&self, entry: &FilterEntry) -> Result<Arc<dyn FilterChainFactory>> {
        match self.builders.get(&entry.name) {
            Some(builder) => builder(entry),
            None => filter_factory(entry),
        }
    }
}
