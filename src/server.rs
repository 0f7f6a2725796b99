//! TCP front end
//!
//! Each listener accepts on the current thread's `LocalSet`. Every accepted
//! connection gets its own dispatcher and [`ProxyFilter`]; after each read
//! the dispatcher runs until idle and buffered replies are flushed. Work
//! posted from upstream socket tasks wakes the connection loop.

use anyhow::{Context, Result};
use bytes::BytesMut;
use config::{ClusterConfig, Config, ConfigUpdate, FilterEntry, ListenerConfig};
use parking_lot::RwLock;
use proxy::{
    BufferedConnection, ConnectionEvent, ConnectionState, Dispatcher, DownstreamConnection,
    DrainDecision, DrainManager, FilterConfig, FilterRegistry, ProxyFilter, ProxyStats, Runtime,
    SnapshotRuntime,
};
use router::{register_router, ClusterManager, RouterStats};
use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, error, info, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(250);

/// Drain decision for one listener
pub struct ListenerDrain {
    manager: Arc<DrainManager>,
    drain_close: bool,
}

impl DrainDecision for ListenerDrain {
    fn drain_close(&self) -> bool {
        self.drain_close && self.manager.is_draining()
    }
}

/// Filters known by name, with the router bound to `clusters`
pub fn filter_registry(clusters: &[ClusterConfig], stats: Arc<RouterStats>) -> Result<FilterRegistry> {
    let clusters = ClusterManager::from_config(clusters).context("Invalid cluster configuration")?;
    let mut registry = FilterRegistry::new();
    register_router(&mut registry, Arc::new(clusters), stats);
    Ok(registry)
}

/// A listener whose routes name a cluster ends its chain with the router
pub fn with_router(listener: &ListenerConfig) -> Cow<'_, ListenerConfig> {
    let routes_upstream = listener
        .routes
        .iter()
        .any(|r| r.cluster.is_some() && r.direct_response.is_none());
    let has_router = listener.filters.iter().any(|f| f.name == router::FILTER_NAME);
    if !routes_upstream || has_router {
        return Cow::Borrowed(listener);
    }

    debug!(listener = %listener.name, "Appending router filter");
    let mut listener = listener.clone();
    listener.filters.push(FilterEntry {
        name: router::FILTER_NAME.to_string(),
        config: HashMap::new(),
    });
    Cow::Owned(listener)
}

fn build_filter_config(listener: &ListenerConfig, registry: &FilterRegistry) -> Result<FilterConfig> {
    let config = FilterConfig::from_config_with(&with_router(listener), registry)?;
    Ok(config)
}

/// A listener and its current filter config
pub struct ListenerHandle {
    name: String,
    address: String,
    config: RwLock<Arc<FilterConfig>>,
    drain: Arc<ListenerDrain>,
}

impl ListenerHandle {
    pub fn new(
        listener: &ListenerConfig,
        drain: Arc<DrainManager>,
        registry: &FilterRegistry,
    ) -> Result<Self> {
        let config = build_filter_config(listener, registry)
            .with_context(|| format!("Failed to build listener '{}'", listener.name))?;
        Ok(Self {
            name: listener.name.clone(),
            address: listener.address.clone(),
            config: RwLock::new(Arc::new(config)),
            drain: Arc::new(ListenerDrain {
                manager: drain,
                drain_close: listener.drain_close,
            }),
        })
    }

    /// Config handed to the next accepted connection
    pub fn current(&self) -> Arc<FilterConfig> {
        self.config.read().clone()
    }

    pub fn stats(&self) -> Arc<ProxyStats> {
        self.current().stats().clone()
    }

    /// Rebuild the filter config; connections already open keep the old one
    pub fn reload(&self, listener: &ListenerConfig, registry: &FilterRegistry) -> Result<()> {
        let config = build_filter_config(listener, registry)?.with_stats(self.stats());
        *self.config.write() = Arc::new(config);
        Ok(())
    }
}

pub struct Server {
    listeners: Vec<Arc<ListenerHandle>>,
    runtime: RwLock<Arc<dyn Runtime>>,
    drain: Arc<DrainManager>,
    router_stats: Arc<RouterStats>,
}

impl Server {
    pub fn from_config(config: &Config, drain: Arc<DrainManager>) -> Result<Self> {
        let router_stats = Arc::new(RouterStats::new());
        let registry = filter_registry(&config.clusters, router_stats.clone())?;
        let listeners = config
            .listeners
            .iter()
            .map(|l| ListenerHandle::new(l, drain.clone(), &registry).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        let runtime: Arc<dyn Runtime> = Arc::new(SnapshotRuntime::from_config(&config.runtime));
        Ok(Self {
            listeners,
            runtime: RwLock::new(runtime),
            drain,
            router_stats,
        })
    }

    pub fn stats(&self) -> Vec<Arc<ProxyStats>> {
        self.listeners.iter().map(|l| l.stats()).collect()
    }

    /// Upstream counters, shared across reloads
    pub fn router_stats(&self) -> &Arc<RouterStats> {
        &self.router_stats
    }

    fn runtime(&self) -> Arc<dyn Runtime> {
        self.runtime.read().clone()
    }

    /// Apply a reloaded configuration
    ///
    /// Changed listeners are rebuilt. A cluster change rebuilds every
    /// listener that routes upstream.
    pub fn apply(&self, update: &ConfigUpdate) {
        for name in &update.removed_listeners {
            warn!(listener = %name, "Listener removed from configuration, restart to stop it");
        }
        for name in &update.added_listeners {
            warn!(listener = %name, "New listener needs a restart");
        }

        let registry = match filter_registry(&update.config.clusters, self.router_stats.clone()) {
            Ok(registry) => registry,
            Err(e) => {
                error!(error = %e, "Keeping previous listener configs");
                return;
            }
        };

        for handle in &self.listeners {
            let Some(listener) = update.config.listeners.iter().find(|l| l.name == handle.name) else {
                continue;
            };
            let routes_upstream = || {
                with_router(listener)
                    .filters
                    .iter()
                    .any(|f| f.name == router::FILTER_NAME)
            };
            if !update.is_changed(&handle.name) && !(update.clusters_changed && routes_upstream()) {
                continue;
            }
            let Some(listener) = update.config.listeners.iter().find(|l| l.name == handle.name) else {
                continue;
            };
            if listener.address != handle.address {
                warn!(listener = %handle.name, address = %listener.address, "Address changes need a restart");
            }
            match handle.reload(listener, &registry) {
                Ok(()) => info!(listener = %handle.name, "Listener config reloaded"),
                Err(e) => error!(listener = %handle.name, error = %e, "Keeping previous listener config"),
            }
        }

        *self.runtime.write() = Arc::new(SnapshotRuntime::from_config(&update.config.runtime));
    }

    /// Bind every listener and serve until the process exits
    ///
    /// Must run inside a `LocalSet`.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut tasks = Vec::new();
        for handle in &self.listeners {
            let socket = TcpListener::bind(&handle.address)
                .await
                .with_context(|| format!("Failed to bind {} for listener '{}'", handle.address, handle.name))?;
            info!(listener = %handle.name, address = %handle.address, "Listening");
            tasks.push(tokio::task::spawn_local(accept_loop(
                socket,
                self.clone(),
                handle.clone(),
            )));
        }

        for task in tasks {
            task.await.context("Listener task failed")?;
        }
        Ok(())
    }
}

async fn accept_loop(socket: TcpListener, server: Arc<Server>, handle: Arc<ListenerHandle>) {
    loop {
        let (stream, peer) = match socket.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(listener = %handle.name, error = %e, "Accept failed");
                continue;
            }
        };

        if server.drain.is_draining() {
            debug!(listener = %handle.name, %peer, "Refusing connection while draining");
            continue;
        }

        let config = handle.current();
        let runtime = server.runtime();
        let drain = handle.drain.clone();
        tokio::task::spawn_local(async move {
            if let Err(e) = handle_connection(stream, peer, config, runtime, drain).await {
                debug!(%peer, error = %e, "Connection ended with an error");
            }
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    config: Arc<FilterConfig>,
    runtime: Arc<dyn Runtime>,
    drain: Arc<dyn DrainDecision>,
) -> std::io::Result<()> {
    debug!(%peer, "Accepted connection");
    let dispatcher = Dispatcher::with_real_time();
    let wakeup = Rc::new(Notify::new());
    {
        let wakeup = wakeup.clone();
        dispatcher.set_wakeup(move || wakeup.notify_one());
    }
    let connection = Rc::new(BufferedConnection::new());
    let proxy = ProxyFilter::new(config, runtime, dispatcher.clone(), connection.clone(), drain);

    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    let mut drain_check = tokio::time::interval(DRAIN_CHECK_INTERVAL);

    let result = loop {
        tokio::select! {
            read = stream.read_buf(&mut buffer) => match read {
                Ok(0) => {
                    debug!(%peer, "Peer closed connection");
                    proxy.on_event(ConnectionEvent::RemoteClose);
                    break Ok(());
                }
                Ok(n) => {
                    trace!(%peer, bytes = n, "Read from downstream");
                    proxy.on_data(&mut buffer, false);
                }
                Err(e) => {
                    proxy.on_event(ConnectionEvent::RemoteClose);
                    break Err(e);
                }
            },
            _ = drain_check.tick() => proxy.may_be_drain_close(),
            _ = wakeup.notified() => trace!(%peer, "Dispatcher woken"),
        }
        dispatcher.run_until_idle();

        let output = connection.take_output();
        if !output.is_empty() {
            trace!(%peer, bytes = output.len(), "Writing to downstream");
            if let Err(e) = stream.write_all(&output).await {
                proxy.on_event(ConnectionEvent::RemoteClose);
                break Err(e);
            }
        }

        if connection.state() != ConnectionState::Open {
            if !proxy.is_downstream_closed() {
                proxy.on_event(ConnectionEvent::LocalClose);
            }
            let _ = stream.shutdown().await;
            break Ok(());
        }
    };

    dispatcher.run_until_idle();
    debug!(%peer, bytes_written = connection.bytes_written(), "Connection closed");
    result
}
