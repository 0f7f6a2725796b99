//! Router stream filter
//!
//! The `router` filter is the terminal decoder filter of a listener that
//! proxies calls. For each stream it resolves the route's cluster, picks a
//! host, and drives one [`UpstreamRequest`] from connection acquisition to
//! the response, which it hands back to the stream as a text reply.
//!
//! Pool and upstream connection callbacks arrive from the event loop's
//! socket tasks. The router only queues them on the stream's dispatcher,
//! so the upstream request is never re-entered.

use crate::app_exception::{AppException, AppExceptionType};
use crate::cluster::{Cluster, ClusterManager};
use crate::conn_pool::{thread_local_pool, PoolSettings};
use crate::converter::{RequestLine, TextConverter};
use crate::host::Host;
use crate::pool::{
    ConnectionData, ConnectionPool, PoolCallbacks, PoolFailureReason, UpstreamCallbacks,
};
use crate::protocol::{MessageMetadata, MessageType, Protocol};
use crate::stats::RouterStats;
use crate::upstream_request::{RequestOwner, UpstreamRequest};
use bytes::BytesMut;
use config::FilterEntry;
use proxy::{
    ConnectionEvent, DecoderFilter, Dispatcher, FilterChain, FilterChainFactory, FilterRegistry,
    FilterStatus, Request, Response, Status, StatusCode, StreamBase, StreamHandle,
};
use std::cell::{OnceCell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, trace, warn};

pub const FILTER_NAME: &str = "router";

/// Request property copied onto the reply
const REQUEST_ID_KEY: &str = "id";

/// Where the router gets the connection pool for a host
pub trait PoolSource: Send + Sync {
    fn pool(&self, cluster: &Cluster, host: &Arc<Host>) -> Rc<dyn ConnectionPool>;
}

/// TCP pools owned by the current event loop thread
pub struct TcpPools {
    stats: Arc<RouterStats>,
}

impl TcpPools {
    pub fn new(stats: Arc<RouterStats>) -> Self {
        Self { stats }
    }
}

impl PoolSource for TcpPools {
    fn pool(&self, cluster: &Cluster, host: &Arc<Host>) -> Rc<dyn ConnectionPool> {
        thread_local_pool(host, PoolSettings::from_cluster(cluster), &self.stats)
    }
}

/// Adds a [`RouterFilter`] to every stream
pub struct RouterFactory {
    clusters: Arc<ClusterManager>,
    stats: Arc<RouterStats>,
    pools: Arc<dyn PoolSource>,
}

impl RouterFactory {
    /// Router connecting over TCP
    pub fn new(clusters: Arc<ClusterManager>, stats: Arc<RouterStats>) -> Self {
        let pools = Arc::new(TcpPools::new(stats.clone()));
        Self::with_pools(clusters, stats, pools)
    }

    pub fn with_pools(
        clusters: Arc<ClusterManager>,
        stats: Arc<RouterStats>,
        pools: Arc<dyn PoolSource>,
    ) -> Self {
        Self {
            clusters,
            stats,
            pools,
        }
    }

    pub fn stats(&self) -> &Arc<RouterStats> {
        &self.stats
    }

    /// Make the `router` filter name resolve to this factory
    pub fn register(self: Arc<Self>, registry: &mut FilterRegistry) {
        registry.register(FILTER_NAME, move |_entry: &FilterEntry| {
            let factory: Arc<dyn FilterChainFactory> = self.clone();
            Ok(factory)
        });
    }
}

impl FilterChainFactory for RouterFactory {
    fn create_filter_chain(&self, chain: &mut FilterChain) {
        chain.add_decoder_filter(RouterFilter {
            clusters: self.clusters.clone(),
            stats: self.stats.clone(),
            pools: self.pools.clone(),
            router: None,
        });
    }
}

pub struct RouterFilter {
    clusters: Arc<ClusterManager>,
    stats: Arc<RouterStats>,
    pools: Arc<dyn PoolSource>,
    router: Option<Rc<Router>>,
}

impl DecoderFilter for RouterFilter {
    fn set_decoder_callbacks(&mut self, callbacks: StreamHandle) {
        self.router = Some(Router::new(callbacks, self.stats.clone()));
    }

    fn on_stream_decoded(&mut self, request: &mut dyn Request) -> FilterStatus {
        match &self.router {
            Some(router) => router.route(request, &self.clusters, self.pools.as_ref()),
            None => FilterStatus::Continue,
        }
    }

    fn on_destroy(&mut self) {
        if let Some(router) = self.router.take() {
            router.destroy();
        }
    }
}

/// Upstream side of one routed stream
pub struct Router {
    weak_self: Weak<Router>,
    handle: StreamHandle,
    stats: Arc<RouterStats>,
    cluster: OnceCell<String>,
    request: RefCell<Option<RequestLine>>,
    pending_write: RefCell<BytesMut>,
    upstream: RefCell<Option<UpstreamRequest>>,
    converter: RefCell<TextConverter>,
}

impl Router {
    pub fn new(handle: StreamHandle, stats: Arc<RouterStats>) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            handle,
            stats,
            cluster: OnceCell::new(),
            request: RefCell::new(None),
            pending_write: RefCell::new(BytesMut::new()),
            upstream: RefCell::new(None),
            converter: RefCell::new(TextConverter::new()),
        })
    }

    fn route(
        &self,
        request: &dyn Request,
        clusters: &ClusterManager,
        pools: &dyn PoolSource,
    ) -> FilterStatus {
        let Some(route) = self.handle.route_entry() else {
            debug!(service = %request.host(), method = %request.method(), "No route for request");
            self.stats.inc_route_missing(request.host());
            self.handle.send_local_reply(
                Status::new(
                    StatusCode::NotFound,
                    format!("no route for {}.{}", request.host(), request.method()),
                ),
                None,
            );
            return FilterStatus::StopIteration;
        };
        let Some(cluster_name) = route.cluster() else {
            trace!(route = %route.name(), "Route has no cluster, passing through");
            return FilterStatus::Continue;
        };

        let cluster = match clusters.get(cluster_name) {
            Ok(cluster) => cluster,
            Err(e) => {
                warn!(route = %route.name(), error = %e, "Route names an unknown cluster");
                self.stats.inc_unknown_cluster(cluster_name);
                self.handle
                    .send_local_reply(Status::new(StatusCode::Internal, e.to_string()), None);
                return FilterStatus::StopIteration;
            }
        };
        let host = match cluster.choose_host() {
            Ok(host) => host,
            Err(e) => {
                warn!(cluster = %cluster_name, error = %e, "No upstream host available");
                self.stats.inc_no_healthy_upstream(cluster_name);
                self.handle
                    .send_local_reply(Status::new(StatusCode::Unavailable, e.to_string()), None);
                return FilterStatus::StopIteration;
            }
        };
        let _ = self.cluster.set(cluster.name().to_string());

        let mut line = RequestLine::new(request.host(), request.method());
        request.for_each(&mut |key, value| {
            line.push_property(key, value);
            true
        });
        *self.request.borrow_mut() = Some(line);

        let metadata = MessageMetadata::new()
            .with_method_name(request.method())
            .with_message_type(MessageType::Call);
        let pool = pools.pool(&cluster, &host);
        debug!(
            stream_id = self.handle.stream_id(),
            cluster = %cluster.name(),
            host = %host.address(),
            "Routing request upstream"
        );

        *self.upstream.borrow_mut() =
            Some(UpstreamRequest::for_cluster(self.stats.clone(), &cluster, metadata));
        let status = match self.upstream.borrow_mut().as_mut() {
            Some(upstream) => upstream.start(pool.as_ref(), self),
            None => FilterStatus::StopIteration,
        };
        if status == FilterStatus::Continue {
            self.write_request();
        }
        FilterStatus::StopIteration
    }

    /// Write the request once a connection is attached
    fn write_request(&self) {
        let mut upstream = self.upstream.borrow_mut();
        let Some(upstream) = upstream.as_mut() else {
            return;
        };
        if !upstream.has_connection() || upstream.request_complete() {
            return;
        }
        let written = upstream.encode_and_write(&mut self.pending_write.borrow_mut());
        self.add_size(written);
        upstream.on_request_complete(self);
    }

    fn handle_data(&self, mut data: BytesMut) {
        let done = {
            let mut upstream = self.upstream.borrow_mut();
            let Some(upstream) = upstream.as_mut() else {
                return;
            };
            if !upstream.has_connection() || upstream.response_complete() {
                trace!(bytes = data.len(), "Ignoring upstream data for a finished request");
                return;
            }
            let mut converter = self.converter.borrow_mut();
            upstream.handle_upstream_data(&mut data, false, &mut *converter, self)
        };
        if done {
            self.forward_reply();
        }
    }

    fn handle_event(&self, event: ConnectionEvent) {
        let mut upstream = self.upstream.borrow_mut();
        let Some(upstream) = upstream.as_mut() else {
            return;
        };
        if !upstream.has_connection() || upstream.response_complete() {
            trace!(?event, "Ignoring upstream event for a finished request");
            return;
        }
        upstream.on_event(event, self);
    }

    fn forward_reply(&self) {
        let (response, decode_error) = {
            let mut converter = self.converter.borrow_mut();
            (
                converter.take_response(),
                converter.decode_error().map(str::to_string),
            )
        };

        if let Some(error) = decode_error {
            self.send_local_reply(
                AppException::new(AppExceptionType::ProtocolError, error),
                true,
            );
            return;
        }
        let Some(mut response) = response else {
            return;
        };
        if let Some(id) = self.request_id() {
            response.set(REQUEST_ID_KEY, &id);
        }
        self.handle.upstream_response(Box::new(response));
    }

    fn request_id(&self) -> Option<String> {
        self.request
            .borrow()
            .as_ref()
            .and_then(|line| line.get(REQUEST_ID_KEY))
            .map(str::to_string)
    }

    /// Run `operation` on the stream's dispatcher if the router still exists
    fn defer<F>(&self, operation: F)
    where
        F: FnOnce(&Router) + 'static,
    {
        let router = self.weak_self.clone();
        self.handle.dispatcher().post(move || {
            if let Some(router) = router.upgrade() {
                operation(&router);
            }
        });
    }

    /// Drop the upstream request, cancelling or closing whatever it holds
    fn destroy(&self) {
        let upstream = self.upstream.borrow_mut().take();
        if let Some(mut upstream) = upstream {
            if !upstream.response_complete() {
                debug!(stream_id = self.handle.stream_id(), "Stream destroyed before the upstream response");
                upstream.reset_stream();
            }
        }
    }
}

impl RequestOwner for Router {
    fn cluster(&self) -> &str {
        self.cluster.get().map(String::as_str).unwrap_or("")
    }

    fn dispatcher(&self) -> Rc<Dispatcher> {
        self.handle.dispatcher().clone()
    }

    fn add_size(&self, size: u64) {
        self.stats.record_request_size(self.cluster(), size);
    }

    fn upstream_callbacks(&self) -> Weak<dyn UpstreamCallbacks> {
        self.weak_self.clone()
    }

    fn pool_callbacks(&self) -> Weak<dyn PoolCallbacks> {
        self.weak_self.clone()
    }

    fn init_protocol_converter(&self, protocol: &dyn Protocol) {
        trace!(protocol = protocol.name(), "Converting request");
        self.pending_write.borrow_mut().clear();
    }

    fn convert_message_begin(&self, metadata: &MessageMetadata) {
        if let Some(line) = self.request.borrow().as_ref() {
            line.encode(metadata, &mut self.pending_write.borrow_mut());
        }
    }

    fn continue_decoding(&self) {
        self.defer(|router| router.write_request());
    }

    fn send_local_reply(&self, exception: AppException, end_stream: bool) {
        debug!(
            stream_id = self.handle.stream_id(),
            exception = %exception.exception_type().as_str(),
            end_stream,
            "Upstream local reply"
        );
        self.handle.send_local_reply(
            Status::new(StatusCode::Internal, exception.message()),
            Some(Box::new(move |response: &mut dyn Response| {
                if end_stream {
                    response.set("connection", "close");
                }
            })),
        );
    }

    fn reset_downstream_connection(&self) {
        self.handle.reset_downstream_connection();
    }

    fn on_reset(&self) {
        self.handle.reset_stream();
    }
}

impl PoolCallbacks for Router {
    fn on_pool_ready(&self, conn_data: Box<dyn ConnectionData>, host: Arc<Host>) {
        self.defer(move |router| {
            if let Some(upstream) = router.upstream.borrow_mut().as_mut() {
                upstream.on_pool_ready(conn_data, host, router);
            }
        });
    }

    fn on_pool_failure(&self, reason: PoolFailureReason, host: Option<Arc<Host>>) {
        self.defer(move |router| {
            if let Some(upstream) = router.upstream.borrow_mut().as_mut() {
                upstream.on_pool_failure(reason, host, router);
            }
        });
    }
}

impl UpstreamCallbacks for Router {
    fn on_upstream_data(&self, data: &mut BytesMut, _end_stream: bool) {
        let data = data.split();
        self.defer(move |router| router.handle_data(data));
    }

    fn on_event(&self, event: ConnectionEvent) {
        self.defer(move |router| router.handle_event(event));
    }
}

/// Register the TCP router for `clusters` under [`FILTER_NAME`]
pub fn register_router(
    registry: &mut FilterRegistry,
    clusters: Arc<ClusterManager>,
    stats: Arc<RouterStats>,
) -> Arc<RouterFactory> {
    let factory = Arc::new(RouterFactory::new(clusters, stats));
    factory.clone().register(registry);
    factory
}
