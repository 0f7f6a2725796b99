//! Connection-level stream registry
//!
//! One [`ProxyFilter`] is created per downstream connection. It feeds bytes
//! to the codec, creates an [`ActiveStream`] for every decoded request, and
//! tears streams down through the dispatcher's deferred delete list.

use bytes::BytesMut;
use config::ListenerConfig;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::codec::{
    codec_factory, CodecFactory, MessageCreator, Request, RequestDecoder, RequestDecoderCallbacks,
    RequestPtr, Response, ResponseEncoder,
};
use crate::connection::{
    CloseType, ConnectionEvent, ConnectionState, DownstreamConnection, DrainDecision,
};
use crate::dispatcher::Dispatcher;
use crate::error::Result;
use crate::filter::{FilterChain, FilterChainFactory, FilterStatus};
use crate::filters::FilterRegistry;
use crate::metrics::ProxyStats;
use crate::route::{RouteEntry, RouteMatcher, RouteTable};
use crate::runtime::Runtime;
use crate::stream::ActiveStream;
use crate::tracer::{LogTracer, Tracer, TracingConfig};

/// Everything a listener's connections share
pub struct FilterConfig {
    stat_prefix: String,
    codec_factory: Arc<dyn CodecFactory>,
    route_matcher: Arc<dyn RouteMatcher>,
    filter_factories: Vec<Arc<dyn FilterChainFactory>>,
    tracing_config: Option<Arc<TracingConfig>>,
    tracer: Option<Arc<dyn Tracer>>,
    stats: Arc<ProxyStats>,
}

impl FilterConfig {
    pub fn new(
        stat_prefix: impl Into<String>,
        codec_factory: Arc<dyn CodecFactory>,
        route_matcher: Arc<dyn RouteMatcher>,
    ) -> Self {
        let stat_prefix = stat_prefix.into();
        Self {
            stats: Arc::new(ProxyStats::new(stat_prefix.clone())),
            stat_prefix,
            codec_factory,
            route_matcher,
            filter_factories: Vec::new(),
            tracing_config: None,
            tracer: None,
        }
    }

    /// Build a listener's config with the built-in filters only
    pub fn from_config(listener: &ListenerConfig) -> Result<Self> {
        Self::from_config_with(listener, &FilterRegistry::new())
    }

    /// Build a listener's config: codec, routes, named filters and tracing.
    /// Filter names are resolved through `registry` first.
    pub fn from_config_with(listener: &ListenerConfig, registry: &FilterRegistry) -> Result<Self> {
        let codec = codec_factory(&listener.codec)?;
        let routes = RouteTable::from_config(&listener.name, &listener.routes)?;
        let mut config = Self::new(listener.stat_prefix(), codec, Arc::new(routes));

        for entry in &listener.filters {
            config = config.with_filter_factory(registry.build(entry)?);
        }
        if let Some(tracing) = &listener.tracing {
            config = config.with_tracing(TracingConfig::from_config(tracing), Arc::new(LogTracer));
        }

        info!(
            listener = %listener.name,
            codec = %listener.codec,
            filters = config.filter_factories.len(),
            routes = listener.routes.len(),
            "Built filter config"
        );
        Ok(config)
    }

    pub fn with_filter_factory(mut self, factory: Arc<dyn FilterChainFactory>) -> Self {
        self.filter_factories.push(factory);
        self
    }

    pub fn with_tracing(mut self, config: TracingConfig, tracer: Arc<dyn Tracer>) -> Self {
        self.tracing_config = Some(Arc::new(config));
        self.tracer = Some(tracer);
        self
    }

    /// Share stats with a previous config, so reloads keep counting
    pub fn with_stats(mut self, stats: Arc<ProxyStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stat_prefix(&self) -> &str {
        &self.stat_prefix
    }

    pub fn codec_factory(&self) -> &Arc<dyn CodecFactory> {
        &self.codec_factory
    }

    pub fn tracing_config(&self) -> Option<&Arc<TracingConfig>> {
        self.tracing_config.as_ref()
    }

    pub fn tracer(&self) -> Option<&Arc<dyn Tracer>> {
        self.tracer.as_ref()
    }

    pub fn stats(&self) -> &Arc<ProxyStats> {
        &self.stats
    }

    pub fn route_entry(&self, request: &dyn Request) -> Option<Arc<RouteEntry>> {
        self.route_matcher.route_entry(request)
    }
}

impl FilterChainFactory for FilterConfig {
    fn create_filter_chain(&self, chain: &mut FilterChain) {
        for factory in &self.filter_factories {
            factory.create_filter_chain(chain);
        }
    }
}

/// Stream registry for one downstream connection
pub struct ProxyFilter {
    weak_self: Weak<ProxyFilter>,
    config: Arc<FilterConfig>,
    runtime: Arc<dyn Runtime>,
    dispatcher: Rc<Dispatcher>,
    connection: Rc<dyn DownstreamConnection>,
    drain_decision: Arc<dyn DrainDecision>,

    decoder: RefCell<Box<dyn RequestDecoder>>,
    encoder: RefCell<Box<dyn ResponseEncoder>>,
    creator: Option<Box<dyn MessageCreator>>,

    active_streams: RefCell<Vec<Rc<ActiveStream>>>,
    downstream_connection_closed: Cell<bool>,
    next_stream_id: Cell<u64>,
}

impl ProxyFilter {
    pub fn new(
        config: Arc<FilterConfig>,
        runtime: Arc<dyn Runtime>,
        dispatcher: Rc<Dispatcher>,
        connection: Rc<dyn DownstreamConnection>,
        drain_decision: Arc<dyn DrainDecision>,
    ) -> Rc<Self> {
        let codec = config.codec_factory().clone();
        config.stats().downstream_cx_total.inc();
        config.stats().downstream_cx_active.inc();

        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            decoder: RefCell::new(codec.request_decoder()),
            encoder: RefCell::new(codec.response_encoder()),
            creator: codec.message_creator(),
            config,
            runtime,
            dispatcher,
            connection,
            drain_decision,
            active_streams: RefCell::new(Vec::new()),
            downstream_connection_closed: Cell::new(false),
            next_stream_id: Cell::new(0),
        })
    }

    pub fn config(&self) -> &Arc<FilterConfig> {
        &self.config
    }

    pub fn dispatcher(&self) -> &Rc<Dispatcher> {
        &self.dispatcher
    }

    pub fn runtime(&self) -> &dyn Runtime {
        self.runtime.as_ref()
    }

    pub fn connection(&self) -> &Rc<dyn DownstreamConnection> {
        &self.connection
    }

    pub(crate) fn weak(&self) -> Weak<ProxyFilter> {
        self.weak_self.clone()
    }

    pub(crate) fn message_creator(&self) -> Option<&dyn MessageCreator> {
        self.creator.as_deref()
    }

    pub fn active_stream_count(&self) -> usize {
        self.active_streams.borrow().len()
    }

    /// Snapshot of the in-flight streams, oldest first
    pub fn active_streams(&self) -> Vec<Rc<ActiveStream>> {
        self.active_streams.borrow().clone()
    }

    pub fn is_downstream_closed(&self) -> bool {
        self.downstream_connection_closed.get()
    }

    /// Feed bytes read from the connection
    pub fn on_data(&self, data: &mut BytesMut, _end_stream: bool) -> FilterStatus {
        if self.downstream_connection_closed.get() {
            return FilterStatus::StopIteration;
        }
        self.decoder.borrow_mut().decode(data, self);
        FilterStatus::StopIteration
    }

    pub fn on_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::RemoteClose | ConnectionEvent::LocalClose => {
                debug!(?event, streams = self.active_stream_count(), "Downstream connection closed");
                self.downstream_connection_closed.set(true);
                self.reset_streams_for_unexpected_error();
            }
            ConnectionEvent::Connected | ConnectionEvent::ConnectedZeroRtt => {}
        }
    }

    pub fn new_downstream_request(&self, request: RequestPtr) {
        let id = self.next_stream_id.get();
        self.next_stream_id.set(id + 1);

        debug!(
            stream_id = id,
            service = %request.host(),
            method = %request.method(),
            "New downstream request"
        );
        let stream = ActiveStream::new(self, id, request);

        let stats = self.config.stats();
        stats.downstream_rq_total.inc();
        stats.downstream_rq_active.inc();

        stream.set_inserted(true);
        self.active_streams.borrow_mut().push(stream.clone());

        stream.initialize_filter_chain(self.config.as_ref());
        stream.continue_decoding();
    }

    /// Complete a stream and schedule its destruction
    pub(crate) fn deferred_stream(&self, stream: &ActiveStream) {
        stream.complete_request();
        if !stream.inserted() {
            return;
        }

        let removed = {
            let mut streams = self.active_streams.borrow_mut();
            let index = streams
                .iter()
                .position(|s| std::ptr::eq(Rc::as_ptr(s), stream));
            index.map(|index| streams.remove(index))
        };
        stream.set_inserted(false);
        if let Some(removed) = removed {
            self.config.stats().downstream_rq_active.dec();
            self.dispatcher.deferred_delete(Box::new(removed));
        }

        self.may_be_drain_close();
    }

    /// Close the downstream connection and reset everything in flight
    pub fn close_downstream_connection(&self, close_type: CloseType) {
        if self.downstream_connection_closed.get() {
            return;
        }
        debug!(?close_type, streams = self.active_stream_count(), "Closing downstream connection");
        self.connection.close(close_type);
        self.on_event(ConnectionEvent::LocalClose);
    }

    pub fn reset_streams_for_unexpected_error(&self) {
        let streams = self.active_streams();
        for stream in streams {
            stream.reset_stream();
        }
    }

    /// Close the connection if draining and nothing is in flight
    pub fn may_be_drain_close(&self) {
        if self.drain_decision.drain_close()
            && self.active_streams.borrow().is_empty()
            && self.connection.state() == ConnectionState::Open
        {
            self.on_drain_close_and_no_active_streams();
        }
    }

    fn on_drain_close_and_no_active_streams(&self) {
        debug!("Drain closing idle connection");
        self.config.stats().downstream_cx_drain_close.inc();
        self.connection.close(CloseType::FlushWrite);
    }

    pub(crate) fn send_reply_downstream(&self, response: &dyn Response, stream: &ActiveStream) {
        self.encoder.borrow_mut().encode(response, stream);
    }

    pub(crate) fn write_downstream(&self, buffer: &mut BytesMut, end_stream: bool) {
        self.connection.write(buffer, end_stream);

        if self.connection.state() != ConnectionState::Open
            && !self.downstream_connection_closed.get()
        {
            let weak = self.weak_self.clone();
            self.dispatcher.post(move || {
                if let Some(filter) = weak.upgrade() {
                    filter.on_event(ConnectionEvent::LocalClose);
                }
            });
        }
    }
}

impl RequestDecoderCallbacks for ProxyFilter {
    fn on_decoding_success(&self, request: RequestPtr) {
        self.new_downstream_request(request);
    }

    fn on_decoding_failure(&self) {
        warn!(streams = self.active_stream_count(), "Downstream decoding failure");
        self.config.stats().downstream_rq_decoding_error.inc();
        self.reset_streams_for_unexpected_error();
        self.connection.close(CloseType::FlushWrite);
    }
}

impl Drop for ProxyFilter {
    fn drop(&mut self) {
        self.config.stats().downstream_cx_active.dec();
    }
}
