//! Per-request stream state machine
//!
//! An [`ActiveStream`] owns one decoded request, its filter chain, the
//! pending response and the stream's trace span. Filters never touch the
//! stream directly; they hold a [`StreamHandle`] whose operations are queued
//! on the connection's dispatcher and run once the current callback returns.

use bytes::BytesMut;
use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::codec::{RequestPtr, Response, ResponseEncoderCallbacks, ResponsePtr, Status};
use crate::connection::CloseType;
use crate::dispatcher::Dispatcher;
use crate::filter::{
    DecoderFilterEntry, EncoderFilterEntry, FilterChain, FilterChainFactory, FilterStatus,
};
use crate::proxy::{FilterConfig, ProxyFilter};
use crate::route::RouteEntry;
use crate::stream_info::StreamInfo;
use crate::tracer::{finalize_span, tracing_decision, Span, TracingConfig};

/// Mutation applied to a locally generated response before it is encoded
pub type ResponseUpdate = Box<dyn FnOnce(&mut dyn Response)>;

pub struct ActiveStream {
    id: u64,
    weak_self: Weak<ActiveStream>,
    parent: Weak<ProxyFilter>,
    dispatcher: Rc<Dispatcher>,
    config: Arc<FilterConfig>,

    request: RefCell<Option<RequestPtr>>,
    response: RefCell<Option<ResponsePtr>>,

    decoder_filters: RefCell<Vec<DecoderFilterEntry>>,
    encoder_filters: RefCell<Vec<EncoderFilterEntry>>,
    next_decoder_filter_index: Cell<usize>,
    next_encoder_filter_index: Cell<usize>,

    route_resolved: Cell<bool>,
    cached_route_entry: RefCell<Option<Arc<RouteEntry>>>,

    reset: Cell<bool>,
    completed: Cell<bool>,
    inserted: Cell<bool>,

    tracing_config: Option<Arc<TracingConfig>>,
    active_span: RefCell<Option<Box<dyn Span>>>,
    stream_info: RefCell<StreamInfo>,
}

impl ActiveStream {
    pub(crate) fn new(parent: &ProxyFilter, id: u64, request: RequestPtr) -> Rc<Self> {
        let config = parent.config().clone();
        let dispatcher = parent.dispatcher().clone();
        let time = dispatcher.time_source();
        let mut stream_info = StreamInfo::new(time.monotonic_time(), time.system_time());

        let mut tracing_config = None;
        let mut active_span = None;
        if let (Some(trace_config), Some(tracer)) = (config.tracing_config(), config.tracer()) {
            let decision = tracing_decision(trace_config, parent.runtime());
            if decision.traced {
                stream_info.set_trace_reason(decision.reason);
            }
            active_span = Some(tracer.start_span(
                trace_config,
                request.as_ref(),
                &stream_info,
                decision,
            ));
            tracing_config = Some(trace_config.clone());
        }

        Rc::new_cyclic(|weak_self| Self {
            id,
            weak_self: weak_self.clone(),
            parent: parent.weak(),
            dispatcher,
            config,
            request: RefCell::new(Some(request)),
            response: RefCell::new(None),
            decoder_filters: RefCell::new(Vec::new()),
            encoder_filters: RefCell::new(Vec::new()),
            next_decoder_filter_index: Cell::new(0),
            next_encoder_filter_index: Cell::new(0),
            route_resolved: Cell::new(false),
            cached_route_entry: RefCell::new(None),
            reset: Cell::new(false),
            completed: Cell::new(false),
            inserted: Cell::new(false),
            tracing_config,
            active_span: RefCell::new(active_span),
            stream_info: RefCell::new(stream_info),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Handle for filters and other collaborators
    pub fn handle(&self) -> StreamHandle {
        StreamHandle {
            stream_id: self.id,
            stream: self.weak_self.clone(),
            dispatcher: self.dispatcher.clone(),
        }
    }

    pub fn is_reset(&self) -> bool {
        self.reset.get()
    }

    pub fn is_completed(&self) -> bool {
        self.completed.get()
    }

    pub(crate) fn inserted(&self) -> bool {
        self.inserted.get()
    }

    pub(crate) fn set_inserted(&self, inserted: bool) {
        self.inserted.set(inserted);
    }

    pub fn stream_info(&self) -> StreamInfo {
        self.stream_info.borrow().clone()
    }

    pub fn has_span(&self) -> bool {
        self.active_span.borrow().is_some()
    }

    /// Route for this stream, resolved once from the decoded request
    pub fn route_entry(&self) -> Option<Arc<RouteEntry>> {
        if !self.route_resolved.get() {
            // The request is mutably borrowed while a decoder filter runs;
            // resolution then waits for the next call.
            if let Ok(request) = self.request.try_borrow() {
                if let Some(request) = request.as_deref() {
                    let entry = self.config.route_entry(request);
                    if let Some(entry) = &entry {
                        self.stream_info.borrow_mut().set_route_name(entry.name());
                    }
                    *self.cached_route_entry.borrow_mut() = entry;
                    self.route_resolved.set(true);
                }
            }
        }
        self.cached_route_entry.borrow().clone()
    }

    /// Populate the filter lists; encoders end up in reverse order
    pub(crate) fn initialize_filter_chain(&self, factory: &dyn FilterChainFactory) {
        let mut chain = FilterChain::new();
        factory.create_filter_chain(&mut chain);

        let FilterChain {
            decoder_filters,
            mut encoder_filters,
        } = chain;
        encoder_filters.reverse();

        let handle = self.handle();
        for entry in &decoder_filters {
            entry.filter.borrow_mut().set_decoder_callbacks(handle.clone());
        }
        for entry in &encoder_filters {
            entry.filter.borrow_mut().set_encoder_callbacks(handle.clone());
        }

        trace!(
            stream_id = self.id,
            decoders = decoder_filters.len(),
            encoders = encoder_filters.len(),
            "Initialized filter chain"
        );
        *self.decoder_filters.borrow_mut() = decoder_filters;
        *self.encoder_filters.borrow_mut() = encoder_filters;
    }

    /// Run decoder filters from the saved cursor until one stops
    pub fn continue_decoding(&self) {
        if self.reset.get() || self.completed.get() || self.request.borrow().is_none() {
            return;
        }
        self.route_entry();

        loop {
            let index = self.next_decoder_filter_index.get();
            let filter = match self.decoder_filters.borrow().get(index) {
                Some(entry) => entry.filter.clone(),
                None => break,
            };
            self.next_decoder_filter_index.set(index + 1);

            let status = {
                let mut request = self.request.borrow_mut();
                let Some(request) = request.as_deref_mut() else {
                    return;
                };
                let status = filter.borrow_mut().on_stream_decoded(request);
                status
            };
            if status == FilterStatus::StopIteration {
                trace!(stream_id = self.id, filter = index, "Decoding stopped");
                return;
            }
        }

        debug!(stream_id = self.id, "Decoder filter chain complete");
    }

    /// Run encoder filters from the saved cursor; the reply is written once
    /// the last one continues
    pub fn continue_encoding(&self) {
        if self.reset.get() || self.completed.get() || self.response.borrow().is_none() {
            return;
        }

        loop {
            let index = self.next_encoder_filter_index.get();
            let filter = match self.encoder_filters.borrow().get(index) {
                Some(entry) => entry.filter.clone(),
                None => break,
            };
            self.next_encoder_filter_index.set(index + 1);

            let status = {
                let mut response = self.response.borrow_mut();
                let Some(response) = response.as_deref_mut() else {
                    return;
                };
                let status = filter.borrow_mut().on_stream_encoded(response);
                status
            };
            if status == FilterStatus::StopIteration {
                trace!(stream_id = self.id, filter = index, "Encoding stopped");
                return;
            }
        }

        debug!(stream_id = self.id, "Encoder filter chain complete");
        self.send_reply_downstream();
    }

    /// Answer the request locally
    pub fn send_local_reply(&self, status: Status, update: Option<ResponseUpdate>) {
        if self.reset.get() || self.completed.get() {
            return;
        }
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        let Some(creator) = parent.message_creator() else {
            panic!("local reply requested but the codec has no message creator");
        };

        let response = {
            let request = self.request.borrow();
            request
                .as_deref()
                .map(|request| creator.response(status, request))
        };
        let Some(mut response) = response else {
            warn!(stream_id = self.id, "Local reply without a request");
            self.reset_stream();
            return;
        };
        if let Some(update) = update {
            update(response.as_mut());
        }

        debug!(
            stream_id = self.id,
            status = %response.status().code(),
            "Sending local reply"
        );
        self.config.stats().downstream_rq_local_reply.inc();
        self.stream_info.borrow_mut().set_local_reply();
        self.set_response(response);
        self.continue_encoding();
    }

    /// Hand over the response produced upstream
    pub fn upstream_response(&self, response: ResponsePtr) {
        if self.reset.get() || self.completed.get() {
            return;
        }
        debug!(stream_id = self.id, status = %response.status().code(), "Upstream response");
        self.set_response(response);
        self.continue_encoding();
    }

    /// Finish the stream without sending anything downstream
    pub fn complete_directly(&self) {
        debug!(stream_id = self.id, "Completing stream directly");
        if let Some(parent) = self.parent.upgrade() {
            parent.deferred_stream(self);
        }
    }

    /// Close the whole downstream connection this stream belongs to
    pub fn reset_downstream_connection(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.close_downstream_connection(CloseType::NoFlush);
        }
    }

    pub fn reset_stream(&self) {
        if self.reset.replace(true) {
            return;
        }
        if !self.completed.get() {
            debug!(stream_id = self.id, "Resetting stream");
            self.config.stats().downstream_rq_reset.inc();
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.deferred_stream(self);
        }
    }

    /// Finalize the span and destroy the filters; later calls do nothing
    pub(crate) fn complete_request(&self) {
        if self.completed.replace(true) {
            return;
        }

        let now = self.dispatcher.time_source().monotonic_time();
        self.stream_info.borrow_mut().on_request_complete(now);
        {
            let info = self.stream_info.borrow();
            let stats = self.config.stats();
            if let Some(elapsed) = info.request_complete() {
                stats.downstream_rq_time.observe(elapsed.as_secs_f64());
            }
            if let Some(code) = info.response_status() {
                stats.downstream_rq_by_status.inc(code.as_str());
            }
        }

        let span = self.active_span.borrow_mut().take();
        if let (Some(mut span), Some(config)) = (span, self.tracing_config.as_ref()) {
            let request = self.request.borrow();
            finalize_span(
                span.as_mut(),
                request.as_deref(),
                &self.stream_info.borrow(),
                config,
            );
        }

        for entry in self.decoder_filters.borrow().iter() {
            entry.filter.borrow_mut().on_destroy();
        }
        for entry in self.encoder_filters.borrow().iter().filter(|e| !e.dual) {
            entry.filter.borrow_mut().on_destroy();
        }
        debug!(stream_id = self.id, "Stream complete");
    }

    #[cfg(test)]
    pub(crate) fn take_request(&self) -> Option<RequestPtr> {
        self.request.borrow_mut().take()
    }

    fn set_response(&self, response: ResponsePtr) {
        *self.response.borrow_mut() = Some(response);
        self.next_encoder_filter_index.set(0);
    }

    fn send_reply_downstream(&self) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        let response = self.response.borrow();
        let Some(response) = response.as_deref() else {
            return;
        };
        self.stream_info
            .borrow_mut()
            .set_response_status(response.status().code());
        parent.send_reply_downstream(response, self);
    }
}

impl ResponseEncoderCallbacks for ActiveStream {
    fn on_encoding_success(&self, buffer: &mut BytesMut, close_connection: bool) {
        let Some(parent) = self.parent.upgrade() else {
            return;
        };
        trace!(stream_id = self.id, bytes = buffer.len(), close_connection, "Reply encoded");
        parent.write_downstream(buffer, close_connection);
        parent.deferred_stream(self);
    }
}

/// Filter-facing handle to a stream
///
/// Mutating operations are posted to the dispatcher and silently dropped if
/// the stream is gone by the time they run.
#[derive(Clone)]
pub struct StreamHandle {
    stream_id: u64,
    stream: Weak<ActiveStream>,
    dispatcher: Rc<Dispatcher>,
}

impl StreamHandle {
    pub fn stream_id(&self) -> u64 {
        self.stream_id
    }

    pub fn dispatcher(&self) -> &Rc<Dispatcher> {
        &self.dispatcher
    }

    /// True once the stream was reset or destroyed
    pub fn is_reset(&self) -> bool {
        self.stream.upgrade().map_or(true, |s| s.is_reset())
    }

    pub fn route_entry(&self) -> Option<Arc<RouteEntry>> {
        self.stream.upgrade().and_then(|s| s.route_entry())
    }

    pub fn stream_info(&self) -> Option<StreamInfo> {
        self.stream.upgrade().map(|s| s.stream_info())
    }

    pub fn continue_decoding(&self) {
        self.post(|stream| stream.continue_decoding());
    }

    pub fn continue_encoding(&self) {
        self.post(|stream| stream.continue_encoding());
    }

    pub fn send_local_reply(&self, status: Status, update: Option<ResponseUpdate>) {
        self.post(move |stream| stream.send_local_reply(status, update));
    }

    pub fn upstream_response(&self, response: ResponsePtr) {
        self.post(move |stream| stream.upstream_response(response));
    }

    pub fn complete_directly(&self) {
        self.post(|stream| stream.complete_directly());
    }

    pub fn reset_stream(&self) {
        self.post(|stream| stream.reset_stream());
    }

    pub fn reset_downstream_connection(&self) {
        self.post(|stream| stream.reset_downstream_connection());
    }

    fn post<F>(&self, operation: F)
    where
        F: FnOnce(&ActiveStream) + 'static,
    {
        let stream = self.stream.clone();
        self.dispatcher.post(move || {
            if let Some(stream) = stream.upgrade() {
                operation(&*stream);
            }
        });
    }
}
