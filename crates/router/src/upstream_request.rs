//! Upstream request state machine
//!
//! An [`UpstreamRequest`] takes one proxied call from connection acquisition
//! through the response. It moves through
//! `AwaitingConnection -> AwaitingUpgrade? -> RequestInFlight ->
//! ResponseStarted -> ResponseComplete`, and can be reset from any of them.
//!
//! The request does not hold a reference to whoever owns it. Every
//! operation that needs the owner takes it as a [`RequestOwner`] argument.
//! Owner methods are called while the request is mutably borrowed, so an
//! owner must not call back into the request from them; owners post that
//! kind of work to their dispatcher instead.

use crate::app_exception::{AppException, AppExceptionType};
use crate::cluster::Cluster;
use crate::host::Host;
use crate::outlier::{OutlierDetector, OutlierResult};
use crate::pool::{
    CancelPolicy, Cancellable, ConnectionData, ConnectionPool, PoolCallbacks, PoolFailureReason,
    PoolResult, UpstreamCallbacks,
};
use crate::protocol::{
    create_protocol, create_transport, MessageMetadata, MessageType, Protocol,
    ThriftConnectionState, Transport, UpgradeResponse,
};
use crate::reset::{self, DownstreamAction, ResponseProgress};
use crate::stats::RouterStats;
use bytes::BytesMut;
use proxy::{CloseType, ConnectionEvent, Dispatcher, FilterStatus};
use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, trace, warn};

/// Result of feeding upstream bytes to the response decoder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    MoreData,
    Complete,
    Reset,
}

/// Decodes the upstream response on behalf of the downstream stream
pub trait UpstreamResponseCallbacks {
    fn start_upstream_response(&mut self, transport: &dyn Transport, protocol: &dyn Protocol);

    fn upstream_data(&mut self, data: &mut BytesMut) -> ResponseStatus;

    /// Envelope of the decoded response, valid once it is complete
    fn response_metadata(&self) -> &MessageMetadata;

    /// Whether a reply carries a success result rather than a declared error
    fn response_success(&self) -> bool;
}

/// The router side of one upstream request
pub trait RequestOwner {
    fn cluster(&self) -> &str;

    fn dispatcher(&self) -> Rc<Dispatcher>;

    /// Account bytes written upstream on behalf of the request
    fn add_size(&self, size: u64);

    fn upstream_callbacks(&self) -> Weak<dyn UpstreamCallbacks>;

    fn pool_callbacks(&self) -> Weak<dyn PoolCallbacks>;

    fn init_protocol_converter(&self, protocol: &dyn Protocol);

    fn convert_message_begin(&self, metadata: &MessageMetadata);

    fn continue_decoding(&self);

    fn send_local_reply(&self, exception: AppException, end_stream: bool);

    fn reset_downstream_connection(&self);

    /// The upstream went away after the request was sent
    fn on_reset(&self);
}

pub struct UpstreamRequest {
    stats: Arc<RouterStats>,
    metadata: MessageMetadata,
    transport: Box<dyn Transport>,
    protocol: Box<dyn Protocol>,
    conn_pool_handle: Option<Box<dyn Cancellable>>,
    conn_data: Option<Box<dyn ConnectionData>>,
    conn_state: Option<Rc<RefCell<ThriftConnectionState>>>,
    upgrade_response: Option<Box<dyn UpgradeResponse>>,
    upstream_host: Option<Arc<Host>>,
    request_complete: bool,
    response_started: bool,
    response_complete: bool,
    draining: bool,
    response_underflow: bool,
    charged_response_timing: bool,
    close_downstream_on_error: bool,
    response_size: u64,
    request_complete_time: Option<Instant>,
}

impl UpstreamRequest {
    pub fn new(
        stats: Arc<RouterStats>,
        metadata: MessageMetadata,
        transport: Box<dyn Transport>,
        protocol: Box<dyn Protocol>,
        close_downstream_on_error: bool,
    ) -> Self {
        Self {
            stats,
            metadata,
            transport,
            protocol,
            conn_pool_handle: None,
            conn_data: None,
            conn_state: None,
            upgrade_response: None,
            upstream_host: None,
            request_complete: false,
            response_started: false,
            response_complete: false,
            draining: false,
            response_underflow: false,
            charged_response_timing: false,
            close_downstream_on_error,
            response_size: 0,
            request_complete_time: None,
        }
    }

    /// Request using the cluster's transport, protocol and error policy
    pub fn for_cluster(stats: Arc<RouterStats>, cluster: &Cluster, metadata: MessageMetadata) -> Self {
        Self::new(
            stats,
            metadata,
            create_transport(cluster.transport()),
            create_protocol(cluster.protocol()),
            cluster.close_downstream_on_error(),
        )
    }

    pub fn metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    pub fn upstream_host(&self) -> Option<&Arc<Host>> {
        self.upstream_host.as_ref()
    }

    pub fn request_complete(&self) -> bool {
        self.request_complete
    }

    pub fn response_started(&self) -> bool {
        self.response_started
    }

    pub fn response_complete(&self) -> bool {
        self.response_complete
    }

    pub fn draining(&self) -> bool {
        self.draining
    }

    pub fn response_underflow(&self) -> bool {
        self.response_underflow
    }

    pub fn has_pending_connection(&self) -> bool {
        self.conn_pool_handle.is_some()
    }

    pub fn has_connection(&self) -> bool {
        self.conn_data.is_some()
    }

    pub fn is_upgrading(&self) -> bool {
        self.upgrade_response.is_some()
    }

    /// Ask the pool for a connection
    pub fn start(&mut self, pool: &dyn ConnectionPool, owner: &dyn RequestOwner) -> FilterStatus {
        match pool.new_connection(owner.pool_callbacks()) {
            PoolResult::Pending(handle) => {
                debug!(cluster = %owner.cluster(), "Waiting for upstream connection");
                self.conn_pool_handle = Some(handle);
                return FilterStatus::StopIteration;
            }
            PoolResult::Ready { conn_data, host } => self.on_pool_ready(conn_data, host, owner),
            PoolResult::Failure { reason, host } => self.on_pool_failure(reason, host, owner),
        }

        if self.upgrade_response.is_some() {
            return FilterStatus::StopIteration;
        }

        if self.upstream_host.is_none() {
            return FilterStatus::StopIteration;
        }

        FilterStatus::Continue
    }

    pub fn on_pool_ready(
        &mut self,
        mut conn_data: Box<dyn ConnectionData>,
        host: Arc<Host>,
        owner: &dyn RequestOwner,
    ) {
        // Decoding only needs resuming if start() stopped the chain
        let continue_decoding = self.conn_pool_handle.is_some();

        debug!(cluster = %owner.cluster(), host = %host.address(), "Upstream connection ready");
        host.outlier_detector()
            .put_result(OutlierResult::LocalOriginConnectSuccess);
        host.active_requests().inc();
        self.upstream_host = Some(host);

        conn_data.add_upstream_callbacks(owner.upstream_callbacks());
        self.conn_pool_handle = None;

        let state = match conn_data
            .connection_state()
            .and_then(|state| state.downcast::<RefCell<ThriftConnectionState>>().ok())
        {
            Some(state) => state,
            None => {
                let state = Rc::new(RefCell::new(ThriftConnectionState::new()));
                conn_data.set_connection_state(state.clone());
                state
            }
        };
        self.conn_data = Some(conn_data);
        self.conn_state = Some(state.clone());

        if self.protocol.supports_upgrade() {
            let mut buffer = BytesMut::new();
            let upgrade = self.protocol.attempt_upgrade(
                self.transport.as_ref(),
                &mut state.borrow_mut(),
                &mut buffer,
            );
            if let Some(upgrade) = upgrade {
                debug!(protocol = self.protocol.name(), bytes = buffer.len(), "Attempting protocol upgrade");
                owner.add_size(buffer.len() as u64);
                self.upgrade_response = Some(upgrade);
                if let Some(conn_data) = &self.conn_data {
                    conn_data.connection().write(&mut buffer, false);
                }
                return;
            }
        }

        self.on_request_start(continue_decoding, owner);
    }

    pub fn on_pool_failure(
        &mut self,
        reason: PoolFailureReason,
        host: Option<Arc<Host>>,
        owner: &dyn RequestOwner,
    ) {
        debug!(cluster = %owner.cluster(), reason = %reason, "Upstream pool failure");
        self.conn_pool_handle = None;

        self.upstream_host = host;
        if !self.on_reset_stream(reason, owner) {
            owner.continue_decoding();
        }
    }

    /// Feed upstream bytes; returns true once the response is finished
    ///
    /// # Panics
    ///
    /// Panics if the response already completed.
    pub fn handle_upstream_data(
        &mut self,
        data: &mut BytesMut,
        end_stream: bool,
        callbacks: &mut dyn UpstreamResponseCallbacks,
        owner: &dyn RequestOwner,
    ) -> bool {
        assert!(
            !self.response_complete,
            "upstream data received after the response completed"
        );

        self.response_size += data.len() as u64;

        if self.upgrade_response.is_some() {
            self.handle_upgrade_response(data, owner);
        } else {
            let status = self.handle_regular_response(data, callbacks, owner);
            if status != ResponseStatus::MoreData {
                return true;
            }
        }

        if end_stream {
            debug!(cluster = %owner.cluster(), "Upstream response underflow");
            self.on_response_complete(owner);
            self.response_underflow = true;
            self.on_reset_stream(PoolFailureReason::RemoteConnectionFailure, owner);
            return true;
        }

        false
    }

    fn handle_upgrade_response(&mut self, data: &mut BytesMut, owner: &dyn RequestOwner) {
        trace!(bytes = data.len(), "Reading upgrade response");
        let done = match self.upgrade_response.as_mut() {
            Some(upgrade) => upgrade.on_data(data),
            None => return,
        };
        if !done {
            return;
        }

        debug!(protocol = self.protocol.name(), "Upgrade response complete");
        if let (Some(upgrade), Some(state)) = (self.upgrade_response.take(), &self.conn_state) {
            self.protocol
                .complete_upgrade(&mut state.borrow_mut(), upgrade.as_ref());
        }
        self.on_request_start(true, owner);
    }

    fn handle_regular_response(
        &mut self,
        data: &mut BytesMut,
        callbacks: &mut dyn UpstreamResponseCallbacks,
        owner: &dyn RequestOwner,
    ) -> ResponseStatus {
        trace!(bytes = data.len(), "Reading upstream response");

        if !self.response_started {
            callbacks.start_upstream_response(self.transport.as_ref(), self.protocol.as_ref());
            self.response_started = true;
        }

        let cluster = owner.cluster();
        let host = self.upstream_host.clone();

        let status = callbacks.upstream_data(data);
        match status {
            ResponseStatus::Complete => {
                self.stats.record_response_size(cluster, self.response_size);

                let metadata = callbacks.response_metadata();
                match metadata.message_type() {
                    Some(MessageType::Reply) => {
                        if callbacks.response_success() {
                            self.put_outlier_result(OutlierResult::ExtOriginRequestSuccess);
                            self.stats.inc_reply_success(cluster, host.as_deref());
                        } else {
                            self.put_outlier_result(OutlierResult::ExtOriginRequestFailed);
                            self.stats.inc_reply_error(cluster, host.as_deref());
                        }
                    }
                    Some(MessageType::Exception) => {
                        self.put_outlier_result(OutlierResult::ExtOriginRequestFailed);
                        self.stats.inc_remote_exception(cluster, host.as_deref());
                    }
                    _ => {
                        self.stats.inc_invalid_type(cluster, host.as_deref());
                    }
                }

                if metadata.is_draining() {
                    // Only the upstream connection goes away, the downstream keeps this response
                    debug!(cluster = %cluster, "Upstream sent a draining signal");
                    self.stats.inc_close_drain(cluster);
                    self.draining = true;
                    self.reset_stream();
                }
                self.on_response_complete(owner);
            }
            ResponseStatus::Reset => {
                // Not counted in the response size histogram
                debug!(cluster = %cluster, "Upstream response could not be decoded");
                self.put_outlier_result(OutlierResult::ExtOriginRequestFailed);
                self.stats.inc_decoding_error(cluster, host.as_deref());
                self.reset_stream();
            }
            ResponseStatus::MoreData => {}
        }

        status
    }

    /// Upstream connection event delivered through the owner's callbacks
    pub fn on_event(&mut self, event: ConnectionEvent, owner: &dyn RequestOwner) {
        debug_assert!(
            !self.response_complete,
            "connection event delivered after the response completed"
        );
        let close_downstream = match event {
            ConnectionEvent::RemoteClose => {
                debug!(cluster = %owner.cluster(), "Upstream remote close");
                self.on_reset_stream(PoolFailureReason::RemoteConnectionFailure, owner)
            }
            ConnectionEvent::LocalClose => {
                debug!(cluster = %owner.cluster(), "Upstream local close");
                self.on_reset_stream(PoolFailureReason::LocalConnectionFailure, owner)
            }
            ConnectionEvent::Connected | ConnectionEvent::ConnectedZeroRtt => {
                error!(?event, "Connect event reached the upstream request");
                debug_assert!(false, "connect events belong to the connection pool");
                true
            }
        };

        self.release_connection(false);
        if !close_downstream && self.request_complete {
            owner.on_reset();
        }
    }

    /// Give up the connection or pending connection, closing it if asked
    pub fn release_connection(&mut self, close: bool) {
        debug!(close, "Releasing upstream connection");
        if let Some(mut handle) = self.conn_pool_handle.take() {
            handle.cancel(CancelPolicy::Default);
        }

        self.conn_state = None;

        // Closing raises an event that releases the connection again, so take it first
        if let Some(conn_data) = self.take_connection() {
            if close {
                conn_data.connection().close(CloseType::NoFlush);
            }
        }
    }

    pub fn reset_stream(&mut self) {
        debug!("Resetting upstream request");
        self.release_connection(true);
    }

    /// Frame and write an encoded request, returning the bytes written
    pub fn encode_and_write(&mut self, request_buffer: &mut BytesMut) -> u64 {
        let mut transport_buffer = BytesMut::new();

        self.metadata.set_protocol(self.protocol.protocol_type());
        self.transport
            .encode_frame(&mut transport_buffer, &self.metadata, request_buffer);

        let size = transport_buffer.len() as u64;
        match &self.conn_data {
            Some(conn_data) => conn_data.connection().write(&mut transport_buffer, false),
            None => warn!(bytes = size, "No upstream connection to write the request to"),
        }

        size
    }

    fn on_request_start(&mut self, continue_decoding: bool, owner: &dyn RequestOwner) {
        owner.init_protocol_converter(self.protocol.as_ref());

        if let Some(state) = &self.conn_state {
            self.metadata
                .set_sequence_id(state.borrow_mut().next_sequence_id());
        }
        owner.convert_message_begin(&self.metadata);

        if continue_decoding {
            owner.continue_decoding();
        }
    }

    /// The whole request has been written upstream
    pub fn on_request_complete(&mut self, owner: &dyn RequestOwner) {
        self.request_complete_time = Some(owner.dispatcher().time_source().monotonic_time());
        self.request_complete = true;
    }

    pub fn on_response_complete(&mut self, owner: &dyn RequestOwner) {
        debug!(cluster = %owner.cluster(), "Upstream response complete");
        self.charge_response_timing(owner);
        self.response_complete = true;
        self.conn_state = None;
        self.take_connection();
    }

    /// Record response time once, and only for requests that were fully sent
    pub fn charge_response_timing(&mut self, owner: &dyn RequestOwner) {
        if self.charged_response_timing || !self.request_complete {
            return;
        }
        self.charged_response_timing = true;

        if let Some(started) = self.request_complete_time {
            let elapsed = owner
                .dispatcher()
                .time_source()
                .monotonic_time()
                .saturating_duration_since(started);
            self.stats.record_response_time(
                owner.cluster(),
                self.upstream_host.as_deref(),
                elapsed.as_millis() as u64,
            );
        }
    }

    /// Apply the reset mapping; returns whether the downstream is being closed
    pub fn on_reset_stream(&mut self, reason: PoolFailureReason, owner: &dyn RequestOwner) -> bool {
        self.charge_response_timing(owner);

        let progress = ResponseProgress {
            started: self.response_started,
            complete: self.response_complete,
            draining: self.draining,
            underflow: self.response_underflow,
        };
        let decision = reset::decide(reason, progress, self.close_downstream_on_error);

        if let Some(result) = decision.outlier_result {
            self.put_outlier_result(result);
        }

        match decision.action {
            DownstreamAction::LocalReply { close_downstream } => {
                self.stats.inc_local_exception(owner.cluster());
                let message = reset::local_reply_message(reason, self.upstream_host.as_deref());
                owner.send_local_reply(
                    AppException::new(AppExceptionType::InternalError, message),
                    close_downstream,
                );
            }
            DownstreamAction::ResetDownstream => {
                debug!("Resetting downstream connection after a partial or underflow response");
                owner.reset_downstream_connection();
            }
            DownstreamAction::Nothing => {}
        }

        debug!(
            reason = %reason,
            close_downstream = decision.close_downstream,
            response_started = self.response_started,
            response_complete = self.response_complete,
            draining = self.draining,
            response_underflow = self.response_underflow,
            "Upstream reset complete"
        );
        decision.close_downstream
    }

    fn put_outlier_result(&self, result: OutlierResult) {
        if let Some(host) = &self.upstream_host {
            host.outlier_detector().put_result(result);
        }
    }

    fn take_connection(&mut self) -> Option<Box<dyn ConnectionData>> {
        let conn_data = self.conn_data.take()?;
        if let Some(host) = &self.upstream_host {
            host.active_requests().dec();
        }
        Some(conn_data)
    }
}

impl Drop for UpstreamRequest {
    fn drop(&mut self) {
        if let Some(mut handle) = self.conn_pool_handle.take() {
            handle.cancel(CancelPolicy::Default);
        }
        self.take_connection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outlier::{ConsecutiveFailureDetector, DetectorSettings};
    use crate::pool::UpstreamConnection;
    use crate::protocol::{CompactProtocol, FramedTransport, TransportType};
    use proxy::{ConnectionState, SimulatedTimeSource};
    use std::any::Any;
    use std::cell::Cell;
    use std::time::Duration;

    type Log = Rc<RefCell<Vec<String>>>;

    struct NoopCallbacks;

    impl UpstreamCallbacks for NoopCallbacks {
        fn on_upstream_data(&self, _data: &mut BytesMut, _end_stream: bool) {}
        fn on_event(&self, _event: ConnectionEvent) {}
    }

    impl PoolCallbacks for NoopCallbacks {
        fn on_pool_ready(&self, _conn_data: Box<dyn ConnectionData>, _host: Arc<Host>) {}
        fn on_pool_failure(&self, _reason: PoolFailureReason, _host: Option<Arc<Host>>) {}
    }

    struct MockOwner {
        log: Log,
        time: Rc<SimulatedTimeSource>,
        dispatcher: Rc<Dispatcher>,
        size: Cell<u64>,
    }

    impl MockOwner {
        fn new() -> Self {
            let time = Rc::new(SimulatedTimeSource::new());
            Self {
                log: Rc::new(RefCell::new(Vec::new())),
                dispatcher: Dispatcher::new(time.clone()),
                time,
                size: Cell::new(0),
            }
        }

        fn calls(&self) -> Vec<String> {
            self.log.borrow().clone()
        }

        fn count(&self, call: &str) -> usize {
            self.log.borrow().iter().filter(|c| c.as_str() == call).count()
        }
    }

    impl RequestOwner for MockOwner {
        fn cluster(&self) -> &str {
            "users"
        }

        fn dispatcher(&self) -> Rc<Dispatcher> {
            self.dispatcher.clone()
        }

        fn add_size(&self, size: u64) {
            self.size.set(self.size.get() + size);
        }

        fn upstream_callbacks(&self) -> Weak<dyn UpstreamCallbacks> {
            Weak::<NoopCallbacks>::new()
        }

        fn pool_callbacks(&self) -> Weak<dyn PoolCallbacks> {
            Weak::<NoopCallbacks>::new()
        }

        fn init_protocol_converter(&self, protocol: &dyn Protocol) {
            self.log.borrow_mut().push(format!("converter:{}", protocol.name()));
        }

        fn convert_message_begin(&self, metadata: &MessageMetadata) {
            self.log
                .borrow_mut()
                .push(format!("begin:{}", metadata.sequence_id().unwrap_or(-1)));
        }

        fn continue_decoding(&self) {
            self.log.borrow_mut().push("continue_decoding".to_string());
        }

        fn send_local_reply(&self, exception: AppException, end_stream: bool) {
            self.log
                .borrow_mut()
                .push(format!("local_reply:{}:{}", exception.message(), end_stream));
        }

        fn reset_downstream_connection(&self) {
            self.log.borrow_mut().push("reset_downstream".to_string());
        }

        fn on_reset(&self) {
            self.log.borrow_mut().push("on_reset".to_string());
        }
    }

    struct MockConnection {
        written: RefCell<BytesMut>,
        closed: Cell<Option<CloseType>>,
    }

    impl UpstreamConnection for MockConnection {
        fn write(&self, data: &mut BytesMut, _end_stream: bool) {
            self.written.borrow_mut().extend_from_slice(&data.split());
        }

        fn close(&self, close_type: CloseType) {
            self.closed.set(Some(close_type));
        }

        fn state(&self) -> ConnectionState {
            match self.closed.get() {
                Some(_) => ConnectionState::Closed,
                None => ConnectionState::Open,
            }
        }
    }

    /// Pooled connection whose state slot outlives each checkout
    struct MockConnData {
        connection: Rc<MockConnection>,
        state: Rc<RefCell<Option<Rc<dyn Any>>>>,
        callbacks_added: Rc<Cell<usize>>,
    }

    impl ConnectionData for MockConnData {
        fn connection(&self) -> &dyn UpstreamConnection {
            self.connection.as_ref()
        }

        fn add_upstream_callbacks(&mut self, _callbacks: Weak<dyn UpstreamCallbacks>) {
            self.callbacks_added.set(self.callbacks_added.get() + 1);
        }

        fn connection_state(&self) -> Option<Rc<dyn Any>> {
            self.state.borrow().clone()
        }

        fn set_connection_state(&mut self, state: Rc<dyn Any>) {
            *self.state.borrow_mut() = Some(state);
        }
    }

    struct PooledConnection {
        connection: Rc<MockConnection>,
        state: Rc<RefCell<Option<Rc<dyn Any>>>>,
        callbacks_added: Rc<Cell<usize>>,
    }

    impl PooledConnection {
        fn new() -> Self {
            Self {
                connection: Rc::new(MockConnection {
                    written: RefCell::new(BytesMut::new()),
                    closed: Cell::new(None),
                }),
                state: Rc::new(RefCell::new(None)),
                callbacks_added: Rc::new(Cell::new(0)),
            }
        }

        fn checkout(&self) -> Box<dyn ConnectionData> {
            Box::new(MockConnData {
                connection: self.connection.clone(),
                state: self.state.clone(),
                callbacks_added: self.callbacks_added.clone(),
            })
        }

        fn written(&self) -> Vec<u8> {
            self.connection.written.borrow().to_vec()
        }

        fn closed(&self) -> Option<CloseType> {
            self.connection.closed.get()
        }
    }

    struct MockHandle {
        cancelled: Rc<Cell<usize>>,
    }

    impl Cancellable for MockHandle {
        fn cancel(&mut self, _policy: CancelPolicy) {
            self.cancelled.set(self.cancelled.get() + 1);
        }
    }

    struct MockPool {
        result: RefCell<Option<PoolResult>>,
    }

    impl MockPool {
        fn new(result: PoolResult) -> Self {
            Self {
                result: RefCell::new(Some(result)),
            }
        }

        fn pending() -> (Self, Rc<Cell<usize>>) {
            let cancelled = Rc::new(Cell::new(0));
            let handle = MockHandle {
                cancelled: cancelled.clone(),
            };
            (Self::new(PoolResult::Pending(Box::new(handle))), cancelled)
        }
    }

    impl ConnectionPool for MockPool {
        fn new_connection(&self, _callbacks: Weak<dyn PoolCallbacks>) -> PoolResult {
            self.result
                .borrow_mut()
                .take()
                .expect("pool asked for a connection twice")
        }
    }

    struct MockResponse {
        statuses: Vec<ResponseStatus>,
        metadata: MessageMetadata,
        success: bool,
        started: usize,
    }

    impl MockResponse {
        fn new(statuses: &[ResponseStatus]) -> Self {
            Self {
                statuses: statuses.iter().rev().copied().collect(),
                metadata: MessageMetadata::new().with_message_type(MessageType::Reply),
                success: true,
                started: 0,
            }
        }
    }

    impl UpstreamResponseCallbacks for MockResponse {
        fn start_upstream_response(&mut self, _transport: &dyn Transport, _protocol: &dyn Protocol) {
            self.started += 1;
        }

        fn upstream_data(&mut self, data: &mut BytesMut) -> ResponseStatus {
            data.clear();
            self.statuses.pop().unwrap_or(ResponseStatus::MoreData)
        }

        fn response_metadata(&self) -> &MessageMetadata {
            &self.metadata
        }

        fn response_success(&self) -> bool {
            self.success
        }
    }

    /// Protocol that sends "UPGRADE" once per connection and waits for "OK"
    struct UpgradingProtocol;

    struct UpgradeReply {
        seen: Vec<u8>,
    }

    impl UpgradeResponse for UpgradeReply {
        fn on_data(&mut self, data: &mut BytesMut) -> bool {
            self.seen.extend_from_slice(&data.split());
            self.seen.ends_with(b"OK")
        }
    }

    impl Protocol for UpgradingProtocol {
        fn name(&self) -> &'static str {
            "upgrading"
        }

        fn protocol_type(&self) -> crate::protocol::ProtocolType {
            crate::protocol::ProtocolType::Binary
        }

        fn supports_upgrade(&self) -> bool {
            true
        }

        fn attempt_upgrade(
            &self,
            _transport: &dyn Transport,
            state: &mut ThriftConnectionState,
            buffer: &mut BytesMut,
        ) -> Option<Box<dyn UpgradeResponse>> {
            if state.upgrade_attempted() {
                return None;
            }
            state.mark_upgrade_attempted();
            buffer.extend_from_slice(b"UPGRADE");
            Some(Box::new(UpgradeReply { seen: Vec::new() }))
        }

        fn complete_upgrade(&self, state: &mut ThriftConnectionState, _response: &dyn UpgradeResponse) {
            state.mark_upgraded();
        }
    }

    fn host() -> Arc<Host> {
        Arc::new(Host::with_settings(
            "10.0.0.1:9090",
            "users",
            DetectorSettings::default(),
        ))
    }

    fn detector_host() -> (Arc<Host>, Arc<ConsecutiveFailureDetector>) {
        let detector = Arc::new(ConsecutiveFailureDetector::new(
            "10.0.0.1:9090",
            DetectorSettings::default(),
        ));
        let host = Arc::new(Host::new("10.0.0.1:9090", "users", detector.clone()));
        (host, detector)
    }

    fn request(stats: &Arc<RouterStats>, close_downstream_on_error: bool) -> UpstreamRequest {
        UpstreamRequest::new(
            stats.clone(),
            MessageMetadata::new().with_method_name("get"),
            Box::new(FramedTransport),
            Box::new(CompactProtocol),
            close_downstream_on_error,
        )
    }

    /// Request with a connection already attached through an inline pool result
    fn connected(
        stats: &Arc<RouterStats>,
        owner: &MockOwner,
        pooled: &PooledConnection,
        host: Arc<Host>,
    ) -> UpstreamRequest {
        let mut upstream = request(stats, true);
        let pool = MockPool::new(PoolResult::Ready {
            conn_data: pooled.checkout(),
            host,
        });
        assert_eq!(upstream.start(&pool, owner), FilterStatus::Continue);
        upstream
    }

    #[test]
    fn test_pending_pool_resumes_decoding_once() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let (pool, cancelled) = MockPool::pending();
        let (host, detector) = detector_host();

        let mut upstream = request(&stats, true);
        assert_eq!(upstream.start(&pool, &owner), FilterStatus::StopIteration);
        assert!(upstream.has_pending_connection());
        assert!(owner.calls().is_empty());

        upstream.on_pool_ready(pooled.checkout(), host.clone(), &owner);

        assert!(!upstream.has_pending_connection());
        assert!(upstream.has_connection());
        assert_eq!(owner.calls(), vec!["converter:compact", "begin:0", "continue_decoding"]);
        assert_eq!(owner.count("continue_decoding"), 1);
        assert_eq!(pooled.callbacks_added.get(), 1);
        assert_eq!(host.active_requests().get(), 1);
        assert_eq!(detector.stats().local_failures, 0);
        assert_eq!(cancelled.get(), 0);
    }

    #[test]
    fn test_ready_pool_continues_inline() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();

        let upstream = connected(&stats, &owner, &pooled, host());

        assert_eq!(owner.calls(), vec!["converter:compact", "begin:0"]);
        assert_eq!(upstream.metadata().sequence_id(), Some(0));
        assert_eq!(upstream.upstream_host().map(|h| h.address()), Some("10.0.0.1:9090"));
    }

    #[test]
    fn test_sequence_ids_follow_the_pooled_connection() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();

        let first = connected(&stats, &owner, &pooled, host());
        drop(first);
        let second = connected(&stats, &owner, &pooled, host());

        assert_eq!(second.metadata().sequence_id(), Some(1));
    }

    #[test]
    fn test_overflow_replies_locally_and_keeps_downstream() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pool = MockPool::new(PoolResult::Failure {
            reason: PoolFailureReason::Overflow,
            host: None,
        });

        let mut upstream = request(&stats, true);
        assert_eq!(upstream.start(&pool, &owner), FilterStatus::StopIteration);

        assert_eq!(
            owner.calls(),
            vec![
                "local_reply:upstream request: too many connections:false",
                "continue_decoding"
            ]
        );
        assert_eq!(stats.upstream_resp_local_exception.get("users"), 1);
    }

    #[test]
    fn test_connect_failure_replies_with_host_address() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let (host, detector) = detector_host();

        let mut upstream = request(&stats, true);
        upstream.on_pool_failure(PoolFailureReason::LocalConnectionFailure, Some(host), &owner);

        assert_eq!(
            owner.calls(),
            vec!["local_reply:connection failure: local connection failure '10.0.0.1:9090':true"]
        );
        assert_eq!(detector.stats().local_failures, 1);
    }

    #[test]
    fn test_connect_failure_without_close_resumes_decoding() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();

        let mut upstream = request(&stats, false);
        upstream.on_pool_failure(PoolFailureReason::Timeout, None, &owner);

        assert_eq!(
            owner.calls(),
            vec![
                "local_reply:connection failure: timeout 'to upstream':false",
                "continue_decoding"
            ]
        );
    }

    #[test]
    fn test_failure_after_partial_response_resets_downstream() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let (host, detector) = detector_host();
        let mut upstream = connected(&stats, &owner, &pooled, host.clone());
        upstream.on_request_complete(&owner);

        let mut response = MockResponse::new(&[ResponseStatus::MoreData]);
        let mut data = BytesMut::from(&b"partial"[..]);
        assert!(!upstream.handle_upstream_data(&mut data, false, &mut response, &owner));
        assert!(upstream.response_started());

        upstream.on_event(ConnectionEvent::RemoteClose, &owner);

        assert_eq!(owner.count("reset_downstream"), 1);
        assert!(!owner.calls().iter().any(|c| c.starts_with("local_reply")));
        assert_eq!(owner.count("on_reset"), 0);
        assert!(!upstream.has_connection());
        assert_eq!(pooled.closed(), None);
        assert_eq!(host.active_requests().get(), 0);
        assert_eq!(detector.stats().local_failures, 1);
    }

    #[test]
    fn test_pool_failure_after_partial_response_resets_downstream() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = connected(&stats, &owner, &pooled, host());

        let mut response = MockResponse::new(&[ResponseStatus::MoreData]);
        upstream.handle_upstream_data(&mut BytesMut::from(&b"x"[..]), false, &mut response, &owner);
        upstream.on_pool_failure(PoolFailureReason::RemoteConnectionFailure, Some(host()), &owner);

        assert_eq!(owner.count("reset_downstream"), 1);
        assert_eq!(owner.count("continue_decoding"), 0);
    }

    #[test]
    fn test_close_before_request_complete_does_not_notify_owner() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = request(&stats, false);
        let pool = MockPool::new(PoolResult::Ready {
            conn_data: pooled.checkout(),
            host: host(),
        });
        upstream.start(&pool, &owner);

        upstream.on_event(ConnectionEvent::LocalClose, &owner);

        assert!(owner
            .calls()
            .contains(&"local_reply:connection failure: local connection failure '10.0.0.1:9090':false".to_string()));
        assert_eq!(owner.count("on_reset"), 0);
    }

    #[test]
    fn test_close_after_request_complete_notifies_owner() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = request(&stats, false);
        let pool = MockPool::new(PoolResult::Ready {
            conn_data: pooled.checkout(),
            host: host(),
        });
        upstream.start(&pool, &owner);
        upstream.on_request_complete(&owner);

        upstream.on_event(ConnectionEvent::RemoteClose, &owner);

        assert_eq!(owner.count("on_reset"), 1);
    }

    #[test]
    fn test_end_of_stream_without_response_is_underflow() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let (host, detector) = detector_host();
        let mut upstream = connected(&stats, &owner, &pooled, host);
        upstream.on_request_complete(&owner);

        let mut response = MockResponse::new(&[ResponseStatus::MoreData]);
        let mut data = BytesMut::from(&b"trunc"[..]);
        assert!(upstream.handle_upstream_data(&mut data, true, &mut response, &owner));

        assert!(upstream.response_underflow());
        assert!(upstream.response_complete());
        assert_eq!(owner.count("reset_downstream"), 1);
        assert!(!owner.calls().iter().any(|c| c.starts_with("local_reply")));
        assert_eq!(detector.stats().local_failures, 1);
        assert_eq!(stats.upstream_resp_time.count("users/10.0.0.1:9090"), 1);
    }

    #[test]
    fn test_draining_signal_closes_only_upstream() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = connected(&stats, &owner, &pooled, host());
        upstream.on_request_complete(&owner);

        let mut response = MockResponse::new(&[ResponseStatus::Complete]);
        response.metadata.set_draining(true);
        let mut data = BytesMut::from(&b"reply"[..]);
        assert!(upstream.handle_upstream_data(&mut data, false, &mut response, &owner));

        assert!(upstream.draining());
        assert!(upstream.response_complete());
        assert_eq!(pooled.closed(), Some(CloseType::NoFlush));
        assert_eq!(stats.upstream_cx_drain_close.get("users"), 1);
        assert_eq!(stats.upstream_resp_reply_success.get("users/10.0.0.1:9090"), 1);
        assert_eq!(owner.count("reset_downstream"), 0);
        assert!(!owner.calls().iter().any(|c| c.starts_with("local_reply")));
    }

    #[test]
    #[should_panic(expected = "upstream data received after the response completed")]
    fn test_data_after_response_complete_panics() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = connected(&stats, &owner, &pooled, host());

        let mut response = MockResponse::new(&[ResponseStatus::Complete]);
        upstream.handle_upstream_data(&mut BytesMut::from(&b"reply"[..]), false, &mut response, &owner);
        upstream.handle_upstream_data(&mut BytesMut::from(&b"more"[..]), false, &mut response, &owner);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "connection event delivered after the response completed")]
    fn test_event_after_response_complete_is_rejected() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = connected(&stats, &owner, &pooled, host());

        let mut response = MockResponse::new(&[ResponseStatus::Complete]);
        upstream.handle_upstream_data(&mut BytesMut::from(&b"reply"[..]), false, &mut response, &owner);
        upstream.on_event(ConnectionEvent::RemoteClose, &owner);
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "connect events belong to the connection pool")]
    fn test_connect_event_is_rejected() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = connected(&stats, &owner, &pooled, host());

        upstream.on_event(ConnectionEvent::Connected, &owner);
    }

    #[test]
    fn test_response_outcomes_feed_stats_and_outlier() {
        let cases = [
            (MessageType::Reply, true, "success"),
            (MessageType::Reply, false, "error"),
            (MessageType::Exception, true, "exception"),
            (MessageType::Call, true, "invalid"),
        ];

        for (message_type, success, outcome) in cases {
            let stats = Arc::new(RouterStats::new());
            let owner = MockOwner::new();
            let pooled = PooledConnection::new();
            let (host, detector) = detector_host();
            let mut upstream = connected(&stats, &owner, &pooled, host);

            let mut response = MockResponse::new(&[ResponseStatus::Complete]);
            response.metadata.set_message_type(message_type);
            response.success = success;
            upstream.handle_upstream_data(&mut BytesMut::from(&b"0123456789"[..]), false, &mut response, &owner);

            let label = "users/10.0.0.1:9090";
            assert_eq!(stats.upstream_resp_size.sum("users"), 10.0, "{outcome}");
            assert_eq!(stats.upstream_resp_reply_success.get(label), (outcome == "success") as u64);
            assert_eq!(stats.upstream_resp_reply_error.get(label), (outcome == "error") as u64);
            assert_eq!(stats.upstream_resp_exception.get(label), (outcome == "exception") as u64);
            assert_eq!(stats.upstream_resp_invalid_type.get(label), (outcome == "invalid") as u64);

            let ext_failures = matches!(outcome, "error" | "exception") as u64;
            assert_eq!(detector.stats().ext_failures, ext_failures, "{outcome}");
            assert_eq!(response.started, 1);
            assert_eq!(pooled.closed(), None);
        }
    }

    #[test]
    fn test_undecodable_response_resets_upstream() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let (host, detector) = detector_host();
        let mut upstream = connected(&stats, &owner, &pooled, host);

        let mut response = MockResponse::new(&[ResponseStatus::Reset]);
        assert!(upstream.handle_upstream_data(&mut BytesMut::from(&b"junk"[..]), false, &mut response, &owner));

        assert!(!upstream.response_complete());
        assert_eq!(pooled.closed(), Some(CloseType::NoFlush));
        assert_eq!(stats.upstream_resp_decoding_error.get("users/10.0.0.1:9090"), 1);
        assert_eq!(stats.upstream_resp_size.count("users"), 0);
        assert_eq!(detector.stats().ext_failures, 1);
    }

    #[test]
    fn test_response_time_charged_once() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = connected(&stats, &owner, &pooled, host());

        upstream.on_request_complete(&owner);
        owner.time.advance(Duration::from_millis(25));

        let mut response = MockResponse::new(&[ResponseStatus::Complete]);
        upstream.handle_upstream_data(&mut BytesMut::from(&b"reply"[..]), false, &mut response, &owner);
        owner.time.advance(Duration::from_millis(100));
        upstream.on_reset_stream(PoolFailureReason::RemoteConnectionFailure, &owner);
        upstream.charge_response_timing(&owner);

        let label = "users/10.0.0.1:9090";
        assert_eq!(stats.upstream_resp_time.count(label), 1);
        assert_eq!(stats.upstream_resp_time.sum(label), 25.0);
    }

    #[test]
    fn test_response_time_needs_complete_request() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = connected(&stats, &owner, &pooled, host());

        let mut response = MockResponse::new(&[ResponseStatus::Complete]);
        upstream.handle_upstream_data(&mut BytesMut::from(&b"reply"[..]), false, &mut response, &owner);

        assert!(stats.upstream_resp_time.labels().is_empty());
    }

    #[test]
    fn test_upgrade_defers_request_start() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = UpstreamRequest::new(
            stats.clone(),
            MessageMetadata::new(),
            Box::new(FramedTransport),
            Box::new(UpgradingProtocol),
            true,
        );
        let pool = MockPool::new(PoolResult::Ready {
            conn_data: pooled.checkout(),
            host: host(),
        });

        assert_eq!(upstream.start(&pool, &owner), FilterStatus::StopIteration);
        assert!(upstream.is_upgrading());
        assert_eq!(pooled.written(), b"UPGRADE");
        assert_eq!(owner.size.get(), 7);
        assert!(owner.calls().is_empty());

        let mut response = MockResponse::new(&[]);
        assert!(!upstream.handle_upstream_data(&mut BytesMut::from(&b"O"[..]), false, &mut response, &owner));
        assert!(upstream.is_upgrading());
        assert!(!upstream.handle_upstream_data(&mut BytesMut::from(&b"K"[..]), false, &mut response, &owner));

        assert!(!upstream.is_upgrading());
        assert!(!upstream.response_started());
        assert_eq!(response.started, 0);
        assert_eq!(owner.calls(), vec!["converter:upgrading", "begin:0", "continue_decoding"]);

        let state = pooled
            .state
            .borrow()
            .clone()
            .and_then(|s| s.downcast::<RefCell<ThriftConnectionState>>().ok())
            .expect("connection state attached");
        assert!(state.borrow().is_upgraded());
    }

    #[test]
    fn test_upgrade_attempted_once_per_connection() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let new_request = || {
            UpstreamRequest::new(
                stats.clone(),
                MessageMetadata::new(),
                Box::new(FramedTransport),
                Box::new(UpgradingProtocol),
                true,
            )
        };

        let mut first = new_request();
        first.on_pool_ready(pooled.checkout(), host(), &owner);
        assert!(first.is_upgrading());
        drop(first);

        let mut second = new_request();
        second.on_pool_ready(pooled.checkout(), host(), &owner);
        assert!(!second.is_upgrading());
        assert_eq!(pooled.written(), b"UPGRADE");
    }

    #[test]
    fn test_encode_and_write_frames_request() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();
        let mut upstream = connected(&stats, &owner, &pooled, host());

        let mut request = BytesMut::from(&b"call"[..]);
        let size = upstream.encode_and_write(&mut request);

        assert_eq!(size, 8);
        assert_eq!(pooled.written(), b"\x00\x00\x00\x04call");
        assert_eq!(
            upstream.metadata().protocol(),
            Some(crate::protocol::ProtocolType::Compact)
        );
    }

    #[test]
    fn test_drop_cancels_pending_connection() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let (pool, cancelled) = MockPool::pending();

        let mut upstream = request(&stats, true);
        upstream.start(&pool, &owner);
        drop(upstream);

        assert_eq!(cancelled.get(), 1);
    }

    #[test]
    fn test_reset_stream_cancels_and_closes() {
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let (pool, cancelled) = MockPool::pending();

        let mut upstream = request(&stats, true);
        upstream.start(&pool, &owner);
        upstream.reset_stream();
        assert_eq!(cancelled.get(), 1);
        drop(upstream);
        assert_eq!(cancelled.get(), 1);

        let pooled = PooledConnection::new();
        let host = host();
        let mut upstream = connected(&stats, &owner, &pooled, host.clone());
        assert_eq!(host.active_requests().get(), 1);
        upstream.reset_stream();
        assert_eq!(pooled.closed(), Some(CloseType::NoFlush));
        assert_eq!(host.active_requests().get(), 0);
    }

    #[test]
    fn test_for_cluster_uses_cluster_codecs() {
        let config = config::ClusterConfig {
            name: "users".to_string(),
            hosts: vec!["10.0.0.1:9090".to_string()],
            transport: config::TransportKind::Unframed,
            protocol: config::ProtocolKind::Binary,
            close_downstream_on_error: false,
            max_connections: 8,
            connect_timeout: 1,
            outlier_detection: Default::default(),
        };
        let cluster = Cluster::from_config(&config).unwrap();
        let stats = Arc::new(RouterStats::new());
        let owner = MockOwner::new();
        let pooled = PooledConnection::new();

        let mut upstream = UpstreamRequest::for_cluster(stats, &cluster, MessageMetadata::new());
        let pool = MockPool::new(PoolResult::Ready {
            conn_data: pooled.checkout(),
            host: cluster.choose_host().unwrap(),
        });
        upstream.start(&pool, &owner);
        upstream.encode_and_write(&mut BytesMut::from(&b"call"[..]));

        assert_eq!(pooled.written(), b"call");
        assert_eq!(owner.calls()[0], "converter:binary");
        assert_eq!(cluster.transport(), TransportType::Unframed);
    }
}
