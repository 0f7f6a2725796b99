//! Per-host TCP connection pool
//!
//! A [`TcpConnPool`] lives on the event loop thread and keeps idle
//! connections to one host for reuse. Connects run as local tasks, so
//! every callback into the router arrives from outside the stream's
//! dispatcher; the router posts its reaction back onto it.
//!
//! The pool counts busy and connecting clients against the cluster's
//! `max_connections`. A request beyond that budget fails with
//! [`PoolFailureReason::Overflow`] instead of waiting.

use crate::cluster::Cluster;
use crate::host::Host;
use crate::pool::{
    CancelPolicy, Cancellable, ConnectionData, ConnectionPool, PoolCallbacks, PoolFailureReason,
    PoolResult, UpstreamCallbacks, UpstreamConnection,
};
use crate::stats::RouterStats;
use bytes::{Bytes, BytesMut};
use proxy::{CloseType, ConnectionEvent, ConnectionState};
use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSettings {
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

impl PoolSettings {
    pub fn from_cluster(cluster: &Cluster) -> Self {
        Self {
            max_connections: cluster.max_connections(),
            connect_timeout: cluster.connect_timeout(),
        }
    }
}

enum Outbound {
    Data(Bytes),
    Close,
}

/// One established upstream connection
struct ActiveClient {
    id: u64,
    state: Cell<ConnectionState>,
    sender: mpsc::UnboundedSender<Outbound>,
    callbacks: RefCell<Option<Weak<dyn UpstreamCallbacks>>>,
    connection_state: RefCell<Option<Rc<dyn Any>>>,
    pool: Weak<TcpConnPool>,
    reader: RefCell<Option<JoinHandle<()>>>,
    writer: RefCell<Option<JoinHandle<()>>>,
}

impl ActiveClient {
    fn start(id: u64, stream: TcpStream, pool: Weak<TcpConnPool>) -> Rc<Self> {
        let (read_half, write_half) = stream.into_split();
        let (sender, receiver) = mpsc::unbounded_channel();
        let client = Rc::new(Self {
            id,
            state: Cell::new(ConnectionState::Open),
            sender,
            callbacks: RefCell::new(None),
            connection_state: RefCell::new(None),
            pool,
            reader: RefCell::new(None),
            writer: RefCell::new(None),
        });

        let weak = Rc::downgrade(&client);
        *client.reader.borrow_mut() = Some(tokio::task::spawn_local(read_loop(weak.clone(), read_half)));
        *client.writer.borrow_mut() = Some(tokio::task::spawn_local(write_loop(weak, write_half, receiver)));
        client
    }

    fn callbacks(&self) -> Option<Rc<dyn UpstreamCallbacks>> {
        self.callbacks.borrow().as_ref().and_then(Weak::upgrade)
    }

    fn abort_reader(&self) {
        if let Some(task) = self.reader.borrow_mut().take() {
            task.abort();
        }
    }

    fn abort_writer(&self) {
        if let Some(task) = self.writer.borrow_mut().take() {
            task.abort();
        }
    }

    fn on_data(&self, buffer: &mut BytesMut) {
        match self.callbacks() {
            Some(callbacks) => callbacks.on_upstream_data(buffer, false),
            None => {
                warn!(client = self.id, bytes = buffer.len(), "Data on idle upstream connection");
                buffer.clear();
                self.close(CloseType::NoFlush);
                self.detach_from_pool();
            }
        }
    }

    /// The socket went away underneath us
    fn on_closed(&self, event: ConnectionEvent) {
        if self.state.replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        debug!(client = self.id, ?event, "Upstream connection closed");
        match event {
            ConnectionEvent::LocalClose => self.abort_reader(),
            _ => self.abort_writer(),
        }
        if let Some(callbacks) = self.callbacks() {
            callbacks.on_event(event);
        }
        self.detach_from_pool();
    }

    fn detach_from_pool(&self) {
        if let Some(pool) = self.pool.upgrade() {
            pool.remove_idle(self.id);
        }
    }
}

impl UpstreamConnection for ActiveClient {
    fn write(&self, data: &mut BytesMut, _end_stream: bool) {
        let data = data.split().freeze();
        if self.state.get() != ConnectionState::Open {
            debug!(client = self.id, bytes = data.len(), "Dropping write to closed upstream connection");
            return;
        }
        trace!(client = self.id, bytes = data.len(), "Writing upstream");
        if self.sender.send(Outbound::Data(data)).is_err() {
            debug!(client = self.id, "Upstream writer already stopped");
        }
    }

    /// Closing on request raises no connection event
    fn close(&self, close_type: CloseType) {
        if self.state.replace(ConnectionState::Closed) == ConnectionState::Closed {
            return;
        }
        debug!(client = self.id, ?close_type, "Closing upstream connection");
        self.abort_reader();
        match close_type {
            CloseType::FlushWrite => {
                let _ = self.sender.send(Outbound::Close);
            }
            CloseType::NoFlush => self.abort_writer(),
        }
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

impl Drop for ActiveClient {
    fn drop(&mut self) {
        // Pending writes still drain once the sender is gone.
        self.abort_reader();
    }
}

async fn read_loop(client: Weak<ActiveClient>, mut reader: OwnedReadHalf) {
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);
    loop {
        let result = reader.read_buf(&mut buffer).await;
        let Some(client) = client.upgrade() else {
            return;
        };
        match result {
            Ok(0) => {
                client.on_closed(ConnectionEvent::RemoteClose);
                return;
            }
            Ok(n) => {
                trace!(client = client.id, bytes = n, "Read upstream");
                client.on_data(&mut buffer);
            }
            Err(e) => {
                debug!(client = client.id, error = %e, "Upstream read failed");
                client.on_closed(ConnectionEvent::RemoteClose);
                return;
            }
        }
    }
}

async fn write_loop(
    client: Weak<ActiveClient>,
    mut writer: OwnedWriteHalf,
    mut receiver: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(message) = receiver.recv().await {
        match message {
            Outbound::Data(data) => {
                if let Err(e) = writer.write_all(&data).await {
                    debug!(error = %e, "Upstream write failed");
                    if let Some(client) = client.upgrade() {
                        client.on_closed(ConnectionEvent::LocalClose);
                    }
                    return;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

/// A connection handed out by the pool; dropping it gives the connection back
struct PooledConnection {
    client: Rc<ActiveClient>,
    pool: Weak<TcpConnPool>,
}

impl ConnectionData for PooledConnection {
    fn connection(&self) -> &dyn UpstreamConnection {
        self.client.as_ref()
    }

    fn add_upstream_callbacks(&mut self, callbacks: Weak<dyn UpstreamCallbacks>) {
        *self.client.callbacks.borrow_mut() = Some(callbacks);
    }

    fn connection_state(&self) -> Option<Rc<dyn Any>> {
        self.client.connection_state.borrow().clone()
    }

    fn set_connection_state(&mut self, state: Rc<dyn Any>) {
        *self.client.connection_state.borrow_mut() = Some(state);
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        self.client.callbacks.borrow_mut().take();
        if let Some(pool) = self.pool.upgrade() {
            pool.release(self.client.clone());
        }
    }
}

struct PendingRequest {
    callbacks: Weak<dyn PoolCallbacks>,
    cancelled: Cell<Option<CancelPolicy>>,
}

struct PendingHandle {
    request: Rc<PendingRequest>,
}

impl Cancellable for PendingHandle {
    fn cancel(&mut self, policy: CancelPolicy) {
        trace!(?policy, "Cancelling pending upstream connection");
        self.request.cancelled.set(Some(policy));
    }
}

/// Connections to one host
pub struct TcpConnPool {
    weak_self: Weak<TcpConnPool>,
    host: Arc<Host>,
    settings: PoolSettings,
    stats: Arc<RouterStats>,
    idle: RefCell<Vec<Rc<ActiveClient>>>,
    busy: Cell<usize>,
    connecting: Cell<usize>,
    next_id: Cell<u64>,
}

impl TcpConnPool {
    pub fn new(host: Arc<Host>, settings: PoolSettings, stats: Arc<RouterStats>) -> Rc<Self> {
        Rc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            host,
            settings,
            stats,
            idle: RefCell::new(Vec::new()),
            busy: Cell::new(0),
            connecting: Cell::new(0),
            next_id: Cell::new(0),
        })
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.host
    }

    pub fn settings(&self) -> PoolSettings {
        self.settings
    }

    pub fn idle_count(&self) -> usize {
        self.idle.borrow().len()
    }

    pub fn busy_count(&self) -> usize {
        self.busy.get()
    }

    pub fn connecting_count(&self) -> usize {
        self.connecting.get()
    }

    fn checkout(&self, client: Rc<ActiveClient>) -> Box<dyn ConnectionData> {
        self.busy.set(self.busy.get() + 1);
        Box::new(PooledConnection {
            client,
            pool: self.weak_self.clone(),
        })
    }

    fn release(&self, client: Rc<ActiveClient>) {
        self.busy.set(self.busy.get().saturating_sub(1));
        if client.state() == ConnectionState::Open {
            trace!(host = %self.host.address(), client = client.id, "Upstream connection idle");
            self.idle.borrow_mut().push(client);
        }
    }

    fn remove_idle(&self, id: u64) {
        self.idle.borrow_mut().retain(|client| client.id != id);
    }

    fn on_connected(&self, result: io::Result<TcpStream>, request: Rc<PendingRequest>) {
        self.connecting.set(self.connecting.get().saturating_sub(1));
        let cancelled = request.cancelled.get();

        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                let reason = failure_reason(&e);
                warn!(host = %self.host.address(), error = %e, reason = %reason, "Upstream connect failed");
                self.stats.inc_connect_fail(&self.host);
                if cancelled.is_none() {
                    if let Some(callbacks) = request.callbacks.upgrade() {
                        callbacks.on_pool_failure(reason, Some(self.host.clone()));
                    }
                }
                return;
            }
        };

        let _ = stream.set_nodelay(true);
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.stats.inc_connection(&self.host);
        debug!(host = %self.host.address(), client = id, "Upstream connected");
        let client = ActiveClient::start(id, stream, self.weak_self.clone());

        match (cancelled, request.callbacks.upgrade()) {
            (Some(CancelPolicy::CloseExcess), _) => client.close(CloseType::NoFlush),
            (None, Some(callbacks)) => {
                let conn_data = self.checkout(client);
                callbacks.on_pool_ready(conn_data, self.host.clone());
            }
            _ => self.idle.borrow_mut().push(client),
        }
    }
}

impl ConnectionPool for TcpConnPool {
    fn new_connection(&self, callbacks: Weak<dyn PoolCallbacks>) -> PoolResult {
        loop {
            let next = self.idle.borrow_mut().pop();
            let Some(client) = next else {
                break;
            };
            if client.state() == ConnectionState::Open {
                trace!(host = %self.host.address(), client = client.id, "Reusing upstream connection");
                return PoolResult::Ready {
                    conn_data: self.checkout(client),
                    host: self.host.clone(),
                };
            }
        }

        if self.busy.get() + self.connecting.get() >= self.settings.max_connections {
            warn!(
                host = %self.host.address(),
                max_connections = self.settings.max_connections,
                "Upstream connection budget exhausted"
            );
            self.stats.inc_overflow(&self.host);
            return PoolResult::Failure {
                reason: PoolFailureReason::Overflow,
                host: Some(self.host.clone()),
            };
        }

        self.connecting.set(self.connecting.get() + 1);
        let request = Rc::new(PendingRequest {
            callbacks,
            cancelled: Cell::new(None),
        });
        let pool = self.weak_self.clone();
        let address = self.host.address().to_string();
        let timeout = self.settings.connect_timeout;
        let pending = request.clone();
        tokio::task::spawn_local(async move {
            let result = match tokio::time::timeout(timeout, TcpStream::connect(address.as_str())).await {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "connect timed out")),
            };
            if let Some(pool) = pool.upgrade() {
                pool.on_connected(result, pending);
            }
        });

        debug!(host = %self.host.address(), "Connecting upstream");
        PoolResult::Pending(Box::new(PendingHandle { request }))
    }
}

fn failure_reason(error: &io::Error) -> PoolFailureReason {
    match error.kind() {
        io::ErrorKind::TimedOut => PoolFailureReason::Timeout,
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => PoolFailureReason::RemoteConnectionFailure,
        _ => PoolFailureReason::LocalConnectionFailure,
    }
}

thread_local! {
    static POOLS: RefCell<HashMap<String, Rc<TcpConnPool>>> = RefCell::new(HashMap::new());
}

/// The event loop's pool for `host`, replaced when the host is rebuilt by a reload
pub fn thread_local_pool(
    host: &Arc<Host>,
    settings: PoolSettings,
    stats: &Arc<RouterStats>,
) -> Rc<TcpConnPool> {
    POOLS.with(|pools| {
        let mut pools = pools.borrow_mut();
        let key = host.stat_name();
        match pools.get(&key) {
            Some(pool) if Arc::ptr_eq(pool.host(), host) => pool.clone(),
            _ => {
                let pool = TcpConnPool::new(host.clone(), settings, stats.clone());
                pools.insert(key, pool.clone());
                pool
            }
        }
    })
}
