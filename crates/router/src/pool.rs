//! Connection pool contracts
//!
//! The router never owns sockets. A [`ConnectionPool`] hands out
//! [`ConnectionData`] either immediately or later through
//! [`PoolCallbacks`], and the request reacts to what it gets.

use crate::host::Host;
use bytes::BytesMut;
use proxy::{CloseType, ConnectionEvent, ConnectionState};
use std::any::Any;
use std::fmt;
use std::rc::{Rc, Weak};
use std::sync::Arc;

/// Why the pool could not provide a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolFailureReason {
    Overflow,
    LocalConnectionFailure,
    RemoteConnectionFailure,
    Timeout,
}

impl PoolFailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolFailureReason::Overflow => "overflow",
            PoolFailureReason::LocalConnectionFailure => "local connection failure",
            PoolFailureReason::RemoteConnectionFailure => "remote connection failure",
            PoolFailureReason::Timeout => "timeout",
        }
    }
}

impl fmt::Display for PoolFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to do with a connection that was being established for a cancelled request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelPolicy {
    /// Keep it for the next request
    #[default]
    Default,
    CloseExcess,
}

/// A pending connection request
pub trait Cancellable {
    fn cancel(&mut self, policy: CancelPolicy);
}

/// Upstream side of a pooled connection
pub trait UpstreamConnection {
    fn write(&self, data: &mut BytesMut, end_stream: bool);

    fn close(&self, close_type: CloseType);

    fn state(&self) -> ConnectionState;
}

/// Receives bytes and events from an upstream connection
pub trait UpstreamCallbacks {
    fn on_upstream_data(&self, data: &mut BytesMut, end_stream: bool);

    fn on_event(&self, event: ConnectionEvent);
}

/// A connection checked out of the pool
pub trait ConnectionData {
    fn connection(&self) -> &dyn UpstreamConnection;

    fn add_upstream_callbacks(&mut self, callbacks: Weak<dyn UpstreamCallbacks>);

    /// State attached to the pooled connection, shared by every request using it
    fn connection_state(&self) -> Option<Rc<dyn Any>>;

    fn set_connection_state(&mut self, state: Rc<dyn Any>);
}

/// Outcome of asking the pool for a connection
pub enum PoolResult {
    /// A connection will be delivered through [`PoolCallbacks`]
    Pending(Box<dyn Cancellable>),
    Ready {
        conn_data: Box<dyn ConnectionData>,
        host: Arc<Host>,
    },
    Failure {
        reason: PoolFailureReason,
        host: Option<Arc<Host>>,
    },
}

impl fmt::Debug for PoolResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolResult::Pending(_) => f.write_str("Pending"),
            PoolResult::Ready { host, .. } => f.debug_struct("Ready").field("host", host).finish(),
            PoolResult::Failure { reason, host } => f
                .debug_struct("Failure")
                .field("reason", reason)
                .field("host", host)
                .finish(),
        }
    }
}

/// Late delivery of a pending connection request
pub trait PoolCallbacks {
    fn on_pool_ready(&self, conn_data: Box<dyn ConnectionData>, host: Arc<Host>);

    fn on_pool_failure(&self, reason: PoolFailureReason, host: Option<Arc<Host>>);
}

pub trait ConnectionPool {
    fn new_connection(&self, callbacks: Weak<dyn PoolCallbacks>) -> PoolResult;
}
