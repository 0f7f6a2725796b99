//! conduit-router: upstream side of a proxied call
//!
//! The `router` filter ([`RouterFactory`]) sends each routed stream to a
//! host of its cluster. An [`UpstreamRequest`] acquires a pooled
//! connection, writes the framed request, decodes the response through the
//! owning router and maps upstream failures to downstream actions. Pools
//! and connections are reached through traits; [`TcpConnPool`] is the
//! socket-backed pool.

pub mod app_exception;
pub mod cluster;
pub mod conn_pool;
pub mod converter;
pub mod error;
pub mod host;
pub mod outlier;
pub mod pool;
pub mod protocol;
pub mod reset;
pub mod router;
pub mod stats;
pub mod upstream_request;

pub use app_exception::{AppException, AppExceptionType};
pub use cluster::{Cluster, ClusterManager};
pub use conn_pool::{thread_local_pool, PoolSettings, TcpConnPool};
pub use converter::{RequestLine, TextConverter};
pub use error::*;
pub use host::Host;
pub use outlier::{ConsecutiveFailureDetector, DetectorSettings, OutlierDetector, OutlierResult};
pub use pool::{
    CancelPolicy, Cancellable, ConnectionData, ConnectionPool, PoolCallbacks, PoolFailureReason,
    PoolResult, UpstreamCallbacks, UpstreamConnection,
};
pub use protocol::{
    MessageMetadata, MessageType, Protocol, ProtocolType, ThriftConnectionState, Transport,
    TransportType, UpgradeResponse,
};
pub use router::{register_router, PoolSource, Router, RouterFactory, RouterFilter, TcpPools, FILTER_NAME};
pub use stats::RouterStats;
pub use upstream_request::{RequestOwner, ResponseStatus, UpstreamRequest, UpstreamResponseCallbacks};
