//! conduit-proxy: generic proxy stream pipeline
//!
//! This crate decodes downstream requests with a pluggable codec, runs them
//! through ordered decoder and encoder filter chains, and writes replies
//! back, one [`ProxyFilter`] per connection.

pub mod codec;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod filter;
pub mod filters;
pub mod metrics;
pub mod proxy;
pub mod route;
pub mod runtime;
pub mod stream;
pub mod stream_info;
pub mod tracer;

#[cfg(test)]
mod testing;

pub use codec::{
    CodecFactory, MessageCreator, Request, RequestPtr, Response, ResponsePtr, Status, StatusCode,
    StreamBase,
};
pub use connection::{
    BufferedConnection, CloseType, ConnectionEvent, ConnectionState, DownstreamConnection,
    DrainDecision, DrainManager,
};
pub use dispatcher::{Dispatcher, RealTimeSource, SimulatedTimeSource, TimeSource};
pub use error::*;
pub use filter::{DecoderFilter, EncoderFilter, FilterChain, FilterChainFactory, FilterStatus};
pub use filters::FilterRegistry;
pub use metrics::{wait_for_connections_drain, ProxyStats};
pub use proxy::{FilterConfig, ProxyFilter};
pub use route::{RouteEntry, RouteMatch, RouteMatcher, RouteTable};
pub use runtime::{Runtime, SnapshotRuntime};
pub use stream::{ActiveStream, ResponseUpdate, StreamHandle};
pub use stream_info::StreamInfo;
pub use tracer::{Decision, LogTracer, Span, TraceReason, Tracer, TracingConfig};
