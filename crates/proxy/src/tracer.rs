//! Stream tracing
//!
//! A sampling [`Decision`] is made once per stream from the listener's
//! [`TracingConfig`] and the `tracing.random_sampling` runtime flag. The
//! [`Tracer`] opens a [`Span`] for the stream which is finalized exactly once
//! when the stream completes.

use config::{OperationName, StreamTracingConfig};
use std::collections::HashMap;
use tracing::{debug, info, info_span};

use crate::codec::{Request, StatusCode};
use crate::runtime::Runtime;
use crate::stream_info::StreamInfo;

/// Runtime flag holding the sampling percentage
pub const RANDOM_SAMPLING_KEY: &str = "tracing.random_sampling";

/// Span tag names
pub mod tags {
    pub const COMPONENT: &str = "component";
    pub const PROTOCOL: &str = "protocol";
    pub const SERVICE: &str = "service";
    pub const METHOD: &str = "method";
    pub const PATH: &str = "path";
    pub const ROUTE: &str = "route";
    pub const STATUS: &str = "status";
    pub const ERROR: &str = "error";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceReason {
    NotTraceable,
    HealthCheck,
    Sampling,
    ServiceForced,
    ClientForced,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub reason: TraceReason,
    pub traced: bool,
}

#[derive(Debug, Clone)]
pub struct TracingConfig {
    operation_name: OperationName,
    random_sampling: f64,
    verbose: bool,
    max_path_tag_length: usize,
    custom_tags: HashMap<String, String>,
}

impl TracingConfig {
    pub fn new(operation_name: OperationName, random_sampling: f64) -> Self {
        Self {
            operation_name,
            random_sampling,
            verbose: false,
            max_path_tag_length: 256,
            custom_tags: HashMap::new(),
        }
    }

    pub fn from_config(config: &StreamTracingConfig) -> Self {
        Self {
            operation_name: config.operation_name,
            random_sampling: config.random_sampling,
            verbose: config.verbose,
            max_path_tag_length: config.max_path_tag_length,
            custom_tags: config.custom_tags.clone(),
        }
    }

    pub fn with_max_path_tag_length(mut self, length: usize) -> Self {
        self.max_path_tag_length = length;
        self
    }

    pub fn with_custom_tag(mut self, name: &str, value: &str) -> Self {
        self.custom_tags.insert(name.to_string(), value.to_string());
        self
    }

    pub fn with_verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn operation_name(&self) -> OperationName {
        self.operation_name
    }

    /// Default sampling percentage when the runtime flag is unset
    pub fn random_sampling(&self) -> f64 {
        self.random_sampling
    }

    pub fn verbose(&self) -> bool {
        self.verbose
    }

    pub fn max_path_tag_length(&self) -> usize {
        self.max_path_tag_length
    }

    pub fn custom_tags(&self) -> &HashMap<String, String> {
        &self.custom_tags
    }
}

/// Decide whether a new stream is traced
pub fn tracing_decision(config: &TracingConfig, runtime: &dyn Runtime) -> Decision {
    if runtime.feature_enabled(RANDOM_SAMPLING_KEY, config.random_sampling()) {
        Decision {
            reason: TraceReason::Sampling,
            traced: true,
        }
    } else {
        Decision {
            reason: TraceReason::NotTraceable,
            traced: false,
        }
    }
}

pub trait Span {
    fn set_tag(&mut self, name: &str, value: &str);
    fn log(&mut self, event: &str);
    fn finish_span(&mut self);
}

pub trait Tracer: Send + Sync {
    fn start_span(
        &self,
        config: &TracingConfig,
        request: &dyn Request,
        stream_info: &StreamInfo,
        decision: Decision,
    ) -> Box<dyn Span>;
}

/// Cut `path` to at most `max` bytes on a character boundary
pub fn truncate_path(path: &str, max: usize) -> &str {
    if path.len() <= max {
        return path;
    }
    let mut end = max;
    while !path.is_char_boundary(end) {
        end -= 1;
    }
    &path[..end]
}

/// Tag and finish a stream's span
pub fn finalize_span(
    span: &mut dyn Span,
    request: Option<&dyn Request>,
    stream_info: &StreamInfo,
    config: &TracingConfig,
) {
    span.set_tag(tags::COMPONENT, "proxy");
    if let Some(request) = request {
        span.set_tag(tags::PROTOCOL, request.protocol());
        span.set_tag(tags::SERVICE, request.host());
        span.set_tag(tags::METHOD, request.method());
        span.set_tag(
            tags::PATH,
            truncate_path(request.path(), config.max_path_tag_length()),
        );
    }
    if let Some(route) = stream_info.route_name() {
        span.set_tag(tags::ROUTE, route);
    }
    match stream_info.response_status() {
        Some(code) => {
            span.set_tag(tags::STATUS, code.as_str());
            if code != StatusCode::Ok {
                span.set_tag(tags::ERROR, "true");
            }
        }
        None => span.set_tag(tags::ERROR, "true"),
    }
    if config.verbose() {
        if let Some(elapsed) = stream_info.request_complete() {
            span.log(&format!("stream complete after {}ms", elapsed.as_millis()));
        }
    }
    for (name, value) in config.custom_tags() {
        span.set_tag(name, value);
    }
    span.finish_span();
}

/// Tracer that opens `tracing` spans, exported through whatever subscriber
/// the process installed
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTracer;

struct LogSpan {
    span: tracing::Span,
    sampled: bool,
    tags: Vec<(String, String)>,
    finished: bool,
}

impl Tracer for LogTracer {
    fn start_span(
        &self,
        config: &TracingConfig,
        request: &dyn Request,
        _stream_info: &StreamInfo,
        decision: Decision,
    ) -> Box<dyn Span> {
        let span = if decision.traced {
            info_span!(
                "stream",
                operation = ?config.operation_name(),
                service = %request.host(),
                method = %request.method(),
                reason = ?decision.reason
            )
        } else {
            tracing::Span::none()
        };
        Box::new(LogSpan {
            span,
            sampled: decision.traced,
            tags: Vec::new(),
            finished: false,
        })
    }
}

impl Span for LogSpan {
    fn set_tag(&mut self, name: &str, value: &str) {
        if self.sampled {
            self.tags.push((name.to_string(), value.to_string()));
        }
    }

    fn log(&mut self, event: &str) {
        if self.sampled {
            self.span.in_scope(|| debug!(event = %event, "Span event"));
        }
    }

    fn finish_span(&mut self) {
        if self.finished || !self.sampled {
            return;
        }
        self.finished = true;
        let tags = &self.tags;
        self.span.in_scope(|| info!(tags = ?tags, "Span finished"));
    }
}
