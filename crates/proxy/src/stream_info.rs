//! Per-stream bookkeeping

use std::time::{Duration, Instant, SystemTime};

use crate::codec::StatusCode;
use crate::tracer::TraceReason;

#[derive(Debug, Clone)]
pub struct StreamInfo {
    start_time: Instant,
    start_system_time: SystemTime,
    request_complete: Option<Duration>,
    trace_reason: Option<TraceReason>,
    route_name: Option<String>,
    response_status: Option<StatusCode>,
    local_reply: bool,
}

impl StreamInfo {
    pub fn new(start_time: Instant, start_system_time: SystemTime) -> Self {
        Self {
            start_time,
            start_system_time,
            request_complete: None,
            trace_reason: None,
            route_name: None,
            response_status: None,
            local_reply: false,
        }
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn start_system_time(&self) -> SystemTime {
        self.start_system_time
    }

    /// Record completion; only the first call counts
    pub fn on_request_complete(&mut self, now: Instant) {
        if self.request_complete.is_none() {
            self.request_complete = Some(now.saturating_duration_since(self.start_time));
        }
    }

    /// Time from stream creation to completion
    pub fn request_complete(&self) -> Option<Duration> {
        self.request_complete
    }

    pub fn set_trace_reason(&mut self, reason: TraceReason) {
        self.trace_reason = Some(reason);
    }

    pub fn trace_reason(&self) -> Option<TraceReason> {
        self.trace_reason
    }

    pub fn set_route_name(&mut self, name: &str) {
        self.route_name = Some(name.to_string());
    }

    pub fn route_name(&self) -> Option<&str> {
        self.route_name.as_deref()
    }

    pub fn set_response_status(&mut self, code: StatusCode) {
        self.response_status = Some(code);
    }

    pub fn response_status(&self) -> Option<StatusCode> {
        self.response_status
    }

    pub fn set_local_reply(&mut self) {
        self.local_reply = true;
    }

    pub fn is_local_reply(&self) -> bool {
        self.local_reply
    }
}
