//! Access logging for proxied streams

use chrono::{DateTime, Utc};
use config::FilterEntry;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::codec::{Request, Response};
use crate::error::Result;
use crate::filter::{DecoderFilter, EncoderFilter, FilterChain, FilterChainFactory, FilterStatus};
use crate::stream::StreamHandle;

pub const FILTER_NAME: &str = "access_log";

/// Access log entry data
#[derive(Debug, Clone)]
pub struct AccessLogEntry {
    pub timestamp: DateTime<Utc>,
    pub stream_id: u64,
    pub protocol: String,
    pub service: String,
    pub method: String,
    pub path: String,
    /// Status name, "-" when the stream ended without a reply
    pub status: String,
    pub local_reply: bool,
    pub duration_ms: u64,
}

/// Log format type
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LogFormat {
    #[default]
    Common,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Common,
        })
    }
}

#[derive(Clone)]
enum Sink {
    File(Arc<Mutex<BufWriter<File>>>),
    Log,
}

/// Writes access log lines to a file or the process log
#[derive(Clone)]
pub struct AccessLogger {
    sink: Sink,
    format: LogFormat,
}

impl AccessLogger {
    /// Append to a file
    pub fn new<P: AsRef<Path>>(path: P, format: LogFormat) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;

        Ok(Self {
            sink: Sink::File(Arc::new(Mutex::new(BufWriter::new(file)))),
            format,
        })
    }

    /// Emit through `tracing` under the `access_log` target
    pub fn to_log(format: LogFormat) -> Self {
        Self {
            sink: Sink::Log,
            format,
        }
    }

    pub fn log(&self, entry: &AccessLogEntry) {
        let line = match self.format {
            LogFormat::Common => format_common(entry),
            LogFormat::Json => format_json(entry),
        };

        match &self.sink {
            Sink::File(writer) => {
                let mut writer = writer.lock();
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
            Sink::Log => info!(target: "access_log", "{}", line),
        }
    }
}

/// [10/Oct/2000:13:55:36 +0000] "users get /v1/users" ok 12ms stream=3
fn format_common(entry: &AccessLogEntry) -> String {
    let timestamp = entry.timestamp.format("%d/%b/%Y:%H:%M:%S %z");
    format!(
        "[{}] \"{} {} {}\" {}{} {}ms stream={}",
        timestamp,
        entry.service,
        entry.method,
        if entry.path.is_empty() { "-" } else { &entry.path },
        entry.status,
        if entry.local_reply { " local" } else { "" },
        entry.duration_ms,
        entry.stream_id
    )
}

fn format_json(entry: &AccessLogEntry) -> String {
    serde_json::json!({
        "timestamp": entry.timestamp.to_rfc3339(),
        "stream_id": entry.stream_id,
        "protocol": entry.protocol,
        "service": entry.service,
        "method": entry.method,
        "path": entry.path,
        "status": entry.status,
        "local_reply": entry.local_reply,
        "duration_ms": entry.duration_ms,
    })
    .to_string()
}

/// Dual filter: request fields on decode, status on encode, one line on
/// destroy
pub struct AccessLogFilter {
    logger: Arc<AccessLogger>,
    handle: Option<StreamHandle>,
    started: Option<Instant>,
    entry: AccessLogEntry,
}

impl AccessLogFilter {
    pub fn new(logger: Arc<AccessLogger>) -> Self {
        Self {
            logger,
            handle: None,
            started: None,
            entry: AccessLogEntry {
                timestamp: Utc::now(),
                stream_id: 0,
                protocol: String::new(),
                service: String::new(),
                method: String::new(),
                path: String::new(),
                status: "-".to_string(),
                local_reply: false,
                duration_ms: 0,
            },
        }
    }
}

impl DecoderFilter for AccessLogFilter {
    fn set_decoder_callbacks(&mut self, callbacks: StreamHandle) {
        self.entry.stream_id = callbacks.stream_id();
        self.started = Some(callbacks.dispatcher().time_source().monotonic_time());
        self.handle = Some(callbacks);
    }

    fn on_stream_decoded(&mut self, request: &mut dyn Request) -> FilterStatus {
        self.entry.protocol = request.protocol().to_string();
        self.entry.service = request.host().to_string();
        self.entry.method = request.method().to_string();
        self.entry.path = request.path().to_string();
        FilterStatus::Continue
    }

    fn on_destroy(&mut self) {
        if let Some(handle) = &self.handle {
            if let Some(started) = self.started {
                let now = handle.dispatcher().time_source().monotonic_time();
                self.entry.duration_ms = now.saturating_duration_since(started).as_millis() as u64;
            }
            if let Some(info) = handle.stream_info() {
                self.entry.local_reply = info.is_local_reply();
            }
        }
        self.logger.log(&self.entry);
    }
}

impl EncoderFilter for AccessLogFilter {
    fn on_stream_encoded(&mut self, response: &mut dyn Response) -> FilterStatus {
        self.entry.status = response.status().code().to_string();
        FilterStatus::Continue
    }
}

pub struct AccessLogFactory {
    logger: Arc<AccessLogger>,
}

impl AccessLogFactory {
    pub fn new(logger: AccessLogger) -> Self {
        Self {
            logger: Arc::new(logger),
        }
    }

    /// Settings: `path` (log to the process log when absent), `format`
    pub fn from_config(entry: &FilterEntry) -> Result<Self> {
        let format: LogFormat = entry
            .get_str("format")
            .unwrap_or("common")
            .parse()
            .unwrap_or_default();
        let logger = match entry.get_str("path") {
            Some(path) => AccessLogger::new(path, format)?,
            None => AccessLogger::to_log(format),
        };
        Ok(Self::new(logger))
    }
}

impl FilterChainFactory for AccessLogFactory {
    fn create_filter_chain(&self, chain: &mut FilterChain) {
        chain.add_filter(AccessLogFilter::new(self.logger.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::fs;
    use tempfile::NamedTempFile;

    fn make_test_entry() -> AccessLogEntry {
        AccessLogEntry {
            timestamp: Utc::now(),
            stream_id: 3,
            protocol: "text".to_string(),
            service: "users".to_string(),
            method: "get".to_string(),
            path: "/v1/users".to_string(),
            status: "ok".to_string(),
            local_reply: false,
            duration_ms: 42,
        }
    }

    #[test]
    fn test_log_format_from_str() {
        assert_eq!("common".parse::<LogFormat>().unwrap(), LogFormat::Common);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("unknown".parse::<LogFormat>().unwrap(), LogFormat::Common);
    }

    #[test]
    fn test_format_common() {
        let line = format_common(&make_test_entry());
        assert!(line.contains("\"users get /v1/users\" ok 42ms stream=3"));
    }

    #[test]
    fn test_format_common_marks_local_reply() {
        let mut entry = make_test_entry();
        entry.local_reply = true;
        entry.path.clear();
        entry.status = "not_found".to_string();
        let line = format_common(&entry);
        assert!(line.contains("\"users get -\" not_found local 42ms"));
    }

    #[test]
    fn test_format_json() {
        let line = format_json(&make_test_entry());
        let value: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["service"], "users");
        assert_eq!(value["status"], "ok");
        assert_eq!(value["duration_ms"], 42);
        assert_eq!(value["local_reply"], false);
    }

    #[test]
    fn test_logger_write() {
        let tmp = NamedTempFile::new().unwrap();
        let path = tmp.path().to_owned();

        {
            let logger = AccessLogger::new(&path, LogFormat::Common).unwrap();
            logger.log(&make_test_entry());
        }

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.contains("users get /v1/users"));
    }

    #[test]
    fn test_factory_from_config() {
        let tmp = NamedTempFile::new().unwrap();
        let mut config = HashMap::new();
        config.insert(
            "path".to_string(),
            toml_value(tmp.path().to_str().unwrap()),
        );
        config.insert("format".to_string(), toml_value("json"));
        let entry = FilterEntry {
            name: FILTER_NAME.to_string(),
            config,
        };

        let factory = AccessLogFactory::from_config(&entry).unwrap();
        let mut chain = FilterChain::new();
        factory.create_filter_chain(&mut chain);
        assert_eq!(chain.decoder_filter_count(), 1);
        assert_eq!(chain.encoder_filter_count(), 1);
    }

    #[test]
    fn test_filter_logs_local_reply_on_destroy() {
        use crate::filters::DirectResponseFactory;
        use crate::testing::{text_config, Harness};

        let tmp = NamedTempFile::new().unwrap();
        let logger = AccessLogger::new(tmp.path(), LogFormat::Json).unwrap();
        let config = text_config()
            .with_filter_factory(Arc::new(AccessLogFactory::new(logger)))
            .with_filter_factory(Arc::new(DirectResponseFactory));
        let h = Harness::new(config);

        h.feed("users get path=/v1/users\n");
        h.run();

        let content = fs::read_to_string(tmp.path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(content.trim()).unwrap();
        assert_eq!(value["service"], "users");
        assert_eq!(value["path"], "/v1/users");
        assert_eq!(value["status"], "not_found");
        assert_eq!(value["local_reply"], true);
    }

    fn toml_value(s: &str) -> config::toml::Value {
        config::toml::Value::String(s.to_string())
    }
}
