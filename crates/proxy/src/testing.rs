//! Shared fixtures for stream and registry tests

use bytes::BytesMut;
use parking_lot::Mutex;
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::codec::text::TextCodecFactory;
use crate::codec::{Request, Response};
use crate::connection::{BufferedConnection, DrainManager};
use crate::dispatcher::{Dispatcher, SimulatedTimeSource};
use crate::filter::{DecoderFilter, EncoderFilter, FilterChain, FilterChainFactory, FilterStatus};
use crate::proxy::{FilterConfig, ProxyFilter};
use crate::route::RouteTable;
use crate::runtime::{Runtime, SnapshotRuntime};
use crate::stream::ActiveStream;
use crate::stream_info::StreamInfo;
use crate::tracer::{Decision, Span, Tracer, TracingConfig};

pub(crate) type Log = Arc<Mutex<Vec<String>>>;

pub(crate) fn text_config() -> FilterConfig {
    FilterConfig::new(
        "test",
        Arc::new(TextCodecFactory),
        Arc::new(RouteTable::new("test")),
    )
}

/// One connection wired to a buffered socket and a simulated clock
pub(crate) struct Harness {
    pub time: Rc<SimulatedTimeSource>,
    pub dispatcher: Rc<Dispatcher>,
    pub connection: Rc<BufferedConnection>,
    pub drain: Arc<DrainManager>,
    pub proxy: Rc<ProxyFilter>,
}

impl Harness {
    pub fn new(config: FilterConfig) -> Self {
        Self::with_runtime(config, Arc::new(SnapshotRuntime::new()))
    }

    pub fn with_runtime(config: FilterConfig, runtime: Arc<dyn Runtime>) -> Self {
        let time = Rc::new(SimulatedTimeSource::new());
        let dispatcher = Dispatcher::new(time.clone());
        let connection = Rc::new(BufferedConnection::new());
        let drain = Arc::new(DrainManager::new());
        let proxy = ProxyFilter::new(
            Arc::new(config),
            runtime,
            dispatcher.clone(),
            connection.clone(),
            drain.clone(),
        );
        Self {
            time,
            dispatcher,
            connection,
            drain,
            proxy,
        }
    }

    pub fn feed(&self, data: &str) {
        let mut buffer = BytesMut::from(data.as_bytes());
        self.proxy.on_data(&mut buffer, false);
    }

    pub fn run(&self) {
        self.dispatcher.run_until_idle();
    }

    pub fn output(&self) -> String {
        String::from_utf8(self.connection.take_output().to_vec()).unwrap()
    }

    pub fn stream(&self, index: usize) -> Rc<ActiveStream> {
        self.proxy.active_streams()[index].clone()
    }
}

#[derive(Clone, Copy)]
pub(crate) enum Registration {
    Decoder,
    Encoder,
    Dual,
}

/// Records every callback and answers with fixed statuses
pub(crate) struct ScriptedFilter {
    name: String,
    decode: FilterStatus,
    encode: FilterStatus,
    log: Log,
}

impl DecoderFilter for ScriptedFilter {
    fn on_stream_decoded(&mut self, _request: &mut dyn Request) -> FilterStatus {
        self.log.lock().push(format!("decode:{}", self.name));
        self.decode
    }

    fn on_destroy(&mut self) {
        self.log.lock().push(format!("destroy:{}", self.name));
    }
}

impl EncoderFilter for ScriptedFilter {
    fn on_stream_encoded(&mut self, _response: &mut dyn Response) -> FilterStatus {
        self.log.lock().push(format!("encode:{}", self.name));
        self.encode
    }

    fn on_destroy(&mut self) {
        self.log.lock().push(format!("encoder_destroy:{}", self.name));
    }
}

#[derive(Default)]
pub(crate) struct ScriptedFactory {
    filters: Vec<(String, Registration, FilterStatus, FilterStatus)>,
    pub log: Log,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(
        mut self,
        name: &str,
        registration: Registration,
        decode: FilterStatus,
        encode: FilterStatus,
    ) -> Self {
        self.filters
            .push((name.to_string(), registration, decode, encode));
        self
    }

    pub fn entries(&self) -> Vec<String> {
        self.log.lock().clone()
    }
}

impl FilterChainFactory for ScriptedFactory {
    fn create_filter_chain(&self, chain: &mut FilterChain) {
        for (name, registration, decode, encode) in &self.filters {
            let filter = ScriptedFilter {
                name: name.clone(),
                decode: *decode,
                encode: *encode,
                log: self.log.clone(),
            };
            match registration {
                Registration::Decoder => chain.add_decoder_filter(filter),
                Registration::Encoder => chain.add_encoder_filter(filter),
                Registration::Dual => chain.add_filter(filter),
            }
        }
    }
}

/// Tracer that counts started and finished spans
#[derive(Default)]
pub(crate) struct RecordingTracer {
    pub started: AtomicUsize,
    pub traced: AtomicUsize,
    pub finished: Arc<AtomicUsize>,
    pub tags: Log,
}

struct RecordingSpan {
    finished: Arc<AtomicUsize>,
    tags: Log,
}

impl Span for RecordingSpan {
    fn set_tag(&mut self, name: &str, value: &str) {
        self.tags.lock().push(format!("{}={}", name, value));
    }

    fn log(&mut self, _event: &str) {}

    fn finish_span(&mut self) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

impl Tracer for RecordingTracer {
    fn start_span(
        &self,
        _config: &TracingConfig,
        _request: &dyn Request,
        _stream_info: &StreamInfo,
        decision: Decision,
    ) -> Box<dyn Span> {
        self.started.fetch_add(1, Ordering::SeqCst);
        if decision.traced {
            self.traced.fetch_add(1, Ordering::SeqCst);
        }
        Box::new(RecordingSpan {
            finished: self.finished.clone(),
            tags: self.tags.clone(),
        })
    }
}
