//! Answers requests whose route carries a direct response

use crate::codec::{Request, Status, StatusCode};
use crate::filter::{DecoderFilter, FilterChain, FilterChainFactory, FilterStatus};
use crate::stream::StreamHandle;

pub const FILTER_NAME: &str = "direct_response";

/// Replies from the route's configured status. Requests matching no route
/// get `not_found`; routes without a direct response pass through.
#[derive(Default)]
pub struct DirectResponseFilter {
    handle: Option<StreamHandle>,
}

impl DecoderFilter for DirectResponseFilter {
    fn set_decoder_callbacks(&mut self, callbacks: StreamHandle) {
        self.handle = Some(callbacks);
    }

    fn on_stream_decoded(&mut self, request: &mut dyn Request) -> FilterStatus {
        let Some(handle) = &self.handle else {
            return FilterStatus::Continue;
        };

        let status = match handle.route_entry() {
            Some(route) => match route.direct_response() {
                Some(status) => status.clone(),
                None => return FilterStatus::Continue,
            },
            None => Status::new(
                StatusCode::NotFound,
                format!("no route for {}.{}", request.host(), request.method()),
            ),
        };
        handle.send_local_reply(status, None);
        FilterStatus::StopIteration
    }
}

pub struct DirectResponseFactory;

impl FilterChainFactory for DirectResponseFactory {
    fn create_filter_chain(&self, chain: &mut FilterChain) {
        chain.add_decoder_filter(DirectResponseFilter::default());
    }
}
