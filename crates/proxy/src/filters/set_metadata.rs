//! Sets configured key/values on requests and responses

use config::FilterEntry;
use std::sync::Arc;

use crate::codec::{Request, Response};
use crate::filter::{DecoderFilter, EncoderFilter, FilterChain, FilterChainFactory, FilterStatus};

pub const FILTER_NAME: &str = "set_metadata";

type Values = Arc<Vec<(String, String)>>;

pub struct SetRequestMetadataFilter {
    values: Values,
}

impl DecoderFilter for SetRequestMetadataFilter {
    fn on_stream_decoded(&mut self, request: &mut dyn Request) -> FilterStatus {
        for (key, value) in self.values.iter() {
            request.set(key, value);
        }
        FilterStatus::Continue
    }
}

pub struct SetResponseMetadataFilter {
    values: Values,
}

impl EncoderFilter for SetResponseMetadataFilter {
    fn on_stream_encoded(&mut self, response: &mut dyn Response) -> FilterStatus {
        for (key, value) in self.values.iter() {
            response.set(key, value);
        }
        FilterStatus::Continue
    }
}

/// Registers a request filter and a response filter, each only when it has
/// something to set
pub struct SetMetadataFactory {
    request: Values,
    response: Values,
}

impl SetMetadataFactory {
    pub fn new(request: Vec<(String, String)>, response: Vec<(String, String)>) -> Self {
        Self {
            request: Arc::new(request),
            response: Arc::new(response),
        }
    }

    /// Settings: `request` and `response` tables of string values
    pub fn from_config(entry: &FilterEntry) -> Self {
        let mut request: Vec<_> = entry.get_string_map("request").into_iter().collect();
        let mut response: Vec<_> = entry.get_string_map("response").into_iter().collect();
        request.sort();
        response.sort();
        Self::new(request, response)
    }
}

impl FilterChainFactory for SetMetadataFactory {
    fn create_filter_chain(&self, chain: &mut FilterChain) {
        if !self.request.is_empty() {
            chain.add_decoder_filter(SetRequestMetadataFilter {
                values: self.request.clone(),
            });
        }
        if !self.response.is_empty() {
            chain.add_encoder_filter(SetResponseMetadataFilter {
                values: self.response.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::text::{TextRequest, TextResponse};
    use crate::codec::{Status, StreamBase};

    #[test]
    fn test_sets_request_and_response_values() {
        let values: Values = Arc::new(vec![("lane".to_string(), "canary".to_string())]);

        let mut request = TextRequest::new("users", "get");
        let status = SetRequestMetadataFilter {
            values: values.clone(),
        }
        .on_stream_decoded(&mut request);
        assert_eq!(status, FilterStatus::Continue);
        assert_eq!(request.get("lane"), Some("canary"));

        let mut response = TextResponse::new(Status::ok());
        SetResponseMetadataFilter { values }.on_stream_encoded(&mut response);
        assert_eq!(response.get("lane"), Some("canary"));
    }

    #[test]
    fn test_factory_skips_empty_sides() {
        let factory = SetMetadataFactory::new(vec![("a".to_string(), "1".to_string())], vec![]);
        let mut chain = FilterChain::new();
        factory.create_filter_chain(&mut chain);
        assert_eq!(chain.decoder_filter_count(), 1);
        assert_eq!(chain.encoder_filter_count(), 0);
    }

    #[test]
    fn test_factory_from_config() {
        let entry: FilterEntry = config::toml::from_str(
            r#"
            name = "set_metadata"
            [config.request]
            lane = "canary"
            [config.response]
            served_by = "conduit"
            "#,
        )
        .unwrap();
        let factory = SetMetadataFactory::from_config(&entry);
        let mut chain = FilterChain::new();
        factory.create_filter_chain(&mut chain);
        assert_eq!(chain.decoder_filter_count(), 1);
        assert_eq!(chain.encoder_filter_count(), 1);
    }
}
