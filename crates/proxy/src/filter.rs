//! Stream filters and the chain they are registered into
//!
//! Decoder filters run in registration order as a request is decoded;
//! encoder filters run in reverse registration order on the way back. A
//! filter returning [`FilterStatus::StopIteration`] suspends the chain until
//! it calls `continue_decoding`/`continue_encoding` on its [`StreamHandle`].

use std::cell::RefCell;
use std::rc::Rc;

use crate::codec::{Request, Response};
use crate::stream::StreamHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterStatus {
    Continue,
    StopIteration,
}

pub trait DecoderFilter {
    fn set_decoder_callbacks(&mut self, _callbacks: StreamHandle) {}

    fn on_stream_decoded(&mut self, request: &mut dyn Request) -> FilterStatus;

    /// Called once when the stream completes. Filters registered in both
    /// directions are destroyed through this side only.
    fn on_destroy(&mut self) {}
}

pub trait EncoderFilter {
    fn set_encoder_callbacks(&mut self, _callbacks: StreamHandle) {}

    fn on_stream_encoded(&mut self, response: &mut dyn Response) -> FilterStatus;

    fn on_destroy(&mut self) {}
}

pub(crate) struct DecoderFilterEntry {
    pub(crate) filter: Rc<RefCell<dyn DecoderFilter>>,
    pub(crate) dual: bool,
}

pub(crate) struct EncoderFilterEntry {
    pub(crate) filter: Rc<RefCell<dyn EncoderFilter>>,
    pub(crate) dual: bool,
}

/// Filters collected for one stream
#[derive(Default)]
pub struct FilterChain {
    pub(crate) decoder_filters: Vec<DecoderFilterEntry>,
    pub(crate) encoder_filters: Vec<EncoderFilterEntry>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_decoder_filter<F>(&mut self, filter: F)
    where
        F: DecoderFilter + 'static,
    {
        self.decoder_filters.push(DecoderFilterEntry {
            filter: Rc::new(RefCell::new(filter)),
            dual: false,
        });
    }

    pub fn add_encoder_filter<F>(&mut self, filter: F)
    where
        F: EncoderFilter + 'static,
    {
        self.encoder_filters.push(EncoderFilterEntry {
            filter: Rc::new(RefCell::new(filter)),
            dual: false,
        });
    }

    /// Register one instance in both directions
    pub fn add_filter<F>(&mut self, filter: F)
    where
        F: DecoderFilter + EncoderFilter + 'static,
    {
        let filter = Rc::new(RefCell::new(filter));
        self.decoder_filters.push(DecoderFilterEntry {
            filter: filter.clone(),
            dual: true,
        });
        self.encoder_filters.push(EncoderFilterEntry { filter, dual: true });
    }

    pub fn decoder_filter_count(&self) -> usize {
        self.decoder_filters.len()
    }

    pub fn encoder_filter_count(&self) -> usize {
        self.encoder_filters.len()
    }
}

/// Populates the filter chain of every new stream
pub trait FilterChainFactory: Send + Sync {
    fn create_filter_chain(&self, chain: &mut FilterChain);
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Passthrough;

    impl DecoderFilter for Passthrough {
        fn on_stream_decoded(&mut self, _request: &mut dyn Request) -> FilterStatus {
            FilterStatus::Continue
        }
    }

    impl EncoderFilter for Passthrough {
        fn on_stream_encoded(&mut self, _response: &mut dyn Response) -> FilterStatus {
            FilterStatus::Continue
        }
    }

    #[test]
    fn test_dual_registration_shares_instance() {
        let mut chain = FilterChain::new();
        chain.add_filter(Passthrough);
        chain.add_decoder_filter(Passthrough);

        assert_eq!(chain.decoder_filter_count(), 2);
        assert_eq!(chain.encoder_filter_count(), 1);
        assert!(chain.decoder_filters[0].dual);
        assert!(!chain.decoder_filters[1].dual);
        assert!(chain.encoder_filters[0].dual);
        assert_eq!(Rc::strong_count(&chain.encoder_filters[0].filter), 2);
    }
}
