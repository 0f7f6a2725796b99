//! Text rendering of routed calls
//!
//! Requests go upstream as `<service> <method> seq=<id> [key=value ...]\n`.
//! Upstream answers with a text response line, optionally carrying
//! `type=reply|exception|call|oneway`, `draining=true` and the echoed `seq`.
//! Framed transports wrap each line in a length-prefixed frame.

use crate::protocol::{MessageMetadata, MessageType, Protocol, Transport, TransportType};
use crate::upstream_request::{ResponseStatus, UpstreamResponseCallbacks};
use bytes::{Buf, BufMut, BytesMut};
use proxy::codec::text::{TextResponse, MAX_LINE_LENGTH};
use proxy::{Response, StreamBase};
use tracing::{debug, trace};

pub const SEQUENCE_ID_KEY: &str = "seq";
pub const MESSAGE_TYPE_KEY: &str = "type";
pub const DRAINING_KEY: &str = "draining";

const FRAME_HEADER_SIZE: usize = 4;

/// Request captured from the downstream stream, rendered once a sequence id is known
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestLine {
    service: String,
    method: String,
    properties: Vec<(String, String)>,
}

impl RequestLine {
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
            properties: Vec::new(),
        }
    }

    pub fn with_property(mut self, key: &str, value: &str) -> Self {
        self.push_property(key, value);
        self
    }

    pub fn push_property(&mut self, key: &str, value: &str) {
        self.properties.push((key.to_string(), value.to_string()));
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Write the line for `metadata`, terminator included
    pub fn encode(&self, metadata: &MessageMetadata, buffer: &mut BytesMut) {
        buffer.put_slice(self.service.as_bytes());
        buffer.put_u8(b' ');
        buffer.put_slice(self.method.as_bytes());
        if let Some(id) = metadata.sequence_id() {
            buffer.put_slice(format!(" {SEQUENCE_ID_KEY}={id}").as_bytes());
        }
        for (key, value) in &self.properties {
            if key == SEQUENCE_ID_KEY {
                continue;
            }
            buffer.put_slice(format!(" {key}={value}").as_bytes());
        }
        buffer.put_u8(b'\n');
    }
}

/// Decodes one upstream response into a downstream [`TextResponse`]
pub struct TextConverter {
    transport: TransportType,
    buffer: BytesMut,
    metadata: MessageMetadata,
    success: bool,
    response: Option<TextResponse>,
    decode_error: Option<String>,
}

impl Default for TextConverter {
    fn default() -> Self {
        Self::new()
    }
}

impl TextConverter {
    pub fn new() -> Self {
        Self {
            transport: TransportType::Framed,
            buffer: BytesMut::new(),
            metadata: MessageMetadata::new(),
            success: false,
            response: None,
            decode_error: None,
        }
    }

    /// The decoded response, once
    pub fn take_response(&mut self) -> Option<TextResponse> {
        self.response.take()
    }

    /// Why the last response could not be decoded
    pub fn decode_error(&self) -> Option<&str> {
        self.decode_error.as_deref()
    }

    fn next_frame(&mut self) -> Result<Option<BytesMut>, String> {
        match self.transport {
            TransportType::Framed => {
                if self.buffer.len() < FRAME_HEADER_SIZE {
                    return Ok(None);
                }
                let mut header = &self.buffer[..FRAME_HEADER_SIZE];
                let len = header.get_u32() as usize;
                if len > MAX_LINE_LENGTH {
                    return Err(format!("frame of {len} bytes exceeds the maximum"));
                }
                if self.buffer.len() < FRAME_HEADER_SIZE + len {
                    return Ok(None);
                }
                self.buffer.advance(FRAME_HEADER_SIZE);
                Ok(Some(self.buffer.split_to(len)))
            }
            TransportType::Unframed => match self.buffer.iter().position(|&b| b == b'\n') {
                Some(end) => Ok(Some(self.buffer.split_to(end + 1))),
                None if self.buffer.len() > MAX_LINE_LENGTH => {
                    Err("response line exceeds the maximum length".to_string())
                }
                None => Ok(None),
            },
        }
    }

    fn decode(&mut self, frame: &[u8]) -> Result<(), String> {
        let line = std::str::from_utf8(frame).map_err(|_| "response is not valid UTF-8".to_string())?;
        let line = line.trim_end_matches(['\r', '\n']);
        let mut response =
            TextResponse::parse(line).ok_or_else(|| format!("malformed response line '{line}'"))?;

        let message_type = match response.get(MESSAGE_TYPE_KEY) {
            None | Some("reply") => MessageType::Reply,
            Some("exception") => MessageType::Exception,
            Some("call") => MessageType::Call,
            Some("oneway") => MessageType::Oneway,
            Some(other) => return Err(format!("unknown message type '{other}'")),
        };
        self.metadata.set_message_type(message_type);
        self.metadata
            .set_draining(response.get(DRAINING_KEY) == Some("true"));
        if let Some(id) = response.get(SEQUENCE_ID_KEY).and_then(|id| id.parse().ok()) {
            self.metadata.set_sequence_id(id);
        }
        for key in [MESSAGE_TYPE_KEY, DRAINING_KEY, SEQUENCE_ID_KEY] {
            response.erase(key);
        }

        self.success = response.status().is_ok();
        self.response = Some(response);
        Ok(())
    }
}

impl UpstreamResponseCallbacks for TextConverter {
    fn start_upstream_response(&mut self, transport: &dyn Transport, protocol: &dyn Protocol) {
        trace!(transport = transport.name(), protocol = protocol.name(), "Decoding upstream response");
        self.transport = transport.transport_type();
        self.buffer.clear();
        self.metadata = MessageMetadata::new();
        self.metadata.set_protocol(protocol.protocol_type());
        self.success = false;
        self.response = None;
        self.decode_error = None;
    }

    fn upstream_data(&mut self, data: &mut BytesMut) -> ResponseStatus {
        self.buffer.extend_from_slice(&data.split());

        let result = self
            .next_frame()
            .and_then(|frame| frame.map(|frame| self.decode(&frame)).transpose());
        match result {
            Ok(Some(())) => ResponseStatus::Complete,
            Ok(None) => ResponseStatus::MoreData,
            Err(error) => {
                debug!(error = %error, "Upstream response decoding failed");
                self.buffer.clear();
                self.decode_error = Some(error);
                ResponseStatus::Reset
            }
        }
    }

    fn response_metadata(&self) -> &MessageMetadata {
        &self.metadata
    }

    fn response_success(&self) -> bool {
        self.success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BinaryProtocol, FramedTransport, UnframedTransport};
    use proxy::StatusCode;

    fn framed(line: &str) -> BytesMut {
        let mut data = BytesMut::new();
        data.put_u32(line.len() as u32);
        data.put_slice(line.as_bytes());
        data
    }

    #[test]
    fn test_request_line_carries_sequence_id() {
        let line = RequestLine::new("users", "get")
            .with_property("id", "7")
            .with_property("seq", "99");
        let mut metadata = MessageMetadata::new();
        metadata.set_sequence_id(3);

        let mut buffer = BytesMut::new();
        line.encode(&metadata, &mut buffer);
        assert_eq!(&buffer[..], b"users get seq=3 id=7\n");
        assert_eq!(line.get("id"), Some("7"));
    }

    #[test]
    fn test_framed_reply_across_reads() {
        let mut converter = TextConverter::new();
        converter.start_upstream_response(&FramedTransport, &BinaryProtocol);

        let mut data = framed("ok \"alice\" seq=0 role=admin\n");
        let mut tail = data.split_off(9);
        assert_eq!(converter.upstream_data(&mut data), ResponseStatus::MoreData);
        assert_eq!(converter.upstream_data(&mut tail), ResponseStatus::Complete);

        assert_eq!(converter.response_metadata().message_type(), Some(MessageType::Reply));
        assert_eq!(converter.response_metadata().sequence_id(), Some(0));
        assert!(converter.response_success());
        let response = converter.take_response().unwrap();
        assert_eq!(response.status().message(), "alice");
        assert_eq!(response.get("role"), Some("admin"));
        assert_eq!(response.get("seq"), None);
    }

    #[test]
    fn test_unframed_exception_with_draining() {
        let mut converter = TextConverter::new();
        converter.start_upstream_response(&UnframedTransport, &BinaryProtocol);

        let mut data = BytesMut::from(&b"internal \"boom\" type=exception draining=true\n"[..]);
        assert_eq!(converter.upstream_data(&mut data), ResponseStatus::Complete);

        let metadata = converter.response_metadata();
        assert_eq!(metadata.message_type(), Some(MessageType::Exception));
        assert!(metadata.is_draining());
        assert!(!converter.response_success());
        let response = converter.take_response().unwrap();
        assert_eq!(response.status().code(), StatusCode::Internal);
        assert_eq!(response.get("type"), None);
    }

    #[test]
    fn test_malformed_response_resets() {
        let mut converter = TextConverter::new();
        converter.start_upstream_response(&UnframedTransport, &BinaryProtocol);

        let mut data = BytesMut::from(&b"garbage\n"[..]);
        assert_eq!(converter.upstream_data(&mut data), ResponseStatus::Reset);
        assert!(converter.decode_error().unwrap().contains("malformed"));
        assert!(converter.take_response().is_none());

        converter.start_upstream_response(&UnframedTransport, &BinaryProtocol);
        let mut data = BytesMut::from(&b"ok \"\" type=notify\n"[..]);
        assert_eq!(converter.upstream_data(&mut data), ResponseStatus::Reset);
        assert!(converter.decode_error().unwrap().contains("notify"));
    }

    #[test]
    fn test_oversized_frame_resets() {
        let mut converter = TextConverter::new();
        converter.start_upstream_response(&FramedTransport, &BinaryProtocol);

        let mut data = BytesMut::new();
        data.put_u32((MAX_LINE_LENGTH + 1) as u32);
        assert_eq!(converter.upstream_data(&mut data), ResponseStatus::Reset);
    }
}
