//! Upstream framing, message protocols and per-connection state

use bytes::{BufMut, BytesMut};
use config::{ProtocolKind, TransportKind};
use std::fmt;

/// Thrift message kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call,
    Reply,
    Exception,
    Oneway,
}

/// Framing transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    Framed,
    Unframed,
}

impl From<TransportKind> for TransportType {
    fn from(kind: TransportKind) -> Self {
        match kind {
            TransportKind::Framed => TransportType::Framed,
            TransportKind::Unframed => TransportType::Unframed,
        }
    }
}

/// Message protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolType {
    Binary,
    Compact,
}

impl From<ProtocolKind> for ProtocolType {
    fn from(kind: ProtocolKind) -> Self {
        match kind {
            ProtocolKind::Binary => ProtocolType::Binary,
            ProtocolKind::Compact => ProtocolType::Compact,
        }
    }
}

impl fmt::Display for ProtocolType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolType::Binary => f.write_str("binary"),
            ProtocolType::Compact => f.write_str("compact"),
        }
    }
}

/// Envelope fields of one message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageMetadata {
    method_name: Option<String>,
    sequence_id: Option<i32>,
    message_type: Option<MessageType>,
    protocol: Option<ProtocolType>,
    draining: bool,
}

impl MessageMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_method_name(mut self, name: impl Into<String>) -> Self {
        self.method_name = Some(name.into());
        self
    }

    pub fn with_message_type(mut self, message_type: MessageType) -> Self {
        self.message_type = Some(message_type);
        self
    }

    pub fn method_name(&self) -> Option<&str> {
        self.method_name.as_deref()
    }

    pub fn sequence_id(&self) -> Option<i32> {
        self.sequence_id
    }

    pub fn set_sequence_id(&mut self, id: i32) {
        self.sequence_id = Some(id);
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.message_type
    }

    pub fn set_message_type(&mut self, message_type: MessageType) {
        self.message_type = Some(message_type);
    }

    pub fn protocol(&self) -> Option<ProtocolType> {
        self.protocol
    }

    pub fn set_protocol(&mut self, protocol: ProtocolType) {
        self.protocol = Some(protocol);
    }

    /// Upstream asked the proxy to stop using this connection
    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn set_draining(&mut self, draining: bool) {
        self.draining = draining;
    }
}

/// State that lives as long as a pooled upstream connection
#[derive(Debug, Default)]
pub struct ThriftConnectionState {
    next_sequence_id: i32,
    upgrade_attempted: bool,
    upgraded: bool,
}

impl ThriftConnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sequence ids are unique per connection and wrap around
    pub fn next_sequence_id(&mut self) -> i32 {
        let id = self.next_sequence_id;
        self.next_sequence_id = self.next_sequence_id.wrapping_add(1);
        id
    }

    pub fn upgrade_attempted(&self) -> bool {
        self.upgrade_attempted
    }

    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    pub fn mark_upgrade_attempted(&mut self) {
        self.upgrade_attempted = true;
    }

    pub fn mark_upgraded(&mut self) {
        self.upgraded = true;
    }
}

/// Wraps an encoded message in the transport's frame
pub trait Transport {
    fn name(&self) -> &'static str;

    fn transport_type(&self) -> TransportType;

    /// Move `message` into `buffer` as one frame
    fn encode_frame(&self, buffer: &mut BytesMut, metadata: &MessageMetadata, message: &mut BytesMut);
}

/// Parser for the reply to a protocol upgrade request
pub trait UpgradeResponse {
    /// Consume bytes; true once the whole reply has been read
    fn on_data(&mut self, data: &mut BytesMut) -> bool;
}

/// Message protocol spoken to the upstream
pub trait Protocol {
    fn name(&self) -> &'static str;

    fn protocol_type(&self) -> ProtocolType;

    fn supports_upgrade(&self) -> bool {
        false
    }

    /// Write an upgrade request into `buffer` if this connection needs one
    fn attempt_upgrade(
        &self,
        _transport: &dyn Transport,
        _state: &mut ThriftConnectionState,
        _buffer: &mut BytesMut,
    ) -> Option<Box<dyn UpgradeResponse>> {
        None
    }

    fn complete_upgrade(&self, _state: &mut ThriftConnectionState, _response: &dyn UpgradeResponse) {}
}

/// 4-byte big-endian length prefix
#[derive(Debug, Default)]
pub struct FramedTransport;

impl Transport for FramedTransport {
    fn name(&self) -> &'static str {
        "framed"
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Framed
    }

    fn encode_frame(&self, buffer: &mut BytesMut, _metadata: &MessageMetadata, message: &mut BytesMut) {
        buffer.reserve(4 + message.len());
        buffer.put_u32(message.len() as u32);
        buffer.extend_from_slice(&message.split());
    }
}

#[derive(Debug, Default)]
pub struct UnframedTransport;

impl Transport for UnframedTransport {
    fn name(&self) -> &'static str {
        "unframed"
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Unframed
    }

    fn encode_frame(&self, buffer: &mut BytesMut, _metadata: &MessageMetadata, message: &mut BytesMut) {
        buffer.extend_from_slice(&message.split());
    }
}

#[derive(Debug, Default)]
pub struct BinaryProtocol;

impl Protocol for BinaryProtocol {
    fn name(&self) -> &'static str {
        "binary"
    }

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Binary
    }
}

#[derive(Debug, Default)]
pub struct CompactProtocol;

impl Protocol for CompactProtocol {
    fn name(&self) -> &'static str {
        "compact"
    }

    fn protocol_type(&self) -> ProtocolType {
        ProtocolType::Compact
    }
}

pub fn create_transport(transport_type: TransportType) -> Box<dyn Transport> {
    match transport_type {
        TransportType::Framed => Box::new(FramedTransport),
        TransportType::Unframed => Box::new(UnframedTransport),
    }
}

pub fn create_protocol(protocol_type: ProtocolType) -> Box<dyn Protocol> {
    match protocol_type {
        ProtocolType::Binary => Box::new(BinaryProtocol),
        ProtocolType::Compact => Box::new(CompactProtocol),
    }
}
