//! Downstream connection surface and drain control

use bytes::BytesMut;
use std::cell::{Cell, RefCell};
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    /// Flush pending writes, then close
    FlushWrite,
    /// Drop pending writes and close immediately
    NoFlush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    RemoteClose,
    LocalClose,
    Connected,
    ConnectedZeroRtt,
}

/// The downstream half of a proxied connection
pub trait DownstreamConnection {
    /// Queue `data` for writing, leaving `data` empty
    fn write(&self, data: &mut BytesMut, end_stream: bool);
    fn close(&self, close_type: CloseType);
    fn state(&self) -> ConnectionState;
}

/// Connection that buffers writes for a socket driver to flush
#[derive(Debug)]
pub struct BufferedConnection {
    output: RefCell<BytesMut>,
    state: Cell<ConnectionState>,
    close_type: Cell<Option<CloseType>>,
    bytes_written: Cell<u64>,
}

impl BufferedConnection {
    pub fn new() -> Self {
        Self {
            output: RefCell::new(BytesMut::new()),
            state: Cell::new(ConnectionState::Open),
            close_type: Cell::new(None),
            bytes_written: Cell::new(0),
        }
    }

    /// Take everything queued since the last call
    pub fn take_output(&self) -> BytesMut {
        self.output.borrow_mut().split()
    }

    pub fn has_output(&self) -> bool {
        !self.output.borrow().is_empty()
    }

    /// How the connection was closed, if it was
    pub fn close_type(&self) -> Option<CloseType> {
        self.close_type.get()
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.get()
    }
}

impl Default for BufferedConnection {
    fn default() -> Self {
        Self::new()
    }
}

impl DownstreamConnection for BufferedConnection {
    fn write(&self, data: &mut BytesMut, end_stream: bool) {
        if self.state.get() != ConnectionState::Open {
            warn!(bytes = data.len(), "Dropping write on closed connection");
            data.clear();
            return;
        }
        self.bytes_written
            .set(self.bytes_written.get() + data.len() as u64);
        self.output.borrow_mut().unsplit(data.split());
        if end_stream {
            self.close(CloseType::FlushWrite);
        }
    }

    fn close(&self, close_type: CloseType) {
        if self.state.get() == ConnectionState::Closed {
            return;
        }
        debug!(?close_type, "Closing downstream connection");
        if close_type == CloseType::NoFlush {
            self.output.borrow_mut().clear();
        }
        self.close_type.set(Some(close_type));
        self.state.set(ConnectionState::Closed);
    }

    fn state(&self) -> ConnectionState {
        self.state.get()
    }
}

/// Whether connections should close once they go idle
pub trait DrainDecision: Send + Sync {
    fn drain_close(&self) -> bool;
}

/// Process-wide drain switch flipped at shutdown
#[derive(Debug, Default)]
pub struct DrainManager {
    draining: AtomicBool,
}

impl DrainManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_draining(&self) {
        if !self.draining.swap(true, Ordering::SeqCst) {
            info!("Draining listeners");
        }
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }
}

impl DrainDecision for DrainManager {
    fn drain_close(&self) -> bool {
        self.is_draining()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffered_write_and_take() {
        let connection = BufferedConnection::new();
        let mut data = BytesMut::from(&b"ok \"\"\n"[..]);

        connection.write(&mut data, false);
        assert!(data.is_empty());
        assert!(connection.has_output());
        assert_eq!(&connection.take_output()[..], b"ok \"\"\n");
        assert!(!connection.has_output());
        assert_eq!(connection.bytes_written(), 6);
    }

    #[test]
    fn test_end_stream_closes_with_flush() {
        let connection = BufferedConnection::new();
        let mut data = BytesMut::from(&b"bye\n"[..]);

        connection.write(&mut data, true);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(connection.close_type(), Some(CloseType::FlushWrite));
        assert_eq!(&connection.take_output()[..], b"bye\n");
    }

    #[test]
    fn test_no_flush_close_discards_output() {
        let connection = BufferedConnection::new();
        connection.write(&mut BytesMut::from(&b"pending"[..]), false);
        connection.close(CloseType::NoFlush);

        assert!(!connection.has_output());
        connection.write(&mut BytesMut::from(&b"late"[..]), false);
        assert!(!connection.has_output());
    }

    #[test]
    fn test_drain_manager() {
        let drain = DrainManager::new();
        assert!(!drain.drain_close());
        drain.start_draining();
        assert!(drain.drain_close());
    }
}
