//! Outbound response sinks.
//!
//! A [`ResponseSink`] receives the status, content type and body chunks of a
//! render. The HTTP server provides a streaming implementation;
//! [`BufferedSink`] collects everything in memory.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use ssr_bridge_common::SinkError;

/// Destination of a rendered response.
///
/// Writes are issued in order, and each write is followed by a flush before
/// the next chunk is read from the runtime.
#[async_trait]
pub trait ResponseSink: Send {
    /// Set the response status.
    fn set_status(&mut self, status: u16);

    /// Set the response content type.
    fn set_content_type(&mut self, content_type: &str);

    /// Write one body chunk.
    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError>;

    /// Flush written data to the client.
    async fn flush(&mut self) -> Result<(), SinkError>;
}

/// Captured output of a [`BufferedSink`].
#[derive(Debug, Clone, Default)]
pub struct Captured {
    /// Status, if set.
    pub status: Option<u16>,
    /// Content type, if set.
    pub content_type: Option<String>,
    /// Concatenated body.
    pub body: Vec<u8>,
    /// Number of `write` calls.
    pub writes: usize,
    /// Number of `flush` calls.
    pub flushes: usize,
}

/// In-memory sink.
///
/// Clones share the same captured state, so a clone kept by the caller can
/// inspect what a render wrote after the sink itself was moved away.
#[derive(Debug, Clone, Default)]
pub struct BufferedSink {
    captured: Arc<Mutex<Captured>>,
}

impl BufferedSink {
    /// Create an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything written so far.
    pub fn captured(&self) -> Captured {
        self.captured.lock().clone()
    }

    /// Body as (lossy) UTF-8.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.captured.lock().body).into_owned()
    }
}

#[async_trait]
impl ResponseSink for BufferedSink {
    fn set_status(&mut self, status: u16) {
        self.captured.lock().status = Some(status);
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.captured.lock().content_type = Some(content_type.to_string());
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        let mut captured = self.captured.lock();
        captured.body.extend_from_slice(chunk);
        captured.writes += 1;
        Ok(())
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        self.captured.lock().flushes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_buffered_sink_collects() {
        let sink = BufferedSink::new();
        let observer = sink.clone();
        let mut sink = sink;

        sink.set_status(201);
        sink.set_content_type("text/plain");
        sink.write(b"He").await.unwrap();
        sink.write(b"llo").await.unwrap();
        sink.flush().await.unwrap();

        let captured = observer.captured();
        assert_eq!(captured.status, Some(201));
        assert_eq!(captured.content_type.as_deref(), Some("text/plain"));
        assert_eq!(captured.writes, 2);
        assert_eq!(captured.flushes, 1);
        assert_eq!(observer.body_text(), "Hello");
    }

    #[test]
    fn test_buffered_sink_empty_write() {
        let mut sink = BufferedSink::new();
        tokio_test::block_on(sink.write(b"")).unwrap();

        let captured = sink.captured();
        assert_eq!(captured.status, None);
        assert_eq!(captured.writes, 1);
        assert!(captured.body.is_empty());
    }
}
