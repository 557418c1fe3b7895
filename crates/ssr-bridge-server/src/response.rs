//! HTTP response conversion for rendering.
//!
//! This module provides:
//! - [`BridgeHttpResponse`]: fully buffered responses (errors, health)
//! - [`StreamingSink`]: the [`ResponseSink`] that streams a render into an
//!   axum [`Body`] as it is produced
//! - [`GuardedStream`]: the body stream, cancelling its render when dropped

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderName, HeaderValue, Response, StatusCode};
use bytes::Bytes;
use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::DropGuard;

use ssr_bridge_common::{BridgeError, SinkError};
use ssr_bridge_core::ResponseSink;

/// Status for a render whose client went away before the head was sent.
pub const CLIENT_CLOSED_REQUEST: u16 = 499;

/// Buffered HTTP response.
#[derive(Debug, Clone)]
pub struct BridgeHttpResponse {
    /// HTTP status code
    pub status: u16,
    /// Response headers as key-value pairs
    pub headers: Vec<(String, String)>,
    /// Response body
    pub body: Vec<u8>,
}

impl BridgeHttpResponse {
    /// Create a simple text response.
    pub fn text(status: u16, body: &str) -> Self {
        Self {
            status,
            headers: vec![(
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string(),
            )],
            body: body.as_bytes().to_vec(),
        }
    }

    /// Create a JSON response.
    pub fn json(status: u16, body: &serde_json::Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: body.to_string().into_bytes(),
        }
    }

    /// Create an error response with JSON body.
    pub fn error(status: u16, kind: &str, message: &str) -> Self {
        Self::json(
            status,
            &serde_json::json!({
                "error": {
                    "kind": kind,
                    "message": message,
                }
            }),
        )
    }

    /// Create an error response for a failed render.
    pub fn from_error(error: &BridgeError) -> Self {
        Self::error(status_for(error), &error.kind().to_string(), &error.to_string())
    }

    /// Add a header to the response.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Convert to Axum response.
    pub fn into_axum_response(self) -> Response<Body> {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        for (name, value) in &self.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                response.headers_mut().append(name, value);
            }
        }
        response
    }
}

/// HTTP status for a render error.
pub fn status_for(error: &BridgeError) -> u16 {
    match error {
        BridgeError::ProtocolViolation { .. } => 502,
        BridgeError::Disposed | BridgeError::WorkerTerminated => 503,
        _ => 500,
    }
}

/// Status line and content type of a streamed response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    /// Response status.
    pub status: u16,
    /// Response content type.
    pub content_type: String,
}

type Chunk = Result<Bytes, io::Error>;

/// Receiving half of a [`StreamingSink`].
pub struct StreamingParts {
    /// Resolves once the sink sends the head. Fails if the sink is dropped
    /// first.
    pub head: oneshot::Receiver<ResponseHead>,
    /// Body chunks.
    pub body: mpsc::Receiver<Chunk>,
    /// Extra sender used to abort the body after the head went out.
    pub abort: mpsc::Sender<Chunk>,
}

/// Streams a render into an HTTP response.
///
/// The head is sent on the first write or flush after a status was set. A
/// flush before any status (an early failure) sends nothing, so the caller
/// can still answer with an error response. Chunks pass through a channel of
/// capacity one; `flush` returns once the previous chunk was taken by the
/// HTTP body.
pub struct StreamingSink {
    head: Option<oneshot::Sender<ResponseHead>>,
    status: Option<u16>,
    content_type: String,
    body: mpsc::Sender<Chunk>,
}

impl StreamingSink {
    /// Create a sink and its receiving half.
    pub fn new() -> (Self, StreamingParts) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(1);

        let sink = Self {
            head: Some(head_tx),
            status: None,
            content_type: String::new(),
            body: body_tx.clone(),
        };
        let parts = StreamingParts {
            head: head_rx,
            body: body_rx,
            abort: body_tx,
        };
        (sink, parts)
    }

    fn send_head(&mut self) -> Result<(), SinkError> {
        let Some(status) = self.status else {
            return Ok(());
        };
        if let Some(head) = self.head.take() {
            head.send(ResponseHead {
                status,
                content_type: std::mem::take(&mut self.content_type),
            })
            .map_err(|_| SinkError::Closed)?;
        }
        Ok(())
    }
}

#[async_trait]
impl ResponseSink for StreamingSink {
    fn set_status(&mut self, status: u16) {
        self.status = Some(status);
    }

    fn set_content_type(&mut self, content_type: &str) {
        self.content_type = content_type.to_string();
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<(), SinkError> {
        self.send_head()?;
        self.body
            .send(Ok(Bytes::copy_from_slice(chunk)))
            .await
            .map_err(|_| SinkError::Closed)
    }

    async fn flush(&mut self) -> Result<(), SinkError> {
        if self.status.is_none() {
            return Ok(());
        }
        self.send_head()?;
        let _permit = self.body.reserve().await.map_err(|_| SinkError::Closed)?;
        Ok(())
    }
}

/// Response body stream that cancels its render when dropped.
///
/// Hyper drops the body when the client disconnects, which trips the guard.
pub struct GuardedStream {
    inner: ReceiverStream<Chunk>,
    _guard: DropGuard,
}

impl GuardedStream {
    /// Wrap a body receiver.
    pub fn new(body: mpsc::Receiver<Chunk>, guard: DropGuard) -> Self {
        Self {
            inner: ReceiverStream::new(body),
            _guard: guard,
        }
    }
}

impl Stream for GuardedStream {
    type Item = Chunk;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

/// Build the streaming response for a received head.
pub fn streaming_response(head: &ResponseHead, request_id: &str, body: GuardedStream) -> Response<Body> {
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() =
        StatusCode::from_u16(head.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::try_from(head.content_type.as_str()) {
        headers.insert(CONTENT_TYPE, value);
    }
    if let Ok(value) = HeaderValue::try_from(request_id) {
        headers.insert(crate::request::REQUEST_ID, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn test_text_response() {
        let resp = BridgeHttpResponse::text(200, "OK");
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, b"OK");
        assert_eq!(
            resp.headers[0],
            (
                "content-type".to_string(),
                "text/plain; charset=utf-8".to_string()
            )
        );
    }

    #[test]
    fn test_error_response_status_mapping() {
        let cases = [
            (BridgeError::import_failure("./index.js", "missing"), 500),
            (BridgeError::invocation("boom"), 500),
            (BridgeError::protocol("bad shape"), 502),
            (BridgeError::stream("reset"), 500),
            (BridgeError::Disposed, 503),
            (BridgeError::WorkerTerminated, 503),
        ];

        for (error, status) in cases {
            let resp = BridgeHttpResponse::from_error(&error);
            assert_eq!(resp.status, status, "{error}");
            let body: serde_json::Value = serde_json::from_slice(&resp.body).unwrap();
            assert_eq!(body["error"]["kind"], error.kind().to_string());
        }
    }

    #[test]
    fn test_with_header() {
        let resp = BridgeHttpResponse::text(200, "OK").with_header("X-Request-Id", "123");

        assert_eq!(resp.headers.len(), 2);
        let axum_resp = resp.into_axum_response();
        assert_eq!(axum_resp.status(), StatusCode::OK);
        assert_eq!(axum_resp.headers()["x-request-id"], "123");
    }

    #[tokio::test]
    async fn test_flush_without_status_sends_no_head() {
        let (mut sink, mut parts) = StreamingSink::new();

        sink.flush().await.unwrap();
        drop(sink);

        assert!(parts.head.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_head_sent_on_first_write() {
        let (mut sink, mut parts) = StreamingSink::new();
        sink.set_status(201);
        sink.set_content_type("text/plain");

        sink.write(b"He").await.unwrap();

        let head = parts.head.try_recv().unwrap();
        assert_eq!(
            head,
            ResponseHead {
                status: 201,
                content_type: "text/plain".to_string()
            }
        );
        assert_eq!(parts.body.recv().await.unwrap().unwrap(), Bytes::from_static(b"He"));
    }

    #[tokio::test]
    async fn test_flush_waits_for_consumer() {
        let (mut sink, mut parts) = StreamingSink::new();
        sink.set_status(200);
        sink.write(b"chunk").await.unwrap();

        let mut flush = tokio_test::task::spawn(sink.flush());
        assert!(flush.poll().is_pending());

        parts.body.recv().await.unwrap().unwrap();
        assert!(flush.is_woken());
        assert!(matches!(flush.poll(), Poll::Ready(Ok(()))));
    }

    #[tokio::test]
    async fn test_write_after_client_gone() {
        let (mut sink, parts) = StreamingSink::new();
        sink.set_status(200);
        drop(parts);

        let err = sink.write(b"late").await.unwrap_err();
        assert_eq!(err, SinkError::Closed);
    }

    #[test]
    fn test_guarded_stream_cancels_on_drop() {
        let token = CancellationToken::new();
        let (_tx, rx) = mpsc::channel(1);

        let stream = GuardedStream::new(rx, token.clone().drop_guard());
        assert!(!token.is_cancelled());

        drop(stream);
        assert!(token.is_cancelled());
    }
}
