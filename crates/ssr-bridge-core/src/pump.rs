//! Response pump: invoke the handler and drain its body into a sink.
//!
//! The pump runs on the runtime thread. It invokes the cached handler with
//! the adapted request, awaits the response, validates its shape, and then
//! reads the body stream chunk by chunk. Each chunk is copied into a rented
//! buffer inside the step that read it, written and flushed before the next
//! read is issued.

use std::rc::Rc;
use std::time::Instant;

use rquickjs::function::This;
use rquickjs::{ArrayBuffer, Coerced, Ctx, Exception, FromJs, Object, TypedArray, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use ssr_bridge_common::BridgeError;

use crate::buffer::{BufferPool, RentedBuffer};
use crate::engine::{Engine, REJECTED, bridge_fn, format_exception, method};
use crate::handles::{Handle, HandleScope};
use crate::request::{CANCEL_REASON, RequestAdapter, RequestContext};
use crate::sink::ResponseSink;

/// How a render ended, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    /// The body was drained to its end.
    Completed {
        /// Response status.
        status: u16,
        /// Chunks written to the sink.
        chunks: usize,
        /// Bytes written to the sink.
        bytes: usize,
    },
    /// The request was cancelled before the body ended.
    Cancelled {
        /// Chunks written before cancellation.
        chunks: usize,
        /// Bytes written before cancellation.
        bytes: usize,
    },
}

impl RenderOutcome {
    /// Returns `true` if the render was cancelled.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, RenderOutcome::Cancelled { .. })
    }
}

/// Validated shape of the handler's response.
#[derive(Debug)]
struct ResponseEnvelope {
    status: u16,
    content_type: String,
    body: Option<Handle>,
}

enum ChunkRead {
    Done,
    Chunk(RentedBuffer),
    Unsupported(String),
}

enum Drained {
    Finished,
    Cancelled,
}

#[derive(Default)]
struct Progress {
    chunks: usize,
    bytes: usize,
}

/// Invokes the render handler and streams its response.
pub struct ResponsePump {
    engine: Rc<Engine>,
    pool: BufferPool,
    default_content_type: String,
}

impl ResponsePump {
    /// Create a pump.
    pub fn new(engine: Rc<Engine>, pool: BufferPool, default_content_type: impl Into<String>) -> Self {
        Self {
            engine,
            pool,
            default_content_type: default_content_type.into(),
        }
    }

    /// Render `request` with `handler` into `sink`.
    ///
    /// The final flush runs on every path and every per-request handle is
    /// released before this returns. Cancellation is not an error.
    pub async fn run<S: ResponseSink + ?Sized>(
        &self,
        handler: Handle,
        request: &RequestContext,
        sink: &mut S,
    ) -> Result<RenderOutcome, BridgeError> {
        let start = Instant::now();
        let scope = self.engine.scope();
        let mut progress = Progress::default();

        let outcome = self
            .render(&scope, handler, request, sink, &mut progress)
            .await;
        let flushed = sink.flush().await;
        drop(scope);

        let outcome = match (outcome, flushed) {
            (Ok(RenderOutcome::Completed { .. }), Err(e)) => {
                Err(BridgeError::stream(format!("final flush: {e}")))
            }
            (outcome, Err(e)) => {
                debug!(error = %e, "Final flush failed");
                outcome
            }
            (outcome, Ok(())) => outcome,
        };

        let duration_ms = start.elapsed().as_millis();
        match &outcome {
            Ok(RenderOutcome::Completed {
                status,
                chunks,
                bytes,
            }) => info!(status, chunks, bytes, duration_ms, "Render completed"),
            Ok(RenderOutcome::Cancelled { chunks, bytes }) => {
                info!(chunks, bytes, duration_ms, "Render cancelled");
            }
            Err(e) => warn!(
                error = %e,
                kind = %e.kind(),
                chunks = progress.chunks,
                duration_ms,
                "Render failed"
            ),
        }
        outcome
    }

    async fn render<S: ResponseSink + ?Sized>(
        &self,
        scope: &HandleScope,
        handler: Handle,
        request: &RequestContext,
        sink: &mut S,
        progress: &mut Progress,
    ) -> Result<RenderOutcome, BridgeError> {
        let token = &request.cancellation;
        if token.is_cancelled() {
            return Ok(RenderOutcome::Cancelled {
                chunks: 0,
                bytes: 0,
            });
        }

        let (adapted, _link) = RequestAdapter::adapt(&self.engine, scope, request)?;

        let result = self
            .engine
            .step(|ctx| {
                let handler = self
                    .engine
                    .handles()
                    .get(ctx, handler)?
                    .into_function()
                    .ok_or_else(|| Exception::throw_type(ctx, "render handler is not a function"))?;
                let result: Value = handler.call((
                    scope.get(ctx, adapted.request)?,
                    scope.get(ctx, adapted.signal)?,
                ))?;
                Ok(scope.pin(ctx, result))
            })
            .map_err(|e| BridgeError::invocation(e.message))?;

        let settled = tokio::select! {
            biased;
            () = token.cancelled() => None,
            settled = self.engine.settle(scope, result) => Some(settled),
        };
        let response = match settled {
            None => {
                return Ok(RenderOutcome::Cancelled {
                    chunks: 0,
                    bytes: 0,
                });
            }
            Some(Err(_)) if token.is_cancelled() => {
                return Ok(RenderOutcome::Cancelled {
                    chunks: 0,
                    bytes: 0,
                });
            }
            Some(Err(e)) => return Err(BridgeError::invocation(e.message)),
            Some(Ok(response)) => response,
        };

        let envelope = self.interpret(scope, response)?;
        debug!(
            status = envelope.status,
            content_type = %envelope.content_type,
            has_body = envelope.body.is_some(),
            "Handler responded"
        );

        sink.set_status(envelope.status);
        sink.set_content_type(&envelope.content_type);

        let Some(body) = envelope.body else {
            return Ok(RenderOutcome::Completed {
                status: envelope.status,
                chunks: 0,
                bytes: 0,
            });
        };

        let reader = self
            .engine
            .step(|ctx| {
                let body = object(ctx, scope.get(ctx, body)?, "body")?;
                let get_reader = method(ctx, &body, "getReader")?;
                let reader: Value = get_reader.call((This(body.clone()),))?;
                Ok(scope.pin(ctx, reader))
            })
            .map_err(|e| BridgeError::stream(format!("getReader: {e}")))?;

        match self.drain(scope, reader, token, sink, progress).await {
            Ok(Drained::Finished) => Ok(RenderOutcome::Completed {
                status: envelope.status,
                chunks: progress.chunks,
                bytes: progress.bytes,
            }),
            Ok(Drained::Cancelled) => {
                self.cancel_reader(scope, reader, CANCEL_REASON);
                Ok(RenderOutcome::Cancelled {
                    chunks: progress.chunks,
                    bytes: progress.bytes,
                })
            }
            Err(err) => {
                self.cancel_reader(scope, reader, &err.to_string());
                Err(err)
            }
        }
    }

    fn interpret(
        &self,
        scope: &HandleScope,
        response: Handle,
    ) -> Result<ResponseEnvelope, BridgeError> {
        self.engine
            .step(|ctx| {
                let value = scope.get(ctx, response)?;
                let Some(response) = value.into_object() else {
                    return Ok(Err(BridgeError::protocol(
                        "handler result is not an object",
                    )));
                };

                let status: Value = response.get("status")?;
                let Some(status) = status_code(&status) else {
                    return Ok(Err(BridgeError::protocol(format!(
                        "status must be an integer between 100 and 999, got {}",
                        describe(&status)
                    ))));
                };

                let headers: Value = response.get("headers")?;
                let content_type = if headers.is_undefined() || headers.is_null() {
                    None
                } else {
                    let Some(headers) = headers.into_object() else {
                        return Ok(Err(BridgeError::protocol("headers is not an object")));
                    };
                    let get: Value = headers.get("get")?;
                    let value: Value = match get.into_function() {
                        Some(get) => get.call((This(headers.clone()), "content-type"))?,
                        None => plain_header(&headers, "content-type")?,
                    };
                    match value.as_string() {
                        Some(s) => Some(s.to_string()?),
                        None => None,
                    }
                };

                let body: Value = response.get("body")?;
                let body = if body.is_undefined() || body.is_null() {
                    None
                } else {
                    let readable = match body.as_object() {
                        Some(stream) => stream.get::<_, Value>("getReader")?.is_function(),
                        None => false,
                    };
                    if !readable {
                        return Ok(Err(BridgeError::protocol(
                            "body is not a readable stream",
                        )));
                    }
                    Some(scope.pin(ctx, body))
                };

                Ok(Ok(ResponseEnvelope {
                    status,
                    content_type: content_type
                        .filter(|ct| !ct.is_empty())
                        .unwrap_or_else(|| self.default_content_type.clone()),
                    body,
                }))
            })
            .map_err(|e| BridgeError::protocol(e.message))?
    }

    async fn drain<S: ResponseSink + ?Sized>(
        &self,
        scope: &HandleScope,
        reader: Handle,
        token: &CancellationToken,
        sink: &mut S,
        progress: &mut Progress,
    ) -> Result<Drained, BridgeError> {
        loop {
            if token.is_cancelled() {
                return Ok(Drained::Cancelled);
            }

            let read = self
                .engine
                .step(|ctx| {
                    let reader = object(ctx, scope.get(ctx, reader)?, "reader")?;
                    let read = method(ctx, &reader, "read")?;
                    let promise: Value = read.call((This(reader.clone()),))?;
                    Ok(scope.pin(ctx, promise))
                })
                .map_err(|e| BridgeError::stream(format!("read: {e}")))?;

            let settled = tokio::select! {
                biased;
                () = token.cancelled() => None,
                settled = self.engine.settle(scope, read) => Some(settled),
            };
            scope.release(read);
            let result = match settled {
                None => return Ok(Drained::Cancelled),
                Some(Err(_)) if token.is_cancelled() => return Ok(Drained::Cancelled),
                Some(Err(e)) => return Err(BridgeError::stream(e.message)),
                Some(Ok(result)) => result,
            };

            let buffer = self.pool.rent();
            let chunk = self
                .engine
                .step(|ctx| read_chunk(ctx, scope.get(ctx, result)?, buffer));
            scope.release(result);

            let buffer = match chunk.map_err(|e| BridgeError::stream(e.message))? {
                ChunkRead::Done => return Ok(Drained::Finished),
                ChunkRead::Unsupported(kind) => {
                    return Err(BridgeError::stream(format!(
                        "unsupported chunk type: {kind}"
                    )));
                }
                ChunkRead::Chunk(buffer) => buffer,
            };
            if buffer.is_empty() {
                continue;
            }

            tokio::select! {
                biased;
                () = token.cancelled() => return Ok(Drained::Cancelled),
                written = sink.write(&buffer) => {
                    written.map_err(|e| BridgeError::stream(format!("write: {e}")))?;
                }
            }
            progress.chunks += 1;
            progress.bytes += buffer.len();

            tokio::select! {
                biased;
                () = token.cancelled() => return Ok(Drained::Cancelled),
                flushed = sink.flush() => {
                    flushed.map_err(|e| BridgeError::stream(format!("flush: {e}")))?;
                }
            }
        }
    }

    /// Best-effort `reader.cancel(reason)`. Failures are logged, never returned.
    fn cancel_reader(&self, scope: &HandleScope, reader: Handle, reason: &str) {
        let cancelled = self
            .engine
            .step(|ctx| {
                let reader = object(ctx, scope.get(ctx, reader)?, "reader")?;
                let cancel = method(ctx, &reader, "cancel")?;
                let promise: Value = cancel.call((This(reader.clone()), reason))?;
                let cell: Value = bridge_fn(ctx, "track")?.call((promise,))?;
                Ok(scope.pin(ctx, cell))
            })
            .and_then(|cell| {
                self.engine.step(|ctx| {
                    let cell = object(ctx, scope.get(ctx, cell)?, "settle cell")?;
                    let state: i32 = cell.get("state")?;
                    if state == REJECTED {
                        Ok(Some(format_exception(ctx, cell.get("value")?)))
                    } else {
                        Ok(None)
                    }
                })
            });

        match cancelled {
            Ok(None) => debug!(reason, "Body stream cancelled"),
            Ok(Some(message)) => warn!(error = %message, "Body stream cancel rejected"),
            Err(e) => warn!(error = %e, "Body stream cancel threw"),
        }
    }
}

fn object<'js>(ctx: &Ctx<'js>, value: Value<'js>, what: &str) -> rquickjs::Result<Object<'js>> {
    value
        .into_object()
        .ok_or_else(|| Exception::throw_type(ctx, &format!("{what} is not an object")))
}

/// Copy one `read()` result into `buffer`.
fn read_chunk<'js>(
    ctx: &Ctx<'js>,
    result: Value<'js>,
    mut buffer: RentedBuffer,
) -> rquickjs::Result<ChunkRead> {
    let result = object(ctx, result, "read() result")?;
    let done: Coerced<bool> = result.get("done")?;
    if done.0 {
        return Ok(ChunkRead::Done);
    }

    let value: Value = result.get("value")?;
    if let Some(text) = value.as_string() {
        buffer.extend_from_slice(text.to_string()?.as_bytes());
        return Ok(ChunkRead::Chunk(buffer));
    }
    if let Ok(array) = TypedArray::<u8>::from_js(ctx, value.clone()) {
        return Ok(match array.as_bytes() {
            Some(bytes) => {
                buffer.extend_from_slice(bytes);
                ChunkRead::Chunk(buffer)
            }
            None => ChunkRead::Unsupported("detached Uint8Array".to_string()),
        });
    }
    if let Ok(array_buffer) = ArrayBuffer::from_js(ctx, value.clone()) {
        return Ok(match array_buffer.as_bytes() {
            Some(bytes) => {
                buffer.extend_from_slice(bytes);
                ChunkRead::Chunk(buffer)
            }
            None => ChunkRead::Unsupported("detached ArrayBuffer".to_string()),
        });
    }
    Ok(ChunkRead::Unsupported(describe(&value)))
}

/// Look up `name` among the own properties of a plain headers object,
/// ignoring case.
fn plain_header<'js>(headers: &Object<'js>, name: &str) -> rquickjs::Result<Value<'js>> {
    for prop in headers.props::<String, Value>() {
        let (key, value) = prop?;
        if key.eq_ignore_ascii_case(name) {
            return Ok(value);
        }
    }
    Ok(Value::new_undefined(headers.ctx().clone()))
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn status_code(value: &Value<'_>) -> Option<u16> {
    let n = value.as_number()?;
    if n.fract() == 0.0 && (100.0..=999.0).contains(&n) {
        Some(n as u16)
    } else {
        None
    }
}

fn describe(value: &Value<'_>) -> String {
    if let Some(n) = value.as_number() {
        return n.to_string();
    }
    value.type_name().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_status_code_range() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let status = |src: &str| status_code(&ctx.eval::<Value, _>(src).unwrap());
            assert_eq!(status("200"), Some(200));
            assert_eq!(status("999"), Some(999));
            assert_eq!(status("100.0"), Some(100));
            assert_eq!(status("99"), None);
            assert_eq!(status("1000"), None);
            assert_eq!(status("200.5"), None);
            assert_eq!(status("'200'"), None);
        });
    }

    #[test]
    fn test_plain_header_ignores_case() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();

        context.with(|ctx| {
            let headers: Object = ctx
                .eval("({ 'Content-Type': 'text/plain', 'x-other': '1' })")
                .unwrap();
            let found = plain_header(&headers, "content-type").unwrap();
            assert_eq!(found.as_string().unwrap().to_string().unwrap(), "text/plain");

            let missing = plain_header(&headers, "accept").unwrap();
            assert!(missing.is_undefined());
        });
    }

    #[test]
    fn test_read_chunk_kinds() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let pool = BufferPool::new(16, 4);

        context.with(|ctx| {
            let read = |src: &str| {
                let value: Value = ctx.eval(src).unwrap();
                read_chunk(&ctx, value, pool.rent()).unwrap()
            };

            assert!(matches!(read("({ done: true })"), ChunkRead::Done));

            match read("({ done: false, value: 'He' })") {
                ChunkRead::Chunk(buf) => assert_eq!(buf.as_slice(), b"He"),
                _ => panic!("expected a chunk"),
            }
            match read("({ done: false, value: new Uint8Array([1, 2, 3]).subarray(1) })") {
                ChunkRead::Chunk(buf) => assert_eq!(buf.as_slice(), &[2, 3]),
                _ => panic!("expected a chunk"),
            }
            match read("({ done: false, value: new Uint8Array([7]).buffer })") {
                ChunkRead::Chunk(buf) => assert_eq!(buf.as_slice(), &[7]),
                _ => panic!("expected a chunk"),
            }
            assert!(matches!(
                read("({ done: false, value: 42 })"),
                ChunkRead::Unsupported(_)
            ));
        });

        assert_eq!(pool.outstanding(), 0);
    }
}
