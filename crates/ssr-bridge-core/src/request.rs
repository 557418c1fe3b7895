//! Inbound request adaptation.
//!
//! This module provides:
//! - [`RequestContext`]: the native view of an inbound request
//! - [`HeaderMultiMap`]: ordered headers keeping every value
//! - [`RequestAdapter`]: builds the runtime `Request` and its abort signal
//! - [`AbortLink`]: forwards host cancellation to the runtime abort, once

use std::rc::{Rc, Weak};

use rquickjs::{Array, Object, Value};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ssr_bridge_common::BridgeError;

use crate::engine::{Engine, bridge_fn};
use crate::handles::{Handle, HandleScope};

/// Reason passed to the runtime abort when a request is cancelled.
pub const CANCEL_REASON: &str = "request cancelled";

/// Ordered header multi-map.
///
/// Names are lower-cased. Keys keep first-seen order and each key keeps its
/// values in the order they were appended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMultiMap {
    entries: Vec<(String, Vec<String>)>,
}

impl HeaderMultiMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a value for `name`.
    pub fn append(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let name = name.as_ref().to_ascii_lowercase();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, values)) => values.push(value.into()),
            None => self.entries.push((name, vec![value.into()])),
        }
    }

    /// All values of `name`, in order.
    pub fn get_all(&self, name: &str) -> &[String] {
        let name = name.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(key, _)| *key == name)
            .map_or(&[], |(_, values)| values.as_slice())
    }

    /// Iterate over `(name, values)` pairs in first-seen order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.entries
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    /// Number of distinct header names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if there are no headers.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for HeaderMultiMap {
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        let mut map = Self::new();
        for (name, value) in iter {
            map.append(name, value);
        }
        map
    }
}

/// The native view of an inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Request id used for tracing and admin cancellation.
    pub id: String,
    /// HTTP method.
    pub method: String,
    /// Absolute display URL.
    pub url: String,
    /// Request headers.
    pub headers: HeaderMultiMap,
    /// Fires when the client goes away or the request is cancelled.
    pub cancellation: CancellationToken,
}

impl RequestContext {
    /// Create a request with a fresh id and cancellation token.
    pub fn new(method: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            url: url.into(),
            headers: HeaderMultiMap::new(),
            cancellation: CancellationToken::new(),
        }
    }

    /// Set the request id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Append a header.
    #[must_use]
    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.append(name, value);
        self
    }

    /// Replace the headers.
    #[must_use]
    pub fn with_headers(mut self, headers: HeaderMultiMap) -> Self {
        self.headers = headers;
        self
    }

    /// Use an existing cancellation token.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }
}

/// Runtime-side request objects, pinned in the request's scope.
#[derive(Debug, Clone, Copy)]
pub struct AdaptedRequest {
    /// The `Request` passed to the handler.
    pub request: Handle,
    /// Its `AbortSignal`.
    pub signal: Handle,
    /// The `AbortController` behind the signal, pinned outside the scope and
    /// owned by the [`AbortLink`].
    controller: Handle,
}

/// Converts [`RequestContext`] into runtime constructs.
pub struct RequestAdapter;

impl RequestAdapter {
    /// Build the runtime `Request` and link its abort signal to the
    /// request's cancellation token.
    pub fn adapt(
        engine: &Rc<Engine>,
        scope: &HandleScope,
        request: &RequestContext,
    ) -> Result<(AdaptedRequest, AbortLink), BridgeError> {
        let adapted = engine
            .step(|ctx| {
                let entries = Array::new(ctx.clone())?;
                for (index, (name, values)) in request.headers.iter().enumerate() {
                    let pair = Array::new(ctx.clone())?;
                    pair.set(0, name)?;
                    pair.set(1, values.to_vec())?;
                    entries.set(index, pair)?;
                }

                let create = bridge_fn(ctx, "createRequest")?;
                let created: Object = create.call((
                    request.method.as_str(),
                    request.url.as_str(),
                    entries,
                ))?;
                let js_request: Object = created.get("request")?;
                let signal: Value = js_request.get("signal")?;
                let controller: Value = created.get("controller")?;

                Ok(AdaptedRequest {
                    request: scope.pin(ctx, js_request.into_value()),
                    signal: scope.pin(ctx, signal),
                    controller: engine.handles().pin(ctx, controller),
                })
            })
            .map_err(|e| BridgeError::invocation(format!("request adaptation: {e}")))?;

        let link = AbortLink::spawn(engine, adapted.controller, request.cancellation.clone());
        Ok((adapted, link))
    }
}

/// One-way link from a [`CancellationToken`] to a runtime `AbortController`.
///
/// A watcher task on the runtime thread aborts the controller at most once
/// when the token fires. Dropping the link unregisters the watcher.
pub struct AbortLink {
    done: Option<oneshot::Sender<()>>,
}

impl AbortLink {
    fn spawn(engine: &Rc<Engine>, controller: Handle, token: CancellationToken) -> Self {
        let (done_tx, done_rx) = oneshot::channel();
        let engine = Rc::downgrade(engine);

        tokio::task::spawn_local(watch(engine, controller, token, done_rx));

        Self {
            done: Some(done_tx),
        }
    }
}

impl Drop for AbortLink {
    fn drop(&mut self) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

async fn watch(
    engine: Weak<Engine>,
    controller: Handle,
    token: CancellationToken,
    done: oneshot::Receiver<()>,
) {
    tokio::select! {
        biased;
        _ = done => {}
        () = token.cancelled() => {}
    }

    let Some(engine) = engine.upgrade() else {
        return;
    };

    // A render that stopped because of cancellation still aborts its signal.
    if token.is_cancelled() {
        let aborted = engine.step(|ctx| {
            let controller = engine.handles().get(ctx, controller)?;
            let abort = bridge_fn(ctx, "abort")?;
            abort.call::<_, ()>((controller, CANCEL_REASON))
        });
        match aborted {
            Ok(()) => debug!("Runtime abort signalled"),
            Err(e) => warn!(error = %e, "Runtime abort handler threw"),
        }
    }

    engine.handles().release(controller);
}
