//! Embedded QuickJS runtime bridge for ssr-bridge.
//!
//! This crate lets a native host delegate page rendering to a JavaScript
//! module running in an embedded runtime, and stream the output back:
//! - [`RuntimeWorker`]: one runtime on one dedicated thread, with a task queue
//! - [`Engine`]: the QuickJS runtime, handle table, job pump and timers
//! - [`ModuleCache`]: imports the render module once and pins its handler
//! - [`RequestAdapter`]: converts a [`RequestContext`] into a runtime `Request`
//! - [`ResponsePump`]: invokes the handler and drains its body into a
//!   [`ResponseSink`]
//! - [`InteropRegistry`]: host-native functions published to scripts
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    RuntimeWorker                        │
//! │  (Send + Sync handle, shared by all requests)           │
//! │  - task channel into the runtime thread                 │
//! │  - stats, buffer pool                                   │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │              WorkerContext (runtime thread)             │
//! │  - Engine: Runtime + Context + HandleTable              │
//! │  - ModuleCache: pinned default export                   │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │               ResponsePump (per request)                │
//! │  - Request + AbortSignal, linked to cancellation        │
//! │  - read → copy → write → flush, until done              │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod buffer;
pub mod console;
pub mod engine;
pub mod handles;
pub mod interop;
pub mod module;
pub mod pump;
pub mod request;
pub mod sink;
pub mod worker;

pub use buffer::{BufferPool, RentedBuffer};
pub use engine::{Engine, ScriptError};
pub use handles::{Handle, HandleScope, HandleTable};
pub use interop::{ArgKind, HostFunction, HostValue, InteropRegistry};
pub use module::{ModuleCache, ScriptLoader, ScriptResolver};
pub use pump::{RenderOutcome, ResponsePump};
pub use request::{AbortLink, AdaptedRequest, HeaderMultiMap, RequestAdapter, RequestContext};
pub use sink::{BufferedSink, Captured, ResponseSink};
pub use worker::{RenderedPage, RuntimeWorker, WorkerContext, WorkerStats, WorkerStatsSnapshot};
