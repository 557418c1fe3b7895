//! The runtime worker: one embedded runtime on one dedicated thread.
//!
//! [`RuntimeWorker`] is the only way to touch runtime state. It owns a named
//! OS thread running a current-thread tokio runtime with a `LocalSet`; work is
//! submitted as closures over a channel and answered through a oneshot, so
//! callers on any thread get a future back.
//!
//! ```text
//!  caller threads                         runtime thread
//! ┌──────────────┐   Task (Send closure)  ┌────────────────────────────────┐
//! │ run/render   │ ─────────────────────▶ │ LocalSet                       │
//! │              │                        │  spawn_local(task(cx))         │
//! │   .await  ◀──┼──── oneshot result ─── │  WorkerContext                 │
//! └──────────────┘                        │   Engine / ModuleCache / Pump  │
//!                                         └────────────────────────────────┘
//! ```

use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::LocalSet;
use tracing::{debug, error, info, instrument, warn};

use ssr_bridge_common::{BridgeConfig, BridgeError};

use crate::buffer::BufferPool;
use crate::engine::Engine;
use crate::interop::InteropRegistry;
use crate::module::ModuleCache;
use crate::pump::{RenderOutcome, ResponsePump};
use crate::request::RequestContext;
use crate::sink::{BufferedSink, ResponseSink};

type Task = Box<dyn FnOnce(Rc<WorkerContext>) -> LocalBoxFuture<'static, ()> + Send>;

/// Counters shared between the runtime thread and observers.
#[derive(Debug, Default)]
pub struct WorkerStats {
    /// Render module imports attempted.
    pub module_imports: AtomicU64,
    /// Renders started.
    pub renders_started: AtomicU64,
    /// Renders that drained to completion.
    pub renders_completed: AtomicU64,
    /// Renders cancelled by the client.
    pub renders_cancelled: AtomicU64,
    /// Renders that failed.
    pub renders_failed: AtomicU64,
    /// Set once the handler reference is pinned.
    pub handler_ready: AtomicBool,
    /// Set once the render module import has failed.
    pub import_failed: AtomicBool,
    /// Runtime heap in use after the last render.
    pub heap_used_bytes: AtomicU64,
}

impl WorkerStats {
    /// Point-in-time copy of the counters.
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            module_imports: self.module_imports.load(Ordering::Relaxed),
            renders_started: self.renders_started.load(Ordering::Relaxed),
            renders_completed: self.renders_completed.load(Ordering::Relaxed),
            renders_cancelled: self.renders_cancelled.load(Ordering::Relaxed),
            renders_failed: self.renders_failed.load(Ordering::Relaxed),
            handler_ready: self.handler_ready.load(Ordering::Relaxed),
            import_failed: self.import_failed.load(Ordering::Relaxed),
            heap_used_bytes: self.heap_used_bytes.load(Ordering::Relaxed),
        }
    }

    fn record(&self, outcome: &Result<RenderOutcome, BridgeError>) {
        let counter = match outcome {
            Ok(RenderOutcome::Completed { .. }) => &self.renders_completed,
            Ok(RenderOutcome::Cancelled { .. }) => &self.renders_cancelled,
            Err(_) => &self.renders_failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Copy of [`WorkerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStatsSnapshot {
    /// Render module imports attempted.
    pub module_imports: u64,
    /// Renders started.
    pub renders_started: u64,
    /// Renders that drained to completion.
    pub renders_completed: u64,
    /// Renders cancelled by the client.
    pub renders_cancelled: u64,
    /// Renders that failed.
    pub renders_failed: u64,
    /// Handler reference is pinned.
    pub handler_ready: bool,
    /// Render module import failed.
    pub import_failed: bool,
    /// Runtime heap in use after the last render.
    pub heap_used_bytes: u64,
}

/// A fully buffered render.
#[derive(Debug, Clone)]
pub struct RenderedPage {
    /// Response status.
    pub status: u16,
    /// Response content type.
    pub content_type: String,
    /// Response body.
    pub body: Vec<u8>,
}

/// State living on the runtime thread.
///
/// Tasks scheduled with [`RuntimeWorker::run`] and
/// [`RuntimeWorker::run_async`] receive it.
pub struct WorkerContext {
    engine: Rc<Engine>,
    modules: ModuleCache,
    pump: ResponsePump,
    stats: Arc<WorkerStats>,
}

impl WorkerContext {
    async fn init(
        config: &BridgeConfig,
        interop: &InteropRegistry,
        stats: Arc<WorkerStats>,
        pool: BufferPool,
    ) -> Result<Self, BridgeError> {
        let engine = Engine::new(&config.worker)?;
        engine.publish(interop)?;

        let modules = ModuleCache::new(config.worker.entry_module.clone(), Arc::clone(&stats));
        let pump = ResponsePump::new(
            Rc::clone(&engine),
            pool,
            config.render.default_content_type.clone(),
        );

        let cx = Self {
            engine,
            modules,
            pump,
            stats,
        };

        if config.worker.warm_on_start {
            // Failure is sticky in the cache; renders report it.
            if let Err(e) = cx.modules.handler(&cx.engine).await {
                error!(
                    specifier = %cx.modules.specifier(),
                    error = %e,
                    "Render module warm-up failed"
                );
            }
        }
        Ok(cx)
    }

    /// The engine.
    pub fn engine(&self) -> &Rc<Engine> {
        &self.engine
    }

    /// Render one request into `sink`.
    pub async fn render<S: ResponseSink + ?Sized>(
        &self,
        request: &RequestContext,
        sink: &mut S,
    ) -> Result<RenderOutcome, BridgeError> {
        self.stats.renders_started.fetch_add(1, Ordering::Relaxed);
        let outcome = match self.modules.handler(&self.engine).await {
            Ok(handler) => self.pump.run(handler, request, sink).await,
            Err(e) => Err(e),
        };
        self.stats.record(&outcome);
        self.stats
            .heap_used_bytes
            .store(self.engine.heap_used_bytes(), Ordering::Relaxed);
        outcome
    }
}

/// Owner of the runtime thread.
///
/// Created once at startup and disposed once at shutdown. All methods may be
/// called from any thread.
pub struct RuntimeWorker {
    sender: Mutex<Option<mpsc::UnboundedSender<Task>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
    stats: Arc<WorkerStats>,
    pool: BufferPool,
    entry_module: String,
}

impl RuntimeWorker {
    /// Start the runtime thread and initialize the runtime on it.
    ///
    /// Blocks until the thread reports ready. Call from a blocking context
    /// (e.g. `spawn_blocking`) when inside an async runtime.
    #[instrument(skip(config, interop), fields(thread = %config.worker.thread_name))]
    pub fn create(config: &BridgeConfig, interop: InteropRegistry) -> Result<Self, BridgeError> {
        config.validate()?;

        let stats = Arc::new(WorkerStats::default());
        let pool = BufferPool::new(
            config.render.buffer_capacity,
            config.render.max_pooled_buffers,
        );
        let (sender, receiver) = mpsc::unbounded_channel::<Task>();
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();

        let thread = {
            let config = config.clone();
            let stats = Arc::clone(&stats);
            let pool = pool.clone();
            std::thread::Builder::new()
                .name(config.worker.thread_name.clone())
                .spawn(move || runtime_thread(&config, &interop, stats, pool, receiver, &ready_tx))
                .map_err(|e| BridgeError::runtime_init(format!("spawn runtime thread: {e}")))?
        };

        let ready = ready_rx
            .recv()
            .unwrap_or_else(|_| Err(BridgeError::runtime_init("runtime thread exited during startup")));
        if let Err(e) = ready {
            if thread.join().is_err() {
                warn!("Runtime thread panicked during startup");
            }
            return Err(e);
        }

        info!(entry_module = %config.worker.entry_module, "Runtime worker started");
        Ok(Self {
            sender: Mutex::new(Some(sender)),
            thread: Mutex::new(Some(thread)),
            disposed: AtomicBool::new(false),
            stats,
            pool,
            entry_module: config.worker.entry_module.clone(),
        })
    }

    /// Run a synchronous closure on the runtime thread.
    pub async fn run<F, R>(&self, f: F) -> Result<R, BridgeError>
    where
        F: FnOnce(&WorkerContext) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.run_async(move |cx| {
            let out = f(&cx);
            async move { out }
        })
        .await
    }

    /// Run a closure returning a local future on the runtime thread.
    ///
    /// The future is spawned on the thread's `LocalSet`, so many of them
    /// interleave at their suspension points.
    pub async fn run_async<F, Fut, R>(&self, f: F) -> Result<R, BridgeError>
    where
        F: FnOnce(Rc<WorkerContext>) -> Fut + Send + 'static,
        Fut: Future<Output = R> + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task: Task = Box::new(move |cx| {
            async move {
                let out = f(cx).await;
                let _ = tx.send(out);
            }
            .boxed_local()
        });

        self.submit(task)?;
        rx.await.map_err(|_| self.lost_task_error())
    }

    /// Render `request` into `sink` on the runtime thread.
    #[instrument(skip(self, request, sink), fields(request_id = %request.id, url = %request.url))]
    pub async fn render<S>(&self, request: RequestContext, sink: S) -> Result<RenderOutcome, BridgeError>
    where
        S: ResponseSink + 'static,
    {
        self.run_async(move |cx| async move {
            let mut sink = sink;
            cx.render(&request, &mut sink).await
        })
        .await?
    }

    /// Render `request` into memory.
    pub async fn render_buffered(&self, request: RequestContext) -> Result<RenderedPage, BridgeError> {
        let sink = BufferedSink::new();
        let captured = sink.clone();
        let outcome = self.render(request, sink).await?;

        let captured = captured.captured();
        match outcome {
            RenderOutcome::Completed { status, .. } => Ok(RenderedPage {
                status,
                content_type: captured.content_type.unwrap_or_default(),
                body: captured.body,
            }),
            RenderOutcome::Cancelled { .. } => Err(BridgeError::stream("render cancelled")),
        }
    }

    /// Counters of this worker.
    pub fn stats(&self) -> WorkerStatsSnapshot {
        self.stats.snapshot()
    }

    /// The chunk buffer pool.
    pub fn buffer_pool(&self) -> &BufferPool {
        &self.pool
    }

    /// Render module this worker imports.
    pub fn entry_module(&self) -> &str {
        &self.entry_module
    }

    /// Returns `true` once [`dispose`](Self::dispose) has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Stop the runtime thread and free the runtime.
    ///
    /// Idempotent. Tasks still in flight are dropped and their callers get
    /// [`BridgeError::Disposed`].
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        drop(self.sender.lock().take());

        let Some(thread) = self.thread.lock().take() else {
            return;
        };
        if thread.thread().id() == std::thread::current().id() {
            warn!("Runtime worker disposed from its own thread; not joining");
            return;
        }
        if thread.join().is_err() {
            error!("Runtime thread panicked");
        }
        info!("Runtime worker disposed");
    }

    fn submit(&self, task: Task) -> Result<(), BridgeError> {
        if self.is_disposed() {
            return Err(BridgeError::Disposed);
        }
        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            return Err(BridgeError::Disposed);
        };
        sender.send(task).map_err(|_| BridgeError::WorkerTerminated)
    }

    fn lost_task_error(&self) -> BridgeError {
        if self.is_disposed() {
            BridgeError::Disposed
        } else {
            BridgeError::WorkerTerminated
        }
    }
}

impl Drop for RuntimeWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for RuntimeWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeWorker")
            .field("entry_module", &self.entry_module)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}

fn runtime_thread(
    config: &BridgeConfig,
    interop: &InteropRegistry,
    stats: Arc<WorkerStats>,
    pool: BufferPool,
    mut receiver: mpsc::UnboundedReceiver<Task>,
    ready: &std::sync::mpsc::Sender<Result<(), BridgeError>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(BridgeError::runtime_init(format!(
                "tokio runtime: {e}"
            ))));
            return;
        }
    };

    let local = LocalSet::new();
    local.block_on(&runtime, async move {
        let cx = match WorkerContext::init(config, interop, stats, pool).await {
            Ok(cx) => Rc::new(cx),
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(()));

        while let Some(task) = receiver.recv().await {
            tokio::task::spawn_local(task(Rc::clone(&cx)));
        }
        debug!("Runtime worker channel closed");
    });

    // Dropping the LocalSet drops in-flight tasks while the engine is still
    // reachable through them; the engine goes last.
    drop(local);
    debug!("Runtime thread exiting");
}
