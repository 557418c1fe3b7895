//! QuickJS engine owned by the runtime thread.
//!
//! The [`Engine`] wraps one `rquickjs` [`Runtime`] and its [`Context`]. It is:
//! - Confined to the runtime thread (`Rc`, never `Send`)
//! - The owner of the [`HandleTable`] that pins values across steps
//! - Responsible for pumping pending jobs and firing host timers
//!
//! Every interaction with script state goes through [`Engine::step`], which
//! enters the context, runs a closure, converts exceptions into messages and
//! then drains the microtask queue.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::{Rc, Weak};
use std::time::Duration;

use rquickjs::function::Func;
use rquickjs::{Coerced, Context, Ctx, Exception, FromJs, Function, Object, Runtime, Value};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use ssr_bridge_common::{BridgeError, InteropError, WorkerConfig};

use crate::console;
use crate::handles::{Handle, HandleScope, HandleTable};
use crate::interop::InteropRegistry;
use crate::module::{ScriptLoader, ScriptResolver};

/// Web-platform surface installed into every context.
const PRELUDE: &str = include_str!("prelude.js");

/// Settlement states written by `__bridge.track`.
pub(crate) const PENDING: i32 = 0;
pub(crate) const FULFILLED: i32 = 1;
pub(crate) const REJECTED: i32 = 2;

/// An exception raised inside the runtime, converted to a message.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct ScriptError {
    /// Exception message, followed by the stack when one is available.
    pub message: String,
}

impl ScriptError {
    pub(crate) fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

type TimerQueue = Rc<RefCell<Vec<(u32, Duration)>>>;

/// The embedded QuickJS runtime and its context.
///
/// Field order matters: pinned handles are dropped before the context, and
/// the context before the runtime.
pub struct Engine {
    handles: Rc<HandleTable>,
    timers: TimerQueue,
    jobs_ran: Rc<Notify>,
    published: Cell<bool>,
    script_root: PathBuf,
    context: Context,
    runtime: Runtime,
}

impl Engine {
    /// Create the runtime, apply limits, install the module loader, the
    /// console bridge and the prelude.
    ///
    /// Must be called on the runtime thread, inside its `LocalSet`.
    pub fn new(config: &WorkerConfig) -> Result<Rc<Self>, BridgeError> {
        let runtime = Runtime::new()
            .map_err(|e| BridgeError::runtime_init(format!("QuickJS runtime: {e}")))?;

        if let Some(limit) = config.memory_limit_bytes() {
            runtime.set_memory_limit(limit);
        }
        if let Some(limit) = config.max_stack_bytes() {
            runtime.set_max_stack_size(limit);
        }

        let script_root = config.script_root.clone();
        runtime.set_loader(ScriptResolver::new(script_root.clone()), ScriptLoader);

        let context = Context::full(&runtime)
            .map_err(|e| BridgeError::runtime_init(format!("QuickJS context: {e}")))?;

        let timers: TimerQueue = Rc::new(RefCell::new(Vec::new()));
        let engine = Rc::new(Self {
            handles: Rc::new(HandleTable::new()),
            timers,
            jobs_ran: Rc::new(Notify::new()),
            published: Cell::new(false),
            script_root,
            context,
            runtime,
        });

        engine
            .step(|ctx| engine.install_prelude(ctx))
            .map_err(|e| BridgeError::runtime_init(format!("prelude: {e}")))?;

        info!(
            script_root = %engine.script_root.display(),
            memory_limit_mb = config.memory_limit_mb,
            "QuickJS engine initialized"
        );

        Ok(engine)
    }

    fn install_prelude(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let native = Object::new(ctx.clone())?;

        native.set(
            "log",
            Func::from(|level: i32, message: String| {
                console::emit(console::level_from_i32(level), &message);
            }),
        )?;

        let timers = Rc::clone(&self.timers);
        native.set(
            "setTimer",
            Func::from(move |id: u32, delay_ms: f64| {
                #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let delay = Duration::from_millis(delay_ms.max(0.0) as u64);
                timers.borrow_mut().push((id, delay));
            }),
        )?;

        ctx.globals().set("__bridge_native", native)?;

        // Evaluated as a plain script: imports issued from prelude helpers
        // have no file as their base and resolve against the script root.
        ctx.eval::<(), _>(PRELUDE)
    }

    /// Open a scope whose handles are released when it is dropped.
    pub fn scope(&self) -> HandleScope {
        HandleScope::new(Rc::clone(&self.handles))
    }

    /// The handle table.
    pub fn handles(&self) -> &Rc<HandleTable> {
        &self.handles
    }

    /// Run one synchronous step inside the context.
    ///
    /// Exceptions thrown by the closure are converted into [`ScriptError`].
    /// Pending jobs are drained and newly armed timers are scheduled before
    /// this returns.
    pub fn step<R>(
        self: &Rc<Self>,
        f: impl FnOnce(&Ctx<'_>) -> rquickjs::Result<R>,
    ) -> Result<R, ScriptError> {
        let result = self.context.with(|ctx| match f(&ctx) {
            Ok(value) => Ok(value),
            Err(rquickjs::Error::Exception) => Err(ScriptError::new(format_exception(
                &ctx,
                ctx.catch(),
            ))),
            Err(err) => Err(ScriptError::new(err.to_string())),
        });

        self.pump();
        self.schedule_timers();
        result
    }

    /// Drain the job queue. Returns the number of jobs that ran.
    ///
    /// A job that throws is logged and the drain continues.
    pub fn pump(&self) -> usize {
        let mut ran = 0;
        loop {
            match self.runtime.execute_pending_job() {
                Ok(true) => ran += 1,
                Ok(false) => break,
                Err(err) => {
                    ran += 1;
                    err.0.with(|ctx| {
                        let message = format_exception(&ctx, ctx.catch());
                        warn!(error = %message, "Uncaught exception in pending job");
                    });
                }
            }
        }

        if ran > 0 {
            self.jobs_ran.notify_waiters();
        }
        ran
    }

    fn schedule_timers(self: &Rc<Self>) {
        let armed: Vec<_> = self.timers.borrow_mut().drain(..).collect();
        for (id, delay) in armed {
            let engine = Rc::downgrade(self);
            tokio::task::spawn_local(fire_timer(engine, id, delay));
        }
    }

    /// Wait until a pinned value settles and pin its result.
    ///
    /// Plain values settle immediately; promises are followed until they
    /// fulfil or reject. A rejection becomes a [`ScriptError`] carrying the
    /// rejection reason.
    pub async fn settle(
        self: &Rc<Self>,
        scope: &HandleScope,
        value: Handle,
    ) -> Result<Handle, ScriptError> {
        let cell = self.step(|ctx| {
            let value = scope.get(ctx, value)?;
            let track = bridge_fn(ctx, "track")?;
            let cell: Value = track.call((value,))?;
            Ok(scope.pin(ctx, cell))
        })?;

        let settled = loop {
            let notified = self.jobs_ran.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let state = self.step(|ctx| {
                let cell = scope.get(ctx, cell)?.into_object().ok_or_else(|| {
                    Exception::throw_type(ctx, "settle cell is not an object")
                })?;
                let state: i32 = cell.get("state")?;
                if state == PENDING {
                    return Ok(None);
                }
                let value: Value = cell.get("value")?;
                if state == FULFILLED {
                    Ok(Some(Ok(scope.pin(ctx, value))))
                } else {
                    Ok(Some(Err(format_exception(ctx, value))))
                }
            })?;

            match state {
                Some(settled) => break settled,
                None => notified.await,
            }
        };

        scope.release(cell);
        settled.map_err(ScriptError::new)
    }

    /// Evaluate a global script and coerce its completion value to a string.
    pub fn eval_to_string(self: &Rc<Self>, source: &str) -> Result<String, ScriptError> {
        self.step(|ctx| {
            let value: Value = ctx.eval(source)?;
            Ok(Coerced::<String>::from_js(ctx, value)?.0)
        })
    }

    /// Publish a host function table under its global name.
    ///
    /// Only one table can be published per engine.
    pub fn publish(self: &Rc<Self>, registry: &InteropRegistry) -> Result<(), BridgeError> {
        if self.published.get() {
            return Err(InteropError::AlreadyPublished {
                global: registry.global().to_string(),
            }
            .into());
        }

        self.step(|ctx| registry.install(ctx))
            .map_err(|e| InteropError::Failed { reason: e.message })?;
        self.published.set(true);

        debug!(
            global = registry.global(),
            functions = registry.len(),
            "Host function table published"
        );
        Ok(())
    }

    /// Bytes currently allocated by the runtime heap.
    pub fn heap_used_bytes(&self) -> u64 {
        let usage = self.runtime.memory_usage();
        u64::try_from(usage.memory_used_size).unwrap_or(0)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        let pinned = self.handles.len();
        self.handles.clear();
        debug!(released = pinned, "QuickJS engine dropped");
    }
}

async fn fire_timer(engine: Weak<Engine>, id: u32, delay: Duration) {
    tokio::time::sleep(delay).await;
    let Some(engine) = engine.upgrade() else {
        return;
    };
    let fired = engine.step(|ctx| {
        let fire = bridge_fn(ctx, "fireTimer")?;
        fire.call::<_, ()>((id,))
    });
    if let Err(e) = fired {
        warn!(timer_id = id, error = %e, "Timer callback threw");
    }
}

/// Look up a helper function installed by the prelude on `__bridge`.
pub(crate) fn bridge_fn<'js>(ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Function<'js>> {
    let bridge: Object = ctx.globals().get("__bridge")?;
    bridge.get(name)
}

/// Look up a method on an object, raising a `TypeError` if it is missing.
///
/// Call it with `This(target)` as the first argument.
pub(crate) fn method<'js>(
    ctx: &Ctx<'js>,
    target: &Object<'js>,
    name: &str,
) -> rquickjs::Result<Function<'js>> {
    let value: Value = target.get(name)?;
    value
        .into_function()
        .ok_or_else(|| Exception::throw_type(ctx, &format!("{name} is not a function")))
}

/// Render a thrown or rejected value as a message, with the stack if present.
pub(crate) fn format_exception<'js>(ctx: &Ctx<'js>, caught: Value<'js>) -> String {
    if let Some(obj) = caught.as_object() {
        if let Some(exception) = Exception::from_object(obj.clone()) {
            let message = exception.message();
            let stack = exception.stack().filter(|s| !s.trim().is_empty());
            return match (message, stack) {
                (Some(message), Some(stack)) => format!("{message}\n{stack}"),
                (Some(message), None) => message,
                (None, Some(stack)) => stack,
                (None, None) => "unknown exception".to_string(),
            };
        }
    }

    match Coerced::<String>::from_js(ctx, caught) {
        Ok(value) => value.0,
        Err(err) => format!("(failed to stringify exception: {err})"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::task::LocalSet;

    fn test_config() -> WorkerConfig {
        WorkerConfig::for_root(std::env::temp_dir())
    }

    #[tokio::test]
    async fn test_engine_evaluates() {
        LocalSet::new()
            .run_until(async {
                let engine = Engine::new(&test_config()).unwrap();
                let out = engine.eval_to_string("1 + 2").unwrap();
                assert_eq!(out, "3");
            })
            .await;
    }

    #[tokio::test]
    async fn test_step_converts_exceptions() {
        LocalSet::new()
            .run_until(async {
                let engine = Engine::new(&test_config()).unwrap();
                let err = engine
                    .eval_to_string("throw new Error('boom')")
                    .unwrap_err();
                assert!(err.message.starts_with("boom"));

                let err = engine.eval_to_string("throw 'plain'").unwrap_err();
                assert_eq!(err.message, "plain");
            })
            .await;
    }

    #[tokio::test]
    async fn test_settle_plain_and_promise() {
        LocalSet::new()
            .run_until(async {
                let engine = Engine::new(&test_config()).unwrap();
                let scope = engine.scope();

                let plain = engine
                    .step(|ctx| Ok(scope.pin(ctx, ctx.eval("41 + 1")?)))
                    .unwrap();
                let settled = engine.settle(&scope, plain).await.unwrap();
                let out = engine
                    .step(|ctx| i32::from_js(ctx, scope.get(ctx, settled)?))
                    .unwrap();
                assert_eq!(out, 42);

                let rejected = engine
                    .step(|ctx| {
                        let value = ctx.eval("Promise.reject(new TypeError('nope'))")?;
                        Ok(scope.pin(ctx, value))
                    })
                    .unwrap();
                let err = engine.settle(&scope, rejected).await.unwrap_err();
                assert!(err.message.starts_with("nope"));
            })
            .await;
    }

    #[tokio::test]
    async fn test_settle_waits_for_timer() {
        LocalSet::new()
            .run_until(async {
                let engine = Engine::new(&test_config()).unwrap();
                let scope = engine.scope();

                let promise = engine
                    .step(|ctx| {
                        let value = ctx.eval("new Promise(r => setTimeout(() => r('late'), 5))")?;
                        Ok(scope.pin(ctx, value))
                    })
                    .unwrap();
                let settled = engine.settle(&scope, promise).await.unwrap();
                let out = engine
                    .step(|ctx| String::from_js(ctx, scope.get(ctx, settled)?))
                    .unwrap();
                assert_eq!(out, "late");
            })
            .await;
    }

    #[tokio::test]
    async fn test_scope_handles_released() {
        LocalSet::new()
            .run_until(async {
                let engine = Engine::new(&test_config()).unwrap();
                {
                    let scope = engine.scope();
                    engine
                        .step(|ctx| Ok(scope.pin(ctx, ctx.eval("({})")?)))
                        .unwrap();
                    assert_eq!(engine.handles().len(), 1);
                }
                assert!(engine.handles().is_empty());
            })
            .await;
    }
}
