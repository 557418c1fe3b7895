//! Render module import, resolution and caching.
//!
//! This module provides:
//! - [`ScriptResolver`] / [`ScriptLoader`]: the QuickJS module loader rooted
//!   at the configured script directory
//! - [`ModuleCache`]: imports the render module once and pins its default
//!   export as the handler reference shared by every request

use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use rquickjs::loader::{Loader, Resolver};
use rquickjs::module::Declared;
use rquickjs::{Ctx, Exception, Module, Object, Value};
use tokio::sync::OnceCell;
use tracing::{error, info, instrument};

use ssr_bridge_common::BridgeError;

use crate::engine::{Engine, bridge_fn};
use crate::handles::Handle;
use crate::worker::WorkerStats;

/// Extensions tried, in order, when a specifier does not name a file.
const CANDIDATE_SUFFIXES: [&str; 3] = [".js", ".mjs", "/index.js"];

/// Resolves relative and root-absolute specifiers to canonical file paths.
///
/// Bare specifiers (package names) are rejected: the render bundle is
/// expected to be self-contained.
#[derive(Debug, Clone)]
pub struct ScriptResolver {
    root: PathBuf,
}

impl ScriptResolver {
    /// Create a resolver rooted at `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve `specifier` as imported from `base`.
    pub fn resolve_path(&self, base: &str, specifier: &str) -> Option<PathBuf> {
        let spec = specifier.trim();
        let path = if spec.starts_with("./") || spec.starts_with("../") {
            self.base_dir(base).join(spec)
        } else if let Some(rooted) = spec.strip_prefix('/') {
            let absolute = Path::new(spec);
            if self.is_under_root(absolute) {
                absolute.to_path_buf()
            } else {
                self.root.join(rooted)
            }
        } else {
            return None;
        };

        existing_file(&path)
    }

    fn base_dir(&self, base: &str) -> PathBuf {
        let base = Path::new(base);
        if base.is_absolute() && base.is_file() {
            if let Some(parent) = base.parent() {
                return parent.to_path_buf();
            }
        }
        self.root.clone()
    }

    fn is_under_root(&self, path: &Path) -> bool {
        let Ok(root) = self.root.canonicalize() else {
            return false;
        };
        path.starts_with(root) && path.is_file()
    }
}

fn existing_file(path: &Path) -> Option<PathBuf> {
    if path.is_file() {
        return path.canonicalize().ok();
    }
    let raw = path.to_string_lossy();
    CANDIDATE_SUFFIXES
        .iter()
        .map(|suffix| PathBuf::from(format!("{raw}{suffix}")))
        .find(|candidate| candidate.is_file())
        .and_then(|candidate| candidate.canonicalize().ok())
}

impl Resolver for ScriptResolver {
    fn resolve(&mut self, _ctx: &Ctx<'_>, base: &str, name: &str) -> rquickjs::Result<String> {
        let spec = name.trim();
        if spec.is_empty() {
            return Err(rquickjs::Error::new_resolving(base, name));
        }
        if !(spec.starts_with('.') || spec.starts_with('/')) {
            return Err(rquickjs::Error::new_resolving_message(
                base,
                name,
                format!("bare module specifiers are not supported: {spec}"),
            ));
        }

        self.resolve_path(base, spec)
            .map(|path| path.to_string_lossy().into_owned())
            .ok_or_else(|| {
                rquickjs::Error::new_resolving_message(
                    base,
                    name,
                    format!("module not found under {}", self.root.display()),
                )
            })
    }
}

/// Reads resolved module files from disk.
#[derive(Debug, Clone, Copy)]
pub struct ScriptLoader;

impl Loader for ScriptLoader {
    fn load<'js>(&mut self, ctx: &Ctx<'js>, name: &str) -> rquickjs::Result<Module<'js, Declared>> {
        let source = std::fs::read(name)
            .map_err(|err| rquickjs::Error::new_loading_message(name, format!("read: {err}")))?;
        Module::declare(ctx.clone(), name, source)
    }
}

/// Imports the render module once and hands out its handler reference.
///
/// Concurrent first callers share one import. A failed import is sticky:
/// every later call returns the same [`BridgeError::ImportFailure`].
pub struct ModuleCache {
    specifier: String,
    handler: OnceCell<Handle>,
    failure: RefCell<Option<BridgeError>>,
    stats: Arc<WorkerStats>,
}

impl ModuleCache {
    /// Create a cache for the module at `specifier`.
    pub fn new(specifier: impl Into<String>, stats: Arc<WorkerStats>) -> Self {
        Self {
            specifier: specifier.into(),
            handler: OnceCell::new(),
            failure: RefCell::new(None),
            stats,
        }
    }

    /// The module specifier this cache imports.
    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    /// Returns the cached handler, importing the module on first use.
    pub async fn handler(&self, engine: &Rc<Engine>) -> Result<Handle, BridgeError> {
        if let Some(handle) = self.handler.get() {
            return Ok(*handle);
        }
        self.sticky_failure()?;

        let result = self
            .handler
            .get_or_try_init(|| async {
                self.sticky_failure()?;
                self.import(engine).await
            })
            .await
            .copied();

        if let Err(err) = &result {
            let mut failure = self.failure.borrow_mut();
            if failure.is_none() {
                *failure = Some(err.clone());
                self.stats.import_failed.store(true, Ordering::Relaxed);
            }
        }
        result
    }

    /// Returns `true` once the handler has been imported.
    pub fn is_ready(&self) -> bool {
        self.handler.initialized()
    }

    fn sticky_failure(&self) -> Result<(), BridgeError> {
        match self.failure.borrow().as_ref() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    #[instrument(skip(self, engine), fields(specifier = %self.specifier))]
    async fn import(&self, engine: &Rc<Engine>) -> Result<Handle, BridgeError> {
        let start = Instant::now();
        self.stats.module_imports.fetch_add(1, Ordering::Relaxed);

        let scope = engine.scope();
        let failed = |reason: String| {
            error!(reason = %reason, "Render module import failed");
            BridgeError::import_failure(&self.specifier, reason)
        };

        let promise = engine
            .step(|ctx| {
                let import = bridge_fn(ctx, "importModule")?;
                let promise: Value = import.call((self.specifier.as_str(),))?;
                Ok(scope.pin(ctx, promise))
            })
            .map_err(|e| failed(e.message))?;

        let namespace = engine
            .settle(&scope, promise)
            .await
            .map_err(|e| failed(e.message))?;

        let handler = engine
            .step(|ctx| {
                let namespace: Object = scope
                    .get(ctx, namespace)?
                    .into_object()
                    .ok_or_else(|| Exception::throw_type(ctx, "module namespace is not an object"))?;
                let default: Value = namespace.get("default")?;
                if default.is_function() {
                    Ok(Some(engine.handles().pin(ctx, default)))
                } else {
                    Ok(None)
                }
            })
            .map_err(|e| failed(e.message))?
            .ok_or_else(|| failed("default export is not a function".to_string()))?;

        self.stats.handler_ready.store(true, Ordering::Relaxed);
        info!(
            duration_ms = start.elapsed().as_millis(),
            "Render module imported"
        );
        Ok(handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn bundle() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("build/server")).unwrap();
        fs::write(dir.path().join("build/server/index.js"), "export default 1;").unwrap();
        fs::write(dir.path().join("build/server/util.mjs"), "export const x = 1;").unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/index.js"), "export const y = 2;").unwrap();
        dir
    }

    #[test]
    fn test_resolve_relative_to_root() {
        let dir = bundle();
        let resolver = ScriptResolver::new(dir.path());

        let path = resolver
            .resolve_path("eval_script", "./build/server/index.js")
            .unwrap();
        assert!(path.ends_with("build/server/index.js"));
    }

    #[test]
    fn test_resolve_candidates() {
        let dir = bundle();
        let resolver = ScriptResolver::new(dir.path());

        let entry = resolver
            .resolve_path("eval_script", "./build/server/index")
            .unwrap();
        let base = entry.to_string_lossy().into_owned();

        let util = resolver.resolve_path(&base, "./util").unwrap();
        assert!(util.ends_with("build/server/util.mjs"));

        let lib = resolver.resolve_path(&base, "../../lib").unwrap();
        assert!(lib.ends_with("lib/index.js"));

        let rooted = resolver.resolve_path(&base, "/lib/index.js").unwrap();
        assert_eq!(rooted, lib);
    }

    #[test]
    fn test_resolve_rejects_missing_and_bare() {
        let dir = bundle();
        let resolver = ScriptResolver::new(dir.path());

        assert!(resolver.resolve_path("eval_script", "./nope.js").is_none());
        assert!(resolver.resolve_path("eval_script", "react").is_none());
    }
}
