//! Host-owned table of pinned runtime values.
//!
//! Runtime values cannot outlive the closure they were produced in, so any
//! value needed across scheduled steps is saved as a [`Persistent`] and
//! addressed by an integer [`Handle`]. Handles are released explicitly, or in
//! bulk by a [`HandleScope`] when a request ends.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use rquickjs::{Ctx, Exception, Persistent, Value};

/// Integer id of a pinned runtime value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(u64);

impl Handle {
    /// The raw id.
    pub fn id(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Maps handles to pinned values.
///
/// Lives on the runtime thread only. It must be cleared before the runtime
/// it belongs to is freed.
#[derive(Default)]
pub struct HandleTable {
    next: Cell<u64>,
    slots: RefCell<HashMap<u64, Persistent<Value<'static>>>>,
}

impl HandleTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a value and return its handle.
    pub fn pin<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> Handle {
        let id = self.next.get() + 1;
        self.next.set(id);
        self.slots
            .borrow_mut()
            .insert(id, Persistent::save(ctx, value));
        Handle(id)
    }

    /// Read a pinned value back into the given context.
    ///
    /// A released handle raises a `ReferenceError` inside the runtime.
    pub fn get<'js>(&self, ctx: &Ctx<'js>, handle: Handle) -> rquickjs::Result<Value<'js>> {
        let saved = self.slots.borrow().get(&handle.0).cloned();
        match saved {
            Some(saved) => saved.restore(ctx),
            None => Err(Exception::throw_reference(
                ctx,
                &format!("stale runtime handle {handle}"),
            )),
        }
    }

    /// Release a handle. Returns `false` if it was not pinned.
    pub fn release(&self, handle: Handle) -> bool {
        self.slots.borrow_mut().remove(&handle.0).is_some()
    }

    /// Number of pinned values.
    pub fn len(&self) -> usize {
        self.slots.borrow().len()
    }

    /// Returns `true` if nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.slots.borrow().is_empty()
    }

    /// Release every handle.
    pub fn clear(&self) {
        let drained: Vec<_> = self.slots.borrow_mut().drain().collect();
        drop(drained);
    }
}

/// Releases every handle pinned through it when dropped.
pub struct HandleScope {
    table: Rc<HandleTable>,
    pinned: RefCell<Vec<Handle>>,
}

impl HandleScope {
    pub(crate) fn new(table: Rc<HandleTable>) -> Self {
        Self {
            table,
            pinned: RefCell::new(Vec::new()),
        }
    }

    /// Pin a value for the lifetime of this scope.
    pub fn pin<'js>(&self, ctx: &Ctx<'js>, value: Value<'js>) -> Handle {
        let handle = self.table.pin(ctx, value);
        self.pinned.borrow_mut().push(handle);
        handle
    }

    /// Read a pinned value.
    pub fn get<'js>(&self, ctx: &Ctx<'js>, handle: Handle) -> rquickjs::Result<Value<'js>> {
        self.table.get(ctx, handle)
    }

    /// Release one handle before the scope ends.
    pub fn release(&self, handle: Handle) {
        self.pinned.borrow_mut().retain(|h| *h != handle);
        self.table.release(handle);
    }

    /// Number of handles still held by this scope.
    pub fn len(&self) -> usize {
        self.pinned.borrow().len()
    }

    /// Returns `true` if the scope holds no handles.
    pub fn is_empty(&self) -> bool {
        self.pinned.borrow().is_empty()
    }
}

impl Drop for HandleScope {
    fn drop(&mut self) {
        for handle in self.pinned.get_mut().drain(..) {
            self.table.release(handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rquickjs::{Context, Runtime};

    #[test]
    fn test_pin_and_restore() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let table = Rc::new(HandleTable::new());

        let handle = context.with(|ctx| {
            let value: Value = ctx.eval("({ greeting: 'hi' })").unwrap();
            table.pin(&ctx, value)
        });
        assert_eq!(table.len(), 1);

        context.with(|ctx| {
            let value = table.get(&ctx, handle).unwrap();
            let obj = value.into_object().unwrap();
            let greeting: String = obj.get("greeting").unwrap();
            assert_eq!(greeting, "hi");
        });

        assert!(table.release(handle));
        assert!(!table.release(handle));
        assert!(table.is_empty());
    }

    #[test]
    fn test_stale_handle_raises() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let table = HandleTable::new();

        context.with(|ctx| {
            let result = table.get(&ctx, Handle(42));
            assert!(result.is_err());
            let _ = ctx.catch();
        });
    }

    #[test]
    fn test_scope_releases_on_drop() {
        let runtime = Runtime::new().unwrap();
        let context = Context::full(&runtime).unwrap();
        let table = Rc::new(HandleTable::new());

        let keep = context.with(|ctx| table.pin(&ctx, Value::new_int(ctx.clone(), 1)));

        {
            let scope = HandleScope::new(Rc::clone(&table));
            let first = context.with(|ctx| scope.pin(&ctx, Value::new_int(ctx.clone(), 2)));
            context.with(|ctx| scope.pin(&ctx, Value::new_int(ctx.clone(), 3)));
            assert_eq!(table.len(), 3);

            scope.release(first);
            assert_eq!(scope.len(), 1);
            assert_eq!(table.len(), 2);
        }

        assert_eq!(table.len(), 1);
        assert!(table.release(keep));
        table.clear();
    }
}
