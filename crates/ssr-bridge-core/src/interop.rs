//! Host-native function tables published into the runtime.
//!
//! An [`InteropRegistry`] groups [`HostFunction`]s into namespaces and is
//! published once under a global name, so scripts call
//! `globalThis[global][namespace][name](...)`. Arguments are marshalled into
//! [`HostValue`]s and checked against the declared signature; a mismatch is
//! raised as a `TypeError` inside the runtime.

use std::collections::BTreeMap;
use std::sync::Arc;

use rquickjs::function::{Func, Rest};
use rquickjs::{Ctx, Exception, FromJs, IntoJs, Object, Value};

use ssr_bridge_common::InteropError;

/// A value crossing the interop boundary.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// A boolean.
    Bool(bool),
    /// A number.
    Number(f64),
    /// A string.
    String(String),
    /// Any other runtime value; carries the type name.
    Other(String),
}

impl HostValue {
    /// Name of the runtime type, as used in error messages.
    pub fn type_name(&self) -> &str {
        match self {
            HostValue::Undefined => "undefined",
            HostValue::Null => "null",
            HostValue::Bool(_) => "boolean",
            HostValue::Number(_) => "number",
            HostValue::String(_) => "string",
            HostValue::Other(name) => name,
        }
    }

    /// The number, if this is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            HostValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// The string, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HostValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// The boolean, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            HostValue::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl<'js> FromJs<'js> for HostValue {
    fn from_js(_ctx: &Ctx<'js>, value: Value<'js>) -> rquickjs::Result<Self> {
        if value.is_undefined() {
            return Ok(HostValue::Undefined);
        }
        if value.is_null() {
            return Ok(HostValue::Null);
        }
        if let Some(b) = value.as_bool() {
            return Ok(HostValue::Bool(b));
        }
        if let Some(n) = value.as_number() {
            return Ok(HostValue::Number(n));
        }
        if let Some(s) = value.as_string() {
            return Ok(HostValue::String(s.to_string()?));
        }
        Ok(HostValue::Other(value.type_name().to_string()))
    }
}

impl<'js> IntoJs<'js> for HostValue {
    fn into_js(self, ctx: &Ctx<'js>) -> rquickjs::Result<Value<'js>> {
        match self {
            HostValue::Undefined | HostValue::Other(_) => Ok(Value::new_undefined(ctx.clone())),
            HostValue::Null => Ok(Value::new_null(ctx.clone())),
            HostValue::Bool(b) => Ok(Value::new_bool(ctx.clone(), b)),
            HostValue::Number(n) => Ok(Value::new_number(ctx.clone(), n)),
            HostValue::String(s) => s.into_js(ctx),
        }
    }
}

/// Declared type of a host function parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// A number.
    Number,
    /// A string.
    String,
    /// A boolean.
    Boolean,
}

impl ArgKind {
    /// Type name used in error messages.
    pub fn name(self) -> &'static str {
        match self {
            ArgKind::Number => "number",
            ArgKind::String => "string",
            ArgKind::Boolean => "boolean",
        }
    }

    fn accepts(self, value: &HostValue) -> bool {
        matches!(
            (self, value),
            (ArgKind::Number, HostValue::Number(_))
                | (ArgKind::String, HostValue::String(_))
                | (ArgKind::Boolean, HostValue::Bool(_))
        )
    }
}

type Callback = Arc<dyn Fn(&[HostValue]) -> Result<HostValue, InteropError> + Send + Sync>;

/// A named host-native function with a fixed signature.
#[derive(Clone)]
pub struct HostFunction {
    name: String,
    params: Vec<ArgKind>,
    callback: Callback,
}

impl HostFunction {
    /// Create a function. `callback` only runs once arguments match `params`.
    pub fn new<F>(name: impl Into<String>, params: Vec<ArgKind>, callback: F) -> Self
    where
        F: Fn(&[HostValue]) -> Result<HostValue, InteropError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            params,
            callback: Arc::new(callback),
        }
    }

    /// The function name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared parameter kinds.
    pub fn params(&self) -> &[ArgKind] {
        &self.params
    }

    /// Check arguments against the signature, then dispatch.
    pub fn invoke(&self, args: &[HostValue]) -> Result<HostValue, InteropError> {
        if args.len() != self.params.len() {
            return Err(InteropError::Arity {
                expected: self.params.len(),
                actual: args.len(),
            });
        }
        for (index, (kind, arg)) in self.params.iter().zip(args).enumerate() {
            if !kind.accepts(arg) {
                return Err(InteropError::ArgumentType {
                    index,
                    expected: kind.name(),
                });
            }
        }
        (self.callback)(args)
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("name", &self.name)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

/// A fixed table of host functions, grouped by namespace.
#[derive(Debug, Clone)]
pub struct InteropRegistry {
    global: String,
    namespaces: BTreeMap<String, Vec<HostFunction>>,
}

impl InteropRegistry {
    /// Create an empty registry published under `global`.
    pub fn new(global: impl Into<String>) -> Self {
        Self {
            global: global.into(),
            namespaces: BTreeMap::new(),
        }
    }

    /// Global name the table is published under.
    pub fn global(&self) -> &str {
        &self.global
    }

    /// Add a function to `namespace`.
    pub fn register(
        &mut self,
        namespace: &str,
        function: HostFunction,
    ) -> Result<(), InteropError> {
        let functions = self.namespaces.entry(namespace.to_string()).or_default();
        if functions.iter().any(|f| f.name == function.name) {
            return Err(InteropError::Duplicate {
                name: format!("{namespace}.{}", function.name),
            });
        }
        functions.push(function);
        Ok(())
    }

    /// Look up a function.
    pub fn get(&self, namespace: &str, name: &str) -> Option<&HostFunction> {
        self.namespaces
            .get(namespace)?
            .iter()
            .find(|f| f.name == name)
    }

    /// Total number of functions.
    pub fn len(&self) -> usize {
        self.namespaces.values().map(Vec::len).sum()
    }

    /// Returns `true` if no function is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Install the table on the global object of `ctx`.
    pub(crate) fn install(&self, ctx: &Ctx<'_>) -> rquickjs::Result<()> {
        let root = Object::new(ctx.clone())?;
        for (namespace, functions) in &self.namespaces {
            let table = Object::new(ctx.clone())?;
            for function in functions {
                let function = function.clone();
                let name = function.name.clone();
                table.set(
                    name,
                    Func::from(
                        move |ctx: Ctx<'_>, args: Rest<HostValue>| -> rquickjs::Result<HostValue> {
                            function
                                .invoke(&args.0)
                                .map_err(|e| Exception::throw_type(&ctx, &e.to_string()))
                        },
                    ),
                )?;
            }
            root.set(namespace.as_str(), table)?;
        }
        ctx.globals().set(self.global.as_str(), root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add() -> HostFunction {
        HostFunction::new("add", vec![ArgKind::Number, ArgKind::Number], |args| {
            let a = args[0].as_number().unwrap_or_default();
            let b = args[1].as_number().unwrap_or_default();
            Ok(HostValue::Number(a + b))
        })
    }

    #[test]
    fn test_invoke_checks_signature() {
        let f = add();

        assert_eq!(
            f.invoke(&[HostValue::Number(2.0), HostValue::Number(2.0)]),
            Ok(HostValue::Number(4.0))
        );

        let err = f
            .invoke(&[HostValue::String("2".into()), HostValue::Number(2.0)])
            .unwrap_err();
        assert_eq!(err.to_string(), "wrong argument type, expected number");

        let err = f.invoke(&[HostValue::Number(1.0)]).unwrap_err();
        assert_eq!(
            err,
            InteropError::Arity {
                expected: 2,
                actual: 1
            }
        );
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = InteropRegistry::new("host");
        registry.register("Math", add()).unwrap();

        let err = registry.register("Math", add()).unwrap_err();
        assert!(matches!(err, InteropError::Duplicate { .. }));
        assert_eq!(registry.len(), 1);
        assert!(registry.get("Math", "add").is_some());
        assert!(registry.get("Math", "sub").is_none());
    }

    #[test]
    fn test_install_and_call() {
        let runtime = rquickjs::Runtime::new().unwrap();
        let context = rquickjs::Context::full(&runtime).unwrap();

        let mut registry = InteropRegistry::new("host");
        registry.register("Math", add()).unwrap();

        context.with(|ctx| {
            registry.install(&ctx).unwrap();

            let sum: f64 = ctx.eval("host.Math.add(2, 2)").unwrap();
            assert!((sum - 4.0).abs() < f64::EPSILON);

            let message: String = ctx
                .eval("try { host.Math.add('2', 2); 'no error' } catch (e) { e.name + ': ' + e.message }")
                .unwrap();
            assert_eq!(message, "TypeError: wrong argument type, expected number");
        });
    }

    #[test]
    fn test_host_value_type_names() {
        assert_eq!(HostValue::Undefined.type_name(), "undefined");
        assert_eq!(HostValue::Other("object".into()).type_name(), "object");
        assert_eq!(HostValue::Bool(true).as_bool(), Some(true));
        assert_eq!(HostValue::String("x".into()).as_str(), Some("x"));
    }
}
