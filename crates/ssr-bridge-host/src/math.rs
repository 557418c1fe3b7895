//! `SharedMath` namespace.
//!
//! Numeric helpers whose results must match between native code and render
//! modules.

use ssr_bridge_common::InteropError;
use ssr_bridge_core::{ArgKind, HostFunction, HostValue};

/// The `SharedMath` namespace.
pub struct SharedMath;

impl SharedMath {
    /// Namespace name seen by scripts.
    pub const NAMESPACE: &'static str = "SharedMath";

    /// Add two numbers.
    pub fn add(a: f64, b: f64) -> f64 {
        a + b
    }

    /// All functions of the namespace.
    pub fn functions() -> Vec<HostFunction> {
        vec![HostFunction::new(
            "add",
            vec![ArgKind::Number, ArgKind::Number],
            |args| Ok(HostValue::Number(Self::add(number(args, 0)?, number(args, 1)?))),
        )]
    }
}

fn number(args: &[HostValue], index: usize) -> Result<f64, InteropError> {
    args.get(index)
        .and_then(HostValue::as_number)
        .ok_or(InteropError::ArgumentType {
            index,
            expected: "number",
        })
}
