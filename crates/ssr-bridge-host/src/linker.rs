//! Host function registration.
//!
//! This module fills an [`InteropRegistry`] with every namespace the host
//! exposes to render modules.

use ssr_bridge_common::InteropError;
use ssr_bridge_core::InteropRegistry;
use tracing::debug;

use crate::math::SharedMath;

/// Register all standard host functions.
///
/// This registers the following namespaces:
/// - `SharedMath` - numeric helpers (`add`)
///
/// # Errors
///
/// Returns an error if a function name is registered twice.
pub fn register_all(registry: &mut InteropRegistry) -> Result<(), InteropError> {
    register_math(registry)?;
    Ok(())
}

/// Register the `SharedMath` namespace.
pub fn register_math(registry: &mut InteropRegistry) -> Result<(), InteropError> {
    for function in SharedMath::functions() {
        debug!(
            namespace = SharedMath::NAMESPACE,
            function = function.name(),
            "Registering host function"
        );
        registry.register(SharedMath::NAMESPACE, function)?;
    }
    Ok(())
}

/// Build a registry under `global` with every standard namespace.
pub fn registry(global: &str) -> Result<InteropRegistry, InteropError> {
    let mut registry = InteropRegistry::new(global);
    register_all(&mut registry)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_all() {
        let mut registry = InteropRegistry::new("host");

        let result = register_all(&mut registry);
        assert!(result.is_ok());
        assert!(registry.get("SharedMath", "add").is_some());
    }

    #[test]
    fn test_register_twice_fails() {
        let mut registry = InteropRegistry::new("host");
        register_math(&mut registry).unwrap();

        let result = register_math(&mut registry);
        assert!(matches!(result, Err(InteropError::Duplicate { .. })));
    }

    #[test]
    fn test_registry() {
        let registry = registry("dotnet").unwrap();
        assert_eq!(registry.global(), "dotnet");
        assert_eq!(registry.len(), 1);
    }
}
