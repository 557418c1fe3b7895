//! Host-native functions for ssr-bridge.
//!
//! This crate supplies the function table the bridge publishes into the
//! embedded runtime. Render modules reach it through the configured global
//! (`host` by default):
//!
//! ```js
//! host.SharedMath.add(2, 2); // 4
//! ```
//!
//! # Namespaces
//!
//! - [`math`]: `SharedMath`, numeric helpers shared with the native side

pub mod linker;
pub mod math;

pub use linker::{register_all, registry};
pub use math::SharedMath;
