//! Workspace placeholder crate.
//!
//! This crate exposes feature flags that map to the individual workspace
//! crates (`core-service`, `core-auth`, `core-runtime`). Host applications can
//! depend on `portal-workspace` and enable the documented features without
//! wiring each crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_service as service;

#[cfg(feature = "components")]
pub use core_auth as auth;

#[cfg(feature = "components")]
pub use core_runtime as runtime;
