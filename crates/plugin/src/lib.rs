//! Loadable trust-store modules for fetchguard.
//!
//! An external module can replace either built-in policy store. This
//! crate provides:
//!
//! - A thin dynamic-loading abstraction (open / lookup / close) with
//!   human-readable errors
//! - The plugin lifecycle: a well-known init symbol, capability
//!   registration by priority, finalizers run at shutdown

pub mod dl;
pub mod host;

pub use dl::{DlError, ErrorSlot, Module};
pub use host::{Finalizer, INIT_SYMBOL, PluginHost, PluginInit, PluginRegistrar};
