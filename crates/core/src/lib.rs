//! Trust-policy stores for an HTTP retrieval client.
//!
//! This crate records per-host security decisions learned from HTTP
//! responses and enforces them on later connections:
//!
//! - HSTS host upgrade records (RFC 6797)
//! - HPKP certificate pin sets (RFC 7469)
//!
//! Both caches follow the same pattern: a mutex-guarded map of expiring
//! records keyed by host, persisted to a flat text file that is re-read
//! only when its modification time changes. The public operations of each
//! cache are defined by a capability trait ([`HstsDatabase`],
//! [`KeyPinDatabase`]) so an external module can substitute its own store
//! implementation (see the `fetchguard-plugin` crate).

pub mod config;
pub mod domain;
pub mod error;
pub mod hpkp;
pub mod hsts;
pub mod persist;
pub mod registry;
pub mod store;
pub mod time;

pub use config::{ConfigError, TrustConfig};
pub use error::Error;
pub use hpkp::{HpkpRecord, HpkpStore, KeyPinDatabase, Pin, PinVerdict};
pub use hsts::{HstsDatabase, HstsRecord, HstsStore};
pub use persist::LoadOutcome;
pub use registry::Registry;
