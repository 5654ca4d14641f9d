//! Priority-based selection of the active database implementation.
//!
//! An external module can supply a replacement store for either cache.
//! Every candidate carries an integer priority; the built-in stores
//! register at priority 0 and the highest-priority registration is the
//! one the HTTP client actually queries. At most one implementation is
//! active per cache kind, and the client resolves it once rather than
//! per call.

use tracing::debug;

/// Holds the currently selected implementation of a capability trait.
pub struct Registry<T: ?Sized> {
    active: Box<T>,
    priority: i32,
}

impl<T: ?Sized> Registry<T> {
    /// Start with the built-in implementation at priority 0.
    pub fn new(builtin: Box<T>) -> Self {
        Self { active: builtin, priority: 0 }
    }

    /// Offer a replacement implementation.
    ///
    /// It becomes active when its priority is at least the current one
    /// (the latest registration wins ties); the displaced
    /// implementation is dropped. Returns whether the candidate was
    /// selected.
    pub fn register(&mut self, candidate: Box<T>, priority: i32) -> bool {
        if priority < self.priority {
            debug!(priority, active = self.priority, "ignoring lower-priority database");
            return false;
        }
        self.active = candidate;
        self.priority = priority;
        true
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// The implementation selected so far.
    pub fn active(&self) -> &T {
        &self.active
    }

    /// Consume the registry, yielding the selected implementation.
    pub fn into_active(self) -> Box<T> {
        self.active
    }
}

impl<T: ?Sized> std::fmt::Debug for Registry<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("priority", &self.priority).finish_non_exhaustive()
    }
}
