//! Dynamic loading abstraction for trust-store modules.

use std::path::{MAIN_SEPARATOR, Path, PathBuf};

use thiserror::Error;

/// Errors from the dynamic loader and the plugin lifecycle.
#[derive(Debug, Error)]
pub enum DlError {
    #[error("failed to open module '{path}': {reason}")]
    Open { path: String, reason: String },

    #[error("symbol '{symbol}' not found: {reason}")]
    Symbol { symbol: String, reason: String },

    #[error("module '{0}' not found in any search directory")]
    NotFound(String),

    #[error("module '{0}' failed to initialize")]
    InitFailed(String),

    /// A deferred error slot was written while already holding a
    /// message. This is a logic bug in the caller, not a runtime
    /// condition; debug builds assert on it.
    #[error("conflicting error state: '{new}' over '{existing}'")]
    Conflicting { existing: String, new: String },
}

/// Deferred error carrier for callbacks that cannot return a `Result`
/// across the module boundary.
///
/// The previous message must be taken before a new one is recorded.
#[derive(Debug, Default)]
pub struct ErrorSlot {
    msg: Option<String>,
}

impl ErrorSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error message.
    ///
    /// Piling a new error on top of an unread one indicates the caller
    /// failed to clear a prior error before reuse: debug builds panic,
    /// release builds get [`DlError::Conflicting`].
    pub fn set(&mut self, msg: impl Into<String>) -> Result<(), DlError> {
        let msg = msg.into();
        if let Some(existing) = &self.msg {
            debug_assert!(false, "piling up error '{msg}' over '{existing}'");
            return Err(DlError::Conflicting { existing: existing.clone(), new: msg });
        }
        self.msg = Some(msg);
        Ok(())
    }

    pub fn is_set(&self) -> bool {
        self.msg.is_some()
    }

    /// Take the recorded message, clearing the slot.
    pub fn take(&mut self) -> Option<String> {
        self.msg.take()
    }
}

/// A loaded platform module. The underlying object is closed on drop.
pub struct Module {
    lib: libloading::Library,
    path: PathBuf,
}

impl Module {
    /// Open an object file.
    ///
    /// A bare file name gets a `./` prefix so the platform loader does
    /// not consult its default library search path.
    pub fn open(name: &str) -> Result<Self, DlError> {
        let path = if name.contains(MAIN_SEPARATOR) || name.contains('/') {
            PathBuf::from(name)
        } else {
            Path::new(".").join(name)
        };
        // SAFETY: loading a module runs its initialization code; the
        // caller vouches for the module file.
        let lib = unsafe { libloading::Library::new(&path) }.map_err(|e| DlError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { lib, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a symbol.
    ///
    /// # Safety
    ///
    /// `T` must be the symbol's real type; the returned value must not
    /// outlive this module.
    pub unsafe fn lookup<T>(&self, symbol: &[u8]) -> Result<libloading::Symbol<'_, T>, DlError> {
        unsafe { self.lib.get(symbol) }.map_err(|e| DlError::Symbol {
            symbol: String::from_utf8_lossy(symbol).into_owned(),
            reason: e.to_string(),
        })
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module").field("path", &self.path).finish_non_exhaustive()
    }
}
