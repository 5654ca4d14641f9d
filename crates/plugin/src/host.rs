//! Plugin lifecycle: loading, initialization, store registration.
//!
//! A module exports [`INIT_SYMBOL`], which receives a
//! [`PluginRegistrar`] handle. Through the registrar a plugin may
//! provide replacement HSTS/HPKP databases tagged with a priority; the
//! numerically highest priority wins and the built-in stores sit at
//! priority 0.

use std::path::PathBuf;

use fetchguard_core::registry::Registry;
use fetchguard_core::{HstsDatabase, KeyPinDatabase};
use tracing::{debug, warn};

use crate::dl::{DlError, Module};

/// Name of the well-known entry point every module must export.
pub const INIT_SYMBOL: &[u8] = b"fetchguard_plugin_init";

/// Signature of the exported initializer. A nonzero return means the
/// plugin failed to initialize and is unloaded again.
pub type PluginInit = unsafe extern "C" fn(&mut PluginRegistrar) -> i32;

/// Finalizer a plugin may register to run at host shutdown.
pub type Finalizer = Box<dyn FnOnce(i32) + Send>;

/// Handle a plugin uses during initialization to register capabilities.
pub struct PluginRegistrar {
    name: String,
    finalizer: Option<Finalizer>,
    hsts: Vec<(Box<dyn HstsDatabase>, i32)>,
    pins: Vec<(Box<dyn KeyPinDatabase>, i32)>,
}

impl PluginRegistrar {
    fn new(name: String) -> Self {
        Self { name, finalizer: None, hsts: Vec::new(), pins: Vec::new() }
    }

    /// The name this plugin is known as.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a function to run when the host shuts down.
    pub fn set_finalizer(&mut self, f: impl FnOnce(i32) + Send + 'static) {
        self.finalizer = Some(Box::new(f));
    }

    /// Provide a replacement HSTS database with the given priority.
    pub fn provide_hsts_db(&mut self, db: Box<dyn HstsDatabase>, priority: i32) {
        self.hsts.push((db, priority));
    }

    /// Provide a replacement key-pin database with the given priority.
    pub fn provide_key_pin_db(&mut self, db: Box<dyn KeyPinDatabase>, priority: i32) {
        self.pins.push((db, priority));
    }
}

struct LoadedPlugin {
    name: String,
    module: Module,
    finalizer: Option<Finalizer>,
}

/// Owns the loaded plugins and the active database selections.
pub struct PluginHost {
    search_dirs: Vec<PathBuf>,
    plugins: Vec<LoadedPlugin>,
    hsts: Registry<dyn HstsDatabase>,
    pins: Registry<dyn KeyPinDatabase>,
}

impl PluginHost {
    /// Start with the built-in stores active at priority 0.
    pub fn new(hsts: Box<dyn HstsDatabase>, pins: Box<dyn KeyPinDatabase>) -> Self {
        Self {
            search_dirs: Vec::new(),
            plugins: Vec::new(),
            hsts: Registry::new(hsts),
            pins: Registry::new(pins),
        }
    }

    /// Append a directory to the module search path.
    pub fn add_search_dir(&mut self, dir: impl Into<PathBuf>) {
        self.search_dirs.push(dir.into());
    }

    /// Load a module by explicit path and run its initializer. Loading
    /// an already-loaded plugin name is a no-op.
    pub fn load_from_path(&mut self, path: &str) -> Result<(), DlError> {
        let name = plugin_name_from_path(path);
        if self.is_loaded(&name) {
            debug!(name, "plugin already loaded");
            return Ok(());
        }

        let module = Module::open(path)?;
        let mut registrar = PluginRegistrar::new(name.clone());
        {
            // SAFETY: INIT_SYMBOL is the documented entry point with
            // the documented signature; the symbol does not outlive
            // `module`.
            let init: libloading::Symbol<'_, PluginInit> = unsafe { module.lookup(INIT_SYMBOL)? };
            let rc = unsafe { init(&mut registrar) };
            if rc != 0 {
                warn!(name, rc, "plugin failed to initialize");
                return Err(DlError::InitFailed(name));
            }
        }

        for (db, priority) in registrar.hsts {
            if self.hsts.register(db, priority) {
                debug!(name, priority, "plugin HSTS database selected");
            }
        }
        for (db, priority) in registrar.pins {
            if self.pins.register(db, priority) {
                debug!(name, priority, "plugin HPKP database selected");
            }
        }

        self.plugins.push(LoadedPlugin { name, module, finalizer: registrar.finalizer });
        Ok(())
    }

    /// Load a module by name, searching the configured directories for
    /// a platform-named object file (`lib<name>.so` on Linux).
    pub fn load_from_name(&mut self, name: &str) -> Result<(), DlError> {
        if self.is_loaded(name) {
            return Ok(());
        }
        let file_name = module_file_name(name);
        let found = self.search_dirs.iter().map(|dir| dir.join(&file_name)).find(|candidate| candidate.exists());
        match found {
            Some(path) => self.load_from_path(&path.display().to_string()),
            None => Err(DlError::NotFound(name.to_string())),
        }
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.plugins.iter().any(|p| p.name == name)
    }

    pub fn loaded_names(&self) -> impl Iterator<Item = &str> {
        self.plugins.iter().map(|p| p.name.as_str())
    }

    /// The active HSTS database after all registrations so far.
    pub fn hsts_db(&self) -> &dyn HstsDatabase {
        self.hsts.active()
    }

    /// The active key-pin database after all registrations so far.
    pub fn key_pin_db(&self) -> &dyn KeyPinDatabase {
        self.pins.active()
    }

    /// Run every plugin's finalizer, then unload the modules.
    pub fn finalize(mut self, exit_code: i32) {
        // Databases may be plugin-supplied; drop them before the code
        // that backs them is unmapped.
        drop(self.hsts);
        drop(self.pins);
        for plugin in self.plugins.drain(..) {
            if let Some(finalizer) = plugin.finalizer {
                finalizer(exit_code);
            }
            debug!(name = plugin.name, "unloading plugin");
            drop(plugin.module);
        }
    }
}

/// Platform object-file name for a plugin: `lib<name>.so`,
/// `lib<name>.dylib` or `<name>.dll`.
fn module_file_name(name: &str) -> String {
    format!("{}{}{}", std::env::consts::DLL_PREFIX, name, std::env::consts::DLL_SUFFIX)
}

/// Plugin name for an object-file path: file stem minus the platform
/// prefix.
fn plugin_name_from_path(path: &str) -> String {
    let stem = std::path::Path::new(path).file_stem().and_then(|s| s.to_str()).unwrap_or(path);
    stem.strip_prefix(std::env::consts::DLL_PREFIX).filter(|s| !s.is_empty()).unwrap_or(stem).to_string()
}
