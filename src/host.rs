//! The host-process module boundary.
//!
//! `ModuleHost` abstracts what the running process can do with compiled
//! modules: query what is already bound, bind new payload bytes, and expose
//! a last-resort lookup hook. `LibraryHost` is the real implementation over
//! the platform dynamic loader; tests use the generated mock.

use crate::version::VersionRange;
use log::{debug, info};
use semver::Version;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BindError {
    #[error("payload for '{0}' is not a shared object")]
    NotASharedObject(String),
    #[error("failed to materialize module payload: {0}")]
    Io(#[from] std::io::Error),
    #[error("host loader rejected module '{name}': {reason}")]
    Load { name: String, reason: String },
}

/// Handle to code bound into the running process. Identity is the full
/// (name, version) pair; the handle itself is a cheap clone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct LoadedModule {
    pub name: String,
    pub version: Version,
}

impl fmt::Display for LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// Hook consulted when the host fails to locate a module by name through
/// its normal means.
pub type FallbackHook = Box<dyn Fn(&str) -> Option<LoadedModule> + Send + Sync>;

/// Operations the resolver needs from the host runtime.
#[cfg_attr(test, mockall::automock)]
pub trait ModuleHost: Send + Sync {
    /// Find an already-bound module whose name matches and whose version
    /// satisfies `range`.
    fn find_loaded(&self, name: &str, range: &VersionRange) -> Option<LoadedModule>;

    /// Find an already-bound module by exact identity.
    fn find_loaded_exact(&self, name: &str, version: &Version) -> Option<LoadedModule>;

    /// Bind payload bytes into the process. Binding an identity that is
    /// already bound returns the existing handle instead of loading twice.
    fn bind(&self, name: &str, version: &Version, bytes: &[u8]) -> Result<LoadedModule, BindError>;

    /// Install the last-resort lookup hook. At most one hook is active;
    /// a second registration replaces the first.
    fn register_fallback(&self, hook: FallbackHook);
}

struct LibraryHostState {
    // Libraries are intentionally kept for the process lifetime; there is
    // no unload path once code is bound.
    loaded: HashMap<(String, Version), libloading::Library>,
    fallback: Option<FallbackHook>,
}

/// Real host over the platform dynamic loader. Payload bytes are
/// materialized under `bind_dir` before loading, since the loader works on
/// files.
pub struct LibraryHost {
    bind_dir: PathBuf,
    state: Mutex<LibraryHostState>,
}

impl LibraryHost {
    pub fn new(bind_dir: PathBuf) -> Self {
        LibraryHost {
            bind_dir,
            state: Mutex::new(LibraryHostState {
                loaded: HashMap::new(),
                fallback: None,
            }),
        }
    }

    /// Resolve a module by name the way the host loader would: bound
    /// modules first, then the registered fallback hook.
    pub fn resolve_by_name(&self, name: &str) -> Option<LoadedModule> {
        let state = self.state.lock().unwrap();
        if let Some((module_name, version)) = state
            .loaded
            .keys()
            .filter(|(n, _)| n == name)
            .max_by(|a, b| a.1.cmp(&b.1))
        {
            return Some(LoadedModule {
                name: module_name.clone(),
                version: version.clone(),
            });
        }
        state.fallback.as_ref().and_then(|hook| hook(name))
    }

    /// Names and versions currently bound, for diagnostics.
    pub fn bound_modules(&self) -> Vec<LoadedModule> {
        let state = self.state.lock().unwrap();
        let mut modules: Vec<_> = state
            .loaded
            .keys()
            .map(|(name, version)| LoadedModule {
                name: name.clone(),
                version: version.clone(),
            })
            .collect();
        modules.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.version.cmp(&b.version)));
        modules
    }

    fn verify_shared_object(name: &str, bytes: &[u8]) -> Result<(), BindError> {
        match goblin::Object::parse(bytes) {
            Ok(goblin::Object::Elf(_))
            | Ok(goblin::Object::PE(_))
            | Ok(goblin::Object::Mach(_)) => Ok(()),
            _ => Err(BindError::NotASharedObject(name.to_string())),
        }
    }
}

impl ModuleHost for LibraryHost {
    fn find_loaded(&self, name: &str, range: &VersionRange) -> Option<LoadedModule> {
        let state = self.state.lock().unwrap();
        let versions: Vec<&Version> = state
            .loaded
            .keys()
            .filter(|(n, _)| n == name)
            .map(|(_, v)| v)
            .collect();
        range
            .find_best_match(versions.into_iter())
            .map(|version| LoadedModule {
                name: name.to_string(),
                version: version.clone(),
            })
    }

    fn find_loaded_exact(&self, name: &str, version: &Version) -> Option<LoadedModule> {
        let state = self.state.lock().unwrap();
        state
            .loaded
            .contains_key(&(name.to_string(), version.clone()))
            .then(|| LoadedModule {
                name: name.to_string(),
                version: version.clone(),
            })
    }

    #[tracing::instrument(skip(self, bytes))]
    fn bind(&self, name: &str, version: &Version, bytes: &[u8]) -> Result<LoadedModule, BindError> {
        let key = (name.to_string(), version.clone());
        {
            let state = self.state.lock().unwrap();
            if state.loaded.contains_key(&key) {
                debug!("Module {}@{} already bound, reusing handle", name, version);
                return Ok(LoadedModule {
                    name: name.to_string(),
                    version: version.clone(),
                });
            }
        }

        Self::verify_shared_object(name, bytes)?;

        std::fs::create_dir_all(&self.bind_dir)?;
        let file_name = format!("{}-{}.{}", name, version, std::env::consts::DLL_EXTENSION);
        let path = self.bind_dir.join(file_name);
        std::fs::write(&path, bytes)?;

        info!("Binding module {}@{} from {:?}...", name, version, path);
        // SAFETY: loading a shared object runs its initializers in-process.
        // That is the point of this crate; callers opt in by resolving.
        let library = unsafe { libloading::Library::new(&path) }.map_err(|e| BindError::Load {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        let mut state = self.state.lock().unwrap();
        state.loaded.insert(key, library);
        Ok(LoadedModule {
            name: name.to_string(),
            version: version.clone(),
        })
    }

    fn register_fallback(&self, hook: FallbackHook) {
        let mut state = self.state.lock().unwrap();
        state.fallback = Some(hook);
    }
}
