//! Process-level orchestration of resolution requests.
//!
//! The manager is an explicitly constructed context object: it owns the
//! catalog, the host and fetcher handles, and the roots of every tree
//! resolved through it. Mutating operations take `&mut self`; callers that
//! want concurrent top-level requests must serialize them externally, the
//! catalog has no internal locking.

use crate::catalog::Catalog;
use crate::fetch::PackageFetcher;
use crate::host::{LoadedModule, ModuleHost};
use crate::manifest::{ManifestError, PackageManifest};
use crate::platform::PlatformId;
use crate::resolver::{ResolveError, ResolveOptions, Resolver};
use crate::tree::ModuleTree;
use crate::version::VersionRange;
use log::{debug, info};
use semver::Version;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex};

pub struct ResolutionManager<H: ModuleHost, F: PackageFetcher> {
    catalog: Catalog,
    host: Arc<H>,
    fetcher: F,
    /// Roots of every tree resolved through this manager, shared with the
    /// fallback hook once one is registered.
    roots: Arc<Mutex<Vec<ModuleTree>>>,
    /// Manifest instances already run through the top-level API, by Arc
    /// pointer identity. A manifest is a single-use resolution unit; equal
    /// (id, version) content in a different instance is a different unit.
    requested: HashSet<usize>,
}

impl<H: ModuleHost, F: PackageFetcher> ResolutionManager<H, F> {
    pub fn new(host: Arc<H>, fetcher: F) -> Self {
        ResolutionManager {
            catalog: Catalog::new(),
            host,
            fetcher,
            roots: Arc::new(Mutex::new(Vec::new())),
            requested: HashSet::new(),
        }
    }

    pub fn host(&self) -> &H {
        &self.host
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Register a local package source: a single archive file or a
    /// directory of archives. Returns how many packages were registered.
    #[tracing::instrument(skip(self))]
    pub fn register_source(&mut self, path: &Path) -> Result<usize, ManifestError> {
        if path.is_dir() {
            self.catalog.register_dir(path)
        } else {
            self.catalog.register_file(path).map(|_| 1)
        }
    }

    /// Look up the highest registered version of a package.
    pub fn lookup(&self, id: &str) -> Option<Arc<PackageManifest>> {
        self.catalog.find(id)
    }

    /// Look up the best registered version for a range.
    pub fn lookup_matching(&self, id: &str, range: &VersionRange) -> Option<Arc<PackageManifest>> {
        self.catalog.find_matching(id, range)
    }

    /// Look up an exact package version, fetching and registering it when
    /// absent and a download directory is given.
    pub async fn lookup_or_fetch(
        &mut self,
        id: &str,
        version: &Version,
        download_dir: Option<&Path>,
    ) -> Result<Option<Arc<PackageManifest>>, ResolveError> {
        if let Some(found) = self.catalog.find_exact(id, version) {
            return Ok(Some(found));
        }
        let Some(dir) = download_dir else {
            return Ok(None);
        };
        debug!("Package {}@{} not registered, fetching...", id, version);
        let path = self.fetcher.fetch(id, version, dir).await?;
        Ok(Some(self.catalog.register_file(&path)?))
    }

    /// Resolve a registered package by id (highest version, or the exact
    /// `version` when given) and load its tree.
    pub async fn resolve_package(
        &mut self,
        id: &str,
        version: Option<&Version>,
        target: &PlatformId,
        options: &ResolveOptions,
    ) -> Result<ModuleTree, ResolveError> {
        let manifest = match version {
            Some(v) => self.catalog.find_exact(id, v),
            None => self.catalog.find(id),
        }
        .ok_or_else(|| ResolveError::MissingDependency {
            id: id.to_string(),
            range: version
                .map(|v| VersionRange::exact(v.clone()))
                .unwrap_or_else(|| VersionRange::at_least(Version::new(0, 0, 0))),
            requested_by: "<request>".to_string(),
        })?;
        self.resolve_manifest(&manifest, target, options).await
    }

    /// Resolve one manifest instance and record the resulting tree as a
    /// top-level root. Requesting the same instance twice is an error.
    pub async fn resolve_manifest(
        &mut self,
        manifest: &Arc<PackageManifest>,
        target: &PlatformId,
        options: &ResolveOptions,
    ) -> Result<ModuleTree, ResolveError> {
        let instance = Arc::as_ptr(manifest) as usize;
        if !self.requested.insert(instance) {
            return Err(ResolveError::AlreadyResolved {
                id: manifest.id.clone(),
                version: manifest.version.clone(),
            });
        }

        let mut resolver = Resolver::new(&mut self.catalog, self.host.as_ref(), &self.fetcher, options);
        let tree = resolver.resolve(manifest, target).await?;

        info!(
            "Resolved {}@{}: {} nodes, {} modules",
            tree.id,
            tree.version,
            tree.node_count(),
            tree.flatten().len()
        );
        self.roots.lock().unwrap().push(tree.clone());
        Ok(tree)
    }

    /// Resolve several packages in order against one target. Failure of
    /// any package aborts the whole request; earlier trees stay recorded,
    /// already-bound modules stay bound.
    pub async fn resolve_all(
        &mut self,
        ids: &[String],
        target: &PlatformId,
        options: &ResolveOptions,
    ) -> Result<Vec<ModuleTree>, ResolveError> {
        let mut trees = Vec::with_capacity(ids.len());
        for id in ids {
            trees.push(self.resolve_package(id, None, target, options).await?);
        }
        Ok(trees)
    }

    /// Every module reachable from any resolved root, deduplicated by
    /// exact identity.
    pub fn loaded_modules(&self) -> Vec<LoadedModule> {
        let roots = self.roots.lock().unwrap();
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for root in roots.iter() {
            for module in root.flatten() {
                if seen.insert((module.name.clone(), module.version.clone())) {
                    out.push(module.clone());
                }
            }
        }
        out
    }

    /// Roots of all trees resolved so far, in request order.
    pub fn roots(&self) -> Vec<ModuleTree> {
        self.roots.lock().unwrap().clone()
    }

    /// Install this manager as the host's last-resort module lookup: when
    /// the host misses a module by name, the flattened module set of every
    /// resolved root is searched by exact name. Called explicitly by the
    /// owning application, not during construction.
    pub fn register_fallback_hook(&self) {
        let roots = Arc::clone(&self.roots);
        self.host.register_fallback(Box::new(move |name| {
            let roots = roots.lock().unwrap();
            for root in roots.iter() {
                if let Some(module) = root.find_module(name, None) {
                    return Some(module.clone());
                }
            }
            None
        }));
    }
}
