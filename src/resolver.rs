//! The dependency resolver.
//!
//! Resolution walks a manifest's dependency graph depth-first: pick the
//! dependency group nearest the target platform, satisfy each declaration
//! from the catalog (fetching on miss when allowed), recurse, then bind the
//! package's own payload files. The finished tree is cached on the catalog
//! entry so later references to the same package replay it.

use crate::catalog::Catalog;
use crate::fetch::{FetchError, PackageFetcher};
use crate::host::{BindError, ModuleHost};
use crate::manifest::{Dependency, ManifestError, PackageManifest};
use crate::platform::PlatformId;
use crate::tree::ModuleTree;
use crate::version::VersionRange;
use log::{debug, info};
use semver::Version;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Dependency namespaces that only matter to a compiler or test harness.
/// Declarations under these ids are never resolved at runtime.
pub const DEFAULT_BUILD_ONLY_NAMESPACES: &[&str] = &["build", "analyzers"];

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("package '{id}' declares no platform compatible with {target}")]
    NoCompatiblePlatform { id: String, target: String },
    #[error(
        "missing dependency: '{requested_by}' requires '{id}' {range}, \
         which is not registered, already loaded, or fetchable"
    )]
    MissingDependency {
        id: String,
        range: VersionRange,
        requested_by: String,
    },
    #[error("no version of '{id}' satisfies {range} (available: {available})")]
    IncompatibleVersions {
        id: String,
        range: VersionRange,
        available: String,
    },
    #[error("package {id}@{version} was already resolved; a manifest is a single-use resolution unit")]
    AlreadyResolved { id: String, version: Version },
    #[error("dependency cycle detected: {chain}")]
    CyclicDependency { chain: String },
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Settings for one resolution request.
#[derive(Debug, Clone)]
pub struct ResolveOptions {
    /// Fetch packages missing from the catalog from the remote registry.
    pub download_missing: bool,
    /// Where fetched artifacts are stored.
    pub download_dir: PathBuf,
    /// Dependency namespaces skipped as build-time-only.
    pub build_only_namespaces: Vec<String>,
    /// Turn genuine dependency cycles into an error instead of recursing
    /// until the stack runs out.
    pub detect_cycles: bool,
}

impl Default for ResolveOptions {
    fn default() -> Self {
        ResolveOptions {
            download_missing: false,
            download_dir: default_download_dir(),
            build_only_namespaces: DEFAULT_BUILD_ONLY_NAMESPACES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            detect_cycles: true,
        }
    }
}

/// Default location for fetched artifacts.
pub fn default_download_dir() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("pkgload").join("artifacts"))
        .unwrap_or_else(|| std::env::temp_dir().join("pkgload"))
}

/// One resolution run over a catalog. The resolver holds the catalog
/// mutably for its whole run; concurrent runs over one catalog are the
/// caller's problem to serialize.
pub struct Resolver<'a> {
    catalog: &'a mut Catalog,
    host: &'a dyn ModuleHost,
    fetcher: &'a dyn PackageFetcher,
    options: &'a ResolveOptions,
    in_flight: Vec<(String, Version)>,
}

impl<'a> Resolver<'a> {
    pub fn new(
        catalog: &'a mut Catalog,
        host: &'a dyn ModuleHost,
        fetcher: &'a dyn PackageFetcher,
        options: &'a ResolveOptions,
    ) -> Self {
        Resolver {
            catalog,
            host,
            fetcher,
            options,
            in_flight: Vec::new(),
        }
    }

    /// Resolve `manifest` against `target` and return the loaded tree.
    #[tracing::instrument(skip(self, manifest), fields(id = %manifest.id, version = %manifest.version))]
    pub async fn resolve(
        &mut self,
        manifest: &Arc<PackageManifest>,
        target: &PlatformId,
    ) -> Result<ModuleTree, ResolveError> {
        info!(
            "Resolving {}@{} for platform {}...",
            manifest.id, manifest.version, target
        );
        self.resolve_node(Arc::clone(manifest), target.clone()).await
    }

    // Recursion through an async fn needs the future boxed.
    fn resolve_node(
        &mut self,
        manifest: Arc<PackageManifest>,
        target: PlatformId,
    ) -> Pin<Box<dyn Future<Output = Result<ModuleTree, ResolveError>> + Send + '_>> {
        Box::pin(async move {
            let key = (manifest.id.clone(), manifest.version.clone());
            if self.options.detect_cycles && self.in_flight.contains(&key) {
                let chain = self
                    .in_flight
                    .iter()
                    .chain(std::iter::once(&key))
                    .map(|(id, version)| format!("{id}@{version}"))
                    .collect::<Vec<_>>()
                    .join(" -> ");
                return Err(ResolveError::CyclicDependency { chain });
            }

            self.in_flight.push(key);
            let result = self.resolve_steps(&manifest, &target).await;
            self.in_flight.pop();
            result
        })
    }

    async fn resolve_steps(
        &mut self,
        manifest: &PackageManifest,
        target: &PlatformId,
    ) -> Result<ModuleTree, ResolveError> {
        // Step 1: reduce the declared platforms to the one nearest the
        // target. A manifest that declares no dependency groups at all is a
        // plain leaf, not a platform mismatch.
        let selected_group = if manifest.dependency_groups.is_empty() {
            None
        } else {
            Some(manifest.dependency_group_for(target).ok_or_else(|| {
                ResolveError::NoCompatiblePlatform {
                    id: manifest.id.clone(),
                    target: target.to_string(),
                }
            })?)
        };

        // Dependencies come from the selected declared platform; children
        // resolve against that platform, not the original target. An
        // any-platform group keeps the incoming target.
        let node_platform = selected_group
            .and_then(|g| g.platform.clone())
            .unwrap_or_else(|| target.clone());
        debug!(
            "Selected platform {} for {}@{}",
            node_platform, manifest.id, manifest.version
        );

        let mut children = Vec::new();
        let dependencies = selected_group.map(|g| g.dependencies.as_slice()).unwrap_or(&[]);
        for dep in dependencies {
            self.resolve_dependency(manifest, dep, &node_platform, &mut children)
                .await?;
        }

        // Step 3: bind this package's own payload, if it ships any for the
        // selected platform.
        let mut modules = Vec::new();
        if let Some(file_group) = manifest.file_group_for(&node_platform) {
            for file in file_group.loadable_files() {
                let bytes =
                    self.catalog
                        .read_file_bytes(&manifest.id, &manifest.version, file)?;
                let module = self.host.bind(&module_name(file), &manifest.version, &bytes)?;
                modules.push(module);
            }
        }

        // Step 4: children and modules are complete; the node is finalized
        // exactly once and cached for later references.
        let tree = ModuleTree {
            id: manifest.id.clone(),
            version: manifest.version.clone(),
            managed: true,
            modules,
            children,
        };
        self.catalog
            .store_tree(&manifest.id, &manifest.version, tree.clone());
        Ok(tree)
    }

    /// Step 2 for one declaration. The loop retries the same declaration
    /// after a fetch registers new candidates; one fetch attempt only.
    async fn resolve_dependency(
        &mut self,
        requesting: &PackageManifest,
        dep: &Dependency,
        node_platform: &PlatformId,
        children: &mut Vec<ModuleTree>,
    ) -> Result<(), ResolveError> {
        if self.is_build_only(&dep.id) {
            debug!("Skipping build-only dependency '{}'", dep.id);
            return Ok(());
        }

        let mut fetched = false;
        loop {
            let versions = self.catalog.versions_of(&dep.id);

            if versions.is_empty() {
                // Nothing registered: code the host already has bound wins
                // over any fetch.
                if let Some(module) = self.host.find_loaded(&dep.id, &dep.range) {
                    debug!("Reusing already-loaded module {}", module);
                    children.push(ModuleTree::unmanaged_leaf(module));
                    return Ok(());
                }
                if !self.options.download_missing || fetched {
                    return Err(ResolveError::MissingDependency {
                        id: dep.id.clone(),
                        range: dep.range.clone(),
                        requested_by: requesting.id.clone(),
                    });
                }
                self.fetch_dependency(dep).await?;
                fetched = true;
                continue;
            }

            let best = match dep.range.find_best_match(versions.iter()) {
                Some(version) => version.clone(),
                None => {
                    if !self.options.download_missing || fetched {
                        let mut available = versions.clone();
                        available.sort();
                        return Err(ResolveError::IncompatibleVersions {
                            id: dep.id.clone(),
                            range: dep.range.clone(),
                            available: available
                                .iter()
                                .map(ToString::to_string)
                                .collect::<Vec<_>>()
                                .join(", "),
                        });
                    }
                    self.fetch_dependency(dep).await?;
                    fetched = true;
                    continue;
                }
            };

            let candidate = self
                .catalog
                .find_exact(&dep.id, &best)
                .ok_or_else(|| ManifestError::EntryNotFound(format!("{}@{}", dep.id, best)))?;

            // A linking package that also declares nothing contributes
            // nothing at all.
            if candidate.is_linking_package() && candidate.declares_no_dependencies() {
                debug!(
                    "Skipping no-op linking package {}@{}",
                    candidate.id, candidate.version
                );
                return Ok(());
            }

            // The host already has this exact package bound: reuse the
            // binding instead of loading the payload a second time.
            if let Some(module) = self
                .host
                .find_loaded_exact(&candidate.id, &candidate.version)
            {
                debug!("Module {} already bound in host, reusing", module);
                if let Some(tree) = self.catalog.cached_tree(&candidate.id, &candidate.version) {
                    children.push(tree.clone());
                } else {
                    children.push(ModuleTree::unmanaged_leaf(module));
                }
                return Ok(());
            }

            // A package resolved earlier in this process replays its cached
            // tree; each reference materializes its own copy.
            if let Some(tree) = self.catalog.cached_tree(&candidate.id, &candidate.version) {
                debug!(
                    "Reusing cached tree for {}@{}",
                    candidate.id, candidate.version
                );
                children.push(tree.clone());
                return Ok(());
            }

            let child = self
                .resolve_node(candidate, node_platform.clone())
                .await?;
            children.push(child);
            return Ok(());
        }
    }

    /// Fetch a declaration's package at the range's upper bound when it has
    /// one, else its lower bound, and register the artifact.
    async fn fetch_dependency(&mut self, dep: &Dependency) -> Result<(), ResolveError> {
        let version = match dep.range.upper_bound().or_else(|| dep.range.lower_bound()) {
            Some(v) => v.clone(),
            // Unreachable for any parseable range, which always has a bound.
            None => {
                return Err(ResolveError::MissingDependency {
                    id: dep.id.clone(),
                    range: dep.range.clone(),
                    requested_by: String::new(),
                });
            }
        };

        info!("Fetching missing dependency {}@{}...", dep.id, version);
        let path = self
            .fetcher
            .fetch(&dep.id, &version, &self.options.download_dir)
            .await?;
        self.catalog.register_file(&path)?;
        Ok(())
    }

    fn is_build_only(&self, id: &str) -> bool {
        let namespace = id.split('.').next().unwrap_or(id);
        self.options
            .build_only_namespaces
            .iter()
            .any(|ns| ns.eq_ignore_ascii_case(namespace))
    }
}

/// Module name for a payload file: the file stem of its archive path.
fn module_name(file: &str) -> String {
    std::path::Path::new(file)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.to_string())
}
