//! The package catalog: every archive the process knows about.
//!
//! Entries are added from local sources (single archives or directories of
//! archives) and from fetched artifacts; nothing is ever removed. Each
//! entry caches the module tree produced the first time its package is
//! resolved, so later references replay the cached result instead of
//! re-walking the archive.

use crate::archive::ArchiveReaderImpl;
use crate::manifest::{ManifestError, PackageManifest};
use crate::tree::ModuleTree;
use glob::glob;
use log::{debug, info, warn};
use semver::Version;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Archive name patterns recognized during directory registration.
const ARCHIVE_PATTERNS: &[&str] = &["*.pkg", "*.zip", "*.tar.gz", "*.tgz"];

/// One known package: its archive on disk, its parsed manifest, and the
/// cached resolution result once the package has been resolved.
pub struct CatalogEntry {
    pub archive_path: PathBuf,
    pub manifest: Arc<PackageManifest>,
    pub resolved: Option<ModuleTree>,
}

/// Mutable registry of packages known to the process. Package ids compare
/// case-insensitively; at most one entry exists per (id, version).
#[derive(Default)]
pub struct Catalog {
    entries: Vec<CatalogEntry>,
    reader: ArchiveReaderImpl,
}

impl Catalog {
    pub fn new() -> Self {
        Catalog::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.entries.iter()
    }

    /// Register one archive file. Re-registering an (id, version) already
    /// present keeps the existing entry.
    #[tracing::instrument(skip(self))]
    pub fn register_file(&mut self, path: &Path) -> Result<Arc<PackageManifest>, ManifestError> {
        let manifest = Arc::new(self.reader.read_manifest(path)?);
        if let Some(existing) = self.find_exact(&manifest.id, &manifest.version) {
            debug!(
                "Package {}@{} already registered, keeping existing entry",
                manifest.id, manifest.version
            );
            return Ok(existing);
        }

        info!(
            "Registered package {}@{} from {:?}",
            manifest.id, manifest.version, path
        );
        self.entries.push(CatalogEntry {
            archive_path: path.to_path_buf(),
            manifest: Arc::clone(&manifest),
            resolved: None,
        });
        Ok(manifest)
    }

    /// Register every recognized archive in a directory. Unreadable
    /// archives are skipped with a warning; the count of newly readable
    /// registrations is returned.
    #[tracing::instrument(skip(self))]
    pub fn register_dir(&mut self, dir: &Path) -> Result<usize, ManifestError> {
        let mut registered = 0;
        for pattern in ARCHIVE_PATTERNS {
            let full_pattern = dir.join(pattern);
            let paths = glob(&full_pattern.to_string_lossy())
                .map_err(|e| ManifestError::Archive(e.to_string()))?;
            for path in paths.flatten() {
                match self.register_file(&path) {
                    Ok(_) => registered += 1,
                    Err(e) => warn!("Skipping unreadable archive {:?}: {}", path, e),
                }
            }
        }
        Ok(registered)
    }

    /// All known versions of a package, unsorted.
    pub fn versions_of(&self, id: &str) -> Vec<Version> {
        self.entries
            .iter()
            .filter(|e| e.manifest.id.eq_ignore_ascii_case(id))
            .map(|e| e.manifest.version.clone())
            .collect()
    }

    /// The highest registered version of a package.
    pub fn find(&self, id: &str) -> Option<Arc<PackageManifest>> {
        self.entries
            .iter()
            .filter(|e| e.manifest.id.eq_ignore_ascii_case(id))
            .max_by(|a, b| a.manifest.version.cmp(&b.manifest.version))
            .map(|e| Arc::clone(&e.manifest))
    }

    pub fn find_exact(&self, id: &str, version: &Version) -> Option<Arc<PackageManifest>> {
        self.entry_of(id, version).map(|e| Arc::clone(&e.manifest))
    }

    /// The best-matching registered version for a range.
    pub fn find_matching(
        &self,
        id: &str,
        range: &crate::version::VersionRange,
    ) -> Option<Arc<PackageManifest>> {
        let versions = self.versions_of(id);
        let best = range.find_best_match(versions.iter())?.clone();
        self.find_exact(id, &best)
    }

    /// Read one payload file out of a registered package's archive.
    pub fn read_file_bytes(
        &self,
        id: &str,
        version: &Version,
        entry: &str,
    ) -> Result<Vec<u8>, ManifestError> {
        let catalog_entry = self
            .entry_of(id, version)
            .ok_or_else(|| ManifestError::EntryNotFound(format!("{id}@{version}")))?;
        self.reader
            .read_file_bytes(&catalog_entry.archive_path, entry)
    }

    pub fn cached_tree(&self, id: &str, version: &Version) -> Option<&ModuleTree> {
        self.entry_of(id, version)?.resolved.as_ref()
    }

    /// Remember a finished resolution for a package.
    pub fn store_tree(&mut self, id: &str, version: &Version, tree: ModuleTree) {
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.manifest.id.eq_ignore_ascii_case(id) && &e.manifest.version == version)
        {
            entry.resolved = Some(tree);
        }
    }

    fn entry_of(&self, id: &str, version: &Version) -> Option<&CatalogEntry> {
        self.entries
            .iter()
            .find(|e| e.manifest.id.eq_ignore_ascii_case(id) && &e.manifest.version == version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::test_fixtures::write_zip_package;
    use tempfile::tempdir;

    fn manifest_bytes(id: &str, version: &str) -> Vec<u8> {
        format!(r#"{{"id": "{id}", "version": "{version}"}}"#).into_bytes()
    }

    fn write_package(dir: &Path, id: &str, version: &str) -> PathBuf {
        let path = dir.join(format!("{id}.{version}.pkg"));
        write_zip_package(
            &path,
            &[
                ("manifest.json", manifest_bytes(id, version).as_slice()),
                ("lib/payload.so", b"\x7fELF"),
            ],
        );
        path
    }

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn test_register_file_and_lookup() {
        let dir = tempdir().unwrap();
        let path = write_package(dir.path(), "acme.geo", "1.2.0");

        let mut catalog = Catalog::new();
        let manifest = catalog.register_file(&path).unwrap();
        assert_eq!(manifest.id, "acme.geo");
        assert_eq!(catalog.len(), 1);

        assert!(catalog.find("acme.geo").is_some());
        assert!(catalog.find("ACME.GEO").is_some());
        assert!(catalog.find("other").is_none());
        assert!(catalog.find_exact("acme.geo", &v("1.2.0")).is_some());
        assert!(catalog.find_exact("acme.geo", &v("1.3.0")).is_none());
    }

    #[test]
    fn test_register_duplicate_keeps_existing(){
        let dir = tempdir().unwrap();
        let path = write_package(dir.path(), "acme.geo", "1.2.0");

        let mut catalog = Catalog::new();
        catalog.register_file(&path).unwrap();
        catalog.register_file(&path).unwrap();
        assert_eq!(catalog.len(), 1);
    }

    #[test]
    fn test_register_dir_discovers_archives() {
        let dir = tempdir().unwrap();
        write_package(dir.path(), "acme.geo", "1.0.0");
        write_package(dir.path(), "acme.geo", "1.5.0");
        write_package(dir.path(), "acme.base", "2.0.0");
        std::fs::write(dir.path().join("notes.txt"), "not an archive").unwrap();
        // A corrupt archive is skipped, not fatal.
        std::fs::write(dir.path().join("broken.pkg"), "garbage").unwrap();

        let mut catalog = Catalog::new();
        let registered = catalog.register_dir(dir.path()).unwrap();
        assert_eq!(registered, 3);
        assert_eq!(catalog.versions_of("acme.geo").len(), 2);
    }

    #[test]
    fn test_find_returns_highest_version() {
        let dir = tempdir().unwrap();
        let mut catalog = Catalog::new();
        catalog
            .register_file(&write_package(dir.path(), "acme.geo", "1.0.0"))
            .unwrap();
        catalog
            .register_file(&write_package(dir.path(), "acme.geo", "2.1.0"))
            .unwrap();
        catalog
            .register_file(&write_package(dir.path(), "acme.geo", "1.5.0"))
            .unwrap();

        let best = catalog.find("acme.geo").unwrap();
        assert_eq!(best.version, v("2.1.0"));
    }

    #[test]
    fn test_find_matching_range() {
        let dir = tempdir().unwrap();
        let mut catalog = Catalog::new();
        for version in ["1.0.0", "1.5.0", "2.0.0"] {
            catalog
                .register_file(&write_package(dir.path(), "acme.geo", version))
                .unwrap();
        }

        let range = "[1.0.0,2.0.0)".parse().unwrap();
        let found = catalog.find_matching("acme.geo", &range).unwrap();
        assert_eq!(found.version, v("1.5.0"));

        let range = "[3.0.0,)".parse().unwrap();
        assert!(catalog.find_matching("acme.geo", &range).is_none());
    }

    #[test]
    fn test_read_file_bytes() {
        let dir = tempdir().unwrap();
        let mut catalog = Catalog::new();
        catalog
            .register_file(&write_package(dir.path(), "acme.geo", "1.0.0"))
            .unwrap();

        let bytes = catalog
            .read_file_bytes("acme.geo", &v("1.0.0"), "lib/payload.so")
            .unwrap();
        assert_eq!(bytes, b"\x7fELF");

        assert!(catalog
            .read_file_bytes("missing", &v("1.0.0"), "lib/payload.so")
            .is_err());
    }

    #[test]
    fn test_tree_cache_round_trip() {
        let dir = tempdir().unwrap();
        let mut catalog = Catalog::new();
        catalog
            .register_file(&write_package(dir.path(), "acme.geo", "1.0.0"))
            .unwrap();

        assert!(catalog.cached_tree("acme.geo", &v("1.0.0")).is_none());

        let tree = ModuleTree {
            id: "acme.geo".to_string(),
            version: v("1.0.0"),
            managed: true,
            modules: vec![],
            children: vec![],
        };
        catalog.store_tree("acme.geo", &v("1.0.0"), tree);

        let cached = catalog.cached_tree("acme.geo", &v("1.0.0")).unwrap();
        assert_eq!(cached.id, "acme.geo");
    }
}
