//! Package manifests: identity, per-platform dependency groups, and
//! per-platform file lists.
//!
//! The wire form is JSON (`manifest.json` inside the package archive); the
//! raw serde types are converted into validated domain types on load, so a
//! `PackageManifest` in hand is always well-formed.

use crate::platform::PlatformId;
use crate::version::{VersionRange, parse_version};
use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// File extensions the host can bind as modules.
const LOADABLE_EXTENSIONS: &[&str] = &["so", "dylib", "dll"];

/// Name of the manifest entry inside a package archive.
pub const MANIFEST_ENTRY: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("archive has no {MANIFEST_ENTRY} entry")]
    MissingManifest,
    #[error("archive entry '{0}' not found")]
    EntryNotFound(String),
    #[error("manifest is missing required field '{0}'")]
    MissingField(&'static str),
    #[error("manifest for '{id}' has an invalid version: {source}")]
    InvalidVersion {
        id: String,
        #[source]
        source: crate::version::VersionError,
    },
    #[error("manifest for '{id}' has an invalid range for dependency '{dependency}': {source}")]
    InvalidRange {
        id: String,
        dependency: String,
        #[source]
        source: crate::version::VersionError,
    },
    #[error("manifest for '{id}' declares an invalid platform: {source}")]
    InvalidPlatform {
        id: String,
        #[source]
        source: crate::platform::PlatformError,
    },
    #[error("manifest for '{id}' declares platform '{platform}' more than once")]
    DuplicateGroup { id: String, platform: String },
    #[error("manifest is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported archive format: {0}")]
    UnsupportedFormat(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("malformed archive: {0}")]
    Archive(String),
}

/// One dependency declaration: a package id and the version range the
/// referencing package accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dependency {
    pub id: String,
    pub range: VersionRange,
}

/// Dependencies declared for one platform. `platform == None` is the
/// any-platform group.
#[derive(Debug, Clone)]
pub struct DependencyGroup {
    pub platform: Option<PlatformId>,
    pub dependencies: Vec<Dependency>,
}

/// Files shipped for one platform, as archive-relative paths.
#[derive(Debug, Clone)]
pub struct FileGroup {
    pub platform: Option<PlatformId>,
    pub files: Vec<String>,
}

impl FileGroup {
    /// Paths in this group the host can bind.
    pub fn loadable_files(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(String::as_str).filter(|f| is_loadable(f))
    }

    pub fn has_loadable_files(&self) -> bool {
        self.loadable_files().next().is_some()
    }
}

/// Whether a relative path points at a bindable module.
pub fn is_loadable(path: &str) -> bool {
    std::path::Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| LOADABLE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
}

/// Parsed, read-only description of one package.
#[derive(Debug, Clone)]
pub struct PackageManifest {
    pub id: String,
    pub version: Version,
    pub dependency_groups: Vec<DependencyGroup>,
    pub file_groups: Vec<FileGroup>,
}

impl PackageManifest {
    /// Parse and validate manifest bytes.
    #[tracing::instrument(skip(bytes))]
    pub fn parse(bytes: &[u8]) -> Result<Self, ManifestError> {
        let raw: RawManifest = serde_json::from_slice(bytes)?;
        PackageManifest::try_from(raw)
    }

    /// The dependency group nearest to `target`, if any group is compatible.
    pub fn dependency_group_for(&self, target: &PlatformId) -> Option<&DependencyGroup> {
        target.reduce_nearest(&self.dependency_groups, |g| g.platform.as_ref())
    }

    /// The nearest file group that actually carries bindable files.
    pub fn file_group_for(&self, target: &PlatformId) -> Option<&FileGroup> {
        target.reduce_nearest(
            self.file_groups.iter().filter(|g| g.has_loadable_files()),
            |g| g.platform.as_ref(),
        )
    }

    /// A linking package ships no bindable code for any platform; it exists
    /// only to pull in its own dependencies.
    pub fn is_linking_package(&self) -> bool {
        !self.file_groups.iter().any(FileGroup::has_loadable_files)
    }

    /// Whether no dependency group declares anything at all.
    pub fn declares_no_dependencies(&self) -> bool {
        self.dependency_groups
            .iter()
            .all(|g| g.dependencies.is_empty())
    }
}

impl TryFrom<RawManifest> for PackageManifest {
    type Error = ManifestError;

    fn try_from(raw: RawManifest) -> Result<Self, ManifestError> {
        if raw.id.trim().is_empty() {
            return Err(ManifestError::MissingField("id"));
        }
        let id = raw.id;

        let version = parse_version(&raw.version).map_err(|source| {
            ManifestError::InvalidVersion {
                id: id.clone(),
                source,
            }
        })?;

        let mut dependency_groups = Vec::with_capacity(raw.dependencies.len());
        let mut seen_platforms = HashSet::new();
        for raw_group in raw.dependencies {
            let platform = parse_group_platform(&id, raw_group.platform.as_deref())?;
            let key = platform
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_else(|| "any".to_string());
            if !seen_platforms.insert(key.clone()) {
                return Err(ManifestError::DuplicateGroup { id, platform: key });
            }

            let mut dependencies = Vec::with_capacity(raw_group.dependencies.len());
            for raw_dep in raw_group.dependencies {
                if raw_dep.id.trim().is_empty() {
                    return Err(ManifestError::MissingField("dependency id"));
                }
                let range = raw_dep.range.parse().map_err(|source| {
                    ManifestError::InvalidRange {
                        id: id.clone(),
                        dependency: raw_dep.id.clone(),
                        source,
                    }
                })?;
                dependencies.push(Dependency {
                    id: raw_dep.id,
                    range,
                });
            }
            dependency_groups.push(DependencyGroup {
                platform,
                dependencies,
            });
        }

        let mut file_groups = Vec::with_capacity(raw.files.len());
        for raw_group in raw.files {
            let platform = parse_group_platform(&id, raw_group.platform.as_deref())?;
            file_groups.push(FileGroup {
                platform,
                files: raw_group.files,
            });
        }

        Ok(PackageManifest {
            id,
            version,
            dependency_groups,
            file_groups,
        })
    }
}

fn parse_group_platform(
    id: &str,
    platform: Option<&str>,
) -> Result<Option<PlatformId>, ManifestError> {
    match platform {
        None => Ok(None),
        Some(s) => s
            .parse()
            .map(Some)
            .map_err(|source| ManifestError::InvalidPlatform {
                id: id.to_string(),
                source,
            }),
    }
}

/// Wire form of a manifest, exactly as stored in `manifest.json`.
#[derive(Debug, Serialize, Deserialize)]
pub struct RawManifest {
    pub id: String,
    pub version: String,
    #[serde(default)]
    pub dependencies: Vec<RawDependencyGroup>,
    #[serde(default)]
    pub files: Vec<RawFileGroup>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RawDependencyGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<RawDependency>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RawDependency {
    pub id: String,
    pub range: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RawFileGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}
