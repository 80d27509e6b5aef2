//! Platform identifiers and the compatibility rule between them.
//!
//! A platform identifier names a framework family with a version and an
//! optional OS qualifier, written compactly: `core2.0`, `standard1.3-linux`,
//! `core3.1-musl1.2`. Packages declare dependency and file groups per
//! platform; resolution reduces the declared platforms to the one nearest
//! the execution target.

use crate::version::parse_version;
use semver::Version;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Framework families this loader understands. An identifier outside this
/// vocabulary is a hard input error, never silently defaulted.
pub const KNOWN_FRAMEWORKS: &[&str] = &["core", "standard", "embedded"];

/// Framework version the running host provides.
const HOST_FRAMEWORK_VERSION: Version = Version::new(3, 0, 0);

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("unrecognized platform identifier '{0}'")]
    Unrecognized(String),
    #[error("unknown framework family in '{0}' (expected one of: core, standard, embedded)")]
    UnknownFramework(String),
    #[error("malformed version in platform identifier '{0}'")]
    BadVersion(String),
}

/// Operating-system qualifier of a platform identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct OsQualifier {
    pub name: String,
    pub version: Option<Version>,
}

/// A target execution environment: framework family, framework version,
/// optional OS qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PlatformId {
    pub framework: String,
    pub version: Version,
    pub os: Option<OsQualifier>,
}

impl PlatformId {
    pub fn new(framework: &str, version: Version) -> Self {
        PlatformId {
            framework: framework.to_string(),
            version,
            os: None,
        }
    }

    pub fn with_os(mut self, name: &str, version: Option<Version>) -> Self {
        self.os = Some(OsQualifier {
            name: name.to_string(),
            version,
        });
        self
    }

    /// The platform of the running process: the `core` framework at the
    /// version this host provides, qualified by the detected OS.
    pub fn host() -> Self {
        PlatformId::new("core", HOST_FRAMEWORK_VERSION).with_os(detect_os(), None)
    }

    /// Compatibility rule: this target can use code declared for `declared`
    /// if the declared requirements are a subset of what the target
    /// provides. Different framework families are never compatible.
    pub fn supports(&self, declared: &PlatformId) -> bool {
        if self.framework != declared.framework {
            return false;
        }
        if declared.version > self.version {
            return false;
        }
        match (&self.os, &declared.os) {
            // Declared without a qualifier runs anywhere in the family.
            (_, None) => true,
            // Declared for a specific OS needs the target to be on it.
            (Some(target_os), Some(declared_os)) => {
                target_os.name == declared_os.name
                    && match (&target_os.version, &declared_os.version) {
                        (_, None) => true,
                        (Some(t), Some(d)) => d <= t,
                        (None, Some(_)) => false,
                    }
            }
            (None, Some(_)) => false,
        }
    }

    /// Whether this target can use a group declared for `declared`, where
    /// `None` is the "any platform" group.
    pub fn supports_declared(&self, declared: Option<&PlatformId>) -> bool {
        declared.is_none_or(|d| self.supports(d))
    }

    /// Ordering key for reduction: more specific and higher-versioned
    /// declared platforms are nearer to the target. `None` (any platform)
    /// sorts below everything.
    fn specificity(declared: Option<&PlatformId>) -> (bool, Version, bool, Version) {
        match declared {
            None => (false, Version::new(0, 0, 0), false, Version::new(0, 0, 0)),
            Some(p) => (
                true,
                p.version.clone(),
                p.os.is_some(),
                p.os
                    .as_ref()
                    .and_then(|os| os.version.clone())
                    .unwrap_or_else(|| Version::new(0, 0, 0)),
            ),
        }
    }

    /// Reduce `items` to the one whose declared platform is nearest this
    /// target, or `None` if nothing is compatible. Deterministic for a
    /// fixed input order; ties keep the earliest declaration.
    pub fn reduce_nearest<'a, T>(
        &self,
        items: impl IntoIterator<Item = &'a T>,
        platform_of: impl Fn(&T) -> Option<&PlatformId>,
    ) -> Option<&'a T> {
        let mut best: Option<(&'a T, (bool, Version, bool, Version))> = None;
        for item in items {
            let declared = platform_of(item);
            if !self.supports_declared(declared) {
                continue;
            }
            let key = Self::specificity(declared);
            match &best {
                Some((_, best_key)) if key <= *best_key => {}
                _ => best = Some((item, key)),
            }
        }
        best.map(|(item, _)| item)
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.framework, short_version(&self.version))?;
        if let Some(os) = &self.os {
            write!(f, "-{}", os.name)?;
            if let Some(v) = &os.version {
                write!(f, "{}", short_version(v))?;
            }
        }
        Ok(())
    }
}

/// Render `2.1.0` as `2.1`, keeping the patch only when non-zero.
fn short_version(v: &Version) -> String {
    if v.patch == 0 && v.pre.is_empty() && v.build.is_empty() {
        format!("{}.{}", v.major, v.minor)
    } else {
        v.to_string()
    }
}

impl FromStr for PlatformId {
    type Err = PlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(PlatformError::Unrecognized(s.to_string()));
        }

        let (framework_part, os_part) = match s.split_once('-') {
            Some((fw, os)) => (fw, Some(os)),
            None => (s, None),
        };

        let framework = KNOWN_FRAMEWORKS
            .iter()
            .find(|fw| framework_part.starts_with(**fw))
            .ok_or_else(|| PlatformError::UnknownFramework(s.to_string()))?;

        let version_part = &framework_part[framework.len()..];
        if version_part.is_empty() {
            return Err(PlatformError::BadVersion(s.to_string()));
        }
        let version =
            parse_version(version_part).map_err(|_| PlatformError::BadVersion(s.to_string()))?;

        let os = match os_part {
            None => None,
            Some(os_str) => {
                let split = os_str
                    .char_indices()
                    .find(|(_, c)| c.is_ascii_digit())
                    .map(|(i, _)| i);
                let (name, os_version) = match split {
                    Some(0) | None if os_str.is_empty() => {
                        return Err(PlatformError::Unrecognized(s.to_string()));
                    }
                    Some(i) => {
                        let version = parse_version(&os_str[i..])
                            .map_err(|_| PlatformError::BadVersion(s.to_string()))?;
                        (&os_str[..i], Some(version))
                    }
                    None => (os_str, None),
                };
                if name.is_empty() {
                    return Err(PlatformError::Unrecognized(s.to_string()));
                }
                Some(OsQualifier {
                    name: name.to_string(),
                    version: os_version,
                })
            }
        };

        Ok(PlatformId {
            framework: framework.to_string(),
            version,
            os,
        })
    }
}

fn detect_os() -> &'static str {
    #[cfg(target_os = "macos")]
    {
        "macos"
    }
    #[cfg(target_os = "linux")]
    {
        "linux"
    }
    #[cfg(target_os = "windows")]
    {
        "windows"
    }
    #[cfg(not(any(target_os = "macos", target_os = "linux", target_os = "windows")))]
    {
        "unknown"
    }
}
