//! Version ranges for dependency declarations.
//!
//! A range is an interval over semantic versions with independently
//! inclusive or exclusive bounds, written in the usual interval notation:
//! `[1.0.0,2.0.0)`, `[1.2.3]`, `(,2.0.0]`. A bare version (`1.2.3`) is
//! shorthand for an inclusive minimum with no upper bound.

use semver::Version;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing versions or version ranges.
#[derive(Debug, Error)]
pub enum VersionError {
    #[error("invalid version '{input}': {source}")]
    InvalidVersion {
        input: String,
        #[source]
        source: semver::Error,
    },
    #[error("invalid version range '{0}'")]
    InvalidRange(String),
    #[error("version range '{0}' is empty (no version can satisfy it)")]
    EmptyRange(String),
}

/// Parse a version, padding missing minor/patch components with zeros
/// (`2.1` parses as `2.1.0`). A leading `v` is accepted and stripped.
pub fn parse_version(input: &str) -> Result<Version, VersionError> {
    let s = input.trim();
    let s = s.strip_prefix('v').unwrap_or(s);

    match Version::parse(s) {
        Ok(v) => Ok(v),
        Err(first_err) => {
            // Pad short numeric forms ("2" / "2.1") before giving up. Anything
            // carrying pre-release or build metadata must already be complete.
            let numeric_parts = s.split('.').count();
            if numeric_parts < 3 && !s.contains(['-', '+']) {
                let padded = match numeric_parts {
                    1 => format!("{s}.0.0"),
                    2 => format!("{s}.0"),
                    _ => s.to_string(),
                };
                if let Ok(v) = Version::parse(&padded) {
                    return Ok(v);
                }
            }
            Err(VersionError::InvalidVersion {
                input: input.to_string(),
                source: first_err,
            })
        }
    }
}

/// An interval predicate over semantic versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionRange {
    min: Option<Version>,
    min_inclusive: bool,
    max: Option<Version>,
    max_inclusive: bool,
}

impl VersionRange {
    /// Range accepting any version at or above `min`.
    pub fn at_least(min: Version) -> Self {
        VersionRange {
            min: Some(min),
            min_inclusive: true,
            max: None,
            max_inclusive: false,
        }
    }

    /// Range accepting exactly one version.
    pub fn exact(version: Version) -> Self {
        VersionRange {
            min: Some(version.clone()),
            min_inclusive: true,
            max: Some(version),
            max_inclusive: true,
        }
    }

    pub fn lower_bound(&self) -> Option<&Version> {
        self.min.as_ref()
    }

    pub fn upper_bound(&self) -> Option<&Version> {
        self.max.as_ref()
    }

    pub fn has_upper_bound(&self) -> bool {
        self.max.is_some()
    }

    /// Whether `version` satisfies this range.
    pub fn contains(&self, version: &Version) -> bool {
        if let Some(min) = &self.min {
            match version.cmp(min) {
                std::cmp::Ordering::Less => return false,
                std::cmp::Ordering::Equal if !self.min_inclusive => return false,
                _ => {}
            }
        }
        if let Some(max) = &self.max {
            match version.cmp(max) {
                std::cmp::Ordering::Greater => return false,
                std::cmp::Ordering::Equal if !self.max_inclusive => return false,
                _ => {}
            }
        }
        true
    }

    /// Pick the best match among `candidates`: the highest version that
    /// satisfies the range. An empty candidate set yields `None`.
    pub fn find_best_match<'a, I>(&self, candidates: I) -> Option<&'a Version>
    where
        I: IntoIterator<Item = &'a Version>,
    {
        candidates
            .into_iter()
            .filter(|v| self.contains(v))
            .max()
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Bare-minimum shorthand round-trips as itself.
        if self.max.is_none() && self.min_inclusive {
            if let Some(min) = &self.min {
                return write!(f, "{min}");
            }
        }
        let open = if self.min_inclusive { '[' } else { '(' };
        let close = if self.max_inclusive { ']' } else { ')' };
        let min = self.min.as_ref().map(Version::to_string).unwrap_or_default();
        let max = self.max.as_ref().map(Version::to_string).unwrap_or_default();
        if self.min == self.max && self.min.is_some() && self.min_inclusive && self.max_inclusive {
            write!(f, "[{min}]")
        } else {
            write!(f, "{open}{min},{max}{close}")
        }
    }
}

impl FromStr for VersionRange {
    type Err = VersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(VersionError::InvalidRange(s.to_string()));
        }

        let starts_open = s.starts_with('[') || s.starts_with('(');
        let ends_open = s.ends_with(']') || s.ends_with(')');

        if !starts_open && !ends_open {
            // Bare version: inclusive minimum, unbounded above.
            return Ok(VersionRange::at_least(parse_version(s)?));
        }
        if !starts_open || !ends_open {
            return Err(VersionError::InvalidRange(s.to_string()));
        }

        let min_inclusive = s.starts_with('[');
        let max_inclusive = s.ends_with(']');
        let inner = &s[1..s.len() - 1];

        let (min_str, max_str) = match inner.split_once(',') {
            Some((lo, hi)) => (lo.trim(), hi.trim()),
            None => {
                // "[1.2.3]" pins an exact version; exclusive brackets make no sense here.
                if !(min_inclusive && max_inclusive) {
                    return Err(VersionError::InvalidRange(s.to_string()));
                }
                let v = parse_version(inner.trim())?;
                return Ok(VersionRange::exact(v));
            }
        };

        let min = if min_str.is_empty() {
            None
        } else {
            Some(parse_version(min_str)?)
        };
        let max = if max_str.is_empty() {
            None
        } else {
            Some(parse_version(max_str)?)
        };

        if min.is_none() && max.is_none() {
            return Err(VersionError::InvalidRange(s.to_string()));
        }

        if let (Some(lo), Some(hi)) = (&min, &max) {
            let degenerate =
                lo > hi || (lo == hi && !(min_inclusive && max_inclusive));
            if degenerate {
                return Err(VersionError::EmptyRange(s.to_string()));
            }
        }

        Ok(VersionRange {
            min,
            min_inclusive,
            max,
            max_inclusive,
        })
    }
}
