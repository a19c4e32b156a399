//! Semver-like package versions.
//!
//! Fleet clients report versions such as `2905.2.1`, `3033.0.0+dev` or
//! `1.2`. Ordering only considers the numeric `(major, minor, patch)`
//! triple; anything after the first `-` or `+` is kept for display but
//! ignored when comparing.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StateError, StateResult};

/// A parsed package version.
#[derive(Debug, Clone)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    raw: String,
}

impl Version {
    /// Parse a version string.
    ///
    /// Strict semver is tried first. Versions with fewer than three numeric
    /// components (`1.2`, `7`) are accepted and padded with zeroes.
    pub fn parse(input: &str) -> StateResult<Self> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(StateError::InvalidVersion(input.to_string()));
        }

        if let Ok(v) = semver::Version::parse(trimmed) {
            return Ok(Self {
                major: v.major,
                minor: v.minor,
                patch: v.patch,
                raw: trimmed.to_string(),
            });
        }

        let core = trimmed
            .split(['-', '+'])
            .next()
            .unwrap_or_default();
        let mut parts = [0u64; 3];
        let mut count = 0;
        for (i, piece) in core.split('.').enumerate() {
            if i >= 3 {
                return Err(StateError::InvalidVersion(input.to_string()));
            }
            parts[i] = piece
                .parse()
                .map_err(|_| StateError::InvalidVersion(input.to_string()))?;
            count += 1;
        }
        if count == 0 {
            return Err(StateError::InvalidVersion(input.to_string()));
        }

        Ok(Self {
            major: parts[0],
            minor: parts[1],
            patch: parts[2],
            raw: trimmed.to_string(),
        })
    }

    /// The numeric triple used for ordering.
    pub fn triple(&self) -> (u64, u64, u64) {
        (self.major, self.minor, self.patch)
    }

    /// The version exactly as it was reported.
    pub fn as_str(&self) -> &str {
        &self.raw
    }
}

/// True if `a` parses and sorts strictly before `b`.
///
/// Unparsable input never compares as older.
pub fn is_older(a: &str, b: &str) -> bool {
    match (Version::parse(a), Version::parse(b)) {
        (Ok(a), Ok(b)) => a < b,
        _ => false,
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.triple() == other.triple()
    }
}

impl Eq for Version {}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.triple().cmp(&other.triple())
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

impl FromStr for Version {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.raw)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Version::parse(&raw).map_err(serde::de::Error::custom)
    }
}
