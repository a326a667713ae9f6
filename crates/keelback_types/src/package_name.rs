use std::{borrow::Borrow, fmt, str::FromStr, sync::Arc};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A validated conda package name.
///
/// Package names are non-empty, case-insensitive tokens consisting of
/// alphanumerics, dots, dashes, and underscores. The normalized (lowercase)
/// form is what identifies a package; two names that differ only in case are
/// the same package. The name is stored behind an `Arc` so records can share
/// it cheaply.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PackageName(Arc<str>);

/// The error returned when a string is not a valid package name.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("'{0}' is not a valid package name; names consist of [a-z0-9._-]")]
pub struct InvalidPackageNameError(pub String);

impl PackageName {
    /// Validates and normalizes the given string into a package name.
    pub fn new(source: impl AsRef<str>) -> Result<Self, InvalidPackageNameError> {
        let source = source.as_ref();
        if source.is_empty()
            || !source
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
        {
            return Err(InvalidPackageNameError(source.to_owned()));
        }
        Ok(Self::new_unchecked(source.to_ascii_lowercase()))
    }

    /// Wraps an already-normalized name without validating it. Useful for
    /// compile-time constants like virtual package names.
    pub fn new_unchecked(normalized: impl Into<Arc<str>>) -> Self {
        PackageName(normalized.into())
    }

    /// The normalized lowercase form of the name.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Returns true for virtual package names, which start with `__`.
    pub fn is_virtual(&self) -> bool {
        self.0.starts_with("__")
    }
}

impl AsRef<str> for PackageName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for PackageName {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl FromStr for PackageName {
    type Err = InvalidPackageNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl fmt::Display for PackageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl PartialEq<str> for PackageName {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl PartialEq<&str> for PackageName {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl Serialize for PackageName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for PackageName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = std::borrow::Cow::<str>::deserialize(deserializer)?;
        PackageName::new(source.as_ref()).map_err(serde::de::Error::custom)
    }
}
