//! The query language for conda packages.
//!
//! A [`MatchSpec`] is a predicate over package records. The canonical string
//! form is
//!
//! ```text
//! (channel(/subdir)::)name( version( build))([key=value,key=value])
//! ```
//!
//! where every field except the name is optional and bracketed key-value
//! pairs override anything parsed outside the brackets.

pub mod parse;

use std::fmt::{self, Display, Formatter};

use keelback_digest::{serde::HexDigest, Md5, Md5Hash, Sha256, Sha256Hash};
pub use parse::ParseMatchSpecError;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use thiserror::Error;

use crate::{
    BuildNumberSpec, PackageName, PackageRecord, RepoDataRecord, StringMatcher, VersionSpec,
};
use crate::version_spec::GroupOp;

/// Matches the name field of a record, either exactly or by glob.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NameMatcher {
    /// An exact, normalized package name.
    Exact(PackageName),

    /// A glob over package names, e.g. `*lib*`.
    Pattern(StringMatcher),
}

impl NameMatcher {
    /// Evaluates the matcher against a package name.
    pub fn matches_name(&self, name: &PackageName) -> bool {
        match self {
            NameMatcher::Exact(exact) => exact == name,
            NameMatcher::Pattern(pattern) => pattern.matches(name.as_str()),
        }
    }

    /// The exact name when this matcher is not a pattern.
    pub fn as_exact(&self) -> Option<&PackageName> {
        match self {
            NameMatcher::Exact(name) => Some(name),
            NameMatcher::Pattern(_) => None,
        }
    }

    /// Returns true when the matcher accepts every name.
    pub fn is_any(&self) -> bool {
        matches!(self, NameMatcher::Pattern(StringMatcher::Glob(pattern)) if pattern.as_str() == "^.*$")
    }
}

impl Default for NameMatcher {
    fn default() -> Self {
        NameMatcher::Pattern("*".parse().expect("'*' is a valid glob"))
    }
}

impl Display for NameMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            NameMatcher::Exact(name) => Display::fmt(name, f),
            NameMatcher::Pattern(pattern) => Display::fmt(pattern, f),
        }
    }
}

/// A constraint predicate over [`PackageRecord`]s.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Default, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct MatchSpec {
    /// The package name constraint.
    pub name: NameMatcher,

    /// The version constraint, e.g. `>=1.2,<2`.
    pub version: Option<VersionSpec>,

    /// The build string constraint, e.g. `py37*`.
    pub build: Option<StringMatcher>,

    /// The build number constraint, e.g. `>=2`.
    pub build_number: Option<BuildNumberSpec>,

    /// Constrains the archive filename exactly.
    pub file_name: Option<String>,

    /// Constrains the channel the record comes from, by name.
    pub channel: Option<String>,

    /// Constrains the subdir of the record.
    pub subdir: Option<String>,

    /// Constrains the MD5 digest of the archive.
    #[serde_as(as = "Option<HexDigest<Md5>>")]
    pub md5: Option<Md5Hash>,

    /// Constrains the SHA256 digest of the archive.
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    pub sha256: Option<Sha256Hash>,

    /// Requires the record to activate the given feature tokens.
    pub track_features: Option<Vec<String>>,
}

impl MatchSpec {
    /// Constructs a spec that matches every record of the given name.
    pub fn from_name(name: PackageName) -> Self {
        MatchSpec {
            name: NameMatcher::Exact(name),
            ..MatchSpec::default()
        }
    }

    /// Evaluates the spec against a package record. This is total and pure:
    /// fields absent from the spec always match.
    pub fn matches(&self, record: &PackageRecord) -> bool {
        if !self.name.matches_name(&record.name) {
            return false;
        }
        if let Some(spec) = &self.version {
            if !spec.matches(&record.version) {
                return false;
            }
        }
        if let Some(build) = &self.build {
            if !build.matches(&record.build) {
                return false;
            }
        }
        if let Some(build_number) = &self.build_number {
            if !build_number.matches(record.build_number) {
                return false;
            }
        }
        if let Some(subdir) = &self.subdir {
            if subdir != &record.subdir {
                return false;
            }
        }
        if let Some(md5) = &self.md5 {
            if record.md5.as_ref() != Some(md5) {
                return false;
            }
        }
        if let Some(sha256) = &self.sha256 {
            if record.sha256.as_ref() != Some(sha256) {
                return false;
            }
        }
        if let Some(track_features) = &self.track_features {
            if !track_features
                .iter()
                .all(|feature| record.track_features.contains(feature))
            {
                return false;
            }
        }
        true
    }

    /// Evaluates the spec against a repodata record, additionally checking
    /// the channel and filename constraints which only exist there.
    pub fn matches_repodata(&self, record: &RepoDataRecord) -> bool {
        if let Some(file_name) = &self.file_name {
            if file_name != &record.file_name {
                return false;
            }
        }
        if let Some(channel) = &self.channel {
            if !channel_name_matches(channel, &record.channel) {
                return false;
            }
        }
        self.matches(&record.package_record)
    }

    /// Returns true when the spec can only be satisfied by a virtual
    /// package (its name starts with `__`).
    pub fn is_virtual(&self) -> bool {
        match &self.name {
            NameMatcher::Exact(name) => name.is_virtual(),
            NameMatcher::Pattern(pattern) => pattern.to_string().starts_with("__"),
        }
    }

    /// Combines two specs that constrain the same package into a spec
    /// enforcing both. Fails when the two are provably disjoint or when a
    /// field cannot be conjoined.
    pub fn merge(&self, other: &MatchSpec) -> Result<MatchSpec, MergeSpecsError> {
        if self.name != other.name {
            return Err(MergeSpecsError::DifferentNames(
                self.name.to_string(),
                other.name.to_string(),
            ));
        }

        fn merge_eq<T: Clone + PartialEq + fmt::Debug>(
            field: &'static str,
            a: &Option<T>,
            b: &Option<T>,
        ) -> Result<Option<T>, MergeSpecsError> {
            match (a, b) {
                (Some(a), Some(b)) if a != b => Err(MergeSpecsError::IncompatibleField {
                    field,
                    left: format!("{a:?}"),
                    right: format!("{b:?}"),
                }),
                (Some(value), _) | (_, Some(value)) => Ok(Some(value.clone())),
                (None, None) => Ok(None),
            }
        }

        let version = match (&self.version, &other.version) {
            (Some(a), Some(b)) if a == b => Some(a.clone()),
            (Some(a), Some(b)) => {
                // Conjoin; flatten nested `,` groups to keep display tidy.
                let mut terms = Vec::new();
                for spec in [a, b] {
                    match spec {
                        VersionSpec::Group(GroupOp::All, inner) => terms.extend(inner.clone()),
                        other => terms.push(other.clone()),
                    }
                }
                Some(VersionSpec::Group(GroupOp::All, terms))
            }
            (Some(spec), None) | (None, Some(spec)) => Some(spec.clone()),
            (None, None) => None,
        };

        Ok(MatchSpec {
            name: self.name.clone(),
            version,
            build: merge_eq("build", &self.build, &other.build)?,
            build_number: merge_eq("build_number", &self.build_number, &other.build_number)?,
            file_name: merge_eq("fn", &self.file_name, &other.file_name)?,
            channel: merge_eq("channel", &self.channel, &other.channel)?,
            subdir: merge_eq("subdir", &self.subdir, &other.subdir)?,
            md5: merge_eq("md5", &self.md5, &other.md5)?,
            sha256: merge_eq("sha256", &self.sha256, &other.sha256)?,
            track_features: merge_eq(
                "track_features",
                &self.track_features,
                &other.track_features,
            )?,
        })
    }
}

/// A spec channel like `conda-forge` matches records attributed to
/// `https://conda.anaconda.org/conda-forge`; full urls must match exactly.
fn channel_name_matches(spec_channel: &str, record_channel: &str) -> bool {
    let spec_channel = spec_channel.trim_end_matches('/');
    let record_channel = record_channel.trim_end_matches('/');
    if spec_channel == "*" || spec_channel == record_channel {
        return true;
    }
    record_channel
        .strip_suffix(spec_channel)
        .is_some_and(|prefix| prefix.ends_with('/'))
}

/// The error returned when two specs cannot be merged.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum MergeSpecsError {
    /// The two specs constrain different names.
    #[error("cannot merge specs for different packages: '{0}' and '{1}'")]
    DifferentNames(String, String),

    /// A field is constrained to two different exact values.
    #[error("incompatible {field} constraints: {left} and {right}")]
    IncompatibleField {
        /// The field that conflicts.
        field: &'static str,
        /// Value on the left spec.
        left: String,
        /// Value on the right spec.
        right: String,
    },
}

impl Display for MatchSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if let Some(channel) = &self.channel {
            write!(f, "{channel}")?;
            if let Some(subdir) = &self.subdir {
                write!(f, "/{subdir}")?;
            }
            write!(f, "::")?;
        }

        write!(f, "{}", self.name)?;

        if let Some(version) = &self.version {
            write!(f, " {version}")?;
        }
        if let Some(build) = &self.build {
            write!(f, " {build}")?;
        }

        let mut keys = Vec::new();
        if let Some(build_number) = &self.build_number {
            keys.push(format!("build_number={build_number}"));
        }
        if self.channel.is_none() {
            if let Some(subdir) = &self.subdir {
                keys.push(format!("subdir={subdir}"));
            }
        }
        if let Some(file_name) = &self.file_name {
            keys.push(format!("fn=\"{file_name}\""));
        }
        if let Some(md5) = &self.md5 {
            keys.push(format!("md5={md5:x}"));
        }
        if let Some(sha256) = &self.sha256 {
            keys.push(format!("sha256={sha256:x}"));
        }
        if let Some(track_features) = &self.track_features {
            keys.push(format!("track_features={}", track_features.join(" ")));
        }
        if !keys.is_empty() {
            write!(f, "[{}]", keys.join(","))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::{MatchSpec, NameMatcher};
    use crate::{PackageName, PackageRecord, ParseStrictness, Version};

    fn record(name: &str, version: &str, build: &str) -> PackageRecord {
        PackageRecord::new(
            PackageName::new(name).unwrap(),
            Version::from_str(version).unwrap(),
            build,
        )
    }

    fn spec(s: &str) -> MatchSpec {
        MatchSpec::from_str(s, ParseStrictness::Lenient).unwrap()
    }

    #[test]
    fn match_by_name_and_version() {
        let python = record("python", "3.11.4", "h2755cc3_0");
        assert!(spec("python").matches(&python));
        assert!(spec("python >=3.11").matches(&python));
        assert!(spec("python 3.11.*").matches(&python));
        assert!(!spec("python >=3.12").matches(&python));
        assert!(!spec("python").matches(&record("cpython", "3.11.4", "0")));
    }

    #[test]
    fn match_by_glob_name() {
        let zlib = record("zlib", "1.2.13", "0");
        let certs = record("ca-certificates", "2023.5.7", "0");
        let globbed = spec("*lib*");
        assert!(globbed.matches(&zlib));
        assert!(!globbed.matches(&certs));
    }

    #[test]
    fn match_by_build() {
        let py = record("numpy", "1.24.2", "py311h64a7726_0");
        assert!(spec("numpy * py311*").matches(&py));
        assert!(!spec("numpy * py39*").matches(&py));
    }

    #[test]
    fn match_by_subdir() {
        let mut linux = record("zlib", "1.2.13", "0");
        linux.subdir = "linux-64".to_owned();
        assert!(spec("zlib[subdir=linux-64]").matches(&linux));
        assert!(!spec("zlib[subdir=osx-64]").matches(&linux));
    }

    #[test]
    fn match_by_track_features() {
        let mut mkl = record("blas", "1.0", "mkl");
        mkl.track_features = vec!["mkl".to_owned()];
        assert!(spec("blas[track_features=mkl]").matches(&mkl));
        assert!(!spec("blas[track_features=openblas]").matches(&mkl));
    }

    #[test]
    fn merge_conjoins_versions() {
        let merged = spec("python >=3.8").merge(&spec("python <3.12")).unwrap();
        assert!(merged.matches(&record("python", "3.11.4", "0")));
        assert!(!merged.matches(&record("python", "3.12.0", "0")));
        assert!(!merged.matches(&record("python", "3.7.0", "0")));
    }

    #[test]
    fn merge_rejects_different_names() {
        assert!(spec("python").merge(&spec("numpy")).is_err());
    }

    #[test]
    fn merge_rejects_conflicting_builds() {
        assert!(spec("python * py37_0")
            .merge(&spec("python * py38_0"))
            .is_err());
    }

    #[test]
    fn virtual_spec_detection() {
        assert!(spec("__glibc >=2.17").is_virtual());
        assert!(!spec("glibc").is_virtual());
    }

    #[test]
    fn any_name() {
        assert!(NameMatcher::default().is_any());
        assert!(spec("*").name.is_any());
    }
}
