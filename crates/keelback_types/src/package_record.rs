use std::{
    cmp::Ordering,
    fmt::{self, Display, Formatter},
};

use keelback_digest::{serde::HexDigest, Md5, Md5Hash, Sha256, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};
use thiserror::Error;

use crate::{
    build_number_spec::BuildNumber, utils::serde::{FeatureList, TimestampMillis}, MatchSpec,
    NoArchType, PackageName, ParseMatchSpecError, ParseStrictness, Platform, Version,
};

/// The immutable metadata of one candidate package artifact, as published in
/// repodata. Two records with equal identity fields describe the same
/// artifact.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq, Clone, Hash)]
pub struct PackageRecord {
    /// Optionally the architecture the package supports.
    pub arch: Option<String>,

    /// The build string of the package.
    pub build: String,

    /// The build number of the package.
    pub build_number: BuildNumber,

    /// Run constraints: packages named here are not required, but when they
    /// are installed they must satisfy the given spec.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constrains: Vec<String>,

    /// Specs of the packages this package depends on.
    #[serde(default)]
    pub depends: Vec<String>,

    /// Feature tokens carried in this build. Deprecated but still honored by
    /// the resolver when present in old repodata.
    pub features: Option<String>,

    /// The specific license of the package.
    pub license: Option<String>,

    /// The license family.
    pub license_family: Option<String>,

    /// MD5 digest of the package archive.
    #[serde_as(as = "Option<HexDigest<Md5>>")]
    pub md5: Option<Md5Hash>,

    /// The name of the package.
    pub name: PackageName,

    /// How the package is independent of the architecture, if at all.
    #[serde(default, skip_serializing_if = "NoArchType::is_none")]
    pub noarch: NoArchType,

    /// Optionally the platform the package supports. Does not always align
    /// with `subdir`, old repodata is inconsistent here.
    pub platform: Option<String>,

    /// SHA256 digest of the package archive.
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    pub sha256: Option<Sha256Hash>,

    /// The size of the package archive in bytes.
    pub size: Option<u64>,

    /// The subdirectory (platform slug) the package lives in.
    #[serde(default)]
    pub subdir: String,

    /// When the package was created.
    #[serde_as(as = "Option<TimestampMillis>")]
    pub timestamp: Option<chrono::DateTime<chrono::Utc>>,

    /// Feature tokens this package activates environment-wide. Any package
    /// name affected by an active feature is preferred in builds carrying
    /// the feature.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    #[serde_as(as = "FeatureList<String>")]
    pub track_features: Vec<String>,

    /// The version of the package.
    pub version: Version,
}

impl PackageRecord {
    /// Constructs a record with the minimum fields set; everything else is
    /// empty or `None`. Mostly useful in tests and for virtual packages.
    pub fn new(name: PackageName, version: Version, build: impl Into<String>) -> Self {
        Self {
            arch: None,
            build: build.into(),
            build_number: 0,
            constrains: vec![],
            depends: vec![],
            features: None,
            license: None,
            license_family: None,
            md5: None,
            name,
            noarch: NoArchType::default(),
            platform: None,
            sha256: None,
            size: None,
            subdir: Platform::current().to_string(),
            timestamp: None,
            track_features: vec![],
            version,
        }
    }

    /// The ordering of candidates within one package name:
    /// `(version, build_number, timestamp, build)` ascending.
    pub fn cmp_within_name(&self, other: &Self) -> Ordering {
        debug_assert_eq!(self.name, other.name);
        self.version
            .cmp(&other.version)
            .then_with(|| self.build_number.cmp(&other.build_number))
            .then_with(|| self.timestamp.cmp(&other.timestamp))
            .then_with(|| self.build.cmp(&other.build))
    }

    /// The feature tokens of this build, split from the legacy string form.
    pub fn feature_set(&self) -> impl Iterator<Item = &str> {
        self.features
            .as_deref()
            .unwrap_or("")
            .split_whitespace()
    }

    /// Checks that every `depends` spec of every record is satisfied by some
    /// other record in the set and that no `constrains` spec is violated.
    /// Virtual packages (`__` prefixed) are exempt.
    pub fn validate<T: AsRef<PackageRecord>>(
        records: &[T],
    ) -> Result<(), ValidateRecordsError> {
        for record in records {
            let record = record.as_ref();
            for dep in &record.depends {
                if dep.starts_with("__") {
                    continue;
                }
                let spec = MatchSpec::from_str(dep, ParseStrictness::Lenient)?;
                if !records.iter().any(|r| spec.matches(r.as_ref())) {
                    return Err(ValidateRecordsError::DependencyNotInEnvironment {
                        package: record.to_string(),
                        dependency: dep.clone(),
                    });
                }
            }

            for constraint in &record.constrains {
                let spec = MatchSpec::from_str(constraint, ParseStrictness::Lenient)?;
                let subject = records
                    .iter()
                    .map(AsRef::as_ref)
                    .find(|r| spec.name.matches_name(&r.name));
                if let Some(subject) = subject {
                    if !spec.matches(subject) {
                        return Err(ValidateRecordsError::ConstraintViolated {
                            package: record.to_string(),
                            constraint: constraint.clone(),
                            violator: subject.to_string(),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

impl Display for PackageRecord {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        if self.build.is_empty() {
            write!(f, "{} {}", self.name, self.version)
        } else {
            write!(f, "{}={}={}", self.name, self.version, self.build)
        }
    }
}

impl AsRef<PackageRecord> for PackageRecord {
    fn as_ref(&self) -> &PackageRecord {
        self
    }
}

/// The error returned when a record set fails validation.
#[derive(Debug, Error)]
pub enum ValidateRecordsError {
    /// A dependency is not present in the set.
    #[error("package '{package}' has dependency '{dependency}', which is not in the environment")]
    DependencyNotInEnvironment {
        /// The package with the unmet dependency.
        package: String,
        /// The spec that is not satisfied.
        dependency: String,
    },

    /// A run constraint is violated by a package in the set.
    #[error(
        "package '{package}' has constraint '{constraint}', which is not satisfied by '{violator}' in the environment"
    )]
    ConstraintViolated {
        /// The package declaring the constraint.
        package: String,
        /// The violated constraint.
        constraint: String,
        /// The package that violates it.
        violator: String,
    },

    /// A depends or constrains entry failed to parse.
    #[error(transparent)]
    ParseMatchSpec(#[from] ParseMatchSpecError),
}
