//! Records of packages linked into an environment prefix, stored as one JSON
//! file per package under `<prefix>/conda-meta/`.

use std::{
    io::Write,
    path::{Path, PathBuf},
    str::FromStr,
};

use keelback_digest::{serde::HexDigest, Sha256, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use serde_with::{serde_as, skip_serializing_none};

use crate::{PackageRecord, RepoDataRecord};

/// How a single file was materialized in the prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PathType {
    /// A hard link into the package cache.
    #[serde(rename = "hardlink")]
    HardLink,

    /// A symbolic link into the package cache.
    #[serde(rename = "softlink")]
    SoftLink,

    /// A directory created at link time.
    Directory,

    /// A bytecode file compiled after linking a noarch python package.
    PycFile,

    /// An entry point script generated for a noarch python package.
    UnixPythonEntryPoint,
}

/// How the package cache file was transferred into the prefix.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize_repr, Deserialize_repr, Hash)]
#[repr(u8)]
pub enum LinkType {
    /// Hard link, sharing the inode with the cache.
    HardLink = 1,
    /// Symbolic link pointing into the cache.
    SoftLink = 2,
    /// A full copy.
    Copy = 3,
    /// An (empty) directory.
    Directory = 4,
}

/// How text is replaced when a file carries a prefix placeholder.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    /// Replace the placeholder string, shrinking or growing the file.
    Text,
    /// Replace the placeholder and pad with NULs to keep offsets stable.
    Binary,
}

/// Everything known about one file installed for a package.
#[serde_as]
#[skip_serializing_none]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Hash)]
pub struct PathsEntry {
    /// The path relative to the prefix root.
    #[serde(rename = "_path")]
    #[serde_as(as = "crate::utils::serde::NormalizedPath")]
    pub relative_path: PathBuf,

    /// How the file was installed.
    pub path_type: PathType,

    /// True if this file must never be linked, only copied.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_link: bool,

    /// SHA256 of the file contents as shipped in the package.
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,

    /// SHA256 of the file contents as present in the prefix, which differs
    /// from `sha256` when a placeholder was rewritten.
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    #[serde(default)]
    pub sha256_in_prefix: Option<Sha256Hash>,

    /// Size of the file in bytes.
    #[serde(default)]
    pub size_in_bytes: Option<u64>,

    /// How placeholder replacement is performed for this file.
    #[serde(default)]
    pub file_mode: Option<FileMode>,

    /// The sentinel string embedded in the file that is replaced by the
    /// target prefix path at link time.
    #[serde(default)]
    pub prefix_placeholder: Option<String>,
}

/// The per-file manifest of a linked package.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixPaths {
    /// Version of this file format.
    pub paths_version: u64,

    /// The entries, one per installed file.
    #[serde(default)]
    pub paths: Vec<PathsEntry>,
}

impl Default for PrefixPaths {
    fn default() -> Self {
        Self {
            paths_version: 1,
            paths: Vec::default(),
        }
    }
}

impl From<Vec<PathsEntry>> for PrefixPaths {
    fn from(paths: Vec<PathsEntry>) -> Self {
        Self {
            paths,
            ..Default::default()
        }
    }
}

/// Reference to the package cache location a package was linked from.
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq, Clone)]
pub struct Link {
    /// The extracted package directory in the cache.
    pub source: PathBuf,

    /// How files were transferred into the prefix.
    #[serde(rename = "type")]
    pub link_type: Option<LinkType>,
}

/// A package linked into a prefix: its repodata identity plus the link-time
/// manifest. Serialized as `conda-meta/<name>-<version>-<build>.json`.
#[serde_as]
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq, Clone)]
pub struct PrefixRecord {
    /// The record of the artifact this package was installed from.
    #[serde(flatten)]
    pub repodata_record: RepoDataRecord,

    /// All files created in the prefix, relative paths sorted ascending.
    #[serde(default)]
    #[serde_as(as = "Vec<crate::utils::serde::NormalizedPath>")]
    pub files: Vec<PathBuf>,

    /// Per-file link details.
    #[serde(default)]
    pub paths_data: PrefixPaths,

    /// Where in the package cache the files came from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link: Option<Link>,

    /// The spec the user originally requested when this package entered the
    /// environment, when it was requested explicitly at all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_spec: Option<String>,
}

impl PrefixRecord {
    /// Assembles a prefix record from the artifact record and the manifest
    /// produced by the link phase.
    pub fn from_repodata_record(
        repodata_record: RepoDataRecord,
        paths: Vec<PathsEntry>,
        link: Option<Link>,
        requested_spec: Option<String>,
    ) -> Self {
        let mut files: Vec<PathBuf> = paths
            .iter()
            .map(|entry| entry.relative_path.clone())
            .collect();
        files.sort();
        Self {
            repodata_record,
            files,
            paths_data: paths.into(),
            link,
            requested_spec,
        }
    }

    /// The canonical conda-meta file name: `<name>-<version>-<build>.json`.
    pub fn file_name(&self) -> String {
        let record = &self.repodata_record.package_record;
        format!("{}-{}-{}.json", record.name, record.version, record.build)
    }

    /// Parses a record from a conda-meta file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let contents = fs_err::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Writes the record to the given path. The write is atomic: contents go
    /// to a temporary file in the same directory which is then renamed.
    pub fn write_to_path(&self, path: impl AsRef<Path>) -> Result<(), std::io::Error> {
        let path = path.as_ref();
        let directory = path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(directory)?;
        serde_json::to_writer_pretty(&mut temp, self)?;
        temp.flush()?;
        temp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Reads all records from `<prefix>/conda-meta/*.json`, sorted by
    /// package name. A missing conda-meta directory yields an empty vec.
    pub fn collect_from_prefix(prefix: &Path) -> Result<Vec<PrefixRecord>, std::io::Error> {
        let conda_meta = prefix.join("conda-meta");
        if !conda_meta.is_dir() {
            return Ok(Vec::new());
        }

        let mut records = Vec::new();
        for entry in fs_err::read_dir(&conda_meta)? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                records.push(Self::from_path(&path)?);
            }
        }
        records.sort_by(|a, b| {
            a.repodata_record
                .package_record
                .name
                .cmp(&b.repodata_record.package_record.name)
        });
        Ok(records)
    }
}

impl FromStr for PrefixRecord {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

impl AsRef<RepoDataRecord> for PrefixRecord {
    fn as_ref(&self) -> &RepoDataRecord {
        &self.repodata_record
    }
}

impl AsRef<PackageRecord> for PrefixRecord {
    fn as_ref(&self) -> &PackageRecord {
        &self.repodata_record.package_record
    }
}

#[cfg(test)]
mod test {
    use std::{path::PathBuf, str::FromStr};

    use url::Url;

    use super::{PathType, PathsEntry, PrefixRecord};
    use crate::{PackageName, PackageRecord, RepoDataRecord, Version};

    fn sample() -> PrefixRecord {
        let package_record = PackageRecord::new(
            PackageName::new("zlib").unwrap(),
            Version::from_str("1.2.13").unwrap(),
            "h166bdaf_4",
        );
        let repodata_record = RepoDataRecord {
            package_record,
            file_name: "zlib-1.2.13-h166bdaf_4.conda".to_owned(),
            url: Url::parse(
                "https://conda.anaconda.org/conda-forge/linux-64/zlib-1.2.13-h166bdaf_4.conda",
            )
            .unwrap(),
            channel: "https://conda.anaconda.org/conda-forge".to_owned(),
        };
        PrefixRecord::from_repodata_record(
            repodata_record,
            vec![
                PathsEntry {
                    relative_path: PathBuf::from("lib/libz.so.1.2.13"),
                    path_type: PathType::HardLink,
                    no_link: false,
                    sha256: None,
                    sha256_in_prefix: None,
                    size_in_bytes: Some(121_312),
                    file_mode: None,
                    prefix_placeholder: None,
                },
                PathsEntry {
                    relative_path: PathBuf::from("include/zlib.h"),
                    path_type: PathType::HardLink,
                    no_link: false,
                    sha256: None,
                    sha256_in_prefix: None,
                    size_in_bytes: Some(97_323),
                    file_mode: None,
                    prefix_placeholder: None,
                },
            ],
            None,
            Some("zlib >=1.2".to_owned()),
        )
    }

    #[test]
    fn file_name_is_canonical() {
        assert_eq!(sample().file_name(), "zlib-1.2.13-h166bdaf_4.json");
    }

    #[test]
    fn files_are_sorted() {
        let record = sample();
        assert_eq!(
            record.files,
            vec![
                PathBuf::from("include/zlib.h"),
                PathBuf::from("lib/libz.so.1.2.13")
            ]
        );
    }

    #[test]
    fn write_and_collect_round_trip() {
        let prefix = tempfile::tempdir().unwrap();
        let conda_meta = prefix.path().join("conda-meta");
        fs_err::create_dir_all(&conda_meta).unwrap();

        let record = sample();
        record
            .write_to_path(conda_meta.join(record.file_name()))
            .unwrap();

        let collected = PrefixRecord::collect_from_prefix(prefix.path()).unwrap();
        assert_eq!(collected, vec![record]);
    }

    #[test]
    fn missing_conda_meta_is_empty() {
        let prefix = tempfile::tempdir().unwrap();
        assert!(PrefixRecord::collect_from_prefix(prefix.path())
            .unwrap()
            .is_empty());
    }
}
