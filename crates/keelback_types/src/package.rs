//! The metadata files shipped inside package archives under `info/`.

use std::path::{Path, PathBuf};

use keelback_digest::{serde::HexDigest, Sha256, Sha256Hash};
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, skip_serializing_none};

use crate::{
    build_number_spec::BuildNumber, prefix_record, NoArchType, PackageName, Version,
};

/// The `info/index.json` file: the record fields of the package itself.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexJson {
    /// The name of the package.
    pub name: PackageName,

    /// The version of the package.
    pub version: Version,

    /// The build string.
    pub build: String,

    /// The build number.
    #[serde(default)]
    pub build_number: BuildNumber,

    /// The dependency specs.
    #[serde(default)]
    pub depends: Vec<String>,

    /// The run constraints.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constrains: Vec<String>,

    /// The subdir the package was built for.
    pub subdir: Option<String>,

    /// The noarch kind, when the package is architecture independent.
    #[serde(default, skip_serializing_if = "NoArchType::is_none")]
    pub noarch: NoArchType,
}

impl IndexJson {
    /// Reads `info/index.json` from an extracted package directory.
    pub fn from_package_directory(directory: &Path) -> Result<Self, std::io::Error> {
        let contents = fs_err::read_to_string(directory.join("info/index.json"))?;
        Ok(serde_json::from_str(&contents)?)
    }
}

/// How a file is installed, as declared in `info/paths.json`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackagePathType {
    /// The file should be hard linked when possible.
    HardLink,
    /// The file should be symlinked when possible.
    SoftLink,
    /// An empty directory that must exist in the prefix.
    Directory,
}

impl From<PackagePathType> for prefix_record::PathType {
    fn from(path_type: PackagePathType) -> Self {
        match path_type {
            PackagePathType::HardLink => prefix_record::PathType::HardLink,
            PackagePathType::SoftLink => prefix_record::PathType::SoftLink,
            PackagePathType::Directory => prefix_record::PathType::Directory,
        }
    }
}

/// One entry of `info/paths.json`.
#[serde_as]
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagePathsEntry {
    /// The path relative to the package root.
    #[serde(rename = "_path")]
    pub relative_path: PathBuf,

    /// How the file wants to be installed.
    #[serde(default = "default_path_type")]
    pub path_type: PackagePathType,

    /// The sentinel string to replace with the target prefix at link time.
    #[serde(default)]
    pub prefix_placeholder: Option<String>,

    /// Whether the replacement is text mode or padded binary mode.
    #[serde(default)]
    pub file_mode: Option<prefix_record::FileMode>,

    /// True when the file must never be hard linked (e.g. it is mutated in
    /// place after installation).
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub no_link: bool,

    /// The SHA256 of the file contents.
    #[serde_as(as = "Option<HexDigest<Sha256>>")]
    #[serde(default)]
    pub sha256: Option<Sha256Hash>,

    /// The size of the file in bytes.
    #[serde(default)]
    pub size_in_bytes: Option<u64>,
}

fn default_path_type() -> PackagePathType {
    PackagePathType::HardLink
}

/// The `info/paths.json` file: every file the package installs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsJson {
    /// The version of the file format.
    pub paths_version: u64,

    /// The entries.
    #[serde(default)]
    pub paths: Vec<PackagePathsEntry>,
}

impl PathsJson {
    /// Reads `info/paths.json` from an extracted package directory. Falls
    /// back to reconstructing the entries from the legacy `info/files` +
    /// `info/has_prefix` + `info/no_link` files when `paths.json` is absent.
    pub fn from_package_directory(directory: &Path) -> Result<Self, std::io::Error> {
        match fs_err::read_to_string(directory.join("info/paths.json")) {
            Ok(contents) => Ok(serde_json::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Self::from_legacy_package_directory(directory)
            }
            Err(e) => Err(e),
        }
    }

    /// Reconstructs paths metadata from the pre-`paths.json` layout.
    fn from_legacy_package_directory(directory: &Path) -> Result<Self, std::io::Error> {
        let files = fs_err::read_to_string(directory.join("info/files"))?;

        let has_prefix = fs_err::read_to_string(directory.join("info/has_prefix")).ok();
        let mut placeholders: Vec<(String, prefix_record::FileMode, PathBuf)> = Vec::new();
        for line in has_prefix.as_deref().unwrap_or("").lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // Either `placeholder mode path` or just `path`.
            let fields: Vec<&str> = line.splitn(3, ' ').collect();
            match fields.as_slice() {
                [placeholder, mode, path] => placeholders.push((
                    placeholder.trim_matches('"').to_owned(),
                    if *mode == "binary" {
                        prefix_record::FileMode::Binary
                    } else {
                        prefix_record::FileMode::Text
                    },
                    PathBuf::from(path.trim_matches('"')),
                )),
                [path] => placeholders.push((
                    default_placeholder(),
                    prefix_record::FileMode::Text,
                    PathBuf::from(path.trim_matches('"')),
                )),
                _ => {}
            }
        }

        let no_link: Vec<PathBuf> = fs_err::read_to_string(directory.join("info/no_link"))
            .map(|contents| contents.lines().map(PathBuf::from).collect())
            .unwrap_or_default();

        let paths = files
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let relative_path = PathBuf::from(line.trim());
                let placeholder = placeholders
                    .iter()
                    .find(|(_, _, path)| path == &relative_path);
                PackagePathsEntry {
                    path_type: if directory
                        .join(&relative_path)
                        .symlink_metadata()
                        .map(|metadata| metadata.file_type().is_symlink())
                        .unwrap_or(false)
                    {
                        PackagePathType::SoftLink
                    } else {
                        PackagePathType::HardLink
                    },
                    prefix_placeholder: placeholder.map(|(text, _, _)| text.clone()),
                    file_mode: placeholder.map(|(_, mode, _)| *mode),
                    no_link: no_link.contains(&relative_path),
                    sha256: None,
                    size_in_bytes: None,
                    relative_path,
                }
            })
            .collect();

        Ok(PathsJson {
            paths_version: 1,
            paths,
        })
    }
}

/// The placeholder conda historically used when `has_prefix` does not name
/// one explicitly.
fn default_placeholder() -> String {
    "/opt/anaconda1anaconda2anaconda3".to_owned()
}

#[cfg(test)]
mod test {
    use super::{IndexJson, PathsJson};

    #[test]
    fn parses_index_json() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(dir.path().join("info")).unwrap();
        fs_err::write(
            dir.path().join("info/index.json"),
            r#"{
                "name": "zlib",
                "version": "1.2.13",
                "build": "h166bdaf_4",
                "build_number": 4,
                "depends": ["libgcc-ng >=12"],
                "subdir": "linux-64"
            }"#,
        )
        .unwrap();

        let index = IndexJson::from_package_directory(dir.path()).unwrap();
        assert_eq!(index.name.as_str(), "zlib");
        assert_eq!(index.build_number, 4);
        assert!(index.noarch.is_none());
    }

    #[test]
    fn parses_paths_json() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(dir.path().join("info")).unwrap();
        fs_err::write(
            dir.path().join("info/paths.json"),
            r#"{
                "paths_version": 1,
                "paths": [
                    {"_path": "lib/libz.so", "path_type": "hardlink", "size_in_bytes": 100},
                    {
                        "_path": "bin/zlib-config",
                        "path_type": "hardlink",
                        "prefix_placeholder": "/build/placeholder",
                        "file_mode": "text"
                    }
                ]
            }"#,
        )
        .unwrap();

        let paths = PathsJson::from_package_directory(dir.path()).unwrap();
        assert_eq!(paths.paths.len(), 2);
        assert_eq!(
            paths.paths[1].prefix_placeholder.as_deref(),
            Some("/build/placeholder")
        );
    }

    #[test]
    fn falls_back_to_legacy_files() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(dir.path().join("info")).unwrap();
        fs_err::write(dir.path().join("info/files"), "lib/libz.so\nbin/zlib-config\n").unwrap();
        fs_err::write(
            dir.path().join("info/has_prefix"),
            "/build/placeholder text bin/zlib-config\n",
        )
        .unwrap();
        fs_err::write(dir.path().join("info/no_link"), "lib/libz.so\n").unwrap();

        let paths = PathsJson::from_package_directory(dir.path()).unwrap();
        assert_eq!(paths.paths.len(), 2);
        assert!(paths.paths[0].no_link);
        assert_eq!(
            paths.paths[1].prefix_placeholder.as_deref(),
            Some("/build/placeholder")
        );
    }
}
