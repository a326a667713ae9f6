//! Removing a linked package from a prefix.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};

use keelback_types::{PathType, PrefixRecord};

/// Errors from unlinking a package.
#[derive(Debug, thiserror::Error)]
pub enum UnlinkError {
    /// A file could not be deleted.
    #[error("failed to delete {path}: {source}")]
    FailedToDelete {
        /// The file that could not be removed.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A directory could not be read while sweeping empty directories.
    #[error("failed to read directory {path}: {source}")]
    FailedToReadDirectory {
        /// The directory concerned.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
}

/// Removes all files of the record from the prefix, then sweeps the now
/// empty parent directories. The conda-meta record itself is removed by the
/// caller afterwards, so a crash between the two leaves a record that
/// points at missing files rather than orphaned files.
pub fn unlink_package(
    target_prefix: &Path,
    record: &PrefixRecord,
    keep_directories: &HashSet<PathBuf>,
) -> Result<(), UnlinkError> {
    let is_python_noarch = record
        .repodata_record
        .package_record
        .noarch
        .is_python();

    let mut parents: Vec<PathBuf> = Vec::new();
    for entry in &record.paths_data.paths {
        let path = target_prefix.join(&entry.relative_path);
        if entry.path_type == PathType::Directory {
            parents.push(path);
            continue;
        }
        match fs_err::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(UnlinkError::FailedToDelete {
                    path: entry.relative_path.clone(),
                    source,
                })
            }
        }
        if let Some(parent) = path.parent() {
            parents.push(parent.to_owned());
        }
    }

    // Deepest directories first so whole empty trees collapse.
    parents.sort();
    parents.dedup();
    for parent in parents.into_iter().rev() {
        remove_empty_directories_upward(
            &parent,
            target_prefix,
            is_python_noarch,
            keep_directories,
        )?;
    }
    Ok(())
}

/// Removes the directory when it is empty (or only holds a `__pycache__` of
/// a noarch python package), then tries the same for its parent, stopping
/// at the prefix root or the first non-empty directory.
pub(crate) fn remove_empty_directories_upward(
    directory: &Path,
    target_prefix: &Path,
    is_python_noarch: bool,
    keep_directories: &HashSet<PathBuf>,
) -> Result<(), UnlinkError> {
    let mut current = directory.to_owned();
    loop {
        if current == target_prefix
            || !current.starts_with(target_prefix)
            || keep_directories.contains(&current)
            || !current.exists()
        {
            return Ok(());
        }

        let mut entries =
            fs_err::read_dir(&current).map_err(|source| UnlinkError::FailedToReadDirectory {
                path: current.clone(),
                source,
            })?;

        let removable = match entries.next().transpose().map_err(|source| {
            UnlinkError::FailedToReadDirectory {
                path: current.clone(),
                source,
            }
        })? {
            None => true,
            Some(only) => {
                // A leftover __pycache__ does not keep a noarch package
                // directory alive.
                is_python_noarch
                    && only.file_name() == "__pycache__"
                    && entries.next().is_none()
            }
        };
        if !removable {
            return Ok(());
        }

        fs_err::remove_dir_all(&current).map_err(|source| UnlinkError::FailedToDelete {
            path: current.clone(),
            source,
        })?;

        match current.parent() {
            Some(parent) => current = parent.to_owned(),
            None => return Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashSet, path::PathBuf, str::FromStr};

    use keelback_types::{
        NoArchType, PackageName, PackageRecord, PathType, PathsEntry, PrefixRecord,
        RepoDataRecord, Version,
    };
    use url::Url;

    use super::unlink_package;

    fn paths_entry(path: &str) -> PathsEntry {
        PathsEntry {
            relative_path: PathBuf::from(path),
            path_type: PathType::HardLink,
            no_link: false,
            sha256: None,
            sha256_in_prefix: None,
            size_in_bytes: None,
            file_mode: None,
            prefix_placeholder: None,
        }
    }

    fn record(name: &str, paths: Vec<PathsEntry>, noarch: NoArchType) -> PrefixRecord {
        let mut package_record = PackageRecord::new(
            PackageName::new(name).unwrap(),
            Version::from_str("1.0").unwrap(),
            "0",
        );
        package_record.noarch = noarch;
        PrefixRecord::from_repodata_record(
            RepoDataRecord {
                file_name: format!("{name}-1.0-0.conda"),
                url: Url::parse("https://example.com/x.conda").unwrap(),
                channel: "test".to_owned(),
                package_record,
            },
            paths,
            None,
            None,
        )
    }

    #[test]
    fn removes_files_and_empty_directories() {
        let prefix = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(prefix.path().join("lib/deep")).unwrap();
        fs_err::write(prefix.path().join("lib/deep/libx.so"), "x").unwrap();
        fs_err::write(prefix.path().join("lib/keepme.so"), "y").unwrap();

        let record = record(
            "x",
            vec![paths_entry("lib/deep/libx.so")],
            NoArchType::None,
        );
        unlink_package(prefix.path(), &record, &HashSet::new()).unwrap();

        assert!(!prefix.path().join("lib/deep").exists());
        // lib still holds another package's file.
        assert!(prefix.path().join("lib/keepme.so").exists());
    }

    #[test]
    fn missing_files_are_tolerated() {
        let prefix = tempfile::tempdir().unwrap();
        let record = record("x", vec![paths_entry("bin/gone")], NoArchType::None);
        unlink_package(prefix.path(), &record, &HashSet::new()).unwrap();
    }

    #[test]
    fn pycache_does_not_keep_noarch_directories_alive() {
        let prefix = tempfile::tempdir().unwrap();
        let package_dir = prefix.path().join("lib/python3.11/site-packages/pkg");
        fs_err::create_dir_all(package_dir.join("__pycache__")).unwrap();
        fs_err::write(package_dir.join("__init__.py"), "").unwrap();
        fs_err::write(
            package_dir.join("__pycache__/__init__.cpython-311.pyc"),
            "",
        )
        .unwrap();

        let record = record(
            "pkg",
            vec![paths_entry("lib/python3.11/site-packages/pkg/__init__.py")],
            NoArchType::Python,
        );
        unlink_package(prefix.path(), &record, &HashSet::new()).unwrap();
        assert!(!package_dir.exists());
    }

    #[test]
    fn kept_directories_survive() {
        let prefix = tempfile::tempdir().unwrap();
        fs_err::create_dir_all(prefix.path().join("etc/conda")).unwrap();
        fs_err::write(prefix.path().join("etc/conda/vars.json"), "{}").unwrap();

        let record = record("x", vec![paths_entry("etc/conda/vars.json")], NoArchType::None);
        let keep = HashSet::from([prefix.path().join("etc/conda")]);
        unlink_package(prefix.path(), &record, &keep).unwrap();
        assert!(prefix.path().join("etc/conda").exists());
    }
}
