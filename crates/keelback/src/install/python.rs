//! Python-specific install logic: locating the interpreter of an
//! environment and relocating `noarch: python` packages into it.

use std::path::{Path, PathBuf};

use keelback_types::{PackageRecord, Platform, Version};

/// Errors from interpreting a python version.
#[derive(Debug, thiserror::Error)]
pub enum PythonInfoError {
    /// The version lacks the major.minor components.
    #[error("cannot derive python paths from version '{0}'")]
    InvalidVersion(Version),
}

/// The layout of the python installation inside a prefix.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PythonInfo {
    /// Major and minor version of the interpreter.
    pub short_version: (u64, u64),

    /// The `site-packages` directory, relative to the prefix.
    pub site_packages_path: PathBuf,

    /// The directory scripts are installed into, relative to the prefix.
    pub bin_dir: PathBuf,

    /// The interpreter binary, relative to the prefix.
    pub path: PathBuf,
}

impl PythonInfo {
    /// Derives the layout from the version of a python package.
    pub fn from_version(
        version: &Version,
        platform: Platform,
    ) -> Result<PythonInfo, PythonInfoError> {
        let (major, minor) = version
            .as_major_minor()
            .ok_or_else(|| PythonInfoError::InvalidVersion(version.clone()))?;

        if platform.is_windows() {
            Ok(PythonInfo {
                short_version: (major, minor),
                site_packages_path: PathBuf::from("Lib/site-packages"),
                bin_dir: PathBuf::from("Scripts"),
                path: PathBuf::from("python.exe"),
            })
        } else {
            Ok(PythonInfo {
                short_version: (major, minor),
                site_packages_path: PathBuf::from(format!(
                    "lib/python{major}.{minor}/site-packages"
                )),
                bin_dir: PathBuf::from("bin"),
                path: PathBuf::from(format!("bin/python{major}.{minor}")),
            })
        }
    }

    /// Returns true when switching from `other` to this interpreter forces
    /// noarch python packages to be relinked: their files live in a
    /// versioned `site-packages` directory.
    pub fn is_relink_required(&self, other: &PythonInfo) -> bool {
        self.short_version != other.short_version
    }

    /// Maps a path from inside a noarch python package to its place in the
    /// prefix: `site-packages/...` moves into the interpreter's
    /// site-packages, `python-scripts/...` into the script directory.
    pub fn map_noarch_path(&self, relative_path: &Path) -> PathBuf {
        if let Ok(rest) = relative_path.strip_prefix("site-packages") {
            self.site_packages_path.join(rest)
        } else if let Ok(rest) = relative_path.strip_prefix("python-scripts") {
            self.bin_dir.join(rest)
        } else {
            relative_path.to_owned()
        }
    }
}

/// Finds the python record in a set of records, if any.
pub fn find_python_record<'r, T: AsRef<PackageRecord>>(records: &'r [T]) -> Option<&'r PackageRecord> {
    records
        .iter()
        .map(AsRef::as_ref)
        .find(|record| record.name == "python")
}

/// Byte-compiles the given source files with the environment's own
/// interpreter. Failures are logged and otherwise ignored; a missing or
/// broken interpreter must not fail the transaction.
pub async fn compile_pyc(prefix: &Path, python: &PythonInfo, sources: &[PathBuf]) -> Vec<PathBuf> {
    if sources.is_empty() {
        return Vec::new();
    }
    let interpreter = prefix.join(&python.path);
    if !interpreter.exists() {
        return Vec::new();
    }

    let mut command = tokio::process::Command::new(&interpreter);
    command
        .current_dir(prefix)
        .arg("-Wi")
        .arg("-m")
        .arg("py_compile");
    for source in sources {
        command.arg(source);
    }

    match command.output().await {
        Ok(output) if output.status.success() => sources
            .iter()
            .filter_map(|source| pyc_path(source, python.short_version))
            .filter(|pyc| prefix.join(pyc).is_file())
            .collect(),
        Ok(output) => {
            tracing::warn!(
                "pyc compilation failed: {}",
                String::from_utf8_lossy(&output.stderr)
            );
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("could not run the prefix python: {e}");
            Vec::new()
        }
    }
}

/// The `__pycache__` path of a compiled module.
pub fn pyc_path(source: &Path, (major, minor): (u64, u64)) -> Option<PathBuf> {
    let file_stem = source.file_stem()?.to_str()?;
    let parent = source.parent()?;
    Some(parent.join("__pycache__").join(format!(
        "{file_stem}.cpython-{major}{minor}.pyc"
    )))
}
