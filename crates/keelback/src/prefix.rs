//! State of an environment prefix: the `conda-meta` records, the merged
//! environment variables, the per-prefix transaction lock, and the global
//! environments registry.

use std::{
    collections::BTreeMap,
    io::Write,
    path::{Path, PathBuf},
};

use fxhash::FxHashMap;
use keelback_types::{MatchSpec, PackageName, PrefixRecord};
use serde::{Deserialize, Serialize};

/// Errors from reading or mutating prefix state.
#[derive(Debug, thiserror::Error)]
pub enum PrefixError {
    /// A filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A conda-meta record failed to parse.
    #[error("corrupt conda-meta record {path}: {source}")]
    CorruptRecord {
        /// The offending file.
        path: PathBuf,
        /// The parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The per-prefix lock could not be acquired in time.
    #[error("timed out waiting for the lock on prefix {0}")]
    LockTimeout(PathBuf),
}

/// Read and write access to the installed-package records of one prefix.
///
/// Records are loaded once and cached; mutations write through to disk.
#[derive(Debug)]
pub struct PrefixData {
    prefix: PathBuf,
    records: FxHashMap<PackageName, PrefixRecord>,
}

impl PrefixData {
    /// Loads all records from `<prefix>/conda-meta/`.
    pub fn from_prefix(prefix: impl Into<PathBuf>) -> Result<Self, PrefixError> {
        let prefix = prefix.into();
        let mut records = FxHashMap::default();
        for record in PrefixRecord::collect_from_prefix(&prefix)? {
            records.insert(
                record.repodata_record.package_record.name.clone(),
                record,
            );
        }
        Ok(PrefixData { prefix, records })
    }

    /// The prefix this data describes.
    pub fn prefix(&self) -> &Path {
        &self.prefix
    }

    /// All records, sorted by package name.
    pub fn iter_records(&self) -> impl Iterator<Item = &PrefixRecord> {
        let mut records: Vec<&PrefixRecord> = self.records.values().collect();
        records.sort_by(|a, b| {
            a.repodata_record
                .package_record
                .name
                .cmp(&b.repodata_record.package_record.name)
        });
        records.into_iter()
    }

    /// All records matching the given spec.
    pub fn query<'s>(&'s self, spec: &'s MatchSpec) -> impl Iterator<Item = &'s PrefixRecord> {
        self.iter_records()
            .filter(move |record| spec.matches_repodata(&record.repodata_record))
    }

    /// The installed record of the given package, if any.
    pub fn get(&self, name: &PackageName) -> Option<&PrefixRecord> {
        self.records.get(name)
    }

    /// Writes the record's conda-meta file and tracks it. Invoked by the
    /// link phase after all file operations succeeded.
    pub fn insert(&mut self, record: PrefixRecord) -> Result<(), PrefixError> {
        let conda_meta = self.prefix.join("conda-meta");
        fs_err::create_dir_all(&conda_meta)?;
        record.write_to_path(conda_meta.join(record.file_name()))?;
        self.records.insert(
            record.repodata_record.package_record.name.clone(),
            record,
        );
        Ok(())
    }

    /// Deletes the record's conda-meta file and forgets it. Invoked by the
    /// unlink phase after the package's files were removed.
    pub fn remove(&mut self, name: &PackageName) -> Result<Option<PrefixRecord>, PrefixError> {
        let Some(record) = self.records.remove(name) else {
            return Ok(None);
        };
        let path = self.prefix.join("conda-meta").join(record.file_name());
        match fs_err::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Some(record))
    }

    /// Merges environment variables into `conda-meta/state`. Later writers
    /// override earlier values for the same key.
    pub fn set_environment_env_vars(
        &self,
        env_vars: &BTreeMap<String, String>,
    ) -> Result<(), PrefixError> {
        let mut state = self.environment_state()?;
        state.env_vars.extend(env_vars.clone());
        self.write_environment_state(&state)
    }

    /// Removes environment variables from `conda-meta/state`.
    pub fn unset_environment_env_vars(&self, keys: &[String]) -> Result<(), PrefixError> {
        let mut state = self.environment_state()?;
        for key in keys {
            state.env_vars.remove(key);
        }
        self.write_environment_state(&state)
    }

    /// The parsed `conda-meta/state` file; missing means empty.
    pub fn environment_state(&self) -> Result<EnvironmentState, PrefixError> {
        let path = self.prefix.join("conda-meta").join("state");
        match fs_err::read_to_string(&path) {
            Ok(contents) => {
                serde_json::from_str(&contents).map_err(|source| PrefixError::CorruptRecord {
                    path,
                    source,
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Ok(EnvironmentState::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn write_environment_state(&self, state: &EnvironmentState) -> Result<(), PrefixError> {
        let conda_meta = self.prefix.join("conda-meta");
        fs_err::create_dir_all(&conda_meta)?;
        let mut temp = tempfile::NamedTempFile::new_in(&conda_meta)?;
        serde_json::to_writer_pretty(&mut temp, state)
            .map_err(std::io::Error::from)?;
        temp.flush()?;
        temp.persist(conda_meta.join("state")).map_err(|e| e.error)?;
        Ok(())
    }
}

/// The `conda-meta/state` file: environment variables contributed by the
/// linked packages.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct EnvironmentState {
    /// The merged environment variables.
    #[serde(default)]
    pub env_vars: BTreeMap<String, String>,
}

/// An exclusive advisory lock on a prefix, held for the duration of a
/// transaction. Concurrent transactions on the same prefix block on it.
pub struct PrefixGuard {
    _file: std::fs::File,
}

impl PrefixGuard {
    /// Acquires the lock, blocking until it is available.
    pub fn lock(prefix: &Path) -> Result<PrefixGuard, PrefixError> {
        let conda_meta = prefix.join("conda-meta");
        fs_err::create_dir_all(&conda_meta)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(conda_meta.join(".lock"))?;
        fs4::fs_std::FileExt::lock_exclusive(&file)?;
        Ok(PrefixGuard { _file: file })
    }

    /// Acquires the lock, giving up after the deadline.
    pub fn lock_with_timeout(
        prefix: &Path,
        timeout: std::time::Duration,
    ) -> Result<PrefixGuard, PrefixError> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(guard) = Self::try_lock(prefix)? {
                return Ok(guard);
            }
            if std::time::Instant::now() >= deadline {
                return Err(PrefixError::LockTimeout(prefix.to_owned()));
            }
            std::thread::sleep(std::time::Duration::from_millis(100));
        }
    }

    /// Tries to acquire the lock without blocking.
    pub fn try_lock(prefix: &Path) -> Result<Option<PrefixGuard>, PrefixError> {
        let conda_meta = prefix.join("conda-meta");
        fs_err::create_dir_all(&conda_meta)?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(conda_meta.join(".lock"))?;
        match fs4::fs_std::FileExt::try_lock_exclusive(&file) {
            Ok(true) => Ok(Some(PrefixGuard { _file: file })),
            Ok(false) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

/// The append-only registry of known environments,
/// `~/.conda/environments.txt`. Writes take a file lock; reads deduplicate.
#[derive(Debug)]
pub struct EnvironmentsRegistry {
    path: PathBuf,
}

impl EnvironmentsRegistry {
    /// The registry at its default location under the user's home.
    pub fn default_location() -> EnvironmentsRegistry {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        EnvironmentsRegistry {
            path: home.join(".conda").join("environments.txt"),
        }
    }

    /// A registry backed by an explicit file, for tests.
    pub fn at(path: impl Into<PathBuf>) -> EnvironmentsRegistry {
        EnvironmentsRegistry { path: path.into() }
    }

    /// Registers a prefix, appending it unless already present.
    pub fn register(&self, prefix: &Path) -> Result<(), PrefixError> {
        if let Some(parent) = self.path.parent() {
            fs_err::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(&self.path)?;
        fs4::fs_std::FileExt::lock_exclusive(&file)?;

        // Re-read under the lock so concurrent registrations stay unique.
        let known = self.list()?;
        if !known.iter().any(|known| known == prefix) {
            let mut file = file;
            writeln!(file, "{}", prefix.display())?;
        }
        Ok(())
    }

    /// The registered environments, deduplicated, in first-seen order.
    pub fn list(&self) -> Result<Vec<PathBuf>, PrefixError> {
        let contents = match fs_err::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut seen = Vec::new();
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let path = PathBuf::from(line);
            if !seen.contains(&path) {
                seen.push(path);
            }
        }
        Ok(seen)
    }
}
