//! The shared package cache: downloaded archives and extracted package
//! directories, safe for concurrent use by multiple processes.

use std::path::{Path, PathBuf};

use keelback_types::RepoDataRecord;
use reqwest_middleware::ClientWithMiddleware;
use tracing::debug;

use crate::acquire::{self, AcquireError};

/// A package cache rooted at one `pkgs` directory.
///
/// Layout, per package `<name>-<version>-<build>`:
/// `<root>/<fn>` holds the downloaded archive, `<root>/<stem>/` the
/// extracted contents, and `<root>/locks/<stem>.lock` the advisory lock
/// taken while writing either.
#[derive(Debug, Clone)]
pub struct PackageCache {
    root: PathBuf,
}

impl PackageCache {
    /// Opens (and creates) a cache at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Result<PackageCache, std::io::Error> {
        let root = root.into();
        fs_err::create_dir_all(root.join("locks"))?;
        Ok(PackageCache { root })
    }

    /// The root directory of the cache.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path the archive of a record is stored at.
    pub fn archive_path(&self, record: &RepoDataRecord) -> PathBuf {
        self.root.join(&record.file_name)
    }

    /// The directory a record is extracted into.
    pub fn extracted_dir(&self, record: &RepoDataRecord) -> PathBuf {
        let stem = acquire::ArchiveFormat::from_file_name(&record.file_name)
            .map_or(record.file_name.as_str(), |(stem, _)| stem);
        self.root.join(stem)
    }

    /// Returns true when a verified archive for the record is present.
    pub fn has_valid_archive(&self, record: &RepoDataRecord) -> bool {
        let path = self.archive_path(record);
        path.is_file() && acquire::verify_archive(record, &path).is_ok()
    }

    /// Returns true when the record is already extracted.
    pub fn is_extracted(&self, record: &RepoDataRecord) -> bool {
        self.extracted_dir(record).join("info").is_dir()
    }

    /// Makes sure the record is present and extracted, downloading and
    /// unpacking as necessary, and returns the extracted directory. An
    /// exclusive per-package file lock serializes writers across processes.
    pub async fn ensure_extracted(
        &self,
        client: &ClientWithMiddleware,
        record: &RepoDataRecord,
    ) -> Result<PathBuf, AcquireError> {
        let extracted = self.extracted_dir(record);
        if self.is_extracted(record) {
            return Ok(extracted);
        }

        let _guard = self.lock_package(record).await?;

        // Another process may have finished while we waited for the lock.
        if self.is_extracted(record) {
            return Ok(extracted);
        }

        let archive = self.archive_path(record);
        if !self.has_valid_archive(record) {
            debug!("downloading {}", record.file_name);
            acquire::download_package(client, record, &archive).await?;
        }
        debug!("extracting {}", record.file_name);
        acquire::extract_package(archive, extracted.clone()).await?;
        Ok(extracted)
    }

    async fn lock_package(&self, record: &RepoDataRecord) -> Result<PackageLock, AcquireError> {
        let lock_path = self
            .root
            .join("locks")
            .join(format!("{}.lock", record.file_name));
        tokio::task::spawn_blocking(move || -> Result<PackageLock, std::io::Error> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            fs4::fs_std::FileExt::lock_exclusive(&file)?;
            Ok(PackageLock { _file: file })
        })
        .await?
        .map_err(Into::into)
    }
}

struct PackageLock {
    _file: std::fs::File,
}
