//! Downloading and extracting package archives.
//!
//! Downloads stream into a `.part` file next to the final archive location
//! and are resumed with a ranged request when the server supports it. The
//! archive digest is verified before the file is promoted. Both archive
//! formats are understood: `.tar.bz2` (a bzip2 compressed tar) and `.conda`
//! (a zip containing zstd compressed inner tars).

use std::{io::Read, path::{Path, PathBuf}};

use keelback_digest::{digest_file, Md5, Sha256};
use keelback_types::RepoDataRecord;
use reqwest::{header, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use tokio::io::AsyncWriteExt;
use tracing::debug;

/// Errors from acquiring a package.
#[derive(Debug, thiserror::Error)]
pub enum AcquireError {
    /// The download failed.
    #[error("failed to download {url}: {source}")]
    Download {
        /// The url that failed.
        url: url::Url,
        /// The transport failure.
        #[source]
        source: reqwest_middleware::Error,
    },

    /// The server responded with an error status.
    #[error("the server responded with {status} for {url}")]
    DownloadStatus {
        /// The url that failed.
        url: url::Url,
        /// The status code.
        status: StatusCode,
    },

    /// The downloaded archive does not match its declared digest, even
    /// after one re-download.
    #[error("checksum mismatch for {file_name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// The archive filename.
        file_name: String,
        /// The digest from the repodata.
        expected: String,
        /// The digest of the downloaded file.
        actual: String,
    },

    /// The archive is not a recognizable conda package.
    #[error("malformed package archive {0}: {1}")]
    MalformedArchive(PathBuf, String),

    /// A filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<tokio::task::JoinError> for AcquireError {
    fn from(err: tokio::task::JoinError) -> Self {
        if let Ok(panic) = err.try_into_panic() {
            std::panic::resume_unwind(panic);
        }
        AcquireError::Cancelled
    }
}

/// The two conda archive formats.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ArchiveFormat {
    /// The legacy `.tar.bz2` format.
    TarBz2,
    /// The newer `.conda` format.
    Conda,
}

impl ArchiveFormat {
    /// Determines the format from an archive filename.
    pub fn from_file_name(file_name: &str) -> Option<(&str, ArchiveFormat)> {
        if let Some(stem) = file_name.strip_suffix(".conda") {
            Some((stem, ArchiveFormat::Conda))
        } else {
            file_name
                .strip_suffix(".tar.bz2")
                .map(|stem| (stem, ArchiveFormat::TarBz2))
        }
    }
}

/// Verifies a downloaded archive against the digests in its record. SHA256
/// is preferred; MD5 is checked when no SHA256 is published; a record
/// without digests validates trivially.
pub fn verify_archive(record: &RepoDataRecord, path: &Path) -> Result<(), AcquireError> {
    if let Some(expected) = &record.package_record.sha256 {
        let actual = digest_file::<Sha256>(path)?;
        if &actual != expected {
            return Err(AcquireError::ChecksumMismatch {
                file_name: record.file_name.clone(),
                expected: format!("{expected:x}"),
                actual: format!("{actual:x}"),
            });
        }
        return Ok(());
    }
    if let Some(expected) = &record.package_record.md5 {
        let actual = digest_file::<Md5>(path)?;
        if &actual != expected {
            return Err(AcquireError::ChecksumMismatch {
                file_name: record.file_name.clone(),
                expected: format!("{expected:x}"),
                actual: format!("{actual:x}"),
            });
        }
    }
    Ok(())
}

/// Downloads the archive of a record to `destination`, resuming a partial
/// download when possible and verifying the digest. On a digest mismatch
/// the download is restarted from scratch exactly once.
pub async fn download_package(
    client: &ClientWithMiddleware,
    record: &RepoDataRecord,
    destination: &Path,
) -> Result<(), AcquireError> {
    let part_path = destination.with_extension(format!(
        "{}.part",
        destination
            .extension()
            .map(|ext| ext.to_string_lossy().into_owned())
            .unwrap_or_default()
    ));

    for attempt in 0..2 {
        download_to_part_file(client, record, &part_path).await?;

        match verify_archive(record, &part_path) {
            Ok(()) => {
                fs_err::rename(&part_path, destination)?;
                return Ok(());
            }
            Err(AcquireError::ChecksumMismatch { .. }) if attempt == 0 => {
                debug!(
                    "checksum mismatch for {}, re-downloading once",
                    record.file_name
                );
                fs_err::remove_file(&part_path)?;
            }
            Err(e) => {
                let _ = fs_err::remove_file(&part_path);
                return Err(e);
            }
        }
    }
    unreachable!("the second verification either succeeds or returns");
}

async fn download_to_part_file(
    client: &ClientWithMiddleware,
    record: &RepoDataRecord,
    part_path: &Path,
) -> Result<(), AcquireError> {
    let resume_from = match fs_err::metadata(part_path) {
        Ok(metadata) => metadata.len(),
        Err(_) => 0,
    };

    let mut request = client.get(record.url.clone());
    if resume_from > 0 {
        request = request.header(header::RANGE, format!("bytes={resume_from}-"));
    }
    let response = request.send().await.map_err(|source| AcquireError::Download {
        url: record.url.clone(),
        source,
    })?;

    let (mut file, appending) = match response.status() {
        StatusCode::PARTIAL_CONTENT => {
            let file = tokio::fs::OpenOptions::new()
                .append(true)
                .open(part_path)
                .await?;
            (file, true)
        }
        status if status.is_success() => {
            // The server ignored the range (or none was requested): start
            // over with a truncated file.
            let file = tokio::fs::File::create(part_path).await?;
            (file, false)
        }
        status => {
            return Err(AcquireError::DownloadStatus {
                url: record.url.clone(),
                status,
            })
        }
    };
    if appending {
        debug!(
            "resuming download of {} at byte {resume_from}",
            record.file_name
        );
    }

    let mut stream = response.bytes_stream();
    use futures::StreamExt;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|source| AcquireError::Download {
            url: record.url.clone(),
            source: source.into(),
        })?;
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(())
}

/// Extracts an archive into `destination`. The extraction happens into a
/// sibling temporary directory which is atomically renamed, so a crash
/// never leaves a half-extracted package behind.
pub async fn extract_package(
    archive_path: PathBuf,
    destination: PathBuf,
) -> Result<(), AcquireError> {
    tokio::task::spawn_blocking(move || extract_package_blocking(&archive_path, &destination))
        .await?
}

fn extract_package_blocking(archive_path: &Path, destination: &Path) -> Result<(), AcquireError> {
    let file_name = archive_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let Some((_, format)) = ArchiveFormat::from_file_name(&file_name) else {
        return Err(AcquireError::MalformedArchive(
            archive_path.to_owned(),
            "unknown archive extension".to_owned(),
        ));
    };

    let parent = destination
        .parent()
        .expect("extraction destinations always have a parent");
    fs_err::create_dir_all(parent)?;
    let staging = tempfile::tempdir_in(parent)?;

    match format {
        ArchiveFormat::TarBz2 => {
            let file = fs_err::File::open(archive_path)?;
            let decoder = bzip2::read::BzDecoder::new(file);
            unpack_tar(decoder, staging.path(), archive_path)?;
        }
        ArchiveFormat::Conda => {
            let file = fs_err::File::open(archive_path)?;
            let mut zip = zip::ZipArchive::new(file.into_parts().0).map_err(|e| {
                AcquireError::MalformedArchive(archive_path.to_owned(), e.to_string())
            })?;
            let names: Vec<String> = zip.file_names().map(ToOwned::to_owned).collect();
            let mut inner_tars: Vec<&String> = names
                .iter()
                .filter(|name| name.ends_with(".tar.zst"))
                .collect();
            if inner_tars.is_empty() {
                return Err(AcquireError::MalformedArchive(
                    archive_path.to_owned(),
                    "no inner tarballs".to_owned(),
                ));
            }
            // Extract `info-*` before `pkg-*` so metadata is complete first.
            inner_tars.sort_by_key(|name| !name.starts_with("info-"));
            for name in inner_tars {
                let entry = zip.by_name(name).map_err(|e| {
                    AcquireError::MalformedArchive(archive_path.to_owned(), e.to_string())
                })?;
                let decoder = zstd::stream::read::Decoder::new(entry)?;
                unpack_tar(decoder, staging.path(), archive_path)?;
            }
        }
    }

    // Another process may have extracted the package concurrently; their
    // result is as good as ours.
    match fs_err::rename(staging.keep(), destination) {
        Ok(()) => Ok(()),
        Err(_) if destination.join("info").is_dir() => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn unpack_tar(
    reader: impl Read,
    destination: &Path,
    archive_path: &Path,
) -> Result<(), AcquireError> {
    let mut archive = tar::Archive::new(reader);
    archive.set_preserve_permissions(true);
    archive.unpack(destination).map_err(|e| {
        AcquireError::MalformedArchive(archive_path.to_owned(), e.to_string())
    })
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use keelback_digest::digest_bytes;
    use keelback_types::{PackageName, PackageRecord, RepoDataRecord, Version};
    use url::Url;

    use super::{extract_package, verify_archive, AcquireError, ArchiveFormat};

    fn record_with_sha(name: &str, sha256: keelback_digest::Sha256Hash) -> RepoDataRecord {
        let mut package_record = PackageRecord::new(
            PackageName::new(name).unwrap(),
            Version::major(1),
            "0",
        );
        package_record.sha256 = Some(sha256);
        RepoDataRecord {
            file_name: format!("{name}-1-0.tar.bz2"),
            url: Url::parse("https://example.com/pkg.tar.bz2").unwrap(),
            channel: "test".to_owned(),
            package_record,
        }
    }

    /// Builds a minimal `.tar.bz2` package archive.
    fn build_tar_bz2(dest: &std::path::Path, files: &[(&str, &str)]) {
        let file = std::fs::File::create(dest).unwrap();
        let encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::fast());
        let mut builder = tar::Builder::new(encoder);
        for (path, contents) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn archive_format_detection() {
        assert_eq!(
            ArchiveFormat::from_file_name("zlib-1.2.13-h0_4.conda"),
            Some(("zlib-1.2.13-h0_4", ArchiveFormat::Conda))
        );
        assert_eq!(
            ArchiveFormat::from_file_name("zlib-1.2.13-h0_4.tar.bz2"),
            Some(("zlib-1.2.13-h0_4", ArchiveFormat::TarBz2))
        );
        assert_eq!(ArchiveFormat::from_file_name("zlib.zip"), None);
    }

    #[test]
    fn verification_catches_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("pkg-1-0.tar.bz2");
        let mut file = std::fs::File::create(&archive).unwrap();
        file.write_all(b"payload").unwrap();

        let good = record_with_sha("pkg", digest_bytes::<keelback_digest::Sha256>(b"payload"));
        assert!(verify_archive(&good, &archive).is_ok());

        let bad = record_with_sha("pkg", digest_bytes::<keelback_digest::Sha256>(b"other"));
        assert!(matches!(
            verify_archive(&bad, &archive),
            Err(AcquireError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn extracts_tar_bz2() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("hello-1-0.tar.bz2");
        build_tar_bz2(
            &archive,
            &[
                ("info/index.json", r#"{"name": "hello", "version": "1", "build": "0"}"#),
                ("bin/hello", "#!/bin/sh\necho hello\n"),
            ],
        );

        let destination = dir.path().join("hello-1-0");
        extract_package(archive, destination.clone()).await.unwrap();

        assert!(destination.join("info/index.json").is_file());
        assert_eq!(
            std::fs::read_to_string(destination.join("bin/hello")).unwrap(),
            "#!/bin/sh\necho hello\n"
        );
    }

    #[tokio::test]
    async fn rejects_unknown_format() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("weird.zip");
        std::fs::write(&archive, "not an archive").unwrap();
        let result = extract_package(archive, dir.path().join("weird")).await;
        assert!(matches!(result, Err(AcquireError::MalformedArchive(..))));
    }
}
