//! Downloading and caching of `repodata.json` files.
//!
//! [`fetch_repo_data`] keeps one payload + state sidecar pair per subdir url
//! in the cache directory and revalidates it with conditional requests. A
//! `repodata.json.zst` variant is preferred when the server offers one, and
//! when a JLAP patch stream is available the cached payload is updated
//! incrementally instead of re-downloaded.

pub mod cache;
pub mod jlap;

use std::{
    io::Write,
    path::{Path, PathBuf},
};

use cache::{CacheHeaders, Expiring, RepodataState};
use keelback_digest::{digest_bytes, Blake2b256};
use reqwest::StatusCode;
use reqwest_middleware::ClientWithMiddleware;
use tokio::io::AsyncWriteExt;
use tracing::instrument;
use url::Url;

/// `repodata.json` could not be found for the requested subdir.
#[derive(Debug, thiserror::Error)]
pub enum RepoDataNotFoundError {
    /// The server answered 404.
    #[error("the server responded with 404 for {0}")]
    HttpNotFound(Url),

    /// A filesystem channel has no repodata file.
    #[error(transparent)]
    FileSystemError(#[from] std::io::Error),
}

/// Errors from [`fetch_repo_data`].
#[allow(missing_docs)]
#[derive(Debug, thiserror::Error)]
pub enum FetchRepoDataError {
    #[error("failed to acquire a lock on the repodata cache")]
    FailedToAcquireLock(#[source] anyhow::Error),

    #[error(transparent)]
    HttpError(reqwest_middleware::Error),

    #[error("the server refused access to {0}")]
    Unauthorized(Url),

    #[error("the server failed with status {status} for {url}")]
    ServerError {
        status: StatusCode,
        url: Url,
    },

    #[error("repodata not found")]
    NotFound(#[from] RepoDataNotFoundError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),

    #[error("there is no usable cache entry and fetching was not allowed")]
    NoCacheAvailable,

    #[error("the operation was cancelled")]
    Cancelled,
}

impl From<reqwest_middleware::Error> for FetchRepoDataError {
    fn from(err: reqwest_middleware::Error) -> Self {
        FetchRepoDataError::HttpError(err)
    }
}

impl From<reqwest::Error> for FetchRepoDataError {
    fn from(err: reqwest::Error) -> Self {
        FetchRepoDataError::HttpError(err.into())
    }
}

impl From<tokio::task::JoinError> for FetchRepoDataError {
    fn from(err: tokio::task::JoinError) -> Self {
        // Propagate panics; anything else means the task was cancelled.
        if let Ok(panic) = err.try_into_panic() {
            std::panic::resume_unwind(panic);
        }
        FetchRepoDataError::Cancelled
    }
}

/// How the cache may be used for a fetch.
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum CacheAction {
    /// Use a fresh cache entry, otherwise revalidate or fetch.
    #[default]
    CacheOrFetch,

    /// Only use the cache when it is fresh; never touch the network.
    UseCacheOnly,

    /// Use whatever the cache holds, fresh or not.
    ForceCacheOnly,

    /// Ignore the cache and always fetch.
    NoCache,
}

/// Options for [`fetch_repo_data`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// How the cache participates.
    pub cache_action: CacheAction,

    /// The freshness window, with the `0`/`1`/`n` semantics of
    /// `CONDA_LOCAL_REPODATA_TTL` (see [`RepodataState::is_fresh_at`]).
    pub local_repodata_ttl: i64,

    /// Whether to look for a `repodata.json.zst` variant.
    pub zstd_enabled: bool,

    /// Whether to attempt incremental JLAP updates.
    pub jlap_enabled: bool,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            cache_action: CacheAction::default(),
            local_repodata_ttl: 1,
            zstd_enabled: true,
            jlap_enabled: true,
        }
    }
}

/// How the returned payload relates to the cache.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CacheResult {
    /// The cache was fresh; no request was made.
    CacheHit,

    /// The server confirmed the cache with a 304.
    CacheHitAfterFetch,

    /// The payload was (re)downloaded or patched.
    CacheOutdated,

    /// There was no cache entry yet.
    CacheNotPresent,
}

/// The result of a successful fetch: the cached payload and its state.
#[derive(Debug)]
pub struct CachedRepoData {
    /// Path of the cached `repodata.json` payload.
    pub repodata_path: PathBuf,

    /// The state sidecar as written to disk.
    pub state: RepodataState,

    /// How the cache participated.
    pub cache_result: CacheResult,
}

/// Appends a trailing slash so relative joins keep the final path segment.
pub fn normalize_subdir_url(url: Url) -> Url {
    if url.path().ends_with('/') {
        url
    } else {
        let mut url = url;
        url.set_path(&format!("{}/", url.path()));
        url
    }
}

/// The cache file stem for a subdir url: the first 8 hex characters of the
/// url's md5, matching the layout conda uses.
pub fn cache_key(subdir_url: &Url) -> String {
    let digest = digest_bytes::<md5::Md5>(subdir_url.as_str().trim_end_matches('/'));
    format!("{digest:x}")[..8].to_owned()
}

/// Guards a cache entry against concurrent writers, across threads and
/// processes. Dropping the guard releases the lock.
struct CacheEntryLock {
    _file: std::fs::File,
}

impl CacheEntryLock {
    async fn acquire(lock_path: PathBuf) -> Result<Self, FetchRepoDataError> {
        let file = tokio::task::spawn_blocking(move || -> Result<std::fs::File, anyhow::Error> {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .truncate(false)
                .write(true)
                .open(&lock_path)?;
            fs4::fs_std::FileExt::lock_exclusive(&file)?;
            Ok(file)
        })
        .await?
        .map_err(FetchRepoDataError::FailedToAcquireLock)?;
        Ok(CacheEntryLock { _file: file })
    }
}

/// Fetches the repodata of one subdir, using and maintaining the cache at
/// `cache_path`. Only one fetch per cache entry runs at a time; concurrent
/// callers block on the entry lock.
#[instrument(skip(client, options), fields(url = %subdir_url))]
pub async fn fetch_repo_data(
    subdir_url: Url,
    client: ClientWithMiddleware,
    cache_path: PathBuf,
    options: FetchOptions,
) -> Result<CachedRepoData, FetchRepoDataError> {
    let subdir_url = normalize_subdir_url(subdir_url);
    fs_err::create_dir_all(&cache_path)?;

    let key = cache_key(&subdir_url);
    let payload_path = cache_path.join(format!("{key}.json"));
    let state_path = cache_path.join(format!("{key}.info.json"));
    let _lock = CacheEntryLock::acquire(cache_path.join(format!("{key}.lock"))).await?;

    // Load the previous state when both files are present; a missing or
    // corrupt sidecar degrades to an unconditional fetch.
    let mut state = if payload_path.is_file() {
        match RepodataState::from_path(&state_path) {
            Ok(mut state) => {
                if !state.signature_matches(&payload_path) {
                    tracing::warn!(
                        "repodata cache payload was modified out of band, dropping validators"
                    );
                    state.cache_headers = CacheHeaders::default();
                    state.blake2_hash = None;
                    state.jlap = None;
                    state.refresh_ns = 0;
                }
                Some(state)
            }
            Err(e) => {
                tracing::debug!("ignoring unreadable cache state: {e}");
                None
            }
        }
    } else {
        None
    };

    // Serve straight from the cache when allowed.
    match options.cache_action {
        CacheAction::ForceCacheOnly => {
            let state = state.ok_or(FetchRepoDataError::NoCacheAvailable)?;
            return Ok(CachedRepoData {
                repodata_path: payload_path,
                state,
                cache_result: CacheResult::CacheHit,
            });
        }
        CacheAction::UseCacheOnly => {
            let state = state
                .filter(|state| state.is_fresh_at(cache::now_ns(), options.local_repodata_ttl))
                .ok_or(FetchRepoDataError::NoCacheAvailable)?;
            return Ok(CachedRepoData {
                repodata_path: payload_path,
                state,
                cache_result: CacheResult::CacheHit,
            });
        }
        CacheAction::CacheOrFetch => {
            if let Some(state) = state
                .as_ref()
                .filter(|state| state.is_fresh_at(cache::now_ns(), options.local_repodata_ttl))
            {
                tracing::debug!("repodata cache is fresh, no request needed");
                return Ok(CachedRepoData {
                    repodata_path: payload_path,
                    state: state.clone(),
                    cache_result: CacheResult::CacheHit,
                });
            }
        }
        CacheAction::NoCache => state = None,
    }

    // Filesystem channels bypass the HTTP machinery entirely.
    if subdir_url.scheme() == "file" {
        return fetch_from_filesystem(&subdir_url, &payload_path, &state_path).await;
    }

    let had_cache = state.is_some();

    // Attempt an incremental JLAP update of the cached payload first. A
    // remembered negative probe skips the attempt entirely.
    let jlap_worth_trying = state.as_ref().is_some_and(|state| {
        state.blake2_hash.is_some()
            && state
                .has_jlap
                .and_then(|probe| probe.value())
                .unwrap_or(true)
    });
    if options.jlap_enabled && jlap_worth_trying {
        if let Some(current) = state.as_mut() {
            match jlap::patch_repo_data(&client, &subdir_url, current, &payload_path).await {
                Ok(jlap::PatchOutcome::UpToDate) => {
                    current.touch();
                    current.to_path(&state_path)?;
                    return Ok(CachedRepoData {
                        repodata_path: payload_path,
                        state: current.clone(),
                        cache_result: CacheResult::CacheHitAfterFetch,
                    });
                }
                Ok(jlap::PatchOutcome::Patched) => {
                    current.update_signature(&payload_path)?;
                    current.touch();
                    current.to_path(&state_path)?;
                    return Ok(CachedRepoData {
                        repodata_path: payload_path,
                        state: current.clone(),
                        cache_result: CacheResult::CacheOutdated,
                    });
                }
                Err(e) => {
                    tracing::warn!("jlap patching failed, falling back to a full fetch: {e}");
                }
            }
        }
    }

    // Probe for a `.zst` variant, remembering the answer for a day.
    let mut zst_probe = state.as_ref().and_then(|s| s.has_zst);
    let has_zst = if options.zstd_enabled {
        match zst_probe.and_then(|probe| probe.value()) {
            Some(value) => value,
            None => {
                let available = probe_variant(&client, &subdir_url, "repodata.json.zst").await;
                zst_probe = Some(Expiring::now(available));
                if let Some(state) = state.as_mut() {
                    state.has_zst = zst_probe;
                }
                available
            }
        }
    } else {
        false
    };

    let (variant_name, is_zst) = if has_zst {
        ("repodata.json.zst", true)
    } else {
        ("repodata.json", false)
    };
    let repodata_url = subdir_url
        .join(variant_name)
        .expect("variant names are valid url segments");

    // Conditional request when validators are available.
    let mut request = client.get(repodata_url.clone());
    if let Some(state) = state.as_ref().filter(|s| s.url == repodata_url) {
        let mut headers = reqwest::header::HeaderMap::new();
        state.cache_headers.add_to_request(&mut headers);
        request = request.headers(headers);
    }

    let response = request.send().await?;
    match response.status() {
        StatusCode::NOT_MODIFIED => {
            tracing::debug!("repodata confirmed up to date with 304");
            let mut state = state.expect("304 implies validators were sent");
            state.cache_headers = CacheHeaders::from_response(&response);
            state.touch();
            state.to_path(&state_path)?;
            Ok(CachedRepoData {
                repodata_path: payload_path,
                state,
                cache_result: CacheResult::CacheHitAfterFetch,
            })
        }
        StatusCode::NOT_FOUND => Err(RepoDataNotFoundError::HttpNotFound(repodata_url).into()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(FetchRepoDataError::Unauthorized(repodata_url))
        }
        status if status.is_server_error() => Err(FetchRepoDataError::ServerError {
            status,
            url: repodata_url,
        }),
        status if !status.is_success() => {
            Err(response.error_for_status().expect_err("status is an error").into())
        }
        _ => {
            let cache_headers = CacheHeaders::from_response(&response);
            let blake2_hash =
                stream_payload_to_cache(response, is_zst, &payload_path).await?;

            let mut new_state = RepodataState::new(repodata_url, &payload_path)?;
            new_state.cache_headers = cache_headers;
            new_state.blake2_hash = Some(blake2_hash);
            new_state.has_zst = zst_probe;
            new_state.has_jlap = state.as_ref().and_then(|s| s.has_jlap);
            new_state.to_path(&state_path)?;

            Ok(CachedRepoData {
                repodata_path: payload_path,
                state: new_state,
                cache_result: if had_cache {
                    CacheResult::CacheOutdated
                } else {
                    CacheResult::CacheNotPresent
                },
            })
        }
    }
}

/// HEAD-probes whether a variant file exists next to `repodata.json`.
async fn probe_variant(
    client: &ClientWithMiddleware,
    subdir_url: &Url,
    file_name: &str,
) -> bool {
    let url = subdir_url
        .join(file_name)
        .expect("variant names are valid url segments");
    match client.head(url).send().await {
        Ok(response) => response.status().is_success(),
        Err(_) => false,
    }
}

/// Streams a response body into the cache payload, decompressing zstd when
/// necessary, and returns the Blake2b hash of the decompressed contents.
/// The payload is written atomically via a temporary file.
async fn stream_payload_to_cache(
    response: reqwest::Response,
    is_zst: bool,
    payload_path: &Path,
) -> Result<keelback_digest::Blake2b256Hash, FetchRepoDataError> {
    use futures::TryStreamExt;
    use tokio::io::BufReader;
    use tokio_util::io::StreamReader;

    let directory = payload_path.parent().expect("payload lives in the cache dir");
    let temp = tokio::task::spawn_blocking({
        let directory = directory.to_owned();
        move || tempfile::NamedTempFile::new_in(directory)
    })
    .await??;

    let body = response
        .bytes_stream()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
    let mut reader = StreamReader::new(body);

    let mut file = tokio::fs::File::from_std(temp.reopen()?);
    let mut hasher = Blake2b256::default();

    let copy_result: Result<(), std::io::Error> = async {
        use blake2::Digest;
        use tokio::io::AsyncReadExt;

        let mut buffer = vec![0u8; 64 * 1024];
        if is_zst {
            let mut decoder =
                async_compression::tokio::bufread::ZstdDecoder::new(BufReader::new(&mut reader));
            loop {
                let read = decoder.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
                file.write_all(&buffer[..read]).await?;
            }
        } else {
            loop {
                let read = reader.read(&mut buffer).await?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
                file.write_all(&buffer[..read]).await?;
            }
        }
        file.flush().await?;
        Ok(())
    }
    .await;
    copy_result?;
    drop(file);

    use blake2::Digest;
    let hash = hasher.finalize();

    let payload_path = payload_path.to_owned();
    tokio::task::spawn_blocking(move || temp.persist(&payload_path).map(|_| ()))
        .await?
        .map_err(|e| FetchRepoDataError::IoError(e.error))?;

    Ok(hash)
}

/// Serves repodata for a `file://` channel by copying the file into the
/// cache, so downstream consumers have a uniform view.
async fn fetch_from_filesystem(
    subdir_url: &Url,
    payload_path: &Path,
    state_path: &Path,
) -> Result<CachedRepoData, FetchRepoDataError> {
    let subdir_dir = subdir_url
        .to_file_path()
        .map_err(|()| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid file url"))
        .map_err(RepoDataNotFoundError::FileSystemError)?;
    let source = subdir_dir.join("repodata.json");

    let contents = match fs_err::read(&source) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(RepoDataNotFoundError::FileSystemError(e).into())
        }
        Err(e) => return Err(e.into()),
    };

    let directory = payload_path.parent().expect("payload lives in the cache dir");
    let mut temp = tempfile::NamedTempFile::new_in(directory)?;
    temp.write_all(&contents)?;
    temp.persist(payload_path).map_err(|e| e.error)?;

    let mut state = RepodataState::new(
        subdir_url
            .join("repodata.json")
            .expect("repodata.json is a valid url segment"),
        payload_path,
    )?;
    state.blake2_hash = Some(digest_bytes::<Blake2b256>(&contents));
    state.to_path(state_path)?;

    Ok(CachedRepoData {
        repodata_path: payload_path.to_owned(),
        state,
        cache_result: CacheResult::CacheOutdated,
    })
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use assert_matches::assert_matches;
    use reqwest::Client;
    use reqwest_middleware::ClientWithMiddleware;
    use url::Url;

    use super::{
        cache_key, fetch_repo_data, normalize_subdir_url, CacheResult, FetchOptions,
        FetchRepoDataError, RepoDataNotFoundError,
    };
    use crate::utils::channel_server::ChannelServer;

    const FAKE_REPO_DATA: &str = r#"{
        "info": {"subdir": "linux-64"},
        "packages": {},
        "packages.conda": {
            "zlib-1.2.13-h166bdaf_4.conda": {
                "build": "h166bdaf_4",
                "build_number": 4,
                "depends": [],
                "name": "zlib",
                "size": 61588,
                "subdir": "linux-64",
                "version": "1.2.13"
            }
        }
    }"#;

    fn client() -> ClientWithMiddleware {
        ClientWithMiddleware::from(Client::new())
    }

    #[test]
    fn normalize_url_adds_slash() {
        assert_eq!(
            normalize_subdir_url(Url::parse("http://localhost/channel/linux-64").unwrap()).as_str(),
            "http://localhost/channel/linux-64/"
        );
        assert_eq!(
            normalize_subdir_url(Url::parse("http://localhost/channel/linux-64/").unwrap())
                .as_str(),
            "http://localhost/channel/linux-64/"
        );
    }

    #[test]
    fn cache_keys_are_stable_and_short() {
        let key = cache_key(&Url::parse("https://conda.anaconda.org/conda-forge/linux-64").unwrap());
        assert_eq!(key.len(), 8);
        assert_eq!(
            key,
            cache_key(&Url::parse("https://conda.anaconda.org/conda-forge/linux-64/").unwrap())
        );
    }

    #[tokio::test]
    async fn fetch_then_cache_hit_without_request() {
        let subdir = tempfile::tempdir().unwrap();
        std::fs::write(subdir.path().join("repodata.json"), FAKE_REPO_DATA).unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let options = FetchOptions {
            local_repodata_ttl: 3600,
            zstd_enabled: false,
            jlap_enabled: false,
            ..FetchOptions::default()
        };

        let first = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            options.clone(),
        )
        .await
        .unwrap();
        assert_eq!(first.cache_result, CacheResult::CacheNotPresent);
        assert_eq!(
            std::fs::read_to_string(&first.repodata_path).unwrap(),
            FAKE_REPO_DATA
        );

        let requests_before = server.request_count();
        let second = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            options.clone(),
        )
        .await
        .unwrap();
        assert_eq!(second.cache_result, CacheResult::CacheHit);
        // A fresh cache entry must not produce any HTTP traffic.
        assert_eq!(server.request_count(), requests_before);
    }

    #[tokio::test]
    async fn stale_cache_revalidates_with_304() {
        let subdir = tempfile::tempdir().unwrap();
        std::fs::write(subdir.path().join("repodata.json"), FAKE_REPO_DATA).unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let options = FetchOptions {
            // TTL 0: the cache is always revalidated.
            local_repodata_ttl: 0,
            zstd_enabled: false,
            jlap_enabled: false,
            ..FetchOptions::default()
        };

        let first = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            options.clone(),
        )
        .await
        .unwrap();
        let first_refresh = first.state.refresh_ns;
        let payload_mtime = std::fs::metadata(&first.repodata_path)
            .unwrap()
            .modified()
            .unwrap();

        let second = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            options.clone(),
        )
        .await
        .unwrap();
        assert_eq!(second.cache_result, CacheResult::CacheHitAfterFetch);
        // The 304 refreshed the state but must not rewrite the payload.
        assert!(second.state.refresh_ns > first_refresh);
        assert_eq!(
            std::fs::metadata(&second.repodata_path)
                .unwrap()
                .modified()
                .unwrap(),
            payload_mtime
        );
    }

    #[tokio::test]
    async fn changed_remote_is_redownloaded() {
        let subdir = tempfile::tempdir().unwrap();
        std::fs::write(subdir.path().join("repodata.json"), FAKE_REPO_DATA).unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let options = FetchOptions {
            local_repodata_ttl: 0,
            zstd_enabled: false,
            jlap_enabled: false,
            ..FetchOptions::default()
        };

        fetch_repo_data(server.url(), client(), cache.path().to_owned(), options.clone())
            .await
            .unwrap();

        std::fs::write(subdir.path().join("repodata.json"), r#"{"packages": {}}"#).unwrap();

        let second = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            options.clone(),
        )
        .await
        .unwrap();
        assert_eq!(second.cache_result, CacheResult::CacheOutdated);
        assert_eq!(
            std::fs::read_to_string(&second.repodata_path).unwrap(),
            r#"{"packages": {}}"#
        );
    }

    #[tokio::test]
    async fn tampered_payload_forces_revalidation() {
        let subdir = tempfile::tempdir().unwrap();
        std::fs::write(subdir.path().join("repodata.json"), FAKE_REPO_DATA).unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let options = FetchOptions {
            local_repodata_ttl: 3600,
            zstd_enabled: false,
            jlap_enabled: false,
            ..FetchOptions::default()
        };

        let first = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            options.clone(),
        )
        .await
        .unwrap();

        // Scribble over the payload behind the cache's back.
        std::fs::write(&first.repodata_path, "{}").unwrap();

        let second = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            options.clone(),
        )
        .await
        .unwrap();
        // The freshness window was still open, but the signature mismatch
        // must force a refetch of the real payload.
        assert_eq!(second.cache_result, CacheResult::CacheOutdated);
        assert_eq!(
            std::fs::read_to_string(&second.repodata_path).unwrap(),
            FAKE_REPO_DATA
        );
    }

    #[tokio::test]
    async fn missing_repodata_is_not_found() {
        let subdir = tempfile::tempdir().unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let result = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            FetchOptions {
                zstd_enabled: false,
                jlap_enabled: false,
                ..FetchOptions::default()
            },
        )
        .await;
        assert_matches!(
            result,
            Err(FetchRepoDataError::NotFound(
                RepoDataNotFoundError::HttpNotFound(_)
            ))
        );
    }

    #[tokio::test]
    async fn file_channel_roundtrip() {
        let subdir = tempfile::tempdir().unwrap();
        std::fs::write(subdir.path().join("repodata.json"), FAKE_REPO_DATA).unwrap();

        let cache = tempfile::tempdir().unwrap();
        let url = Url::from_directory_path(subdir.path()).unwrap();
        let result = fetch_repo_data(
            url,
            client(),
            cache.path().to_owned(),
            FetchOptions::default(),
        )
        .await
        .unwrap();
        assert_eq!(
            std::fs::read_to_string(&result.repodata_path).unwrap(),
            FAKE_REPO_DATA
        );

        let missing = tempfile::tempdir().unwrap();
        let result = fetch_repo_data(
            Url::from_directory_path(missing.path()).unwrap(),
            client(),
            cache.path().to_owned(),
            FetchOptions::default(),
        )
        .await;
        assert_matches!(
            result,
            Err(FetchRepoDataError::NotFound(
                RepoDataNotFoundError::FileSystemError(_)
            ))
        );
    }

    #[tokio::test]
    async fn force_cache_only_without_cache_fails() {
        let cache = tempfile::tempdir().unwrap();
        let result = fetch_repo_data(
            Url::parse("http://localhost:1/never-reached/").unwrap(),
            client(),
            PathBuf::from(cache.path()),
            FetchOptions {
                cache_action: super::CacheAction::ForceCacheOnly,
                ..FetchOptions::default()
            },
        )
        .await;
        assert_matches!(result, Err(FetchRepoDataError::NoCacheAvailable));
    }

    #[tokio::test]
    async fn zst_variant_is_preferred() {
        let subdir = tempfile::tempdir().unwrap();
        let compressed = zstd::encode_all(FAKE_REPO_DATA.as_bytes(), 3).unwrap();
        std::fs::write(subdir.path().join("repodata.json.zst"), compressed).unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let result = fetch_repo_data(
            server.url(),
            client(),
            cache.path().to_owned(),
            FetchOptions {
                jlap_enabled: false,
                ..FetchOptions::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(
            std::fs::read_to_string(&result.repodata_path).unwrap(),
            FAKE_REPO_DATA
        );
        assert!(result.state.url.path().ends_with("repodata.json.zst"));
        assert_eq!(result.state.has_zst.unwrap().value, true);
    }
}
