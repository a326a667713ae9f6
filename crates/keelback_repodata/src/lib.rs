#![deny(missing_docs)]

//! Fetching, caching, and merging of conda repodata.
//!
//! The [`fetch`] module maintains an on-disk cache of `repodata.json`
//! payloads with conditional revalidation and incremental (JLAP) updates.
//! The [`gateway`] module turns cached repodata from many channels into one
//! priority-ordered [`gateway::Index`], supplemented with the installed
//! prefix and the host's virtual packages.

pub mod fetch;
pub mod gateway;
pub(crate) mod utils;

use std::path::PathBuf;

use fetch::{cache::RepodataState, fetch_repo_data, CachedRepoData, FetchOptions,
    FetchRepoDataError};
use keelback_types::RepoData;
use reqwest_middleware::ClientWithMiddleware;
use url::Url;

/// Fetches the latest repodata for a subdir and returns the path of the
/// cached payload together with its state.
pub async fn fetch_latest_path(
    subdir_url: Url,
    client: ClientWithMiddleware,
    cache_path: PathBuf,
    options: FetchOptions,
) -> Result<(PathBuf, RepodataState), FetchRepoDataError> {
    let CachedRepoData {
        repodata_path,
        state,
        ..
    } = fetch_repo_data(subdir_url, client, cache_path, options).await?;
    Ok((repodata_path, state))
}

/// Fetches the latest repodata for a subdir and returns the raw payload.
pub async fn fetch_latest_str(
    subdir_url: Url,
    client: ClientWithMiddleware,
    cache_path: PathBuf,
    options: FetchOptions,
) -> Result<(String, RepodataState), FetchRepoDataError> {
    let (path, state) = fetch_latest_path(subdir_url, client, cache_path, options).await?;
    let contents = tokio::task::spawn_blocking(move || fs_err::read_to_string(path)).await??;
    Ok((contents, state))
}

/// Fetches the latest repodata for a subdir and returns it parsed.
pub async fn fetch_latest_parsed(
    subdir_url: Url,
    client: ClientWithMiddleware,
    cache_path: PathBuf,
    options: FetchOptions,
) -> Result<(RepoData, RepodataState), FetchRepoDataError> {
    let (path, state) = fetch_latest_path(subdir_url, client, cache_path, options).await?;
    let repodata = tokio::task::spawn_blocking(move || -> Result<RepoData, std::io::Error> {
        let contents = fs_err::read_to_string(path)?;
        Ok(serde_json::from_str(&contents)?)
    })
    .await??;
    Ok((repodata, state))
}
