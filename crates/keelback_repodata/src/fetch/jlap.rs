//! Incremental repodata updates via JLAP patch streams.
//!
//! A `repodata.jlap` file is a growing log: a leading checksum line, one
//! JSON-patch object per line (each carrying the `from` and `to` hashes of
//! the repodata it transforms), a footer naming the hash of the latest full
//! `repodata.json`, and a trailing checksum line. A client that knows the
//! hash of its cached payload requests only the bytes it has not seen yet
//! (`Range: bytes=<pos>-`), walks the patch chain from its current hash, and
//! verifies the final digest. Any verification failure makes the caller fall
//! back to a full download.

use std::path::Path;

use keelback_digest::{digest_bytes, parse_hex_digest, Blake2b256, Blake2b256Hash};
use reqwest::{header, StatusCode};
use reqwest_middleware::ClientWithMiddleware;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use tracing::debug;
use url::Url;

use super::cache::{Expiring, JlapState, RepodataState};

/// The filename of the patch stream within a subdir.
pub const JLAP_FILE_NAME: &str = "repodata.jlap";

/// Errors from attempting an incremental update.
#[derive(Debug, thiserror::Error)]
pub enum JlapError {
    /// The subdir does not serve a patch stream.
    #[error("no jlap patch stream is available")]
    NotAvailable,

    /// The request failed.
    #[error(transparent)]
    HttpError(#[from] reqwest_middleware::Error),

    /// A line of the stream is not valid JSON.
    #[error("malformed jlap line: {0}")]
    MalformedLine(#[from] serde_json::Error),

    /// The stream has no footer.
    #[error("the jlap stream has no footer")]
    MissingFooter,

    /// The cached hash does not appear in the patch chain.
    #[error("the cached repodata hash is not part of the patch chain")]
    NoApplicablePatch,

    /// Applying a patch failed.
    #[error("failed to apply a jlap patch: {0}")]
    PatchFailed(#[from] json_patch::PatchError),

    /// The patched payload does not match the advertised hash.
    #[error("the patched repodata does not match the advertised digest")]
    DigestMismatch,

    /// Reading or writing the cached payload failed.
    #[error(transparent)]
    IoError(#[from] std::io::Error),
}

/// The result of a successful jlap exchange.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PatchOutcome {
    /// The cached payload already was the latest revision.
    UpToDate,

    /// The cached payload was patched to the latest revision.
    Patched,
}

/// One patch line of the stream.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
struct Patch {
    #[serde_as(as = "keelback_digest::serde::HexDigest<Blake2b256>")]
    from: Blake2b256Hash,

    #[serde_as(as = "keelback_digest::serde::HexDigest<Blake2b256>")]
    to: Blake2b256Hash,

    patch: json_patch::Patch,
}

/// The footer line of the stream.
#[serde_as]
#[derive(Debug, Serialize, Deserialize)]
struct Footer {
    url: String,

    #[serde_as(as = "keelback_digest::serde::HexDigest<Blake2b256>")]
    latest: Blake2b256Hash,
}

/// Attempts to bring the cached payload up to date by applying the patch
/// stream. On success the state's `blake2_hash`, `jlap`, and `has_jlap`
/// fields are updated; the caller refreshes the stat signature and persists
/// the state.
pub async fn patch_repo_data(
    client: &ClientWithMiddleware,
    subdir_url: &Url,
    state: &mut RepodataState,
    payload_path: &Path,
) -> Result<PatchOutcome, JlapError> {
    let current_hash = state.blake2_hash.ok_or(JlapError::NoApplicablePatch)?;
    let position = state.jlap.as_ref().map_or(0, |jlap| jlap.position);

    let jlap_url = subdir_url
        .join(JLAP_FILE_NAME)
        .expect("the jlap filename is a valid url segment");
    let response = client
        .get(jlap_url)
        .header(header::RANGE, format!("bytes={position}-"))
        .send()
        .await?;

    match response.status() {
        StatusCode::NOT_FOUND => {
            state.has_jlap = Some(Expiring::now(false));
            return Err(JlapError::NotAvailable);
        }
        // A server that ignores the range request returns the whole file,
        // which also works; anything else is treated as unavailable.
        StatusCode::OK | StatusCode::PARTIAL_CONTENT => {}
        StatusCode::RANGE_NOT_SATISFIABLE => {
            // Our offset ran past the stream, e.g. because it was rewritten.
            // Restart from the beginning on the next attempt.
            state.jlap = None;
            return Err(JlapError::NoApplicablePatch);
        }
        _ => return Err(JlapError::NotAvailable),
    }
    let from_offset = if response.status() == StatusCode::OK {
        0
    } else {
        position
    };
    state.has_jlap = Some(Expiring::now(true));

    let body = response.text().await.map_err(reqwest_middleware::Error::from)?;
    let consumed = body.len() as u64;

    // Classify the lines: hash lines (leading/trailing checksums) are
    // skipped, patch objects form the chain, the footer names the target.
    let mut patches = Vec::new();
    let mut footer: Option<Footer> = None;
    for line in body.lines() {
        let line = line.trim();
        if line.is_empty() || parse_hex_digest::<Blake2b256>(line).is_some() {
            continue;
        }
        if let Ok(patch) = serde_json::from_str::<Patch>(line) {
            patches.push(patch);
        } else {
            footer = Some(serde_json::from_str::<Footer>(line)?);
        }
    }
    let footer = footer.ok_or(JlapError::MissingFooter)?;

    let new_state = JlapState {
        position: from_offset + consumed,
        latest: footer.latest,
    };

    if footer.latest == current_hash {
        debug!("cached repodata already matches the latest jlap revision");
        state.jlap = Some(new_state);
        return Ok(PatchOutcome::UpToDate);
    }

    // Find where our revision enters the chain and apply the tail.
    let start = patches
        .iter()
        .position(|patch| patch.from == current_hash)
        .ok_or(JlapError::NoApplicablePatch)?;

    let mut repodata: serde_json::Value =
        serde_json::from_str(&fs_err::read_to_string(payload_path)?)?;
    for patch in &patches[start..] {
        json_patch::patch(&mut repodata, &patch.patch)?;
    }

    // Serialize with sorted keys (the serde_json default map ordering) and
    // verify against the advertised digest before touching the cache.
    let serialized = serde_json::to_string_pretty(&repodata)?;
    let new_hash = digest_bytes::<Blake2b256>(&serialized);
    if new_hash != footer.latest {
        return Err(JlapError::DigestMismatch);
    }

    let directory = payload_path
        .parent()
        .expect("the payload lives inside the cache directory");
    let temp = tempfile::NamedTempFile::new_in(directory)?;
    fs_err::write(temp.path(), &serialized)?;
    temp.persist(payload_path).map_err(|e| e.error)?;

    debug!(
        patches = patches.len() - start,
        "applied jlap patches to cached repodata"
    );
    state.blake2_hash = Some(footer.latest);
    state.jlap = Some(new_state);
    Ok(PatchOutcome::Patched)
}

#[cfg(test)]
mod test {
    use keelback_digest::{digest_bytes, Blake2b256};
    use reqwest::Client;
    use reqwest_middleware::ClientWithMiddleware;
    use url::Url;

    use super::{patch_repo_data, JlapError, PatchOutcome};
    use crate::fetch::cache::RepodataState;
    use crate::utils::channel_server::ChannelServer;

    fn canonical(value: &serde_json::Value) -> String {
        serde_json::to_string_pretty(value).unwrap()
    }

    /// Builds a jlap stream transforming `old` into `new` with one patch.
    fn build_jlap(old: &serde_json::Value, new: &serde_json::Value) -> (String, String, String) {
        let old_text = canonical(old);
        let new_text = canonical(new);
        let old_hash = format!("{:x}", digest_bytes::<Blake2b256>(&old_text));
        let new_hash = format!("{:x}", digest_bytes::<Blake2b256>(&new_text));

        let patch = json_patch::diff(old, new);
        let patch_line = serde_json::json!({
            "from": old_hash,
            "to": new_hash,
            "patch": patch,
        });
        let footer = serde_json::json!({"url": "repodata.json", "latest": new_hash});

        let stream = format!(
            "{}\n{}\n{}\n{}",
            "0".repeat(64),
            serde_json::to_string(&patch_line).unwrap(),
            serde_json::to_string(&footer).unwrap(),
            "f".repeat(64),
        );
        (stream, old_text, new_text)
    }

    fn state_for(payload: &str, path: &std::path::Path) -> RepodataState {
        let mut state = RepodataState::new(
            Url::parse("https://example.com/linux-64/repodata.json").unwrap(),
            path,
        )
        .unwrap();
        state.blake2_hash = Some(digest_bytes::<Blake2b256>(payload));
        state
    }

    #[tokio::test]
    async fn patches_cached_payload() {
        let old = serde_json::json!({"packages": {}});
        let new = serde_json::json!({"packages": {"a-1.0-0.tar.bz2": {"name": "a"}}});
        let (stream, old_text, new_text) = build_jlap(&old, &new);

        let subdir = tempfile::tempdir().unwrap();
        std::fs::write(subdir.path().join("repodata.jlap"), stream).unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let payload_path = cache.path().join("cache.json");
        std::fs::write(&payload_path, &old_text).unwrap();

        let mut state = state_for(&old_text, &payload_path);
        let outcome = patch_repo_data(
            &ClientWithMiddleware::from(Client::new()),
            &server.url(),
            &mut state,
            &payload_path,
        )
        .await
        .unwrap();

        assert_eq!(outcome, PatchOutcome::Patched);
        assert_eq!(std::fs::read_to_string(&payload_path).unwrap(), new_text);
        assert_eq!(
            state.blake2_hash.unwrap(),
            digest_bytes::<Blake2b256>(&new_text)
        );
        assert!(state.jlap.unwrap().position > 0);
    }

    #[tokio::test]
    async fn up_to_date_payload_is_left_alone() {
        let current = serde_json::json!({"packages": {"b-1.0-0.conda": {"name": "b"}}});
        let (stream, _, current_text) = build_jlap(&serde_json::json!({"packages": {}}), &current);

        let subdir = tempfile::tempdir().unwrap();
        std::fs::write(subdir.path().join("repodata.jlap"), stream).unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let payload_path = cache.path().join("cache.json");
        std::fs::write(&payload_path, &current_text).unwrap();

        let mut state = state_for(&current_text, &payload_path);
        let outcome = patch_repo_data(
            &ClientWithMiddleware::from(Client::new()),
            &server.url(),
            &mut state,
            &payload_path,
        )
        .await
        .unwrap();
        assert_eq!(outcome, PatchOutcome::UpToDate);
    }

    #[tokio::test]
    async fn unknown_hash_means_no_applicable_patch() {
        let (stream, ..) = build_jlap(
            &serde_json::json!({"packages": {}}),
            &serde_json::json!({"packages": {"c-1-0.conda": {"name": "c"}}}),
        );

        let subdir = tempfile::tempdir().unwrap();
        std::fs::write(subdir.path().join("repodata.jlap"), stream).unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let payload_path = cache.path().join("cache.json");
        let unrelated = r#"{"packages": {"unrelated": {}}}"#;
        std::fs::write(&payload_path, unrelated).unwrap();

        let mut state = state_for(unrelated, &payload_path);
        let result = patch_repo_data(
            &ClientWithMiddleware::from(Client::new()),
            &server.url(),
            &mut state,
            &payload_path,
        )
        .await;
        assert!(matches!(result, Err(JlapError::NoApplicablePatch)));
    }

    #[tokio::test]
    async fn missing_stream_flips_the_probe() {
        let subdir = tempfile::tempdir().unwrap();
        let server = ChannelServer::serve(subdir.path()).await;

        let cache = tempfile::tempdir().unwrap();
        let payload_path = cache.path().join("cache.json");
        std::fs::write(&payload_path, "{}").unwrap();

        let mut state = state_for("{}", &payload_path);
        let result = patch_repo_data(
            &ClientWithMiddleware::from(Client::new()),
            &server.url(),
            &mut state,
            &payload_path,
        )
        .await;
        assert!(matches!(result, Err(JlapError::NotAvailable)));
        assert_eq!(state.has_jlap.unwrap().value, false);
    }
}
