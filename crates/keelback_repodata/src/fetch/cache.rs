//! The on-disk cache state sidecar stored next to every cached repodata
//! payload.
//!
//! For each `(channel, subdir)` pair the cache directory holds two files:
//! `<key>.json`, the repodata payload, and `<key>.info.json`, the state
//! described here. The state records the HTTP validators of the last
//! response, the stat signature of the payload for tamper detection, the
//! wall clock of the last successful freshness check, and the cached results
//! of format probes (`.zst` availability, JLAP availability).

use std::{path::Path, str::FromStr, time::SystemTime};

use keelback_digest::{serde::HexDigest, Blake2b256, Blake2b256Hash};
use reqwest::header::{self, HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use url::Url;

/// The HTTP response headers that drive conditional revalidation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheHeaders {
    /// The `ETag` of the cached payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,

    /// The `Last-Modified` date of the cached payload.
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "mod")]
    pub last_modified: Option<String>,

    /// The `Cache-Control` header of the last response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<String>,
}

impl CacheHeaders {
    /// Extracts the relevant headers from a response.
    pub fn from_response(response: &reqwest::Response) -> Self {
        let header_string = |name| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(ToOwned::to_owned)
        };
        Self {
            etag: header_string(header::ETAG),
            last_modified: header_string(header::LAST_MODIFIED),
            cache_control: header_string(header::CACHE_CONTROL),
        }
    }

    /// Adds `If-None-Match` / `If-Modified-Since` to a request so the server
    /// can answer 304 when nothing changed.
    pub fn add_to_request(&self, headers: &mut HeaderMap) {
        if let Some(etag) = self
            .etag
            .as_deref()
            .and_then(|etag| HeaderValue::from_str(etag).ok())
        {
            headers.insert(header::IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = self
            .last_modified
            .as_deref()
            .and_then(|date| HeaderValue::from_str(date).ok())
        {
            headers.insert(header::IF_MODIFIED_SINCE, last_modified);
        }
    }

    /// The parsed `max-age` of the `Cache-Control` header, if present.
    pub fn max_age(&self) -> Option<std::time::Duration> {
        self.cache_control
            .as_deref()
            .and_then(cache_control::CacheControl::from_value)
            .and_then(|cc| cc.max_age)
    }
}

/// A probed boolean with an expiry, e.g. "the server had a `.zst` variant
/// when we last asked". Probes are re-run once they are older than
/// [`Expiring::PROBE_VALIDITY`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Expiring<T> {
    /// The probed value.
    pub value: T,

    /// When the probe ran.
    pub last_checked: chrono::DateTime<chrono::Utc>,
}

impl<T: Copy> Expiring<T> {
    /// How long a probe result is trusted.
    pub fn probe_validity() -> chrono::TimeDelta {
        chrono::TimeDelta::hours(24)
    }

    /// Wraps a freshly probed value.
    pub fn now(value: T) -> Self {
        Expiring {
            value,
            last_checked: chrono::Utc::now(),
        }
    }

    /// The value, unless the probe has expired.
    pub fn value(&self) -> Option<T> {
        if chrono::Utc::now().signed_duration_since(self.last_checked) >= Self::probe_validity() {
            None
        } else {
            Some(self.value)
        }
    }
}

/// State of the incremental (JLAP) patch stream for a cache entry.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JlapState {
    /// Byte offset into the remote `.jlap` file where the next request
    /// resumes.
    #[serde(rename = "pos")]
    pub position: u64,

    /// The hash of the latest `repodata.json` the server advertised.
    #[serde_as(as = "HexDigest<Blake2b256>")]
    pub latest: Blake2b256Hash,
}

/// The `.info.json` sidecar of one cached repodata payload.
#[serde_as]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepodataState {
    /// The url the payload was fetched from, including the filename (and
    /// thus the compression variant).
    pub url: Url,

    /// Validators of the last response.
    #[serde(flatten)]
    pub cache_headers: CacheHeaders,

    /// Modification time of the payload file when the state was written, in
    /// nanoseconds since the epoch. Together with `size` this detects
    /// out-of-band modification of the payload.
    #[serde(rename = "mtime_ns")]
    pub cache_mtime_ns: u128,

    /// Size in bytes of the payload file when the state was written.
    #[serde(rename = "size")]
    pub cache_size: u64,

    /// Wall clock of the last successful freshness check, in nanoseconds
    /// since the epoch. Both a 200 and a 304 update this.
    #[serde(default)]
    pub refresh_ns: u128,

    /// Blake2b-256 hash of the payload, maintained for JLAP chaining.
    #[serde_as(as = "Option<HexDigest<Blake2b256>>")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blake2_hash: Option<Blake2b256Hash>,

    /// Whether the subdir serves `repodata.json.zst`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_zst: Option<Expiring<bool>>,

    /// Whether the subdir serves `repodata.jlap`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_jlap: Option<Expiring<bool>>,

    /// Position and chain hash of the JLAP stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jlap: Option<JlapState>,
}

impl RepodataState {
    /// A fresh state for a payload that was just written.
    pub fn new(url: Url, payload_path: &Path) -> Result<Self, std::io::Error> {
        let (mtime_ns, size) = stat_signature(payload_path)?;
        Ok(RepodataState {
            url,
            cache_headers: CacheHeaders::default(),
            cache_mtime_ns: mtime_ns,
            cache_size: size,
            refresh_ns: now_ns(),
            blake2_hash: None,
            has_zst: None,
            has_jlap: None,
            jlap: None,
        })
    }

    /// Reads a state file from disk.
    pub fn from_path(path: &Path) -> Result<Self, std::io::Error> {
        Self::from_str(&fs_err::read_to_string(path)?).map_err(Into::into)
    }

    /// Writes the state file. The payload must be written first so the stat
    /// signature matches.
    pub fn to_path(&self, path: &Path) -> Result<(), std::io::Error> {
        let file = fs_err::File::create(path)?;
        Ok(serde_json::to_writer_pretty(file, self)?)
    }

    /// Records the stat signature of the payload file into the state.
    pub fn update_signature(&mut self, payload_path: &Path) -> Result<(), std::io::Error> {
        let (mtime_ns, size) = stat_signature(payload_path)?;
        self.cache_mtime_ns = mtime_ns;
        self.cache_size = size;
        Ok(())
    }

    /// Marks a successful freshness check at the current wall clock.
    pub fn touch(&mut self) {
        self.refresh_ns = now_ns();
    }

    /// Returns true when the payload file still matches the signature in
    /// the state. A mismatch means the payload was modified behind the
    /// cache's back and the HTTP validators cannot be trusted.
    pub fn signature_matches(&self, payload_path: &Path) -> bool {
        matches!(
            stat_signature(payload_path),
            Ok((mtime_ns, size)) if mtime_ns == self.cache_mtime_ns && size == self.cache_size
        )
    }

    /// Evaluates the staleness rule against the configured TTL:
    ///
    /// * a TTL of `0` (or negative in the environment variable) never
    ///   trusts the cache,
    /// * a TTL of `1` delegates to the server's `Cache-Control: max-age`,
    /// * any other TTL is the freshness window in seconds.
    pub fn is_fresh_at(&self, now_ns_value: u128, local_repodata_ttl: i64) -> bool {
        let ttl_ns = match local_repodata_ttl {
            ttl if ttl <= 0 => 0u128,
            1 => self
                .cache_headers
                .max_age()
                .map_or(0, |max_age| max_age.as_nanos()),
            ttl => (ttl as u128) * 1_000_000_000,
        };
        now_ns_value <= self.refresh_ns + ttl_ns
    }
}

impl FromStr for RepodataState {
    type Err = serde_json::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_str(s)
    }
}

pub(crate) fn now_ns() -> u128 {
    SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos())
}

fn stat_signature(path: &Path) -> Result<(u128, u64), std::io::Error> {
    let metadata = fs_err::metadata(path)?;
    let mtime_ns = metadata
        .modified()?
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_nanos());
    Ok((mtime_ns, metadata.len()))
}
