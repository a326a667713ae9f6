//! Assembly of the unified package index from channels, the installed
//! prefix, and virtual packages.

use std::{path::PathBuf, sync::Arc};

use futures::{stream, StreamExt};
use fxhash::FxHashMap;
use keelback_types::{
    Channel, GenericVirtualPackage, MatchSpec, PackageName, PackageRecord, Platform, PrefixRecord,
    RepoData, RepoDataRecord,
};
use reqwest_middleware::ClientWithMiddleware;
use tokio::sync::Semaphore;
use tracing::instrument;
use url::Url;

use crate::fetch::{
    fetch_repo_data, CachedRepoData, FetchOptions, FetchRepoDataError, RepoDataNotFoundError,
};

/// Errors from assembling the index.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// A subdir of a channel could not be fetched and the configuration does
    /// not allow treating it as empty.
    #[error("channel '{channel}' is not available for {subdir}")]
    ChannelNotAvailable {
        /// The channel name.
        channel: String,
        /// The subdir that failed.
        subdir: Platform,
        /// The underlying fetch failure.
        #[source]
        source: FetchRepoDataError,
    },

    /// A fetch failed for a reason other than a missing subdir.
    #[error(transparent)]
    FetchRepoData(#[from] FetchRepoDataError),

    /// A cached payload does not parse as repodata.
    #[error("invalid repodata for channel '{channel}' subdir {subdir}: {source}")]
    InvalidRepoData {
        /// The channel name.
        channel: String,
        /// The subdir concerned.
        subdir: Platform,
        /// The parse failure.
        #[source]
        source: serde_json::Error,
    },

    /// The operation was cancelled.
    #[error("the operation was cancelled")]
    Cancelled,
}

/// Everything the engine needs to build one index.
#[derive(Debug, Clone)]
pub struct IndexRequest {
    /// The channels to load, in priority order: the first channel has the
    /// highest priority (lowest priority number).
    pub channels: Vec<Channel>,

    /// The subdirs to load from every channel.
    pub subdirs: Vec<Platform>,

    /// The records currently linked in the target prefix; they shadow
    /// channel records with the same identity.
    pub installed: Vec<PrefixRecord>,

    /// The virtual packages of the host.
    pub virtual_packages: Vec<GenericVirtualPackage>,

    /// When set, every `python` record grows a dependency on `pip`.
    pub add_pip_as_python_dependency: bool,

    /// When set, a missing subdir is treated as empty instead of an error.
    pub allow_non_channel_urls: bool,
}

/// One entry of the assembled [`Index`].
#[derive(Debug, Clone)]
pub struct IndexEntry {
    /// The record itself.
    pub record: RepoDataRecord,

    /// The priority of the channel the record came from; lower wins.
    pub priority: u32,

    /// True when this exact record is linked in the prefix.
    pub installed: bool,
}

/// The merged, priority-ordered package index the resolver works against.
#[derive(Debug, Default)]
pub struct Index {
    entries: Vec<IndexEntry>,
    by_name: FxHashMap<PackageName, Vec<usize>>,
}

impl Index {
    fn insert(&mut self, entry: IndexEntry) {
        let name = entry.record.package_record.name.clone();
        let index = self.entries.len();
        self.entries.push(entry);
        self.by_name.entry(name).or_default().push(index);
    }

    /// All entries of the index.
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// All entries for an exact package name.
    pub fn entries_for(&self, name: &PackageName) -> impl Iterator<Item = &IndexEntry> {
        self.by_name
            .get(name)
            .into_iter()
            .flatten()
            .map(move |&index| &self.entries[index])
    }

    /// All records matching the given spec. Exact-name specs use the name
    /// table; pattern specs scan the whole index.
    pub fn query<'i>(
        &'i self,
        spec: &'i MatchSpec,
    ) -> Box<dyn Iterator<Item = &'i RepoDataRecord> + 'i> {
        match spec.name.as_exact() {
            Some(name) => Box::new(
                self.entries_for(name)
                    .map(|entry| &entry.record)
                    .filter(move |record| spec.matches_repodata(record)),
            ),
            None => Box::new(
                self.entries
                    .iter()
                    .map(|entry| &entry.record)
                    .filter(move |record| spec.matches_repodata(record)),
            ),
        }
    }

    /// Returns true when a record with the same identity is in the index.
    pub fn contains(&self, record: &PackageRecord) -> bool {
        self.entries_for(&record.name)
            .any(|entry| same_identity(&entry.record.package_record, record))
    }

    /// The number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true when the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Identity per the data model: `(name, version, build, subdir, md5)`.
fn same_identity(a: &PackageRecord, b: &PackageRecord) -> bool {
    a.name == b.name
        && a.version == b.version
        && a.build == b.build
        && a.subdir == b.subdir
        && a.md5 == b.md5
}

/// A long-lived value owning the HTTP client, the cache location, and the
/// fetch policy. Tests instantiate fresh engines; nothing is process-global.
pub struct IndexEngine {
    client: ClientWithMiddleware,
    cache_dir: PathBuf,
    fetch_options: FetchOptions,
    concurrency: Arc<Semaphore>,
}

/// The default bound on concurrent subdir fetches.
pub const DEFAULT_MAX_CONCURRENT_FETCHES: usize = 10;

impl IndexEngine {
    /// Creates an engine with the default fetch concurrency.
    pub fn new(
        client: ClientWithMiddleware,
        cache_dir: impl Into<PathBuf>,
        fetch_options: FetchOptions,
    ) -> Self {
        Self::with_concurrency(client, cache_dir, fetch_options, DEFAULT_MAX_CONCURRENT_FETCHES)
    }

    /// Creates an engine with a custom bound on concurrent fetches.
    pub fn with_concurrency(
        client: ClientWithMiddleware,
        cache_dir: impl Into<PathBuf>,
        fetch_options: FetchOptions,
        max_concurrent_fetches: usize,
    ) -> Self {
        Self {
            client,
            cache_dir: cache_dir.into(),
            fetch_options,
            concurrency: Arc::new(Semaphore::new(max_concurrent_fetches.max(1))),
        }
    }

    /// Builds the unified index for the request: all `(channel, subdir)`
    /// pairs are fetched concurrently, merged with channel priority, then
    /// overlaid with the installed records and virtual packages.
    #[instrument(skip_all, fields(channels = request.channels.len(), subdirs = request.subdirs.len()))]
    pub async fn load_index(&self, request: IndexRequest) -> Result<Index, GatewayError> {
        let mut fetches = Vec::new();
        for (priority, channel) in request.channels.iter().enumerate() {
            for &subdir in &request.subdirs {
                fetches.push((priority as u32, channel.clone(), subdir));
            }
        }

        // Fetch completion order is irrelevant: results are keyed by their
        // channel priority before merging.
        let results: Vec<(u32, Vec<RepoDataRecord>)> = stream::iter(fetches)
            .map(|(priority, channel, subdir)| {
                let engine = self;
                let allow_missing = request.allow_non_channel_urls;
                async move {
                    let records = engine
                        .load_subdir_records(&channel, subdir, allow_missing)
                        .await?;
                    Ok::<_, GatewayError>((priority, records))
                }
            })
            .buffer_unordered(DEFAULT_MAX_CONCURRENT_FETCHES)
            .collect::<Vec<_>>()
            .await
            .into_iter()
            .collect::<Result<_, _>>()?;

        // Merge with priority: for identical identities the channel with
        // the lower priority number wins.
        let mut merged: FxHashMap<String, (u32, RepoDataRecord)> = FxHashMap::default();
        let mut ordered: Vec<(u32, Vec<RepoDataRecord>)> = results;
        ordered.sort_by_key(|(priority, _)| *priority);
        for (priority, records) in ordered {
            for record in records {
                let key = identity_key(&record.package_record);
                match merged.get(&key) {
                    Some((existing, _)) if *existing <= priority => {}
                    _ => {
                        merged.insert(key, (priority, record));
                    }
                }
            }
        }

        let mut index = Index::default();
        let installed_keys: Vec<String> = request
            .installed
            .iter()
            .map(|record| identity_key(&record.repodata_record.package_record))
            .collect();

        for (_, (priority, mut record)) in merged {
            if request.add_pip_as_python_dependency {
                inject_pip_dependency(&mut record.package_record);
            }
            let installed = installed_keys.contains(&identity_key(&record.package_record));
            index.insert(IndexEntry {
                record,
                priority,
                installed,
            });
        }

        // Installed records that are not (or no longer) in any channel still
        // participate, keeping their declared channel attribution.
        for prefix_record in request.installed {
            let mut record = prefix_record.repodata_record;
            if !index.contains(&record.package_record) {
                if request.add_pip_as_python_dependency {
                    inject_pip_dependency(&mut record.package_record);
                }
                index.insert(IndexEntry {
                    record,
                    priority: 0,
                    installed: true,
                });
            }
        }

        for virtual_package in request.virtual_packages {
            let record = virtual_package.into_package_record();
            let file_name = format!("{}-{}-{}", record.name, record.version, record.build);
            index.insert(IndexEntry {
                record: RepoDataRecord {
                    url: Url::parse("virtual://host")
                        .expect("the virtual scheme parses")
                        .join(&file_name)
                        .expect("virtual package names form valid url segments"),
                    channel: "virtual".to_owned(),
                    package_record: record,
                    file_name,
                },
                priority: 0,
                installed: false,
            });
        }

        Ok(index)
    }

    /// Fetches and parses one subdir of one channel. Missing `noarch`
    /// subdirs are always treated as empty; for other subdirs that depends
    /// on `allow_missing`.
    async fn load_subdir_records(
        &self,
        channel: &Channel,
        subdir: Platform,
        allow_missing: bool,
    ) -> Result<Vec<RepoDataRecord>, GatewayError> {
        let _permit = self
            .concurrency
            .acquire()
            .await
            .map_err(|_| GatewayError::Cancelled)?;

        let subdir_url = channel.platform_url(subdir);
        let fetched = fetch_repo_data(
            subdir_url,
            self.client.clone(),
            self.cache_dir.clone(),
            self.fetch_options.clone(),
        )
        .await;

        let CachedRepoData { repodata_path, .. } = match fetched {
            Ok(cached) => cached,
            Err(FetchRepoDataError::NotFound(not_found)) => {
                return if subdir == Platform::NoArch || allow_missing {
                    tracing::debug!(
                        "treating missing repodata for {}/{subdir} as empty",
                        channel.name()
                    );
                    Ok(Vec::new())
                } else {
                    Err(GatewayError::ChannelNotAvailable {
                        channel: channel.name().to_owned(),
                        subdir,
                        source: FetchRepoDataError::NotFound(not_found),
                    })
                };
            }
            Err(e) => return Err(e.into()),
        };

        // Parsing a multi-megabyte json file is CPU work, keep it off the
        // async worker threads.
        let channel = channel.clone();
        tokio::task::spawn_blocking(move || {
            let contents = fs_err::read_to_string(&repodata_path)
                .map_err(FetchRepoDataError::IoError)?;
            let repodata: RepoData =
                serde_json::from_str(&contents).map_err(|source| GatewayError::InvalidRepoData {
                    channel: channel.name().to_owned(),
                    subdir,
                    source,
                })?;
            Ok(repodata.into_repo_data_records(&channel))
        })
        .await
        .map_err(|_| GatewayError::Cancelled)?
    }
}

fn identity_key(record: &PackageRecord) -> String {
    format!(
        "{}|{}|{}|{}|{}",
        record.name,
        record.version,
        record.build,
        record.subdir,
        record.md5.map(|md5| format!("{md5:x}")).unwrap_or_default()
    )
}

/// Adds `pip` to the dependencies of python records, the behavior behind
/// `CONDA_ADD_PIP_AS_PYTHON_DEPENDENCY`.
fn inject_pip_dependency(record: &mut PackageRecord) {
    if record.name == "python"
        && !record
            .depends
            .iter()
            .any(|dep| dep == "pip" || dep.starts_with("pip "))
    {
        record.depends.push("pip".to_owned());
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use keelback_types::{
        Channel, ChannelConfig, GenericVirtualPackage, MatchSpec, PackageName, ParseStrictness,
        Platform, Version,
    };
    use reqwest::Client;
    use reqwest_middleware::ClientWithMiddleware;

    use super::{IndexEngine, IndexRequest};
    use crate::fetch::FetchOptions;

    fn write_channel(dir: &std::path::Path, subdir: &str, packages_conda: &str) {
        let subdir_path = dir.join(subdir);
        std::fs::create_dir_all(&subdir_path).unwrap();
        std::fs::write(
            subdir_path.join("repodata.json"),
            format!(
                r#"{{"info": {{"subdir": "{subdir}"}}, "packages": {{}}, "packages.conda": {packages_conda}}}"#
            ),
        )
        .unwrap();
    }

    fn record_json(name: &str, version: &str, md5_seed: u8) -> String {
        format!(
            r#"{{
                "build": "h000_0",
                "build_number": 0,
                "depends": [],
                "md5": "{:032x}",
                "name": "{name}",
                "size": 1,
                "subdir": "linux-64",
                "version": "{version}"
            }}"#,
            md5_seed as u128
        )
    }

    fn local_channel(dir: &std::path::Path) -> Channel {
        Channel::from_str(
            dir.to_str().unwrap(),
            &ChannelConfig::default_with_root_dir(std::env::current_dir().unwrap()),
        )
        .unwrap()
    }

    fn engine(cache: &std::path::Path) -> IndexEngine {
        IndexEngine::new(
            ClientWithMiddleware::from(Client::new()),
            cache,
            FetchOptions {
                zstd_enabled: false,
                jlap_enabled: false,
                ..FetchOptions::default()
            },
        )
    }

    fn request(channels: Vec<Channel>) -> IndexRequest {
        IndexRequest {
            channels,
            subdirs: vec![Platform::Linux64, Platform::NoArch],
            installed: Vec::new(),
            virtual_packages: Vec::new(),
            add_pip_as_python_dependency: false,
            allow_non_channel_urls: false,
        }
    }

    #[tokio::test]
    async fn merges_channels_with_priority() {
        let high = tempfile::tempdir().unwrap();
        let low = tempfile::tempdir().unwrap();
        // The same identity in both channels: the higher priority channel
        // (listed first) must win.
        write_channel(
            high.path(),
            "linux-64",
            &format!(
                r#"{{"zlib-1.2.13-h000_0.conda": {}}}"#,
                record_json("zlib", "1.2.13", 1)
            ),
        );
        write_channel(
            low.path(),
            "linux-64",
            &format!(
                r#"{{"zlib-1.2.13-h000_0.conda": {}, "bzip2-1.0.8-h000_0.conda": {}}}"#,
                record_json("zlib", "1.2.13", 1),
                record_json("bzip2", "1.0.8", 2)
            ),
        );

        let cache = tempfile::tempdir().unwrap();
        let index = engine(cache.path())
            .load_index(request(vec![
                local_channel(high.path()),
                local_channel(low.path()),
            ]))
            .await
            .unwrap();

        let zlib = MatchSpec::from_str("zlib", ParseStrictness::Strict).unwrap();
        let matches: Vec<_> = index.query(&zlib).collect();
        assert_eq!(matches.len(), 1);
        assert!(matches[0]
            .channel
            .contains(high.path().file_name().unwrap().to_str().unwrap()));

        // The unique record of the lower priority channel is still present.
        let bzip2 = MatchSpec::from_str("bzip2", ParseStrictness::Strict).unwrap();
        assert_eq!(index.query(&bzip2).count(), 1);
    }

    #[tokio::test]
    async fn missing_noarch_is_empty() {
        let channel = tempfile::tempdir().unwrap();
        write_channel(channel.path(), "linux-64", "{}");
        // No noarch directory at all.

        let cache = tempfile::tempdir().unwrap();
        let index = engine(cache.path())
            .load_index(request(vec![local_channel(channel.path())]))
            .await
            .unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn missing_platform_subdir_is_an_error_unless_allowed() {
        let channel = tempfile::tempdir().unwrap();
        // Only noarch exists; linux-64 is missing.
        write_channel(channel.path(), "noarch", "{}");

        let cache = tempfile::tempdir().unwrap();
        let result = engine(cache.path())
            .load_index(request(vec![local_channel(channel.path())]))
            .await;
        assert!(matches!(
            result,
            Err(super::GatewayError::ChannelNotAvailable { .. })
        ));

        let mut allowed = request(vec![local_channel(channel.path())]);
        allowed.allow_non_channel_urls = true;
        let index = engine(cache.path()).load_index(allowed).await.unwrap();
        assert!(index.is_empty());
    }

    #[tokio::test]
    async fn virtual_packages_and_pip_injection() {
        let channel = tempfile::tempdir().unwrap();
        write_channel(
            channel.path(),
            "linux-64",
            &format!(
                r#"{{"python-3.11.4-h000_0.conda": {}}}"#,
                record_json("python", "3.11.4", 3)
            ),
        );

        let cache = tempfile::tempdir().unwrap();
        let mut req = request(vec![local_channel(channel.path())]);
        req.add_pip_as_python_dependency = true;
        req.virtual_packages = vec![GenericVirtualPackage {
            name: PackageName::new_unchecked("__glibc"),
            version: Version::from_str("2.36").unwrap(),
            build_string: "0".to_owned(),
        }];

        let index = engine(cache.path()).load_index(req).await.unwrap();

        let python = MatchSpec::from_str("python", ParseStrictness::Strict).unwrap();
        let record = index.query(&python).next().unwrap();
        assert!(record.package_record.depends.contains(&"pip".to_owned()));

        let glibc = MatchSpec::from_str("__glibc", ParseStrictness::Strict).unwrap();
        assert_eq!(index.query(&glibc).count(), 1);
    }
}
