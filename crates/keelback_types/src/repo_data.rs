//! The repodata wire format: the JSON index describing all packages
//! published in one subdir of a channel.

use std::{collections::BTreeSet, path::Path};

use fxhash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{
    utils::{serde::sort_map_alphabetically, url::add_trailing_slash},
    Channel, PackageRecord, RepoDataRecord,
};

/// The parsed contents of a `repodata.json` file. Unknown top-level fields
/// are ignored; unknown record fields are dropped by [`PackageRecord`]'s
/// deserializer.
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq, Clone)]
pub struct RepoData {
    /// Information about the subdir this file describes.
    pub info: Option<ChannelInfo>,

    /// The legacy `.tar.bz2` packages, keyed by archive filename.
    #[serde(default, serialize_with = "sort_map_alphabetically")]
    pub packages: FxHashMap<String, PackageRecord>,

    /// The `.conda` packages, keyed by archive filename. Kept under a
    /// separate key for backwards compatibility with old conda versions.
    #[serde(
        default,
        rename = "packages.conda",
        serialize_with = "sort_map_alphabetically"
    )]
    pub conda_packages: FxHashMap<String, PackageRecord>,

    /// Filenames of packages that were removed from the index. The archives
    /// may still exist but must not be installed.
    #[serde(
        default,
        serialize_with = "sort_set_alphabetically",
        skip_serializing_if = "FxHashSet::is_empty"
    )]
    pub removed: FxHashSet<String>,

    /// The version of the repodata format.
    #[serde(rename = "repodata_version")]
    pub version: Option<u64>,
}

/// The `info` block of a repodata file.
#[derive(Debug, Deserialize, Serialize, Eq, PartialEq, Clone)]
pub struct ChannelInfo {
    /// The subdir the file describes.
    pub subdir: Option<String>,

    /// An absolute or relative base url for all package downloads, when the
    /// channel stores archives somewhere other than next to the repodata.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl RepoData {
    /// An empty repodata, the result of fetching a legitimately absent
    /// `noarch` subdir.
    pub fn empty() -> Self {
        RepoData {
            info: None,
            packages: FxHashMap::default(),
            conda_packages: FxHashMap::default(),
            removed: FxHashSet::default(),
            version: None,
        }
    }

    /// Parses repodata from a file on disk.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let contents = fs_err::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// The `base_url` from the `info` block, if any.
    pub fn base_url(&self) -> Option<&str> {
        self.info.as_ref().and_then(|info| info.base_url.as_deref())
    }

    /// Converts the parsed repodata into [`RepoDataRecord`]s attributed to
    /// the given channel, resolving each record's download url. Removed
    /// packages are filtered out.
    pub fn into_repo_data_records(self, channel: &Channel) -> Vec<RepoDataRecord> {
        let channel_name = channel.canonical_name();
        let base_url = self.base_url().map(ToOwned::to_owned);
        let RepoData {
            packages,
            conda_packages,
            removed,
            ..
        } = self;

        let mut records = Vec::with_capacity(packages.len() + conda_packages.len());
        for (file_name, package_record) in packages
            .into_iter()
            .chain(conda_packages)
            .filter(|(file_name, _)| !removed.contains(file_name))
        {
            let subdir_url = channel
                .base_url
                .join(&format!("{}/", package_record.subdir))
                .expect("subdir slugs always form valid url segments");
            records.push(RepoDataRecord {
                url: resolve_package_url(&subdir_url, base_url.as_deref(), &file_name),
                channel: channel_name.clone(),
                package_record,
                file_name,
            });
        }
        records
    }
}

/// Resolves the download url of a package file, honoring an optional
/// `base_url` that may be absolute, host-relative, or subdir-relative.
pub fn resolve_package_url(subdir_url: &Url, base_url: Option<&str>, file_name: &str) -> Url {
    let base = match base_url {
        None => subdir_url.clone(),
        Some(base) => match Url::parse(base) {
            Ok(absolute) => absolute,
            Err(url::ParseError::RelativeUrlWithoutBase) if base.starts_with('/') => {
                let mut url = subdir_url.clone();
                url.set_path(base);
                url
            }
            Err(url::ParseError::RelativeUrlWithoutBase) => add_trailing_slash(subdir_url)
                .join(base)
                .expect("relative base_url must join onto the subdir url"),
            Err(e) => unreachable!("{e}"),
        },
    };

    add_trailing_slash(&base)
        .join(file_name)
        .expect("package filenames always form valid url segments")
}

fn sort_set_alphabetically<S: serde::Serializer>(
    value: &FxHashSet<String>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    value.iter().collect::<BTreeSet<_>>().serialize(serializer)
}
