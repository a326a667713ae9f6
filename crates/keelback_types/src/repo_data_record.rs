use serde::{Deserialize, Serialize};
use url::Url;

use crate::PackageRecord;

/// A [`PackageRecord`] together with the information of where it came from:
/// the channel, the archive filename, and the resolved download url.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RepoDataRecord {
    /// The record as it appeared in the repodata.
    #[serde(flatten)]
    pub package_record: PackageRecord,

    /// The archive filename, e.g. `python-3.11.4-h2755cc3_0.conda`.
    #[serde(rename = "fn")]
    pub file_name: String,

    /// The fully resolved url the archive can be fetched from.
    pub url: Url,

    /// The canonical name of the channel that published the record.
    pub channel: String,
}

impl AsRef<PackageRecord> for RepoDataRecord {
    fn as_ref(&self) -> &PackageRecord {
        &self.package_record
    }
}
