//! Helpers for constructing synthetic indexes in tests.

use std::str::FromStr;

use keelback_types::{PackageName, PackageRecord, RepoDataRecord, Version};
use url::Url;

/// Builds a linux-64 repodata record with the given dependencies.
pub(crate) fn record(
    name: &str,
    version: &str,
    build: &str,
    depends: &[&str],
) -> RepoDataRecord {
    let mut package_record = PackageRecord::new(
        PackageName::new(name).unwrap(),
        Version::from_str(version).unwrap(),
        build,
    );
    package_record.subdir = "linux-64".to_owned();
    package_record.depends = depends.iter().map(ToString::to_string).collect();

    let file_name = format!("{name}-{version}-{build}.conda");
    RepoDataRecord {
        url: Url::parse("https://conda.anaconda.org/main/linux-64/")
            .unwrap()
            .join(&file_name)
            .unwrap(),
        channel: "https://conda.anaconda.org/main".to_owned(),
        package_record,
        file_name,
    }
}
