//! High-level operations composing the full pipeline: index assembly,
//! solving, and transaction execution against a prefix.

use std::path::Path;

use keelback_repodata::{
    fetch::FetchOptions,
    gateway::{GatewayError, IndexEngine, IndexRequest},
};
use keelback_solve::{solve, SolveError, SolverTask};
use keelback_types::{Channel, MatchSpec, Platform, PrefixRecord, RepoDataRecord};
use keelback_virtual_packages::{detect_virtual_packages, DetectVirtualPackageError};
use reqwest_middleware::ClientWithMiddleware;
use tracing::info;

use crate::{
    config::CoreConfig,
    install::{driver::InstallDriver, Transaction, TransactionError, TransactionOutcome},
    package_cache::PackageCache,
    prefix::{PrefixData, PrefixError},
    ExecuteOptions, TransactionRunner,
};

/// Errors from the composed operations.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Assembling the index failed.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// The solver found no solution.
    #[error(transparent)]
    Solve(#[from] SolveError),

    /// Reading the prefix failed.
    #[error(transparent)]
    Prefix(#[from] PrefixError),

    /// Executing the transaction failed.
    #[error(transparent)]
    Transaction(#[from] TransactionError),

    /// Host capabilities could not be detected.
    #[error(transparent)]
    VirtualPackages(#[from] DetectVirtualPackageError),

    /// The package cache could not be opened.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Installs (or updates to) the given specs in the prefix: fetches
/// repodata, solves, and applies the resulting transaction. Specs already
/// satisfied by the installed packages produce an empty transaction.
pub async fn install_specs(
    config: &CoreConfig,
    client: ClientWithMiddleware,
    channels: &[Channel],
    target_prefix: &Path,
    specs: Vec<MatchSpec>,
    dry_run: bool,
) -> Result<TransactionOutcome, OperationError> {
    let installed = PrefixData::from_prefix(target_prefix)?;
    let installed_records: Vec<PrefixRecord> = installed.iter_records().cloned().collect();

    let target = solve_target_state(
        config,
        client.clone(),
        channels,
        &installed_records,
        combined_specs(&installed_records, specs.clone()),
    )
    .await?;

    apply_target_state(
        config,
        client,
        target_prefix,
        installed_records,
        target,
        specs.iter().map(ToString::to_string).collect(),
        dry_run,
    )
    .await
}

/// Removes the packages matching the given specs from the prefix; whatever
/// remains requested is re-solved so transitively orphaned dependencies
/// disappear with them.
pub async fn remove_specs(
    config: &CoreConfig,
    client: ClientWithMiddleware,
    channels: &[Channel],
    target_prefix: &Path,
    specs: Vec<MatchSpec>,
    dry_run: bool,
) -> Result<TransactionOutcome, OperationError> {
    let installed = PrefixData::from_prefix(target_prefix)?;
    let installed_records: Vec<PrefixRecord> = installed.iter_records().cloned().collect();

    // The surviving requests: everything previously asked for whose name
    // does not match a removal spec.
    let keep_specs: Vec<MatchSpec> = combined_specs(&installed_records, Vec::new())
        .into_iter()
        .filter(|kept| {
            let Some(name) = kept.name.as_exact() else {
                return true;
            };
            !specs.iter().any(|removal| removal.name.matches_name(name))
        })
        .collect();

    let target = solve_target_state(
        config,
        client.clone(),
        channels,
        &installed_records,
        keep_specs,
    )
    .await?;

    apply_target_state(
        config,
        client,
        target_prefix,
        installed_records,
        target,
        Vec::new(),
        dry_run,
    )
    .await
}

/// Builds the index and computes the target state for the given specs.
async fn solve_target_state(
    config: &CoreConfig,
    client: ClientWithMiddleware,
    channels: &[Channel],
    installed_records: &[PrefixRecord],
    specs: Vec<MatchSpec>,
) -> Result<Vec<RepoDataRecord>, OperationError> {
    let engine = IndexEngine::new(
        client,
        config.repodata_cache_dir(),
        FetchOptions {
            local_repodata_ttl: config.local_repodata_ttl,
            ..FetchOptions::default()
        },
    );

    let virtual_packages = detect_virtual_packages(config.platform)?
        .into_iter()
        .map(Into::into)
        .collect();

    let index = engine
        .load_index(IndexRequest {
            channels: channels.to_vec(),
            subdirs: vec![config.platform, Platform::NoArch],
            installed: installed_records.to_vec(),
            virtual_packages,
            add_pip_as_python_dependency: config.add_pip_as_python_dependency,
            allow_non_channel_urls: config.allow_non_channel_urls,
        })
        .await?;
    info!("assembled an index of {} records", index.len());

    let available: Vec<RepoDataRecord> = index
        .entries()
        .iter()
        .map(|entry| entry.record.clone())
        .collect();
    let channel_priorities: Vec<(String, u32)> = channels
        .iter()
        .enumerate()
        .map(|(priority, channel)| (channel.canonical_name(), priority as u32))
        .collect();
    let installed: Vec<RepoDataRecord> = installed_records
        .iter()
        .map(|record| record.repodata_record.clone())
        .collect();

    let task = SolverTask {
        available: &available,
        installed: &installed,
        channel_priorities: &channel_priorities,
        specs,
    };
    Ok(solve(&task)?)
}

/// Diffs and executes.
async fn apply_target_state(
    config: &CoreConfig,
    client: ClientWithMiddleware,
    target_prefix: &Path,
    installed_records: Vec<PrefixRecord>,
    target: Vec<RepoDataRecord>,
    requested_specs: Vec<String>,
    dry_run: bool,
) -> Result<TransactionOutcome, OperationError> {
    let transaction = Transaction::from_current_and_desired(
        installed_records,
        target,
        config.platform,
    )
    .map_err(TransactionError::from)?;

    if transaction.is_empty() {
        info!("nothing to do, the environment already satisfies the request");
        return Ok(TransactionOutcome::Applied {
            linked: 0,
            unlinked: 0,
        });
    }

    let runner = TransactionRunner {
        client,
        package_cache: PackageCache::new(config.writable_pkgs_dir())?,
        driver: InstallDriver::default(),
    };
    let options = ExecuteOptions {
        dry_run,
        requested_specs,
        cancel: None,
        registry: None,
    };
    Ok(runner.execute(target_prefix, &transaction, &options).await?)
}

/// The specs driving a solve: the new requests plus the recorded
/// `requested_spec` of every installed package not being re-requested, so
/// explicit installs stay pinned to what the user asked for.
fn combined_specs(installed: &[PrefixRecord], new_specs: Vec<MatchSpec>) -> Vec<MatchSpec> {
    let mut specs = new_specs;
    for record in installed {
        let Some(requested) = record.requested_spec.as_deref() else {
            continue;
        };
        let Ok(spec) = MatchSpec::from_str(requested, keelback_types::ParseStrictness::Lenient)
        else {
            continue;
        };
        let name = &record.repodata_record.package_record.name;
        let already_requested = specs.iter().any(|existing| {
            existing
                .name
                .as_exact()
                .is_some_and(|existing_name| existing_name == name)
        });
        if !already_requested {
            specs.push(spec);
        }
    }
    specs
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use keelback_types::{
        MatchSpec, PackageName, PackageRecord, ParseStrictness, PrefixRecord, RepoDataRecord,
        Version,
    };
    use url::Url;

    use super::combined_specs;

    fn installed(name: &str, requested: Option<&str>) -> PrefixRecord {
        PrefixRecord::from_repodata_record(
            RepoDataRecord {
                file_name: format!("{name}-1.0-0.conda"),
                url: Url::parse("https://conda.anaconda.org/main/linux-64/x.conda").unwrap(),
                channel: "https://conda.anaconda.org/main".to_owned(),
                package_record: PackageRecord::new(
                    PackageName::new(name).unwrap(),
                    Version::from_str("1.0").unwrap(),
                    "0",
                ),
            },
            Vec::new(),
            None,
            requested.map(ToString::to_string),
        )
    }

    #[test]
    fn history_specs_supplement_new_requests() {
        let records = vec![
            installed("python", Some("python >=3.11")),
            installed("zlib", None),
        ];
        let new_specs =
            vec![MatchSpec::from_str("numpy", ParseStrictness::Strict).unwrap()];

        let combined = combined_specs(&records, new_specs);
        let rendered: Vec<String> = combined.iter().map(ToString::to_string).collect();
        assert_eq!(rendered, vec!["numpy", "python >=3.11"]);
    }

    #[test]
    fn re_requested_names_are_not_duplicated() {
        let records = vec![installed("python", Some("python >=3.10"))];
        let new_specs =
            vec![MatchSpec::from_str("python =3.12", ParseStrictness::Strict).unwrap()];

        let combined = combined_specs(&records, new_specs);
        assert_eq!(combined.len(), 1);
        assert_eq!(combined[0].to_string(), "python 3.12.*");
    }
}
