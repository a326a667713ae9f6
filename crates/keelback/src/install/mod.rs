//! The transactional link/unlink engine.
//!
//! A [`Transaction`] is the diff between the packages currently linked in a
//! prefix and the target state computed by the resolver. Executing it
//! produces an ordered instruction stream — fetch and extract missing
//! packages, unlink removed packages in reverse dependency order, link new
//! packages in dependency order, then register the environment — and runs
//! it with rollback on failure: a transaction either completes or leaves
//! the prefix as it was.

pub mod driver;
pub mod link;
pub mod python;
pub mod unlink;

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use driver::InstallDriver;
use futures::{stream, StreamExt, TryStreamExt};
use keelback_types::{
    sort_topologically, History, HistoryError, LinkType, PackageRecord, Platform, PrefixRecord,
    RepoDataRecord, Revision,
};
use link::LinkError;
use python::{PythonInfo, PythonInfoError};
use reqwest_middleware::ClientWithMiddleware;
use tracing::{debug, warn};
use unlink::UnlinkError;

use crate::{
    acquire::AcquireError,
    package_cache::PackageCache,
    prefix::{EnvironmentsRegistry, PrefixData, PrefixError},
};

/// One operation of a transaction.
#[derive(Debug, Clone)]
pub enum TransactionOperation {
    /// Link a package that is not currently installed.
    Install(RepoDataRecord),

    /// Replace an installed package with a different artifact.
    Change {
        /// The installed record to remove.
        old: Box<PrefixRecord>,
        /// The record to link instead.
        new: RepoDataRecord,
    },

    /// Unlink and relink the same artifact, e.g. because the python
    /// version changed under a noarch package.
    Reinstall(Box<PrefixRecord>),

    /// Remove an installed package.
    Remove(Box<PrefixRecord>),
}

impl TransactionOperation {
    /// The record that ends up linked by this operation, if any.
    pub fn record_to_link(&self) -> Option<&RepoDataRecord> {
        match self {
            TransactionOperation::Install(new) => Some(new),
            TransactionOperation::Change { new, .. } => Some(new),
            TransactionOperation::Reinstall(old) => Some(&old.repodata_record),
            TransactionOperation::Remove(_) => None,
        }
    }

    /// The record that is unlinked by this operation, if any.
    pub fn record_to_unlink(&self) -> Option<&PrefixRecord> {
        match self {
            TransactionOperation::Install(_) => None,
            TransactionOperation::Change { old, .. } => Some(old),
            TransactionOperation::Reinstall(old) => Some(old),
            TransactionOperation::Remove(old) => Some(old),
        }
    }
}

/// The diff between the current and the desired state of a prefix.
#[derive(Debug)]
pub struct Transaction {
    /// The operations making up the transaction.
    pub operations: Vec<TransactionOperation>,

    /// The python of the desired state, when python is part of it.
    pub python_info: Option<PythonInfo>,

    /// The platform of the prefix.
    pub platform: Platform,
}

impl Transaction {
    /// Diffs the currently installed records against the target state. A
    /// package present in both with identical identity is kept; noarch
    /// python packages are reinstalled when the python minor version
    /// changes.
    pub fn from_current_and_desired(
        current: Vec<PrefixRecord>,
        desired: Vec<RepoDataRecord>,
        platform: Platform,
    ) -> Result<Transaction, PythonInfoError> {
        let current_python = python::find_python_record(&current)
            .map(|record| PythonInfo::from_version(&record.version, platform))
            .transpose()?;
        let desired_python = python::find_python_record(&desired)
            .map(|record| PythonInfo::from_version(&record.version, platform))
            .transpose()?;
        let needs_python_relink = match (&current_python, &desired_python) {
            (Some(current), Some(desired)) => desired.is_relink_required(current),
            _ => false,
        };

        let mut target: BTreeMap<&str, &RepoDataRecord> = desired
            .iter()
            .map(|record| (record.package_record.name.as_str(), record))
            .collect();

        let mut operations = Vec::new();
        for record in current {
            match target.remove(record.repodata_record.package_record.name.as_str()) {
                None => operations.push(TransactionOperation::Remove(Box::new(record))),
                Some(new) => {
                    if !same_identity(&record.repodata_record.package_record, &new.package_record)
                    {
                        operations.push(TransactionOperation::Change {
                            old: Box::new(record),
                            new: new.clone(),
                        });
                    } else if new.package_record.noarch.is_python() && needs_python_relink {
                        operations.push(TransactionOperation::Reinstall(Box::new(record)));
                    }
                }
            }
        }
        for (_, new) in target {
            operations.push(TransactionOperation::Install(new.clone()));
        }

        Ok(Transaction {
            operations,
            python_info: desired_python,
            platform,
        })
    }

    /// True when the transaction changes nothing.
    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    /// All records that will be linked.
    pub fn records_to_link(&self) -> impl Iterator<Item = &RepoDataRecord> {
        self.operations
            .iter()
            .filter_map(TransactionOperation::record_to_link)
    }

    /// All records that will be unlinked.
    pub fn records_to_unlink(&self) -> impl Iterator<Item = &PrefixRecord> {
        self.operations
            .iter()
            .filter_map(TransactionOperation::record_to_unlink)
    }
}

fn same_identity(a: &PackageRecord, b: &PackageRecord) -> bool {
    a.name == b.name
        && a.version == b.version
        && a.build == b.build
        && a.subdir == b.subdir
        && a.md5 == b.md5
}

/// One step of the executable plan.
#[derive(Debug, Clone)]
pub enum Instruction {
    /// Names the prefix everything below applies to.
    Prefix(PathBuf),

    /// Download an archive into the package cache.
    Fetch(RepoDataRecord),

    /// Extract an archive in the package cache.
    Extract(RepoDataRecord),

    /// Remove a package from the prefix.
    Unlink(Box<PrefixRecord>),

    /// Link a package into the prefix.
    Link(RepoDataRecord),

    /// Materialize the conda redirection for the prefix.
    SymlinkConda(PathBuf),

    /// Add the prefix to the environments registry.
    RegisterEnv(PathBuf),
}

/// How a finished transaction ended.
#[derive(Debug)]
pub enum TransactionOutcome {
    /// All operations were applied and recorded.
    Applied {
        /// Number of packages linked.
        linked: usize,
        /// Number of packages unlinked.
        unlinked: usize,
    },

    /// Dry run: the plan that would have been executed; the prefix was not
    /// touched.
    DryRun(Vec<Instruction>),

    /// Cancellation was requested; partial work was rolled back.
    Cancelled,
}

/// Errors from executing a transaction. When the error occurred during the
/// link or unlink phase, the prefix has been rolled back to its previous
/// state before this is returned.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    /// Fetching or extracting a package failed; the prefix was not touched.
    #[error(transparent)]
    Acquire(#[from] AcquireError),

    /// Prefix state could not be read or written.
    #[error(transparent)]
    Prefix(#[from] PrefixError),

    /// Linking a package failed.
    #[error(transparent)]
    Link(#[from] LinkError),

    /// Unlinking a package failed.
    #[error(transparent)]
    Unlink(#[from] UnlinkError),

    /// The python version of the target state is unusable.
    #[error(transparent)]
    PythonInfo(#[from] PythonInfoError),

    /// The history file could not be appended.
    #[error(transparent)]
    History(#[from] HistoryError),

    /// There is not enough free disk space to apply the transaction.
    #[error("not enough disk space in {0}")]
    DiskSpace(PathBuf),
}

/// Options of one execution.
#[derive(Debug, Default)]
pub struct ExecuteOptions {
    /// Plan only; the filesystem is not touched.
    pub dry_run: bool,

    /// The specs the user requested, recorded in history and in the
    /// `requested_spec` of new prefix records.
    pub requested_specs: Vec<String>,

    /// Cooperative cancellation: checked between file-level operations.
    pub cancel: Option<Arc<AtomicBool>>,

    /// Overrides the environments registry location (used by tests).
    pub registry: Option<EnvironmentsRegistry>,
}

impl ExecuteOptions {
    fn is_cancelled(&self) -> bool {
        self.cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }
}

/// Executes transactions against prefixes.
pub struct TransactionRunner {
    /// The HTTP client used for package downloads.
    pub client: ClientWithMiddleware,

    /// The shared package cache.
    pub package_cache: PackageCache,

    /// Concurrency control for fetch and extract.
    pub driver: InstallDriver,
}

/// What was done during the mutating phase, for rollback.
enum Performed {
    Unlinked(Box<PrefixRecord>),
    Linked(Box<PrefixRecord>),
}

impl TransactionRunner {
    /// Builds the ordered instruction stream for a transaction.
    pub fn plan(&self, target_prefix: &Path, transaction: &Transaction) -> Vec<Instruction> {
        let mut instructions = vec![Instruction::Prefix(target_prefix.to_owned())];

        for record in transaction.records_to_link() {
            if !self.package_cache.has_valid_archive(record)
                && !self.package_cache.is_extracted(record)
            {
                instructions.push(Instruction::Fetch(record.clone()));
            }
        }
        for record in transaction.records_to_link() {
            if !self.package_cache.is_extracted(record) {
                instructions.push(Instruction::Extract(record.clone()));
            }
        }
        for record in unlink_order(transaction) {
            instructions.push(Instruction::Unlink(Box::new(record.clone())));
        }
        for record in link_order(transaction) {
            instructions.push(Instruction::Link(record.clone()));
        }
        if transaction.platform.is_unix() {
            instructions.push(Instruction::SymlinkConda(target_prefix.to_owned()));
        }
        instructions.push(Instruction::RegisterEnv(target_prefix.to_owned()));
        instructions
    }

    /// Executes the transaction against the prefix. Holds the per-prefix
    /// lock for the whole run. On an error during the mutating phase the
    /// already performed operations are rolled back before returning.
    pub async fn execute(
        &self,
        target_prefix: &Path,
        transaction: &Transaction,
        options: &ExecuteOptions,
    ) -> Result<TransactionOutcome, TransactionError> {
        let plan = self.plan(target_prefix, transaction);
        if options.dry_run {
            return Ok(TransactionOutcome::DryRun(plan));
        }

        let _guard = crate::prefix::PrefixGuard::lock(target_prefix)?;
        let mut prefix_data = PrefixData::from_prefix(target_prefix)?;

        // Phase 1: fetch and extract everything up front, in parallel. Any
        // failure aborts here, before the prefix is touched.
        let to_prepare: Vec<RepoDataRecord> =
            transaction.records_to_link().cloned().collect();
        stream::iter(to_prepare)
            .map(|record| {
                let cache = self.package_cache.clone();
                let client = self.client.clone();
                let driver = self.driver.clone();
                async move {
                    driver
                        .with_io_permit(async { cache.ensure_extracted(&client, &record).await })
                        .await
                        .map(|_| ())
                }
            })
            .buffer_unordered(self.driver.io_limit())
            .try_collect::<()>()
            .await?;

        if options.is_cancelled() {
            return Ok(TransactionOutcome::Cancelled);
        }

        // Phase 2: the strictly sequential unlink/link phase.
        let link_type = link::determine_link_type(self.package_cache.root(), target_prefix);
        let mut performed: Vec<Performed> = Vec::new();

        let result = self
            .mutate_prefix(
                target_prefix,
                transaction,
                options,
                link_type,
                &mut prefix_data,
                &mut performed,
            )
            .await;

        match result {
            Ok(true) => {}
            Ok(false) => {
                self.rollback(target_prefix, &mut prefix_data, performed, transaction);
                return Ok(TransactionOutcome::Cancelled);
            }
            Err(e) => {
                self.rollback(target_prefix, &mut prefix_data, performed, transaction);
                return Err(refine_error(e, target_prefix));
            }
        }

        // Phase 3: bookkeeping. Nothing here invalidates the linked state.
        if transaction.platform.is_unix() {
            symlink_conda(target_prefix);
        }
        match &options.registry {
            Some(registry) => registry.register(target_prefix)?,
            None => EnvironmentsRegistry::default_location().register(target_prefix)?,
        }
        self.append_history(target_prefix, transaction, options)?;

        Ok(TransactionOutcome::Applied {
            linked: transaction.records_to_link().count(),
            unlinked: transaction.records_to_unlink().count(),
        })
    }

    /// Runs the unlink and link phases. Returns `Ok(false)` when cancelled
    /// partway; the caller rolls back.
    async fn mutate_prefix(
        &self,
        target_prefix: &Path,
        transaction: &Transaction,
        options: &ExecuteOptions,
        link_type: LinkType,
        prefix_data: &mut PrefixData,
        performed: &mut Vec<Performed>,
    ) -> Result<bool, TransactionError> {
        // Directories owned by packages that stay linked must survive the
        // unlink sweep.
        let unlinked_names: HashSet<&str> = transaction
            .records_to_unlink()
            .map(|record| record.repodata_record.package_record.name.as_str())
            .collect();
        let keep_directories: HashSet<PathBuf> = prefix_data
            .iter_records()
            .filter(|record| {
                !unlinked_names.contains(record.repodata_record.package_record.name.as_str())
            })
            .flat_map(|record| {
                record
                    .paths_data
                    .paths
                    .iter()
                    .filter(|entry| entry.path_type == keelback_types::PathType::Directory)
                    .map(|entry| target_prefix.join(&entry.relative_path))
            })
            .collect();

        for record in unlink_order(transaction) {
            if options.is_cancelled() {
                return Ok(false);
            }
            debug!(
                "unlinking {}",
                record.repodata_record.package_record.name
            );
            // Read the package's contributed env vars while its files are
            // still on disk.
            self.remove_package_env_vars(prefix_data, &record)?;
            unlink::unlink_package(target_prefix, &record, &keep_directories)?;
            prefix_data.remove(&record.repodata_record.package_record.name)?;
            performed.push(Performed::Unlinked(Box::new(record)));
        }

        for record in link_order(transaction) {
            if options.is_cancelled() {
                return Ok(false);
            }
            debug!("linking {}", record.package_record.name);
            let prefix_record = self
                .link_one(target_prefix, record.clone(), link_type, transaction, options)
                .await?;
            self.apply_package_env_vars(prefix_data, &prefix_record)?;
            prefix_data.insert(prefix_record.clone())?;
            performed.push(Performed::Linked(Box::new(prefix_record)));
        }

        Ok(true)
    }

    async fn link_one(
        &self,
        target_prefix: &Path,
        record: RepoDataRecord,
        link_type: LinkType,
        transaction: &Transaction,
        options: &ExecuteOptions,
    ) -> Result<PrefixRecord, TransactionError> {
        let extracted_dir = self.package_cache.extracted_dir(&record);
        let python_info = transaction.python_info.clone();
        let noarch = record.package_record.noarch;
        let prefix = target_prefix.to_owned();

        let source_dir = extracted_dir.clone();
        let mut entries = tokio::task::spawn_blocking(move || {
            link::link_package(
                &source_dir,
                &prefix,
                link_type,
                noarch,
                python_info.as_ref(),
            )
        })
        .await
        .map_err(|_| AcquireError::Cancelled)??;

        // Byte-compile the sources of noarch python packages with the
        // prefix's own interpreter; failures are tolerated.
        if noarch.is_python() {
            if let Some(python) = &transaction.python_info {
                let sources: Vec<PathBuf> = entries
                    .iter()
                    .filter(|entry| entry.relative_path.extension().is_some_and(|e| e == "py"))
                    .map(|entry| entry.relative_path.clone())
                    .collect();
                for pyc in python::compile_pyc(target_prefix, python, &sources).await {
                    entries.push(keelback_types::PathsEntry {
                        relative_path: pyc,
                        path_type: keelback_types::PathType::PycFile,
                        no_link: false,
                        sha256: None,
                        sha256_in_prefix: None,
                        size_in_bytes: None,
                        file_mode: None,
                        prefix_placeholder: None,
                    });
                }
            }
        }

        let requested_spec = options
            .requested_specs
            .iter()
            .find(|spec| {
                spec_name(spec) == record.package_record.name.as_str()
            })
            .cloned();

        Ok(PrefixRecord::from_repodata_record(
            record,
            entries,
            Some(keelback_types::Link {
                source: extracted_dir,
                link_type: Some(link_type),
            }),
            requested_spec,
        ))
    }

    /// Merges the `etc/conda/env_vars.d/*.json` files a package shipped
    /// into `conda-meta/state`.
    fn apply_package_env_vars(
        &self,
        prefix_data: &PrefixData,
        record: &PrefixRecord,
    ) -> Result<(), TransactionError> {
        let mut merged = BTreeMap::new();
        for path in env_var_files(record) {
            let absolute = prefix_data.prefix().join(&path);
            match fs_err::read_to_string(&absolute) {
                Ok(contents) => match serde_json::from_str::<BTreeMap<String, String>>(&contents)
                {
                    Ok(vars) => merged.extend(vars),
                    Err(e) => warn!("ignoring malformed env var file {path:?}: {e}"),
                },
                Err(e) => warn!("could not read env var file {path:?}: {e}"),
            }
        }
        if !merged.is_empty() {
            prefix_data.set_environment_env_vars(&merged)?;
        }
        Ok(())
    }

    fn remove_package_env_vars(
        &self,
        prefix_data: &PrefixData,
        record: &PrefixRecord,
    ) -> Result<(), TransactionError> {
        let mut keys = Vec::new();
        for path in env_var_files(record) {
            let absolute = prefix_data.prefix().join(&path);
            if let Ok(contents) = fs_err::read_to_string(&absolute) {
                if let Ok(vars) = serde_json::from_str::<BTreeMap<String, String>>(&contents) {
                    keys.extend(vars.into_keys());
                }
            }
        }
        if !keys.is_empty() {
            prefix_data.unset_environment_env_vars(&keys)?;
        }
        Ok(())
    }

    /// Reverts the performed operations in reverse order, restoring the
    /// prefix to its pre-transaction state.
    fn rollback(
        &self,
        target_prefix: &Path,
        prefix_data: &mut PrefixData,
        performed: Vec<Performed>,
        transaction: &Transaction,
    ) {
        warn!("rolling back {} operations", performed.len());
        for action in performed.into_iter().rev() {
            match action {
                Performed::Linked(record) => {
                    if let Err(e) =
                        unlink::unlink_package(target_prefix, &record, &HashSet::new())
                    {
                        warn!("rollback: failed to unlink {}: {e}", record.file_name());
                    }
                    let _ = prefix_data.remove(&record.repodata_record.package_record.name);
                }
                Performed::Unlinked(record) => {
                    // Relink from the cache when the extracted directory is
                    // still available; the conda-meta record is restored
                    // from the in-memory snapshot regardless.
                    let source = record
                        .link
                        .as_ref()
                        .map(|link| link.source.clone())
                        .unwrap_or_else(|| {
                            self.package_cache.extracted_dir(&record.repodata_record)
                        });
                    if source.join("info").is_dir() {
                        let link_type = record
                            .link
                            .as_ref()
                            .and_then(|link| link.link_type)
                            .unwrap_or(LinkType::Copy);
                        if let Err(e) = link::link_package(
                            &source,
                            target_prefix,
                            link_type,
                            record.repodata_record.package_record.noarch,
                            transaction.python_info.as_ref(),
                        ) {
                            warn!(
                                "rollback: failed to relink {}: {e}",
                                record.file_name()
                            );
                        }
                    } else {
                        warn!(
                            "rollback: cache no longer holds {}, restoring metadata only",
                            record.file_name()
                        );
                    }
                    if let Err(e) = prefix_data.insert(*record) {
                        warn!("rollback: failed to restore conda-meta record: {e}");
                    }
                }
            }
        }
    }

    fn append_history(
        &self,
        target_prefix: &Path,
        transaction: &Transaction,
        options: &ExecuteOptions,
    ) -> Result<(), TransactionError> {
        let dist = |record: &PackageRecord| {
            format!("{}-{}-{}", record.name, record.version, record.build)
        };
        let revision = Revision {
            timestamp: chrono::Utc::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            cmd: None,
            action_specs: (!options.requested_specs.is_empty()).then(|| {
                ("update".to_owned(), options.requested_specs.clone())
            }),
            removed: transaction
                .records_to_unlink()
                .map(|record| dist(&record.repodata_record.package_record))
                .collect::<BTreeSet<_>>(),
            added: transaction
                .records_to_link()
                .map(|record| dist(&record.package_record))
                .collect::<BTreeSet<_>>(),
        };
        History::new(target_prefix).append(&revision)?;
        Ok(())
    }
}

/// Records to unlink, in reverse topological order of the pre-transaction
/// prefix: dependents are removed before their dependencies.
fn unlink_order(transaction: &Transaction) -> Vec<PrefixRecord> {
    let to_unlink: Vec<PrefixRecord> =
        transaction.records_to_unlink().cloned().collect();
    let mut ordered = sort_topologically(to_unlink);
    ordered.reverse();
    ordered
}

/// Records to link, in topological order: dependencies first.
fn link_order(transaction: &Transaction) -> Vec<RepoDataRecord> {
    sort_topologically(transaction.records_to_link().cloned().collect())
}

/// Creates the conda redirection inside the prefix when the running conda
/// binary is known. Best effort: a prefix without the symlink is still a
/// working environment.
fn symlink_conda(target_prefix: &Path) {
    #[cfg(unix)]
    {
        let Ok(conda_exe) = std::env::var("CONDA_EXE") else {
            return;
        };
        let condabin = target_prefix.join("condabin");
        if fs_err::create_dir_all(&condabin).is_err() {
            return;
        }
        let link = condabin.join("conda");
        if !link.exists() {
            let _ = std::os::unix::fs::symlink(conda_exe, link);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = target_prefix;
    }
}

fn spec_name(spec: &str) -> &str {
    spec.split([' ', '=', '<', '>', '!', '~'])
        .next()
        .unwrap_or(spec)
}

/// Surfaces a full disk as its own error kind; everything else passes
/// through unchanged.
fn refine_error(error: TransactionError, target_prefix: &Path) -> TransactionError {
    let out_of_space = match &error {
        TransactionError::Link(LinkError::FailedToLink { source, .. }) => {
            source.kind() == std::io::ErrorKind::StorageFull
        }
        TransactionError::Prefix(PrefixError::Io(source)) => {
            source.kind() == std::io::ErrorKind::StorageFull
        }
        _ => false,
    };
    if out_of_space {
        TransactionError::DiskSpace(target_prefix.to_owned())
    } else {
        error
    }
}

/// The env-var declaration files a package ships, relative to the prefix.
fn env_var_files(record: &PrefixRecord) -> impl Iterator<Item = &std::path::PathBuf> {
    record.files.iter().filter(|path| {
        path.starts_with("etc/conda/env_vars.d")
            && path.extension().is_some_and(|ext| ext == "json")
    })
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use keelback_types::{
        NoArchType, PackageName, PackageRecord, Platform, PrefixRecord, RepoDataRecord, Version,
    };
    use url::Url;

    use super::{Transaction, TransactionOperation};

    fn repodata_record(name: &str, version: &str, build: &str) -> RepoDataRecord {
        RepoDataRecord {
            file_name: format!("{name}-{version}-{build}.conda"),
            url: Url::parse("https://conda.anaconda.org/main/linux-64/")
                .unwrap()
                .join(&format!("{name}-{version}-{build}.conda"))
                .unwrap(),
            channel: "https://conda.anaconda.org/main".to_owned(),
            package_record: PackageRecord::new(
                PackageName::new(name).unwrap(),
                Version::from_str(version).unwrap(),
                build,
            ),
        }
    }

    fn prefix_record(name: &str, version: &str, build: &str) -> PrefixRecord {
        PrefixRecord::from_repodata_record(
            repodata_record(name, version, build),
            Vec::new(),
            None,
            None,
        )
    }

    #[test]
    fn identical_states_produce_an_empty_transaction() {
        let transaction = Transaction::from_current_and_desired(
            vec![prefix_record("python", "3.11.4", "h0_0")],
            vec![repodata_record("python", "3.11.4", "h0_0")],
            Platform::Linux64,
        )
        .unwrap();
        assert!(transaction.is_empty());
    }

    #[test]
    fn diff_produces_install_change_remove() {
        let transaction = Transaction::from_current_and_desired(
            vec![
                prefix_record("removed", "1.0", "h0_0"),
                prefix_record("upgraded", "1.0", "h0_0"),
                prefix_record("kept", "2.0", "h0_0"),
            ],
            vec![
                repodata_record("upgraded", "2.0", "h0_0"),
                repodata_record("kept", "2.0", "h0_0"),
                repodata_record("added", "1.0", "h0_0"),
            ],
            Platform::Linux64,
        )
        .unwrap();

        let mut kinds: Vec<&str> = transaction
            .operations
            .iter()
            .map(|op| match op {
                TransactionOperation::Install(_) => "install",
                TransactionOperation::Change { .. } => "change",
                TransactionOperation::Reinstall(_) => "reinstall",
                TransactionOperation::Remove(_) => "remove",
            })
            .collect();
        kinds.sort_unstable();
        assert_eq!(kinds, vec!["change", "install", "remove"]);
    }

    #[test]
    fn python_minor_bump_reinstalls_noarch() {
        let mut noarch = prefix_record("six", "1.16.0", "pyh0_0");
        noarch.repodata_record.package_record.noarch = NoArchType::Python;
        let mut desired_six = repodata_record("six", "1.16.0", "pyh0_0");
        desired_six.package_record.noarch = NoArchType::Python;

        let transaction = Transaction::from_current_and_desired(
            vec![noarch, prefix_record("python", "3.10.9", "h0_0")],
            vec![desired_six, repodata_record("python", "3.11.4", "h0_0")],
            Platform::Linux64,
        )
        .unwrap();

        assert!(transaction
            .operations
            .iter()
            .any(|op| matches!(op, TransactionOperation::Reinstall(old)
                if old.repodata_record.package_record.name == "six")));
        assert!(transaction
            .operations
            .iter()
            .any(|op| matches!(op, TransactionOperation::Change { new, .. }
                if new.package_record.name == "python")));
    }

    #[test]
    fn python_patch_bump_does_not_reinstall_noarch() {
        let mut noarch = prefix_record("six", "1.16.0", "pyh0_0");
        noarch.repodata_record.package_record.noarch = NoArchType::Python;
        let mut desired_six = repodata_record("six", "1.16.0", "pyh0_0");
        desired_six.package_record.noarch = NoArchType::Python;

        let transaction = Transaction::from_current_and_desired(
            vec![noarch, prefix_record("python", "3.11.2", "h0_0")],
            vec![desired_six, repodata_record("python", "3.11.4", "h0_0")],
            Platform::Linux64,
        )
        .unwrap();

        assert!(!transaction
            .operations
            .iter()
            .any(|op| matches!(op, TransactionOperation::Reinstall(_))));
    }

    #[test]
    fn link_order_is_dependency_first() {
        let mut python = repodata_record("python", "3.11.4", "h0_0");
        python.package_record.depends = vec!["openssl".to_owned()];
        let openssl = repodata_record("openssl", "3.1.1", "h0_0");

        let transaction = Transaction::from_current_and_desired(
            Vec::new(),
            vec![python, openssl],
            Platform::Linux64,
        )
        .unwrap();

        let order: Vec<String> = super::link_order(&transaction)
            .iter()
            .map(|record| record.package_record.name.to_string())
            .collect();
        assert_eq!(order, vec!["openssl", "python"]);

        // Unlinking the same set runs in the opposite order.
        let mut installed_python = prefix_record("python", "3.11.4", "h0_0");
        installed_python.repodata_record.package_record.depends = vec!["openssl".to_owned()];
        let removal = Transaction::from_current_and_desired(
            vec![installed_python, prefix_record("openssl", "3.1.1", "h0_0")],
            Vec::new(),
            Platform::Linux64,
        )
        .unwrap();
        let unlink_order: Vec<String> = super::unlink_order(&removal)
            .iter()
            .map(|record| record.repodata_record.package_record.name.to_string())
            .collect();
        assert_eq!(unlink_order, vec!["python", "openssl"]);
    }
}
