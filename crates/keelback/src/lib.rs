#![deny(missing_docs)]

//! Transactional conda environment management.
//!
//! This crate ties the keelback pipeline together: it owns the shared
//! package cache, downloads and extracts package archives, and executes the
//! resolver's target state against a prefix as an ordered, recoverable
//! transaction, maintaining the `conda-meta` records, the history trail,
//! and the environments registry.
//!
//! The typical flow:
//!
//! 1. build an index with [`keelback_repodata::gateway::IndexEngine`],
//! 2. compute a target state with [`keelback_solve::solve`],
//! 3. diff it against the prefix with
//!    [`install::Transaction::from_current_and_desired`],
//! 4. execute it with [`install::TransactionRunner::execute`].

pub mod acquire;
pub mod config;
pub mod install;
pub mod ops;
pub mod package_cache;
pub mod prefix;

pub use acquire::AcquireError;
pub use config::CoreConfig;
pub use install::{
    ExecuteOptions, Instruction, Transaction, TransactionError, TransactionOperation,
    TransactionOutcome, TransactionRunner,
};
pub use package_cache::PackageCache;
pub use prefix::{EnvironmentsRegistry, PrefixData, PrefixError, PrefixGuard};
