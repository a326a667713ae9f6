#![deny(missing_docs)]

//! Data model for the keelback conda core.
//!
//! This crate defines the vocabulary shared by the repodata gateway, the
//! resolver, and the transaction engine: package versions and their total
//! order, the match-spec constraint language, repodata wire structures,
//! records for packages available on a channel and packages linked into a
//! prefix, and the `conda-meta/history` trail.
//!
//! Nothing in here performs IO beyond reading and writing its own on-disk
//! representations; networking and prefix manipulation live in the
//! `keelback_repodata` and `keelback` crates.

pub mod build_number_spec;
mod channel;
mod generic_virtual_package;
mod history;
pub mod match_spec;
mod no_arch_type;
pub mod package;
mod package_name;
mod package_record;
mod parse_mode;
mod platform;
mod prefix_record;
mod repo_data;
mod repo_data_record;
mod string_matcher;
mod topological_sort;
pub(crate) mod utils;
pub mod version;
pub mod version_spec;

pub use build_number_spec::{BuildNumberSpec, OrdOperator, ParseBuildNumberSpecError};
pub use channel::{Channel, ChannelConfig, ParseChannelError};
pub use generic_virtual_package::GenericVirtualPackage;
pub use history::{History, HistoryError, HistoryRevision, ParsedHistory, Revision, UserRequest};
pub use match_spec::{MatchSpec, MergeSpecsError, NameMatcher, ParseMatchSpecError};
pub use no_arch_type::NoArchType;
pub use package_name::{InvalidPackageNameError, PackageName};
pub use package_record::{PackageRecord, ValidateRecordsError};
pub use parse_mode::ParseStrictness;
pub use platform::{ParsePlatformError, Platform};
pub use prefix_record::{FileMode, Link, LinkType, PathType, PathsEntry, PrefixPaths, PrefixRecord};
pub use repo_data::{ChannelInfo, RepoData};
pub use repo_data_record::RepoDataRecord;
pub use string_matcher::{StringMatcher, StringMatcherParseError};
pub use topological_sort::sort_topologically;
pub use version::{ParseVersionError, ParseVersionErrorKind, StrictVersion, Version};
pub use version_spec::{ParseVersionSpecError, VersionSpec};
