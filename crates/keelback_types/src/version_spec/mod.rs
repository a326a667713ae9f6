//! The version constraint grammar used inside match specs, e.g. `>=3.4,<4.0`.

mod parse;

use std::fmt::{Display, Formatter};

pub use parse::ParseVersionSpecError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{version::StrictVersion, ParseStrictness, Version};

/// Comparison operators that relate a version to a bound.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum CompareOp {
    Less,
    LessEquals,
    Greater,
    GreaterEquals,
    Equals,
    NotEquals,
}

impl Display for CompareOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            CompareOp::Less => "<",
            CompareOp::LessEquals => "<=",
            CompareOp::Greater => ">",
            CompareOp::GreaterEquals => ">=",
            CompareOp::Equals => "==",
            CompareOp::NotEquals => "!=",
        })
    }
}

/// Prefix-style operators that are sensitive to how the bound was written:
/// `=1.2` matches everything that starts with `1.2`, which is a different
/// set than what `=1.2.0` matches.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum PrefixOp {
    StartsWith,
    NotStartsWith,
    Compatible,
}

/// How the terms of a constraint group combine.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum GroupOp {
    /// Every term must hold (`,`).
    All,
    /// At least one term must hold (`|`).
    Any,
}

impl Display for GroupOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            GroupOp::All => ",",
            GroupOp::Any => "|",
        })
    }
}

/// A parsed version constraint tree.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum VersionSpec {
    /// Matches every version (`*`).
    Any,

    /// An ordering or equality comparison against a bound.
    Compare(CompareOp, Version),

    /// A prefix-sensitive comparison (`=1.2`, `1.2.*`, `~=1.2`).
    Prefix(PrefixOp, StrictVersion),

    /// A conjunction or disjunction of sub-constraints.
    Group(GroupOp, Vec<VersionSpec>),
}

impl VersionSpec {
    /// Parses a version spec with the requested strictness.
    pub fn from_str(
        source: &str,
        strictness: ParseStrictness,
    ) -> Result<Self, ParseVersionSpecError> {
        parse::parse_version_spec(source, strictness)
    }

    /// Evaluates the constraint against a version.
    pub fn matches(&self, version: &Version) -> bool {
        match self {
            VersionSpec::Any => true,
            VersionSpec::Compare(op, bound) => match op {
                CompareOp::Less => version < bound,
                CompareOp::LessEquals => version <= bound,
                CompareOp::Greater => version > bound,
                CompareOp::GreaterEquals => version >= bound,
                CompareOp::Equals => version == bound,
                CompareOp::NotEquals => version != bound,
            },
            VersionSpec::Prefix(op, bound) => match op {
                PrefixOp::StartsWith => version.starts_with(&bound.0),
                PrefixOp::NotStartsWith => !version.starts_with(&bound.0),
                PrefixOp::Compatible => version.compatible_with(&bound.0),
            },
            VersionSpec::Group(GroupOp::All, terms) => {
                terms.iter().all(|term| term.matches(version))
            }
            VersionSpec::Group(GroupOp::Any, terms) => {
                terms.iter().any(|term| term.matches(version))
            }
        }
    }
}

impl std::str::FromStr for VersionSpec {
    type Err = ParseVersionSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        VersionSpec::from_str(s, ParseStrictness::Lenient)
    }
}

impl Display for VersionSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        fn write(
            spec: &VersionSpec,
            f: &mut Formatter<'_>,
            parent: Option<GroupOp>,
        ) -> std::fmt::Result {
            match spec {
                VersionSpec::Any => write!(f, "*"),
                VersionSpec::Compare(op, version) => write!(f, "{op}{version}"),
                VersionSpec::Prefix(PrefixOp::StartsWith, version) => write!(f, "{version}.*"),
                VersionSpec::Prefix(PrefixOp::NotStartsWith, version) => {
                    write!(f, "!={version}.*")
                }
                VersionSpec::Prefix(PrefixOp::Compatible, version) => write!(f, "~={version}"),
                VersionSpec::Group(op, terms) => {
                    // An or-group inside an and-group needs parentheses to
                    // survive a round-trip; `,` binds tighter than `|`.
                    let parenthesize = *op == GroupOp::Any && parent == Some(GroupOp::All);
                    if parenthesize {
                        write!(f, "(")?;
                    }
                    for (i, term) in terms.iter().enumerate() {
                        if i > 0 {
                            write!(f, "{op}")?;
                        }
                        write(term, f, Some(*op))?;
                    }
                    if parenthesize {
                        write!(f, ")")?;
                    }
                    Ok(())
                }
            }
        }
        write(self, f, None)
    }
}

impl Serialize for VersionSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for VersionSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = std::borrow::Cow::<str>::deserialize(deserializer)?;
        source.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::{CompareOp, GroupOp, VersionSpec};
    use crate::{ParseStrictness, Version};

    fn version(s: &str) -> Version {
        Version::from_str(s).unwrap()
    }

    #[test]
    fn simple_constraints() {
        assert_eq!(
            VersionSpec::from_str("1.2.3", ParseStrictness::Strict).unwrap(),
            VersionSpec::Compare(CompareOp::Equals, version("1.2.3"))
        );
        assert_eq!(
            VersionSpec::from_str(">=1.2.3", ParseStrictness::Strict).unwrap(),
            VersionSpec::Compare(CompareOp::GreaterEquals, version("1.2.3"))
        );
    }

    #[test]
    fn groups() {
        let spec = VersionSpec::from_str(">=1.2.3,<2.0.0", ParseStrictness::Strict).unwrap();
        assert_eq!(
            spec,
            VersionSpec::Group(
                GroupOp::All,
                vec![
                    VersionSpec::Compare(CompareOp::GreaterEquals, version("1.2.3")),
                    VersionSpec::Compare(CompareOp::Less, version("2.0.0")),
                ]
            )
        );

        let or_spec = VersionSpec::from_str(">=1.2.3|<1.0.0", ParseStrictness::Strict).unwrap();
        assert_eq!(
            or_spec,
            VersionSpec::Group(
                GroupOp::Any,
                vec![
                    VersionSpec::Compare(CompareOp::GreaterEquals, version("1.2.3")),
                    VersionSpec::Compare(CompareOp::Less, version("1.0.0")),
                ]
            )
        );

        // Parentheses are transparent when redundant.
        assert_eq!(
            VersionSpec::from_str("((>=1.2.3)|<1.0.0)", ParseStrictness::Strict).unwrap(),
            or_spec
        );
    }

    #[test]
    fn matching() {
        let range = VersionSpec::from_str(">=1.2.3,<2.0.0", ParseStrictness::Strict).unwrap();
        assert!(!range.matches(&version("1.2.0")));
        assert!(range.matches(&version("1.2.3")));
        assert!(!range.matches(&version("1!1.2.3")));

        // A bare version is an exact match modulo trailing zeros.
        let exact = VersionSpec::from_str("1.2", ParseStrictness::Strict).unwrap();
        assert!(exact.matches(&version("1.2.0")));
        assert!(!exact.matches(&version("1.2.3")));

        let epoch_range = VersionSpec::from_str(">=1!1.2,<1!2", ParseStrictness::Strict).unwrap();
        assert!(epoch_range.matches(&version("1!1.2.3")));
    }

    #[test]
    fn starts_with_glob() {
        for (spec, expected) in [
            ("2.38.*", true),
            ("2.38.0.*", true),
            ("2.38.0.1*", false),
            ("2.38.0a.*", false),
        ] {
            let spec = VersionSpec::from_str(spec, ParseStrictness::Strict).unwrap();
            assert_eq!(spec.matches(&version("2.38")), expected, "{spec}");
        }
    }

    #[test]
    fn compatible_release() {
        let spec = VersionSpec::from_str("~=2.4", ParseStrictness::Strict).unwrap();
        assert!(spec.matches(&version("2.4")));
        assert!(spec.matches(&version("2.5")));
        assert!(!spec.matches(&version("2.1")));
        assert!(!spec.matches(&version("3.1")));
    }

    #[test]
    fn missing_separator_is_rejected() {
        assert!(VersionSpec::from_str(">=3.8<3.9", ParseStrictness::Strict).is_err());
    }

    #[test]
    fn lenient_normalizations() {
        assert_eq!(
            VersionSpec::from_str(">2.10*", ParseStrictness::Lenient).unwrap(),
            VersionSpec::from_str(">=2.10", ParseStrictness::Strict).unwrap()
        );
        assert_eq!(
            VersionSpec::from_str("2023.*.*", ParseStrictness::Lenient).unwrap(),
            VersionSpec::from_str("2023.*", ParseStrictness::Lenient).unwrap()
        );
        assert!(VersionSpec::from_str("2023.*.*", ParseStrictness::Strict).is_err());
        assert_eq!(
            VersionSpec::from_str("0.2.18.*.", ParseStrictness::Lenient).unwrap(),
            VersionSpec::from_str("0.2.18.*", ParseStrictness::Lenient).unwrap()
        );
        assert!(VersionSpec::from_str("0.2.18.*.", ParseStrictness::Strict).is_err());
        assert_eq!(
            VersionSpec::from_str(">=*", ParseStrictness::Lenient).unwrap(),
            VersionSpec::Any
        );
        assert!(VersionSpec::from_str(">=*", ParseStrictness::Strict).is_err());
        assert!(VersionSpec::from_str(">*", ParseStrictness::Lenient).is_err());
    }

    #[test]
    fn display_round_trip() {
        for (source, formatted) in [
            ("(>=1,<2)|>3", ">=1,<2|>3"),
            ("(>=1|<2),>3", "(>=1|<2),>3"),
            ("(>=1|<2)|>3", ">=1|<2|>3"),
            ("(>=1,<2),>3", ">=1,<2,>3"),
            ("1.2.*", "1.2.*"),
            ("~=1.2", "~=1.2"),
        ] {
            let spec = VersionSpec::from_str(source, ParseStrictness::Lenient).unwrap();
            assert_eq!(spec.to_string(), formatted);
        }
    }

    #[test]
    fn strict_version_distinguishes_written_form() {
        let short = VersionSpec::from_str("=1.1", ParseStrictness::Lenient).unwrap();
        let long = VersionSpec::from_str("=1.1.0", ParseStrictness::Lenient).unwrap();
        assert_ne!(short, long);
        assert!(short.matches(&version("1.1.5")));
        assert!(!long.matches(&version("1.1.5")));
    }
}
