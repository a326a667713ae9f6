//! A small ordinal constraint language for build numbers, e.g. `>=2`.

use std::{
    fmt::{self, Display, Formatter},
    num::ParseIntError,
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// The build number of a package.
pub type BuildNumber = u64;

/// An ordering operator over plain integers.
#[allow(missing_docs)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum OrdOperator {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
}

impl Display for OrdOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            OrdOperator::Gt => ">",
            OrdOperator::Ge => ">=",
            OrdOperator::Lt => "<",
            OrdOperator::Le => "<=",
            OrdOperator::Eq => "==",
            OrdOperator::Ne => "!=",
        })
    }
}

/// A predicate over a package's build number: an operator and a bound.
/// A bare number is shorthand for equality.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct BuildNumberSpec {
    /// The comparison to apply.
    pub op: OrdOperator,
    /// The bound compared against.
    pub bound: BuildNumber,
}

/// The error returned when a build number spec cannot be parsed.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseBuildNumberSpecError {
    /// The operator was not recognized.
    #[error("invalid build number operator: '{0}'")]
    InvalidOperator(String),

    /// The bound is not an unsigned integer.
    #[error("invalid build number: {0}")]
    InvalidBuildNumber(#[from] ParseIntError),
}

impl BuildNumberSpec {
    /// Constructs a spec from its parts.
    pub fn new(op: OrdOperator, bound: BuildNumber) -> Self {
        Self { op, bound }
    }

    /// Evaluates the predicate against a build number.
    pub fn matches(&self, build_number: BuildNumber) -> bool {
        match self.op {
            OrdOperator::Gt => build_number > self.bound,
            OrdOperator::Ge => build_number >= self.bound,
            OrdOperator::Lt => build_number < self.bound,
            OrdOperator::Le => build_number <= self.bound,
            OrdOperator::Eq => build_number == self.bound,
            OrdOperator::Ne => build_number != self.bound,
        }
    }
}

impl FromStr for BuildNumberSpec {
    type Err = ParseBuildNumberSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (op, rest) = [
            (">=", OrdOperator::Ge),
            ("<=", OrdOperator::Le),
            ("==", OrdOperator::Eq),
            ("!=", OrdOperator::Ne),
            (">", OrdOperator::Gt),
            ("<", OrdOperator::Lt),
            ("=", OrdOperator::Eq),
        ]
        .iter()
        .find_map(|(prefix, op)| s.strip_prefix(prefix).map(|rest| (*op, rest)))
        .unwrap_or((OrdOperator::Eq, s));

        let rest = rest.trim();
        if rest.chars().any(|c| !c.is_ascii_digit()) {
            return Err(ParseBuildNumberSpecError::InvalidOperator(s.to_owned()));
        }
        Ok(BuildNumberSpec::new(op, rest.parse()?))
    }
}

impl Display for BuildNumberSpec {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.op, self.bound)
    }
}

impl Serialize for BuildNumberSpec {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for BuildNumberSpec {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = std::borrow::Cow::<str>::deserialize(deserializer)?;
        source.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::{BuildNumberSpec, OrdOperator};

    #[test]
    fn parse_and_match() {
        let spec = BuildNumberSpec::from_str(">=2").unwrap();
        assert_eq!(spec, BuildNumberSpec::new(OrdOperator::Ge, 2));
        assert!(spec.matches(2));
        assert!(spec.matches(7));
        assert!(!spec.matches(1));

        let bare = BuildNumberSpec::from_str("3").unwrap();
        assert_eq!(bare, BuildNumberSpec::new(OrdOperator::Eq, 3));
        assert!(bare.matches(3));
        assert!(!bare.matches(4));
    }

    #[test]
    fn rejects_garbage() {
        assert!(BuildNumberSpec::from_str(">=x").is_err());
        assert!(BuildNumberSpec::from_str("~2").is_err());
    }

    #[test]
    fn display_round_trip() {
        for spec in [">=2", "<5", "==0", "!=3"] {
            assert_eq!(BuildNumberSpec::from_str(spec).unwrap().to_string(), spec);
        }
    }
}
