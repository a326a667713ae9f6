//! Matching of free-form string fields like build strings.

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Matches a string field either exactly, by `*` glob, or by an explicit
/// regular expression (written `^...$`).
#[derive(Debug, Clone)]
pub enum StringMatcher {
    /// The field must equal the value exactly.
    Exact(String),

    /// The field must match a glob where `*` spans any run of characters.
    Glob(regex::Regex),

    /// The field must match the regular expression.
    Regex(regex::Regex),
}

/// The error returned when a string matcher cannot be compiled.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum StringMatcherParseError {
    /// The glob or regex failed to compile.
    #[error("invalid pattern: '{0}'")]
    InvalidPattern(String),
}

impl StringMatcher {
    /// Evaluates the matcher against a string.
    pub fn matches(&self, other: &str) -> bool {
        match self {
            StringMatcher::Exact(value) => value == other,
            StringMatcher::Glob(pattern) | StringMatcher::Regex(pattern) => {
                pattern.is_match(other)
            }
        }
    }
}

impl FromStr for StringMatcher {
    type Err = StringMatcherParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.starts_with('^') && s.ends_with('$') {
            let regex = regex::Regex::new(s)
                .map_err(|_| StringMatcherParseError::InvalidPattern(s.to_owned()))?;
            Ok(StringMatcher::Regex(regex))
        } else if s.contains('*') {
            let escaped = s
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let regex = regex::Regex::new(&format!("^{escaped}$"))
                .map_err(|_| StringMatcherParseError::InvalidPattern(s.to_owned()))?;
            Ok(StringMatcher::Glob(regex))
        } else {
            Ok(StringMatcher::Exact(s.to_owned()))
        }
    }
}

impl Display for StringMatcher {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            StringMatcher::Exact(value) => f.write_str(value),
            StringMatcher::Regex(pattern) => f.write_str(pattern.as_str()),
            StringMatcher::Glob(pattern) => {
                // Recover the original glob from the compiled anchored regex.
                let source = pattern
                    .as_str()
                    .trim_start_matches('^')
                    .trim_end_matches('$')
                    .replace(".*", "*");
                f.write_str(&source)
            }
        }
    }
}

impl PartialEq for StringMatcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (StringMatcher::Exact(a), StringMatcher::Exact(b)) => a == b,
            (StringMatcher::Glob(a), StringMatcher::Glob(b))
            | (StringMatcher::Regex(a), StringMatcher::Regex(b)) => a.as_str() == b.as_str(),
            _ => false,
        }
    }
}

impl Eq for StringMatcher {}

impl Hash for StringMatcher {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            StringMatcher::Exact(value) => value.hash(state),
            StringMatcher::Glob(pattern) | StringMatcher::Regex(pattern) => {
                pattern.as_str().hash(state);
            }
        }
    }
}

impl Serialize for StringMatcher {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for StringMatcher {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = std::borrow::Cow::<str>::deserialize(deserializer)?;
        source.parse().map_err(serde::de::Error::custom)
    }
}
