use std::str::FromStr;

use nom::{
    branch::alt,
    bytes::complete::{tag, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, opt},
    error::{ErrorKind, ParseError},
    multi::separated_list1,
    sequence::preceded,
    IResult, Parser,
};
use thiserror::Error;

use super::{CompareOp, GroupOp, PrefixOp, VersionSpec};
use crate::{version::StrictVersion, ParseStrictness, ParseVersionError, Version};

/// An error that occurred while parsing a version spec.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionSpecError {
    /// A bound inside the spec is not a valid version.
    #[error("invalid version: {0}")]
    InvalidVersion(#[from] ParseVersionError),

    /// Parentheses are unbalanced or a group is malformed.
    #[error("invalid constraint group: {0}")]
    InvalidGroup(String),

    /// A `,` or `|` with nothing on one side.
    #[error("expected a version constraint")]
    EmptyTerm,

    /// A glob appeared somewhere other than the tail of the version.
    #[error("glob patterns are only supported at the end of a version: '{0}'")]
    EmbeddedGlob(String),

    /// The operator cannot be combined with a glob (e.g. `>*`).
    #[error("cannot combine a glob version with the '{operator}' operator")]
    GlobIncompatibleWithOperator {
        /// The offending operator.
        operator: String,
    },

    /// The construct parses leniently but is rejected in strict mode.
    #[error("'{0}' is only accepted by the lenient parser")]
    RequiresLenientParsing(String),
}

impl<'i> ParseError<&'i str> for ParseVersionSpecError {
    fn from_error_kind(_: &'i str, kind: ErrorKind) -> Self {
        ParseVersionSpecError::InvalidGroup(format!("{kind:?}"))
    }

    fn append(_: &'i str, _: ErrorKind, other: Self) -> Self {
        other
    }
}

/// Parses a full spec string: `|` groups of `,` groups of constraints, with
/// parentheses. `,` binds tighter than `|`.
pub(super) fn parse_version_spec(
    source: &str,
    strictness: ParseStrictness,
) -> Result<VersionSpec, ParseVersionSpecError> {
    match spec_tree(source.trim(), strictness) {
        Ok((rest, spec)) if rest.trim().is_empty() => Ok(spec),
        Ok((rest, _)) => {
            // The tree parser backtracks out of separators with a missing
            // operand and out of unbalanced closers; classify the leftover.
            let rest = rest.trim_start();
            if rest.starts_with([',', '|']) {
                Err(ParseVersionSpecError::EmptyTerm)
            } else if rest.starts_with(')') {
                Err(ParseVersionSpecError::InvalidGroup(
                    "unbalanced closing parenthesis".to_owned(),
                ))
            } else {
                Err(ParseVersionSpecError::InvalidGroup(format!(
                    "unexpected trailing input: '{rest}'"
                )))
            }
        }
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(e),
        Err(nom::Err::Incomplete(_)) => unreachable!("only complete parsers are used"),
    }
}

/// `spec := and_group ('|' and_group)*`
fn spec_tree(
    input: &str,
    strictness: ParseStrictness,
) -> IResult<&str, VersionSpec, ParseVersionSpecError> {
    map(
        separated_list1(separator('|'), |i| and_group(i, strictness)),
        |terms| collapse(GroupOp::Any, terms),
    )
    .parse(input)
}

/// `and_group := term (',' term)*`
fn and_group(
    input: &str,
    strictness: ParseStrictness,
) -> IResult<&str, VersionSpec, ParseVersionSpecError> {
    map(
        separated_list1(separator(','), |i| term(i, strictness)),
        |terms| collapse(GroupOp::All, terms),
    )
    .parse(input)
}

/// `term := '(' spec ')' | constraint`
fn term(
    input: &str,
    strictness: ParseStrictness,
) -> IResult<&str, VersionSpec, ParseVersionSpecError> {
    alt((
        |i| parenthesized(i, strictness),
        |i| constraint_term(i, strictness),
    ))
    .parse(input)
}

/// A parenthesized sub-tree. A missing closer is a hard failure: once the
/// opening parenthesis matched, no other interpretation of the input exists.
fn parenthesized(
    input: &str,
    strictness: ParseStrictness,
) -> IResult<&str, VersionSpec, ParseVersionSpecError> {
    let (rest, _) = preceded(multispace0, char('(')).parse(input)?;
    let (rest, spec) = spec_tree(rest, strictness)?;
    match preceded(multispace0::<&str, ParseVersionSpecError>, char(')')).parse(rest) {
        Ok((rest, _)) => Ok((rest, spec)),
        Err(_) => Err(nom::Err::Failure(ParseVersionSpecError::InvalidGroup(
            "missing closing parenthesis".to_owned(),
        ))),
    }
}

/// A single constraint: the run of characters up to the next structural
/// token, handed to the constraint grammar. Constraint errors are failures;
/// they must not make the list parsers silently stop early.
fn constraint_term(
    input: &str,
    strictness: ParseStrictness,
) -> IResult<&str, VersionSpec, ParseVersionSpecError> {
    let (rest, text) = preceded(
        multispace0,
        take_while1(|c: char| !matches!(c, ',' | '|' | '(' | ')')),
    )
    .parse(input)
    .map_err(|err: nom::Err<ParseVersionSpecError>| {
        err.map(|_| ParseVersionSpecError::EmptyTerm)
    })?;

    let text = text.trim();
    if text.is_empty() {
        return Err(nom::Err::Error(ParseVersionSpecError::EmptyTerm));
    }
    match parse_constraint(text, strictness) {
        Ok(spec) => Ok((rest, spec)),
        Err(e) => Err(nom::Err::Failure(e)),
    }
}

/// A `,` or `|` separator, tolerating whitespace before it.
fn separator<'i>(
    token: char,
) -> impl Parser<&'i str, Output = char, Error = ParseVersionSpecError> {
    preceded(multispace0, char(token))
}

fn collapse(op: GroupOp, mut terms: Vec<VersionSpec>) -> VersionSpec {
    if terms.len() == 1 {
        terms.pop().expect("length checked")
    } else {
        VersionSpec::Group(op, terms)
    }
}

/// The comparison operator prefix of a constraint; longest first so `>=`
/// never parses as `>`.
fn operator(input: &str) -> IResult<&str, &str, ParseVersionSpecError> {
    alt((
        tag("=="),
        tag("!="),
        tag("<="),
        tag(">="),
        tag("~="),
        tag("<"),
        tag(">"),
        tag("="),
    ))
    .parse(input)
}

/// Splits a trailing glob off a version literal. Returns the version core and
/// whether a glob was present; `fixed_up` notes constructs only the lenient
/// parser accepts (double globs, trailing dots).
struct GlobSplit<'a> {
    core: &'a str,
    has_glob: bool,
    fixed_up: bool,
}

fn split_glob(input: &str) -> Result<GlobSplit<'_>, ParseVersionSpecError> {
    let mut core = input;
    let mut globs = 0usize;
    let mut fixed_up = false;

    loop {
        if let Some(rest) = core.strip_suffix(".*") {
            core = rest;
            globs += 1;
        } else if let Some(rest) = core.strip_suffix('*') {
            core = rest;
            globs += 1;
        } else if core.ends_with('.') && input.contains('*') && globs == 0 {
            // `0.2.18.*.` style artifact: a dot after the glob.
            core = &core[..core.len() - 1];
            fixed_up = true;
        } else {
            break;
        }
    }

    if globs > 1 {
        fixed_up = true;
    }
    if core.contains('*') {
        return Err(ParseVersionSpecError::EmbeddedGlob(input.to_owned()));
    }
    Ok(GlobSplit {
        core,
        has_glob: globs > 0,
        fixed_up,
    })
}

fn parse_version_bound(source: &str) -> Result<Version, ParseVersionSpecError> {
    Ok(Version::from_str(source)?)
}

/// Parses a single constraint term, e.g. `>=1.2`, `1.2.*`, `~=2.4`.
fn parse_constraint(
    term: &str,
    strictness: ParseStrictness,
) -> Result<VersionSpec, ParseVersionSpecError> {
    let lenient = strictness == ParseStrictness::Lenient;
    let reject_unless_lenient = |construct: &str| {
        if lenient {
            Ok(())
        } else {
            Err(ParseVersionSpecError::RequiresLenientParsing(
                construct.to_owned(),
            ))
        }
    };

    if term == "*" {
        return Ok(VersionSpec::Any);
    }

    let (rest, operator) = opt(operator)
        .parse(term)
        .map_err(|_: nom::Err<ParseVersionSpecError>| ParseVersionSpecError::EmptyTerm)?;
    let operator = operator.unwrap_or("");
    let rest = rest.trim_start();

    if rest == "*" {
        // `>=*`, `==*`, `=*`, `~=*`, `<=*` all collapse to "any version",
        // while `>*`, `<*`, and `!=*` would be contradictions or nonsense.
        return match operator {
            ">=" | "<=" | "==" | "=" | "~=" => {
                reject_unless_lenient(term)?;
                Ok(VersionSpec::Any)
            }
            _ => Err(ParseVersionSpecError::GlobIncompatibleWithOperator {
                operator: operator.to_owned(),
            }),
        };
    }

    let glob = split_glob(rest)?;
    if glob.fixed_up {
        reject_unless_lenient(term)?;
    }

    match operator {
        "" => {
            let version = parse_version_bound(glob.core)?;
            if glob.has_glob {
                Ok(VersionSpec::Prefix(
                    PrefixOp::StartsWith,
                    StrictVersion(version),
                ))
            } else {
                Ok(VersionSpec::Compare(CompareOp::Equals, version))
            }
        }
        "=" => Ok(VersionSpec::Prefix(
            PrefixOp::StartsWith,
            StrictVersion(parse_version_bound(glob.core)?),
        )),
        "==" => {
            if glob.has_glob {
                // `==1.2.*` has prefix semantics; only the lenient parser
                // accepts the mismatch between operator and glob.
                reject_unless_lenient(term)?;
                Ok(VersionSpec::Prefix(
                    PrefixOp::StartsWith,
                    StrictVersion(parse_version_bound(glob.core)?),
                ))
            } else {
                Ok(VersionSpec::Compare(
                    CompareOp::Equals,
                    parse_version_bound(glob.core)?,
                ))
            }
        }
        "!=" => {
            if glob.has_glob {
                Ok(VersionSpec::Prefix(
                    PrefixOp::NotStartsWith,
                    StrictVersion(parse_version_bound(glob.core)?),
                ))
            } else {
                Ok(VersionSpec::Compare(
                    CompareOp::NotEquals,
                    parse_version_bound(glob.core)?,
                ))
            }
        }
        "~=" => {
            if glob.has_glob {
                reject_unless_lenient(term)?;
            }
            Ok(VersionSpec::Prefix(
                PrefixOp::Compatible,
                StrictVersion(parse_version_bound(glob.core)?),
            ))
        }
        op @ (">" | ">=" | "<" | "<=") => {
            let compare = match (op, glob.has_glob) {
                (">", false) => CompareOp::Greater,
                (">=", false) => CompareOp::GreaterEquals,
                ("<", false) => CompareOp::Less,
                ("<=", false) => CompareOp::LessEquals,
                // `>2.10*` was historically written to mean `>=2.10`.
                (">" | ">=", true) => {
                    reject_unless_lenient(term)?;
                    CompareOp::GreaterEquals
                }
                ("<=", true) => {
                    reject_unless_lenient(term)?;
                    CompareOp::LessEquals
                }
                ("<", true) => {
                    return Err(ParseVersionSpecError::GlobIncompatibleWithOperator {
                        operator: op.to_owned(),
                    })
                }
                _ => unreachable!(),
            };
            Ok(VersionSpec::Compare(
                compare,
                parse_version_bound(glob.core)?,
            ))
        }
        other => Err(ParseVersionSpecError::InvalidGroup(format!(
            "unknown operator '{other}'"
        ))),
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::{parse_version_spec, ParseVersionSpecError};
    use crate::ParseStrictness::{Lenient, Strict};

    #[test]
    fn embedded_globs_are_rejected() {
        assert_matches!(
            parse_version_spec("2023.*.0", Lenient),
            Err(ParseVersionSpecError::EmbeddedGlob(_))
        );
    }

    #[test]
    fn unbalanced_parens() {
        assert_matches!(
            parse_version_spec("(>=1.2", Strict),
            Err(ParseVersionSpecError::InvalidGroup(_))
        );
        assert_matches!(
            parse_version_spec(">=1.2)", Strict),
            Err(ParseVersionSpecError::InvalidGroup(_))
        );
    }

    #[test]
    fn empty_terms() {
        assert_matches!(
            parse_version_spec(">=1.2,", Strict),
            Err(ParseVersionSpecError::EmptyTerm)
        );
        assert_matches!(
            parse_version_spec("|>=1.2", Strict),
            Err(ParseVersionSpecError::EmptyTerm)
        );
        assert_matches!(
            parse_version_spec(">=1.2,,<2", Strict),
            Err(ParseVersionSpecError::EmptyTerm)
        );
    }

    #[test]
    fn glob_operator_interactions() {
        assert_matches!(
            parse_version_spec(">*", Lenient),
            Err(ParseVersionSpecError::GlobIncompatibleWithOperator { .. })
        );
        assert_matches!(
            parse_version_spec("!=*", Lenient),
            Err(ParseVersionSpecError::GlobIncompatibleWithOperator { .. })
        );
        assert_matches!(
            parse_version_spec("==1.2.*", Strict),
            Err(ParseVersionSpecError::RequiresLenientParsing(_))
        );
        assert!(parse_version_spec("==1.2.*", Lenient).is_ok());
        assert!(parse_version_spec("!=1.2.*", Strict).is_ok());
    }

    #[test]
    fn bad_constraints_fail_instead_of_truncating() {
        // A malformed second term must not leave a silently shortened group.
        assert_matches!(
            parse_version_spec(">=1.2,<$", Strict),
            Err(ParseVersionSpecError::InvalidVersion(_))
        );
    }

    #[test]
    fn whitespace_is_tolerated_around_separators() {
        assert_eq!(
            parse_version_spec(" >=1.2 , <2.0 | >3 ", Strict).unwrap(),
            parse_version_spec(">=1.2,<2.0|>3", Strict).unwrap()
        );
    }
}
