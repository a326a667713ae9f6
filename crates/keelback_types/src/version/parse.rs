use std::{num::ParseIntError, str::FromStr};

use nom::{
    bytes::complete::take_while1,
    character::complete::{char, digit1, one_of},
    combinator::opt,
    error::{ErrorKind, ParseError},
    sequence::terminated,
    IResult, Parser,
};
use smallvec::{smallvec, SmallVec};
use thiserror::Error;

use super::{Component, Segment, StrictVersion, Version};

/// An error that occurred while parsing a version string.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("malformed version string '{version}': {kind}")]
pub struct ParseVersionError {
    /// The string that failed to parse.
    pub version: String,

    /// The reason parsing failed.
    pub kind: ParseVersionErrorKind,
}

/// The reason a version string failed to parse.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseVersionErrorKind {
    /// The input was empty.
    #[error("empty string")]
    Empty,

    /// The epoch did not fit an integer.
    #[error("epoch is not a number")]
    EpochMustBeInteger(ParseIntError),

    /// A numeral did not fit an integer.
    #[error("invalid number")]
    InvalidNumeral(ParseIntError),

    /// A segment was expected but not found.
    #[error("expected a version component e.g. `2` or `rc`")]
    ExpectedComponent,

    /// Both dashes and underscores were used as separators.
    #[error("cannot use both underscores and dashes as version separators")]
    MixedSeparators,

    /// Trailing characters remained after the version.
    #[error("encountered more characters but expected none")]
    ExpectedEof,

    /// An unclassified parser error.
    #[error("{0:?}")]
    Nom(ErrorKind),
}

impl<'i> ParseError<&'i str> for ParseVersionErrorKind {
    fn from_error_kind(_: &'i str, kind: ErrorKind) -> Self {
        ParseVersionErrorKind::Nom(kind)
    }

    fn append(_: &'i str, _: ErrorKind, other: Self) -> Self {
        other
    }
}

/// Parses the `N!` epoch prefix.
fn epoch(input: &str) -> IResult<&str, u64, ParseVersionErrorKind> {
    let (rest, digits) = terminated(digit1, char('!')).parse(input)?;
    let epoch = digits
        .parse()
        .map_err(|e| nom::Err::Failure(ParseVersionErrorKind::EpochMustBeInteger(e)))?;
    Ok((rest, epoch))
}

/// Parses a single numeral or literal run.
fn component(input: &str) -> IResult<&str, Component, ParseVersionErrorKind> {
    if let Ok((rest, digits)) = digit1::<_, (&str, ErrorKind)>(input) {
        return match digits.parse() {
            Ok(n) => Ok((rest, Component::Numeral(n))),
            Err(e) => Err(nom::Err::Failure(ParseVersionErrorKind::InvalidNumeral(e))),
        };
    }

    let (rest, alpha) =
        take_while1::<_, _, ParseVersionErrorKind>(|c: char| c.is_ascii_alphabetic())
            .parse(input)
            .map_err(|err| err.map(|_| ParseVersionErrorKind::ExpectedComponent))?;

    let component = match alpha.to_ascii_lowercase().as_str() {
        "post" => Component::Post,
        "dev" => Component::Dev,
        lower => Component::Literal(lower.into()),
    };
    Ok((rest, component))
}

/// Parses one segment: a run of components, prefixed with an implicit zero
/// when it does not start with a numeral.
fn segment(input: &str) -> IResult<&str, Segment, ParseVersionErrorKind> {
    let (mut rest, first) = component(input)?;
    let implicit_zero = first.as_number().is_none();
    let mut components: SmallVec<[Component; 2]> = if implicit_zero {
        smallvec![Component::default(), first]
    } else {
        smallvec![first]
    };

    while let (remaining, Some(next)) = opt(component).parse(rest)? {
        components.push(next);
        rest = remaining;
    }

    Ok((
        rest,
        Segment {
            components,
            implicit_zero,
        },
    ))
}

/// Tracks which of `-`/`_` has been seen so the two are never mixed.
fn note_separator(
    seen: &mut Option<char>,
    separator: char,
) -> Result<(), nom::Err<ParseVersionErrorKind>> {
    match (separator, *seen) {
        ('.', _) => {}
        (c, None) => *seen = Some(c),
        (c, Some(previous)) if c != previous => {
            return Err(nom::Err::Failure(ParseVersionErrorKind::MixedSeparators))
        }
        _ => {}
    }
    Ok(())
}

/// Parses a full dotted part (the release part or the local part): segments
/// joined by `.`/`-`/`_`, with a possible run of trailing dashes or
/// underscores that becomes a literal component (the openssl `1.0.1_`
/// convention).
fn version_part<'i>(
    input: &'i str,
    dash_or_underscore: &mut Option<char>,
) -> IResult<&'i str, Vec<Segment>, ParseVersionErrorKind> {
    let mut segments = Vec::new();
    let (mut rest, first) = segment(input)?;
    segments.push(first);

    loop {
        let Ok((after_sep, separator)) = one_of::<_, _, (&str, ErrorKind)>(".-_").parse(rest)
        else {
            break;
        };
        if separator != '.' {
            // A dash or underscore is either a separator or, when no segment
            // follows, a trailing component.
            if let Ok((after_run, run)) = trailing_run(rest, dash_or_underscore) {
                let last = segments.last_mut().expect("at least one segment parsed");
                last.components.push(run);
                return Ok((after_run, segments));
            }
        }
        note_separator(dash_or_underscore, separator)?;

        match segment(after_sep) {
            Ok((remaining, next)) => {
                segments.push(next);
                rest = remaining;
            }
            Err(nom::Err::Error(_)) if separator == '.' => {
                // `1.-` style: a dot followed only by a trailing run.
                let (after_run, run) = trailing_run(after_sep, dash_or_underscore)
                    .map_err(|_| nom::Err::Error(ParseVersionErrorKind::ExpectedComponent))?;
                segments.push(Segment {
                    components: smallvec![Component::default(), run],
                    implicit_zero: true,
                });
                return Ok((after_run, segments));
            }
            Err(e) => return Err(e),
        }
    }

    Ok((rest, segments))
}

/// Parses a run of `-` or `_` that is followed by the end of the current part
/// (end of input or the `+` that introduces the local version). The run is
/// normalized to underscores since dashes and underscores are
/// interchangeable as literal suffixes.
fn trailing_run<'i>(
    input: &'i str,
    dash_or_underscore: &mut Option<char>,
) -> Result<(&'i str, Component), nom::Err<ParseVersionErrorKind>> {
    let run_len = input.chars().take_while(|&c| c == '-' || c == '_').count();
    if run_len == 0 {
        return Err(nom::Err::Error(ParseVersionErrorKind::ExpectedComponent));
    }
    let rest = &input[run_len..];
    if !rest.is_empty() && !rest.starts_with('+') {
        return Err(nom::Err::Error(ParseVersionErrorKind::ExpectedComponent));
    }
    for c in input[..run_len].chars() {
        note_separator(dash_or_underscore, c)?;
    }
    Ok((rest, Component::Literal("_".repeat(run_len).into())))
}

pub(crate) fn version(input: &str) -> IResult<&str, Version, ParseVersionErrorKind> {
    if input.is_empty() {
        return Err(nom::Err::Error(ParseVersionErrorKind::Empty));
    }

    let mut dash_or_underscore = None;
    let (rest, parsed_epoch) = opt(epoch).parse(input)?;
    let (rest, segments) = version_part(rest, &mut dash_or_underscore)?;

    let (rest, local) = if let Some(local_part) = rest.strip_prefix('+') {
        version_part(local_part, &mut dash_or_underscore)?
    } else {
        (rest, Vec::new())
    };

    Ok((
        rest,
        Version::from_parts(
            input[..input.len() - rest.len()].to_ascii_lowercase().into(),
            parsed_epoch,
            segments,
            local,
        ),
    ))
}

impl FromStr for Version {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        match version(trimmed) {
            Ok(("", version)) => Ok(version),
            Ok(_) => Err(ParseVersionError {
                version: s.to_owned(),
                kind: ParseVersionErrorKind::ExpectedEof,
            }),
            Err(nom::Err::Error(kind) | nom::Err::Failure(kind)) => Err(ParseVersionError {
                version: s.to_owned(),
                kind,
            }),
            Err(nom::Err::Incomplete(_)) => unreachable!("only complete parsers are used"),
        }
    }
}

impl FromStr for StrictVersion {
    type Err = ParseVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(StrictVersion(Version::from_str(s)?))
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use assert_matches::assert_matches;

    use super::{ParseVersionErrorKind, Version};

    #[test]
    fn glob_suffix_is_not_consumed() {
        let (rest, version) = super::version("1.2.*").unwrap();
        assert_eq!(rest, ".*");
        assert_eq!(version, Version::from_str("1.2").unwrap());
    }

    #[test]
    fn accepts_the_awkward_corners() {
        for ok in [
            "1!1.2a.3-rc1",
            "1+2",
            "1-2-3",
            "1.0.1_",
            "1.0.1-",
            "1.0.1post.za",
            "1_",
            "1_2_3",
            "1_2_3_",
            "1__",
            "1--",
            "1.-",
        ] {
            let version = Version::from_str(ok).unwrap_or_else(|e| panic!("{e}"));
            assert_eq!(version.to_string(), ok.to_ascii_lowercase());
        }
    }

    #[test]
    fn rejects_garbage() {
        for bad in [
            "", "$", ".", "1!", "1+", "1+$", "1+.", "1@2", "1-_", "1_-", "1-2-3_",
        ] {
            assert!(Version::from_str(bad).is_err(), "{bad} should not parse");
        }
    }

    #[test]
    fn mixed_separators_are_an_error() {
        assert_matches!(
            Version::from_str("1-2_3").unwrap_err().kind,
            ParseVersionErrorKind::MixedSeparators
        );
    }

    #[test]
    fn epoch_requires_integer() {
        assert_matches!(
            Version::from_str("99999999999999999999999999!1").unwrap_err().kind,
            ParseVersionErrorKind::EpochMustBeInteger(_)
        );
    }

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!(
            Version::from_str("1.0.1RC").unwrap(),
            Version::from_str("1.0.1rc").unwrap()
        );
    }
}
