//! Parsing of match spec strings.

use std::str::FromStr;

use keelback_digest::parse_hex_digest;
use nom::{
    branch::alt,
    bytes::complete::{tag, take_until, take_while, take_while1},
    character::complete::{char, multispace0},
    combinator::{map, opt},
    error::{ErrorKind, ParseError},
    multi::separated_list0,
    sequence::{delimited, preceded, separated_pair, terminated},
    IResult, Parser,
};
use thiserror::Error;

use super::{MatchSpec, NameMatcher};
use crate::{
    BuildNumberSpec, InvalidPackageNameError, PackageName, ParseBuildNumberSpecError,
    ParseStrictness, ParseVersionSpecError, Platform, StringMatcher, StringMatcherParseError,
    VersionSpec,
};

/// The error returned when a match spec string cannot be parsed.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum ParseMatchSpecError {
    /// The spec string was empty.
    #[error("match spec is empty")]
    Empty,

    /// The package name is missing or invalid.
    #[error(transparent)]
    InvalidName(#[from] InvalidPackageNameError),

    /// The version part failed to parse.
    #[error("invalid version spec: {0}")]
    InvalidVersionSpec(#[from] ParseVersionSpecError),

    /// The build part failed to parse.
    #[error("invalid build matcher: {0}")]
    InvalidBuildMatcher(#[from] StringMatcherParseError),

    /// The build number part failed to parse.
    #[error("invalid build number spec: {0}")]
    InvalidBuildNumber(#[from] ParseBuildNumberSpecError),

    /// The bracket section is malformed.
    #[error("malformed bracket section: {0}")]
    MalformedBrackets(String),

    /// A bracket key is not recognized.
    #[error("unknown bracket key: '{0}'")]
    UnknownBracketKey(String),

    /// A digest value is not valid hex of the right length.
    #[error("invalid {kind} digest: '{value}'")]
    InvalidDigest {
        /// `md5` or `sha256`.
        kind: &'static str,
        /// The offending value.
        value: String,
    },

    /// More tokens than `name version build` were found.
    #[error("found more than a name, version and build in '{0}'")]
    TooManyTokens(String),
}

impl<'i> ParseError<&'i str> for ParseMatchSpecError {
    fn from_error_kind(input: &'i str, _: ErrorKind) -> Self {
        ParseMatchSpecError::MalformedBrackets(input.to_owned())
    }

    fn append(_: &'i str, _: ErrorKind, other: Self) -> Self {
        other
    }
}

impl MatchSpec {
    /// Parses a match spec from its string form.
    pub fn from_str(
        source: &str,
        strictness: ParseStrictness,
    ) -> Result<MatchSpec, ParseMatchSpecError> {
        parse_match_spec(source, strictness)
    }
}

impl FromStr for MatchSpec {
    type Err = ParseMatchSpecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MatchSpec::from_str(s, ParseStrictness::Lenient)
    }
}

fn parse_match_spec(
    source: &str,
    strictness: ParseStrictness,
) -> Result<MatchSpec, ParseMatchSpecError> {
    // Strip a trailing comment; `zlib 1.2.* # pinned by ops` is valid input.
    let source = source
        .split_once(" #")
        .map_or(source, |(spec, _)| spec)
        .trim();
    if source.is_empty() {
        return Err(ParseMatchSpecError::Empty);
    }

    match spec_parser(source, strictness) {
        Ok(("", spec)) => Ok(spec),
        Ok((rest, _)) if rest.trim_start().starts_with('[') => Err(
            ParseMatchSpecError::MalformedBrackets(rest.trim().to_owned()),
        ),
        Ok((rest, _)) => Err(ParseMatchSpecError::TooManyTokens(rest.trim().to_owned())),
        Err(nom::Err::Error(e) | nom::Err::Failure(e)) => Err(e),
        Err(nom::Err::Incomplete(_)) => unreachable!("only complete parsers are used"),
    }
}

/// `spec := (channel('/'subdir)? "::")? name version_build? brackets?`
fn spec_parser(
    input: &str,
    strictness: ParseStrictness,
) -> IResult<&str, MatchSpec, ParseMatchSpecError> {
    let mut spec = MatchSpec::default();

    // The channel prefix, when the input carries a `::` separator before
    // any bracket section (a `::` inside bracket values is not a channel).
    let has_channel = input
        .find("::")
        .is_some_and(|pos| input.find('[').is_none_or(|bracket| pos < bracket));
    let (input, channel_part) = if has_channel {
        map(terminated(take_until("::"), tag("::")), Some).parse(input)?
    } else {
        (input, None)
    };
    if let Some(channel_part) = channel_part {
        let (channel, subdir) = split_channel_subdir(channel_part.trim());
        if channel != "*" && !channel.is_empty() {
            spec.channel = Some(channel.to_owned());
        }
        spec.subdir = subdir.map(ToOwned::to_owned);
    }

    // The name: a run of name characters, globs included.
    let (input, name) = preceded(
        multispace0,
        take_while1(|c: char| {
            c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_' | '*')
        }),
    )
    .parse(input)
    .map_err(|err: nom::Err<ParseMatchSpecError>| {
        err.map(|_| {
            ParseMatchSpecError::InvalidName(InvalidPackageNameError(input.to_owned()))
        })
    })?;
    spec.name = match parse_name(name) {
        Ok(name) => name,
        Err(e) => return Err(nom::Err::Failure(e)),
    };

    // Everything up to the bracket section is the version (and build).
    let (input, version_build) =
        take_while::<_, _, ParseMatchSpecError>(|c: char| c != '[').parse(input)?;
    let version_build = version_build.trim();
    if !version_build.is_empty() {
        let (version, build) = match split_version_and_build(version_build) {
            Ok(parts) => parts,
            Err(e) => return Err(nom::Err::Failure(e)),
        };
        spec.version = Some(
            VersionSpec::from_str(&version, strictness)
                .map_err(|e| nom::Err::Failure(e.into()))?,
        );
        if let Some(build) = build {
            spec.build = Some(
                StringMatcher::from_str(&build).map_err(|e| nom::Err::Failure(e.into()))?,
            );
        }
    }

    // The bracketed key-value pairs override everything parsed so far.
    let (input, brackets) = opt(bracket_list).parse(input)?;
    if let Some(brackets) = brackets {
        if let Err(e) = apply_brackets(&mut spec, brackets, strictness) {
            return Err(nom::Err::Failure(e));
        }
    }

    Ok((input, spec))
}

fn parse_name(name: &str) -> Result<NameMatcher, ParseMatchSpecError> {
    if name.contains('*') {
        let matcher = StringMatcher::from_str(&name.to_ascii_lowercase())?;
        Ok(NameMatcher::Pattern(matcher))
    } else {
        Ok(NameMatcher::Exact(PackageName::new(name)?))
    }
}

/// Splits the channel part of a spec into channel and optional subdir. Only a
/// trailing segment that is a known platform is treated as a subdir, so
/// `conda-forge/label/dev` stays a single channel.
fn split_channel_subdir(channel_part: &str) -> (&str, Option<&str>) {
    if let Some((channel, maybe_subdir)) = channel_part.rsplit_once('/') {
        if Platform::from_str(maybe_subdir).is_ok() {
            return (channel, Some(maybe_subdir));
        }
    }
    (channel_part, None)
}

/// Splits the part after the name into version and optional build tokens.
/// Handles the `=version=build` shorthand as well as whitespace separation.
fn split_version_and_build(
    input: &str,
) -> Result<(String, Option<String>), ParseMatchSpecError> {
    // `=1.0=py37_0` — the two-equals exact shorthand. Only applies when the
    // version core carries no further operators of its own.
    if let Some(stripped) = input.strip_prefix('=') {
        let stripped = stripped.trim_start_matches('=');
        if let Some((version, build)) = stripped.split_once('=') {
            let shorthand = !version.is_empty()
                && !build.is_empty()
                && !version.contains([',', '|', '<', '>', '!', '~'])
                && !build.contains(['=', '<', '>', '!', '~', ',', '|', ' ']);
            if shorthand {
                let operators = &input[..input.len() - stripped.len()];
                return Ok((
                    format!("{operators}{version}"),
                    Some(build.to_owned()),
                ));
            }
        }
    }

    let only_operators = |token: &str| {
        token
            .chars()
            .all(|c| matches!(c, '<' | '>' | '=' | '!' | '~' | ','))
    };

    // `>= 1.0` — an operator separated from its version by whitespace
    // belongs to the following token.
    let mut merged: Vec<String> = Vec::new();
    let mut tokens = input.split_whitespace().peekable();
    while let Some(token) = tokens.next() {
        if only_operators(token) {
            if let Some(next) = tokens.next() {
                merged.push(format!("{token}{next}"));
                continue;
            }
        }
        merged.push(token.to_owned());
    }

    match merged.len() {
        0 => Err(ParseMatchSpecError::Empty),
        1 => Ok((merged.swap_remove(0), None)),
        2 => {
            let build = merged.pop().expect("len is 2");
            Ok((merged.swap_remove(0), Some(build)))
        }
        _ => Err(ParseMatchSpecError::TooManyTokens(input.to_owned())),
    }
}

type Brackets = Vec<(String, String)>;

/// `brackets := '[' (key '=' value (',' key '=' value)*)? ']'`
fn bracket_list(input: &str) -> IResult<&str, Brackets, ParseMatchSpecError> {
    delimited(
        preceded(multispace0, char('[')),
        separated_list0(preceded(multispace0, char(',')), key_value),
        preceded(multispace0, char(']')),
    )
    .parse(input)
}

/// One `key=value` pair; the key is lowercased, the value unquoted.
fn key_value(input: &str) -> IResult<&str, (String, String), ParseMatchSpecError> {
    map(
        separated_pair(
            preceded(
                multispace0,
                take_while1(|c: char| c.is_ascii_alphanumeric() || c == '_'),
            ),
            preceded(multispace0, char('=')),
            bracket_value,
        ),
        |(key, value): (&str, String)| (key.to_ascii_lowercase(), value),
    )
    .parse(input)
}

/// A bracket value: single- or double-quoted (commas allowed inside), or a
/// bare run up to the next `,` or `]`.
fn bracket_value(input: &str) -> IResult<&str, String, ParseMatchSpecError> {
    preceded(
        multispace0,
        alt((
            delimited(char('"'), take_while(|c: char| c != '"'), char('"')),
            delimited(char('\''), take_while(|c: char| c != '\''), char('\'')),
            take_while1(|c: char| !matches!(c, ',' | ']')),
        )),
    )
    .parse(input)
    .map(|(rest, value)| (rest, value.trim().to_owned()))
}

fn apply_brackets(
    spec: &mut MatchSpec,
    brackets: Brackets,
    strictness: ParseStrictness,
) -> Result<(), ParseMatchSpecError> {
    for (key, value) in brackets {
        match key.as_str() {
            "version" => spec.version = Some(VersionSpec::from_str(&value, strictness)?),
            "build" | "build_string" => spec.build = Some(StringMatcher::from_str(&value)?),
            "build_number" => spec.build_number = Some(BuildNumberSpec::from_str(&value)?),
            "channel" => spec.channel = Some(value),
            "subdir" => spec.subdir = Some(value),
            "fn" => spec.file_name = Some(value),
            "name" => spec.name = parse_name(&value)?,
            "md5" => {
                spec.md5 = Some(parse_hex_digest::<md5::Md5>(&value).ok_or(
                    ParseMatchSpecError::InvalidDigest {
                        kind: "md5",
                        value,
                    },
                )?);
            }
            "sha256" => {
                spec.sha256 = Some(parse_hex_digest::<sha2::Sha256>(&value).ok_or(
                    ParseMatchSpecError::InvalidDigest {
                        kind: "sha256",
                        value,
                    },
                )?);
            }
            "track_features" => {
                spec.track_features = Some(
                    value
                        .split([' ', ','])
                        .filter(|feature| !feature.is_empty())
                        .map(ToOwned::to_owned)
                        .collect(),
                );
            }
            other => return Err(ParseMatchSpecError::UnknownBracketKey(other.to_owned())),
        }
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use assert_matches::assert_matches;

    use super::ParseMatchSpecError;
    use crate::{
        match_spec::NameMatcher, MatchSpec, ParseStrictness, StringMatcher, VersionSpec,
    };

    fn parse(s: &str) -> MatchSpec {
        MatchSpec::from_str(s, ParseStrictness::Strict)
            .unwrap_or_else(|e| panic!("'{s}' failed to parse: {e}"))
    }

    #[test]
    fn bare_name() {
        let spec = parse("python");
        assert_eq!(spec.name.to_string(), "python");
        assert!(spec.version.is_none());
    }

    #[test]
    fn name_and_version_forms() {
        for (input, version) in [
            ("foo 1.0.*", "1.0.*"),
            ("foo ==1.0", "==1.0"),
            ("foo >=1.0", ">=1.0"),
            ("foo>=1.0", ">=1.0"),
            ("foo >= 1.0", ">=1.0"),
            ("foo >=1.5.1,<2.0", ">=1.5.1,<2.0"),
        ] {
            let spec = parse(input);
            assert_eq!(
                spec.version,
                Some(VersionSpec::from_str(version, ParseStrictness::Lenient).unwrap()),
                "{input}"
            );
        }
    }

    #[test]
    fn name_version_build() {
        let spec = parse("foo 1.0.* py27_0");
        assert_eq!(
            spec.build,
            Some(StringMatcher::from_str("py27_0").unwrap())
        );

        let globbed = parse("numpy * py39*");
        assert_eq!(globbed.build, Some(StringMatcher::from_str("py39*").unwrap()));
    }

    #[test]
    fn double_equals_shorthand() {
        let spec = parse("numpy=1.11.1=py27_0");
        assert_eq!(
            spec.version,
            Some(VersionSpec::from_str("=1.11.1", ParseStrictness::Lenient).unwrap())
        );
        assert_eq!(
            spec.build,
            Some(StringMatcher::from_str("py27_0").unwrap())
        );
    }

    #[test]
    fn channel_and_subdir() {
        let spec = parse("conda-forge::numpy >=1.20");
        assert_eq!(spec.channel.as_deref(), Some("conda-forge"));
        assert_eq!(spec.subdir, None);

        let with_subdir = parse("conda-forge/linux-64::numpy");
        assert_eq!(with_subdir.channel.as_deref(), Some("conda-forge"));
        assert_eq!(with_subdir.subdir.as_deref(), Some("linux-64"));

        // A label is part of the channel, not a subdir.
        let label = parse("conda-forge/label/dev::numpy");
        assert_eq!(label.channel.as_deref(), Some("conda-forge/label/dev"));
        assert_eq!(label.subdir, None);

        let any_channel = parse("*/linux-64::numpy");
        assert_eq!(any_channel.channel, None);
        assert_eq!(any_channel.subdir.as_deref(), Some("linux-64"));
    }

    #[test]
    fn brackets() {
        let spec = parse(r#"foo[version="1.0.*", build_number=">=2"]"#);
        assert_eq!(
            spec.version,
            Some(VersionSpec::from_str("1.0.*", ParseStrictness::Lenient).unwrap())
        );
        assert!(spec.build_number.is_some());

        // Brackets override the outer version.
        let overridden = parse(r#"foo >=1.0[version="<2.0"]"#);
        assert_eq!(
            overridden.version,
            Some(VersionSpec::from_str("<2.0", ParseStrictness::Lenient).unwrap())
        );
    }

    #[test]
    fn quoted_bracket_values_may_contain_commas() {
        let spec = parse(r#"foo[version=">=1.5.1,<2.0"]"#);
        assert_eq!(
            spec.version,
            Some(VersionSpec::from_str(">=1.5.1,<2.0", ParseStrictness::Lenient).unwrap())
        );
    }

    #[test]
    fn digest_brackets() {
        let spec = parse("foo[md5=bf7f54dd0f25c3f06ecb82a07341841a]");
        assert!(spec.md5.is_some());
        let spec = parse(
            "foo[sha256=7ed530efddd47a96c11197906b4008405b90e3bc2f4e0df722a36e0e6103fd9c]",
        );
        assert!(spec.sha256.is_some());

        assert_matches!(
            MatchSpec::from_str("foo[md5=deadbeef]", ParseStrictness::Strict),
            Err(ParseMatchSpecError::InvalidDigest { kind: "md5", .. })
        );
    }

    #[test]
    fn glob_names() {
        let spec = parse("*lib*");
        assert_matches!(spec.name, NameMatcher::Pattern(_));
    }

    #[test]
    fn comments_are_stripped() {
        let spec = parse("zlib 1.2.* # pinned for reasons");
        assert_eq!(spec.name.to_string(), "zlib");
        assert!(spec.version.is_some());
    }

    #[test]
    fn errors() {
        assert_matches!(
            MatchSpec::from_str("", ParseStrictness::Strict),
            Err(ParseMatchSpecError::Empty)
        );
        assert_matches!(
            MatchSpec::from_str("foo 1.0 py27_0 extra", ParseStrictness::Strict),
            Err(ParseMatchSpecError::TooManyTokens(_))
        );
        assert_matches!(
            MatchSpec::from_str("foo[unknown=1]", ParseStrictness::Strict),
            Err(ParseMatchSpecError::UnknownBracketKey(_))
        );
        assert_matches!(
            MatchSpec::from_str("foo[bar", ParseStrictness::Strict),
            Err(ParseMatchSpecError::MalformedBrackets(_))
        );
    }

    #[test]
    fn display_round_trip() {
        for spec in [
            "python",
            "python >=3.11",
            "python >=3.11,<3.12",
            "conda-forge::python >=3.11",
            "conda-forge/linux-64::python",
            "numpy 1.24.* py311*",
        ] {
            assert_eq!(parse(spec).to_string(), spec, "round trip of '{spec}'");
        }
    }
}
