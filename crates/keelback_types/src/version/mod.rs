//! The conda version ordering.
//!
//! Version strings are compared under a total order that follows conda's
//! `VersionOrder` semantics: strings are split into dot/underscore separated
//! segments, each segment into alternating runs of numerals and literals,
//! comparison is case-insensitive, `dev` sorts below everything, `post` above
//! everything, plain literals sort below numbers, and missing trailing
//! segments are filled with zeros so that `1.1 == 1.1.0`. An optional epoch
//! (`2!1.0`) dominates the comparison and an optional local part (`1.0+3`)
//! breaks ties between otherwise equal versions.

mod parse;

use std::{
    cmp::Ordering,
    fmt,
    fmt::{Debug, Display, Formatter},
    hash::{Hash, Hasher},
};

use itertools::{EitherOrBoth, Itertools};
pub use parse::{ParseVersionError, ParseVersionErrorKind};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

/// A single run within a version segment. A segment like `beta15` consists of
/// the components `[0, "beta", 15]`: segments always start with an implicit
/// numeral so numerals and literals stay in phase across versions.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub(crate) enum Component {
    /// A numeric run, compared numerically. Numbers order above literals.
    Numeral(u64),

    /// The literal `post`; orders above everything else in its position.
    Post,

    /// The literal `dev`; orders below everything else in its position.
    Dev,

    /// Any other lowercase literal run, compared lexicographically.
    Literal(Box<str>),
}

impl Component {
    pub(crate) fn as_number(&self) -> Option<u64> {
        match self {
            Component::Numeral(n) => Some(*n),
            _ => None,
        }
    }

    fn is_zero(&self) -> bool {
        matches!(self, Component::Numeral(0))
    }
}

impl Default for Component {
    fn default() -> Self {
        Component::Numeral(0)
    }
}

impl Ord for Component {
    fn cmp(&self, other: &Self) -> Ordering {
        use Component::{Dev, Literal, Numeral, Post};
        match (self, other) {
            (Post, Post) | (Dev, Dev) => Ordering::Equal,
            (Post, _) => Ordering::Greater,
            (_, Post) => Ordering::Less,
            (Dev, _) => Ordering::Less,
            (_, Dev) => Ordering::Greater,
            (Numeral(a), Numeral(b)) => a.cmp(b),
            (Numeral(_), Literal(_)) => Ordering::Greater,
            (Literal(_), Numeral(_)) => Ordering::Less,
            (Literal(a), Literal(b)) => a.cmp(b),
        }
    }
}

impl PartialOrd for Component {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for Component {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Component::Numeral(n) => write!(f, "{n}"),
            Component::Post => write!(f, "post"),
            Component::Dev => write!(f, "dev"),
            Component::Literal(s) => write!(f, "{s}"),
        }
    }
}

/// One dot-separated segment of a version. The `implicit_zero` flag records
/// whether the leading numeral was inserted by the parser (`rc` parses as
/// `[0, rc]`) so the canonical form can leave it out again.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub(crate) struct Segment {
    pub(crate) components: SmallVec<[Component; 2]>,
    pub(crate) implicit_zero: bool,
}

impl Segment {
    fn canonical(&self) -> String {
        let components = if self.implicit_zero {
            &self.components[1..]
        } else {
            &self.components[..]
        };
        components.iter().join("")
    }
}

/// A conda package version. See the [module documentation](self) for ordering
/// semantics.
#[derive(Clone, Eq)]
pub struct Version {
    /// The trimmed, lowercased source string; used for display.
    norm: Box<str>,

    /// The epoch, when one was written. An absent epoch compares as `0`.
    epoch: Option<u64>,

    /// Segments of the release part.
    segments: Vec<Segment>,

    /// Segments of the local part (behind `+`), empty when absent.
    local: Vec<Segment>,
}

impl Version {
    /// Returns the epoch of the version, `0` when none was specified.
    pub fn epoch(&self) -> u64 {
        self.epoch.unwrap_or(0)
    }

    /// Returns the epoch of the version or `None` when none was specified.
    pub fn epoch_opt(&self) -> Option<u64> {
        self.epoch
    }

    /// Returns true if the version carries a local part (`1.2+local`).
    pub fn has_local(&self) -> bool {
        !self.local.is_empty()
    }

    /// Returns true if any segment contains the `dev` literal.
    pub fn is_dev(&self) -> bool {
        self.segments
            .iter()
            .flat_map(|segment| segment.components.iter())
            .any(|component| matches!(component, Component::Dev))
    }

    /// Constructs a version consisting of a single major number, e.g. for
    /// synthesized virtual packages.
    pub fn major(major: u64) -> Self {
        Version {
            norm: major.to_string().into_boxed_str(),
            epoch: None,
            segments: vec![Segment {
                components: smallvec::smallvec![Component::Numeral(major)],
                implicit_zero: false,
            }],
            local: Vec::new(),
        }
    }

    /// Tries to extract `(major, minor)` from the first two segments. Returns
    /// `None` when either segment is not a plain number.
    pub fn as_major_minor(&self) -> Option<(u64, u64)> {
        let mut segments = self.segments.iter();
        let major = segments.next()?;
        let minor = segments.next()?;
        if major.components.len() == 1 && minor.components.len() == 1 {
            Some((
                major.components[0].as_number()?,
                minor.components[0].as_number()?,
            ))
        } else {
            None
        }
    }

    /// Returns true when this version starts with all segments of `other`,
    /// the semantics of the `=1.2` / `1.2.*` style prefix match.
    pub fn starts_with(&self, other: &Self) -> bool {
        self.epoch() == other.epoch()
            && segments_start_with(&self.segments, &other.segments)
            && segments_start_with(&self.local, &other.local)
    }

    /// Returns true when this version is a compatible release of `other`
    /// (`~=` semantics): at least `other`, and matching every segment of
    /// `other` except its last.
    pub fn compatible_with(&self, other: &Self) -> bool {
        let prefix_len = other.segments.len().saturating_sub(1);
        self >= other
            && self.epoch() == other.epoch()
            && segments_start_with(&self.segments, &other.segments[..prefix_len])
            && segments_start_with(&self.local, &other.local)
    }

    /// Returns a copy of this version with its last numeric component
    /// incremented, useful to construct exclusive upper bounds.
    pub fn bump(&self) -> Self {
        let mut bumped = self.clone();
        let last_numeral = bumped
            .segments
            .iter_mut()
            .rev()
            .flat_map(|segment| segment.components.iter_mut().rev())
            .find_map(|component| match component {
                Component::Numeral(n) => Some(n),
                _ => None,
            });

        match last_numeral {
            Some(n) => *n += 1,
            // A version without any numeral in the release part can only gain
            // precedence through the epoch.
            None => bumped.epoch = Some(bumped.epoch() + 1),
        }
        bumped.norm = bumped.canonical().into_boxed_str();
        bumped
    }

    /// The canonical dotted representation: epoch, segments joined by dots,
    /// local part behind `+`.
    pub fn canonical(&self) -> String {
        let mut out = String::new();
        if let Some(epoch) = self.epoch {
            out.push_str(&format!("{epoch}!"));
        }
        out.push_str(&self.segments.iter().map(Segment::canonical).join("."));
        if !self.local.is_empty() {
            out.push('+');
            out.push_str(&self.local.iter().map(Segment::canonical).join("."));
        }
        out
    }

    pub(crate) fn from_parts(
        norm: Box<str>,
        epoch: Option<u64>,
        segments: Vec<Segment>,
        local: Vec<Segment>,
    ) -> Self {
        Version {
            norm,
            epoch,
            segments,
            local,
        }
    }
}

/// Compares two segment lists, filling the shorter side with zero components
/// so `1.1` and `1.1.0` compare equal.
fn cmp_segments(a: &[Segment], b: &[Segment]) -> Ordering {
    let default = Component::default();
    for pair in a.iter().zip_longest(b.iter()) {
        let (left, right) = match pair {
            EitherOrBoth::Both(l, r) => (l.components.as_slice(), r.components.as_slice()),
            EitherOrBoth::Left(l) => (l.components.as_slice(), [].as_slice()),
            EitherOrBoth::Right(r) => ([].as_slice(), r.components.as_slice()),
        };
        for components in left.iter().zip_longest(right.iter()) {
            let (l, r) = match components {
                EitherOrBoth::Both(l, r) => (l, r),
                EitherOrBoth::Left(l) => (l, &default),
                EitherOrBoth::Right(r) => (&default, r),
            };
            match l.cmp(r) {
                Ordering::Equal => {}
                other => return other,
            }
        }
    }
    Ordering::Equal
}

fn segments_start_with(this: &[Segment], prefix: &[Segment]) -> bool {
    // Versions have an infinite tail of zero segments, so `2.38` starts with
    // `2.38.0` but not with `2.38.0.1`.
    let default = Component::default();
    for pair in this.iter().zip_longest(prefix.iter()) {
        let (left, right) = match pair {
            EitherOrBoth::Both(l, r) => (l.components.as_slice(), r.components.as_slice()),
            EitherOrBoth::Left(_) => return true,
            EitherOrBoth::Right(r) => ([].as_slice(), r.components.as_slice()),
        };
        for components in left.iter().zip_longest(right.iter()) {
            match components {
                EitherOrBoth::Both(l, r) if l == r => {}
                EitherOrBoth::Both(_, _) => return false,
                EitherOrBoth::Left(_) => break,
                EitherOrBoth::Right(r) if *r == default => {}
                EitherOrBoth::Right(_) => return false,
            }
        }
    }
    true
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.epoch()
            .cmp(&other.epoch())
            .then_with(|| cmp_segments(&self.segments, &other.segments))
            .then_with(|| cmp_segments(&self.local, &other.local))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Hash for Version {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Trailing zero components never influence the comparison, so they
        // must not influence the hash either: `1.1` and `1.1.0` are equal.
        fn hash_segments<H: Hasher>(state: &mut H, segments: &[Segment]) {
            for segment in segments {
                let trailing_zeros = segment
                    .components
                    .iter()
                    .rev()
                    .take_while(|c| c.is_zero())
                    .count();
                let significant = segment.components.len() - trailing_zeros;
                for component in &segment.components[..significant] {
                    component.hash(state);
                }
            }
        }

        self.epoch().hash(state);
        hash_segments(state, &self.segments);
        hash_segments(state, &self.local);
    }
}

impl Display for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.norm)
    }
}

impl Debug for Version {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let format = |segments: &[Segment]| {
            format!(
                "[{}]",
                segments
                    .iter()
                    .format_with(", ", |s, f| f(&format_args!(
                        "[{}]",
                        s.components.iter().format(", ")
                    )))
            )
        };
        f.debug_struct("Version")
            .field("norm", &self.norm)
            .field("epoch", &self.epoch())
            .field("segments", &format(&self.segments))
            .field("local", &format(&self.local))
            .finish()
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.norm)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = std::borrow::Cow::<str>::deserialize(deserializer)?;
        source.parse().map_err(serde::de::Error::custom)
    }
}

/// A [`Version`] whose equality also considers the source representation.
///
/// Under the normal ordering `1.1` and `1.1.0` are equal, but a `=1.1.0`
/// prefix constraint matches a different set of versions than `=1.1`. Specs
/// that need to distinguish the written form wrap their version in this type.
#[derive(Debug, Clone, Eq)]
pub struct StrictVersion(pub Version);

impl PartialEq for StrictVersion {
    fn eq(&self, other: &Self) -> bool {
        self.0.segments.len() == other.0.segments.len() && self.0 == other.0
    }
}

impl Hash for StrictVersion {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
        self.0.segments.len().hash(state);
    }
}

impl Ord for StrictVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0
            .cmp(&other.0)
            .then_with(|| self.0.norm.cmp(&other.0.norm))
    }
}

impl PartialOrd for StrictVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for StrictVersion {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}
