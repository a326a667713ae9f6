//! Property tests for the ordering and parsing invariants.

use std::{cmp::Ordering, str::FromStr};

use keelback_types::{MatchSpec, ParseStrictness, Version};
use proptest::prelude::*;

/// A strategy producing syntactically valid conda version strings covering
/// epochs, literal runs, dev/post markers, and local parts.
fn version_strategy() -> impl Strategy<Value = String> {
    let segment = prop_oneof![
        (0u64..1000).prop_map(|n| n.to_string()),
        (0u64..100, "[a-z]{1,3}").prop_map(|(n, s)| format!("{n}{s}")),
        (0u64..100, prop_oneof![Just("dev"), Just("post")], 0u64..10)
            .prop_map(|(n, tag, m)| format!("{n}{tag}{m}")),
        "[a-z]{1,4}".prop_map(|s| s),
    ];
    let release = prop::collection::vec(segment, 1..5).prop_map(|segments| segments.join("."));
    let epoch = prop_oneof![Just(String::new()), (1u64..3).prop_map(|e| format!("{e}!"))];
    let local = prop_oneof![
        4 => Just(String::new()),
        1 => "[0-9a-z]{1,4}".prop_map(|l| format!("+{l}")),
    ];
    (epoch, release, local).prop_map(|(epoch, release, local)| format!("{epoch}{release}{local}"))
}

proptest! {
    /// Parsing never panics and the display form reparses to an equal value.
    #[test]
    fn version_display_round_trips(source in version_strategy()) {
        let version = Version::from_str(&source).unwrap();
        let reparsed = Version::from_str(&version.to_string()).unwrap();
        prop_assert_eq!(&version, &reparsed);
    }

    /// The version comparison is antisymmetric and consistent with equality.
    #[test]
    fn version_order_is_antisymmetric(a in version_strategy(), b in version_strategy()) {
        let va = Version::from_str(&a).unwrap();
        let vb = Version::from_str(&b).unwrap();
        match va.cmp(&vb) {
            Ordering::Less => prop_assert_eq!(vb.cmp(&va), Ordering::Greater),
            Ordering::Greater => prop_assert_eq!(vb.cmp(&va), Ordering::Less),
            Ordering::Equal => {
                prop_assert_eq!(vb.cmp(&va), Ordering::Equal);
                prop_assert_eq!(&va, &vb);
            }
        }
    }

    /// The version comparison is transitive.
    #[test]
    fn version_order_is_transitive(
        a in version_strategy(),
        b in version_strategy(),
        c in version_strategy(),
    ) {
        let mut versions = [
            Version::from_str(&a).unwrap(),
            Version::from_str(&b).unwrap(),
            Version::from_str(&c).unwrap(),
        ];
        versions.sort();
        prop_assert!(versions[0] <= versions[1]);
        prop_assert!(versions[1] <= versions[2]);
        prop_assert!(versions[0] <= versions[2]);
    }

    /// Equal versions hash identically.
    #[test]
    fn version_hash_respects_equality(a in version_strategy()) {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};

        let version = Version::from_str(&a).unwrap();
        // Appending `.0` never changes the value.
        let padded = Version::from_str(&format!("{a}.0")).unwrap();
        prop_assert_eq!(&version, &padded);

        let hash = |v: &Version| {
            let mut hasher = DefaultHasher::new();
            v.hash(&mut hasher);
            hasher.finish()
        };
        prop_assert_eq!(hash(&version), hash(&padded));
    }
}

/// A strategy producing canonical match spec strings.
fn match_spec_strategy() -> impl Strategy<Value = String> {
    let name = "[a-z][a-z0-9_-]{0,8}";
    let version = prop_oneof![
        Just(String::new()),
        (0u64..100, 0u64..100).prop_map(|(a, b)| format!(" >={a}.{b}")),
        (0u64..100, 0u64..100).prop_map(|(a, b)| format!(" >={a}.{b},<{}", a + 1)),
        (0u64..100, 0u64..100).prop_map(|(a, b)| format!(" {a}.{b}.*")),
        (0u64..100, 0u64..100).prop_map(|(a, b)| format!(" =={a}.{b}")),
    ];
    (name, version).prop_map(|(name, version)| format!("{name}{version}"))
}

proptest! {
    /// A canonical spec survives a parse/display/parse cycle untouched.
    #[test]
    fn match_spec_round_trips(source in match_spec_strategy()) {
        let spec = MatchSpec::from_str(&source, ParseStrictness::Strict).unwrap();
        let displayed = spec.to_string();
        prop_assert_eq!(&displayed, &source);
        let reparsed = MatchSpec::from_str(&displayed, ParseStrictness::Strict).unwrap();
        prop_assert_eq!(spec, reparsed);
    }
}
