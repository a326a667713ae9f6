use std::{collections::BTreeMap, marker::PhantomData, path::PathBuf};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

/// Conda repodata stores timestamps as integers. Old channels used seconds
/// since the epoch, newer ones use milliseconds. Any value that would place a
/// package before 1984 when interpreted as milliseconds is assumed to be in
/// seconds instead.
pub(crate) struct TimestampMillis;

const MILLIS_CUTOFF: i64 = 253_402_300_799; // 9999-12-31 in seconds

impl SerializeAs<DateTime<Utc>> for TimestampMillis {
    fn serialize_as<S>(source: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        source.timestamp_millis().serialize(serializer)
    }
}

impl<'de> DeserializeAs<'de, DateTime<Utc>> for TimestampMillis {
    fn deserialize_as<D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let stamp = i64::deserialize(deserializer)?;
        let millis = if stamp <= MILLIS_CUTOFF {
            stamp * 1000
        } else {
            stamp
        };
        Utc.timestamp_millis_opt(millis)
            .single()
            .ok_or_else(|| serde::de::Error::custom(format_args!("invalid timestamp {stamp}")))
    }
}

/// Serializes a map with its keys in alphabetical order so repodata output is
/// deterministic regardless of hash-map iteration order.
pub(crate) fn sort_map_alphabetically<K: Ord + Serialize, V: Serialize, S: Serializer>(
    value: &fxhash::FxHashMap<K, V>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    value.iter().collect::<BTreeMap<_, _>>().serialize(serializer)
}

/// Paths inside prefix records always use forward slashes, even on Windows.
pub(crate) struct NormalizedPath;

impl SerializeAs<PathBuf> for NormalizedPath {
    fn serialize_as<S>(source: &PathBuf, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        source
            .to_string_lossy()
            .replace('\\', "/")
            .serialize(serializer)
    }
}

impl<'de> DeserializeAs<'de, PathBuf> for NormalizedPath {
    fn deserialize_as<D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        String::deserialize(deserializer).map(PathBuf::from)
    }
}

/// Accepts either a single value or a sequence of values, mirroring how
/// `track_features` appears in the wild both as `"feat"` and `["feat"]`, and
/// as a space- or comma-separated string.
pub(crate) struct FeatureList<T>(PhantomData<T>);

impl<T: Serialize> SerializeAs<Vec<T>> for FeatureList<T> {
    fn serialize_as<S>(source: &Vec<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        source.serialize(serializer)
    }
}

impl<'de> DeserializeAs<'de, Vec<String>> for FeatureList<String> {
    fn deserialize_as<D>(deserializer: D) -> Result<Vec<String>, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }

        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(single) => single
                .split([' ', ','])
                .filter(|feat| !feat.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
            OneOrMany::Many(many) => many,
        })
    }
}
