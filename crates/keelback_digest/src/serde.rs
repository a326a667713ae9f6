//! Serde adapters for digest outputs.
//!
//! Digests appear in repodata and prefix records as lowercase hex strings.
//! The [`HexDigest`] adapter implements `serde_with`'s `SerializeAs` /
//! `DeserializeAs` so record structs can annotate digest fields with
//! `#[serde_as(as = "Option<HexDigest<Sha256>>")]` and keep plain
//! `Output<D>` types in memory.

use std::{borrow::Cow, fmt::LowerHex, marker::PhantomData};

use digest::{Digest, Output};
use serde::{de::Error, Deserialize, Deserializer, Serialize, Serializer};
use serde_with::{DeserializeAs, SerializeAs};

/// Deserializes a digest from a lowercase hex string.
pub fn deserialize<'de, D, Dig: Digest>(deserializer: D) -> Result<Output<Dig>, D::Error>
where
    D: Deserializer<'de>,
{
    let hex_str = Cow::<'de, str>::deserialize(deserializer)?;
    super::parse_hex_digest::<Dig>(hex_str.as_ref())
        .ok_or_else(|| Error::custom(format_args!("invalid hex digest: {hex_str}")))
}

/// Serializes a digest as a lowercase hex string.
pub fn serialize<'a, S: Serializer, Dig: Digest>(
    digest: &'a Output<Dig>,
    serializer: S,
) -> Result<S::Ok, S::Error>
where
    &'a Output<Dig>: LowerHex,
{
    format!("{digest:x}").serialize(serializer)
}

/// A `serde_with` adapter that maps `Output<D>` to and from hex strings.
pub struct HexDigest<D: Digest>(PhantomData<D>);

impl<D: Digest> SerializeAs<Output<D>> for HexDigest<D>
where
    for<'a> &'a Output<D>: LowerHex,
{
    fn serialize_as<S>(source: &Output<D>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serialize::<S, D>(source, serializer)
    }
}

impl<'de, D: Digest + Default> DeserializeAs<'de, Output<D>> for HexDigest<D> {
    fn deserialize_as<De>(deserializer: De) -> Result<Output<D>, De::Error>
    where
        De: Deserializer<'de>,
    {
        deserialize::<De, D>(deserializer)
    }
}
