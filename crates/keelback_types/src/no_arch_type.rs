use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// How a package is independent of the target architecture, if at all.
///
/// `noarch: python` packages ship pure-Python sources that are relocated into
/// the environment's `site-packages` at link time; `noarch: generic` packages
/// carry architecture independent data at fixed paths. Historic repodata also
/// encodes generic noarch as the boolean `true`, which this type preserves on
/// round-trip.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Ord, PartialOrd, Default)]
pub enum NoArchType {
    /// The package is specific to an architecture.
    #[default]
    None,

    /// Architecture independent data, old-style boolean encoding.
    GenericV1,

    /// Architecture independent data, new-style string encoding.
    Generic,

    /// A pure Python package relocated at install time.
    Python,
}

impl NoArchType {
    /// Returns true if this is not a noarch package at all.
    pub fn is_none(&self) -> bool {
        matches!(self, NoArchType::None)
    }

    /// Returns true for python noarch packages.
    pub fn is_python(&self) -> bool {
        matches!(self, NoArchType::Python)
    }

    /// Returns true for generic noarch packages of either encoding.
    pub fn is_generic(&self) -> bool {
        matches!(self, NoArchType::Generic | NoArchType::GenericV1)
    }
}

impl<'de> Deserialize<'de> for NoArchType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Encoded {
            Bool(bool),
            Tag(String),
        }

        match Option::<Encoded>::deserialize(deserializer)? {
            None | Some(Encoded::Bool(false)) => Ok(NoArchType::None),
            Some(Encoded::Bool(true)) => Ok(NoArchType::GenericV1),
            Some(Encoded::Tag(tag)) => match tag.as_str() {
                "generic" => Ok(NoArchType::Generic),
                "python" => Ok(NoArchType::Python),
                other => Err(serde::de::Error::custom(format_args!(
                    "invalid noarch type: {other}"
                ))),
            },
        }
    }
}

impl Serialize for NoArchType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            NoArchType::None => false.serialize(serializer),
            NoArchType::GenericV1 => true.serialize(serializer),
            NoArchType::Generic => "generic".serialize(serializer),
            NoArchType::Python => "python".serialize(serializer),
        }
    }
}

#[cfg(test)]
mod test {
    use super::NoArchType;

    #[test]
    fn round_trips_every_encoding() {
        for (json, expected) in [
            ("false", NoArchType::None),
            ("true", NoArchType::GenericV1),
            (r#""generic""#, NoArchType::Generic),
            (r#""python""#, NoArchType::Python),
        ] {
            let parsed: NoArchType = serde_json::from_str(json).unwrap();
            assert_eq!(parsed, expected);
            assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
        }
    }

    #[test]
    fn rejects_unknown_tags() {
        assert!(serde_json::from_str::<NoArchType>(r#""universal""#).is_err());
    }
}
