use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::{PackageName, PackageRecord, Platform, Version};

/// A virtual package: a synthetic record describing a capability of the host
/// system (`__linux`, `__glibc`, ...). Virtual packages participate in
/// dependency resolution as constraints but are never fetched or linked.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct GenericVirtualPackage {
    /// The name of the package; always starts with `__`.
    pub name: PackageName,

    /// The detected version of the capability.
    pub version: Version,

    /// The build string, used by some packages to carry extra detail (e.g.
    /// the CPU microarchitecture name for `__archspec`).
    pub build_string: String,
}

impl GenericVirtualPackage {
    /// Converts the virtual package into a full record so it can enter the
    /// package index alongside real candidates.
    pub fn into_package_record(self) -> PackageRecord {
        let mut record =
            PackageRecord::new(self.name, self.version, self.build_string);
        record.subdir = Platform::current().to_string();
        record
    }
}

impl Display for GenericVirtualPackage {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}={}", &self.name, &self.version, &self.build_string)
    }
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use super::GenericVirtualPackage;
    use crate::{PackageName, Version};

    #[test]
    fn display_and_record_conversion() {
        let vpkg = GenericVirtualPackage {
            name: PackageName::new_unchecked("__glibc"),
            version: Version::from_str("2.36").unwrap(),
            build_string: "0".to_owned(),
        };
        assert_eq!(vpkg.to_string(), "__glibc=2.36=0");

        let record = vpkg.into_package_record();
        assert!(record.name.is_virtual());
        assert_eq!(record.version, Version::from_str("2.36").unwrap());
    }
}
