#![deny(missing_docs)]

//! Detection of conda virtual packages for the host system.
//!
//! Virtual packages are synthetic records injected into the package index so
//! that real packages can constrain host capabilities: the operating system
//! (`__linux`, `__osx`, `__win`, `__unix`), the libc family (`__glibc`), an
//! available CUDA driver (`__cuda`), and the CPU microarchitecture
//! (`__archspec`). They are never downloaded or linked.
//!
//! Every detector first consults its `CONDA_OVERRIDE_*` environment
//! variable: a value overrides whatever the host reports, an empty value
//! disables the package entirely. This is how solves for foreign platforms
//! are made reproducible on CI machines.

use std::{env, str::FromStr};

use keelback_types::{GenericVirtualPackage, PackageName, ParseVersionError, Platform, Version};
use thiserror::Error;

/// The set of virtual packages this crate can detect.
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub enum VirtualPackage {
    /// Present on Windows hosts.
    Win,

    /// Present on unix hosts.
    Unix,

    /// The Linux kernel version.
    Linux(Version),

    /// The macOS version.
    Osx(Version),

    /// The glibc version on Linux hosts.
    Glibc(Version),

    /// The maximum CUDA version supported by the driver.
    Cuda(Version),

    /// The CPU microarchitecture, carried in the build string.
    Archspec(String),
}

impl From<VirtualPackage> for GenericVirtualPackage {
    fn from(package: VirtualPackage) -> Self {
        let (name, version, build_string) = match package {
            VirtualPackage::Win => ("__win", Version::major(0), "0".to_owned()),
            VirtualPackage::Unix => ("__unix", Version::major(0), "0".to_owned()),
            VirtualPackage::Linux(version) => ("__linux", version, "0".to_owned()),
            VirtualPackage::Osx(version) => ("__osx", version, "0".to_owned()),
            VirtualPackage::Glibc(version) => ("__glibc", version, "0".to_owned()),
            VirtualPackage::Cuda(version) => ("__cuda", version, "0".to_owned()),
            VirtualPackage::Archspec(arch) => ("__archspec", Version::major(1), arch),
        };
        GenericVirtualPackage {
            name: PackageName::new_unchecked(name),
            version,
            build_string,
        }
    }
}

/// An error that occurred while detecting virtual packages.
#[derive(Debug, Error)]
pub enum DetectVirtualPackageError {
    /// An override or detected value is not a valid version.
    #[error("invalid version for {package}: {source}")]
    InvalidVersion {
        /// The virtual package concerned.
        package: &'static str,
        /// The parse failure.
        #[source]
        source: ParseVersionError,
    },

    /// The host could not be probed.
    #[error("failed to probe the host: {0}")]
    Probe(#[from] std::io::Error),
}

/// Reads an override variable. `Ok(None)` means the variable is unset and
/// the host should be probed; `Ok(Some(None))` means the package is
/// explicitly disabled by an empty value.
fn override_var(
    name: &'static str,
    package: &'static str,
) -> Result<Option<Option<Version>>, DetectVirtualPackageError> {
    match env::var(name) {
        Err(_) => Ok(None),
        Ok(value) if value.trim().is_empty() => Ok(Some(None)),
        Ok(value) => {
            let version = Version::from_str(value.trim()).map_err(|source| {
                DetectVirtualPackageError::InvalidVersion { package, source }
            })?;
            Ok(Some(Some(version)))
        }
    }
}

/// Detects all virtual packages for the given platform, honoring the
/// `CONDA_OVERRIDE_*` variables.
pub fn detect_virtual_packages(
    platform: Platform,
) -> Result<Vec<VirtualPackage>, DetectVirtualPackageError> {
    let mut packages = Vec::new();

    if platform.is_unix() {
        packages.push(VirtualPackage::Unix);
    }
    if platform.is_windows() {
        packages.push(VirtualPackage::Win);
    }

    if platform.is_linux() {
        let linux = match override_var("CONDA_OVERRIDE_LINUX", "__linux")? {
            Some(overridden) => overridden,
            None => linux::kernel_version()?,
        };
        if let Some(version) = linux {
            packages.push(VirtualPackage::Linux(version));
        }

        let glibc = match override_var("CONDA_OVERRIDE_GLIBC", "__glibc")? {
            Some(overridden) => overridden,
            None => linux::glibc_version(),
        };
        if let Some(version) = glibc {
            packages.push(VirtualPackage::Glibc(version));
        }
    }

    if platform.is_osx() {
        let osx = match override_var("CONDA_OVERRIDE_OSX", "__osx")? {
            Some(overridden) => overridden,
            None => osx::product_version()?,
        };
        if let Some(version) = osx {
            packages.push(VirtualPackage::Osx(version));
        }
    }

    // CUDA is override-only: probing requires loading the driver library,
    // which is not worth the trouble for a constraint that CI environments
    // pin explicitly anyway.
    if let Some(Some(version)) = override_var("CONDA_OVERRIDE_CUDA", "__cuda")? {
        packages.push(VirtualPackage::Cuda(version));
    }

    let archspec = match env::var("CONDA_OVERRIDE_ARCHSPEC") {
        Ok(value) if value.trim().is_empty() => None,
        Ok(value) => Some(value.trim().to_owned()),
        Err(_) => archspec_for(platform),
    };
    if let Some(arch) = archspec {
        packages.push(VirtualPackage::Archspec(arch));
    }

    Ok(packages)
}

/// The baseline microarchitecture name for a platform. The host may support
/// a newer feature level, but the baseline is what packages are built for.
fn archspec_for(platform: Platform) -> Option<String> {
    match platform {
        Platform::Linux64 | Platform::Osx64 | Platform::Win64 => Some("x86_64".to_owned()),
        Platform::Linux32 | Platform::Win32 => Some("x86".to_owned()),
        Platform::LinuxAarch64 | Platform::OsxArm64 | Platform::WinArm64 => {
            Some("aarch64".to_owned())
        }
        Platform::LinuxPpc64le => Some("ppc64le".to_owned()),
        Platform::LinuxPpc64 => Some("ppc64".to_owned()),
        Platform::LinuxS390X => Some("s390x".to_owned()),
        Platform::LinuxRiscv64 => Some("riscv64".to_owned()),
        Platform::LinuxArmV6l | Platform::LinuxArmV7l | Platform::NoArch => None,
    }
}

mod linux {
    use std::str::FromStr;

    use keelback_types::Version;

    use super::DetectVirtualPackageError;

    /// Parses the running kernel version out of `/proc/version` style
    /// strings, e.g. `Linux version 6.1.0-13-amd64 (...)`.
    pub(super) fn parse_kernel_version(contents: &str) -> Option<Version> {
        let caps = lazy_regex::regex!(r"Linux version ([0-9]+(\.[0-9]+)+)").captures(contents)?;
        Version::from_str(&caps[1]).ok()
    }

    #[cfg(target_os = "linux")]
    pub(super) fn kernel_version() -> Result<Option<Version>, DetectVirtualPackageError> {
        match std::fs::read_to_string("/proc/version") {
            Ok(contents) => Ok(parse_kernel_version(&contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub(super) fn kernel_version() -> Result<Option<Version>, DetectVirtualPackageError> {
        Ok(None)
    }

    /// The glibc version the binary was loaded with.
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    pub(super) fn glibc_version() -> Option<Version> {
        let version = unsafe {
            let ptr = gnu_get_libc_version();
            std::ffi::CStr::from_ptr(ptr)
        };
        Version::from_str(version.to_str().ok()?).ok()
    }

    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    extern "C" {
        fn gnu_get_libc_version() -> *const std::os::raw::c_char;
    }

    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    pub(super) fn glibc_version() -> Option<Version> {
        None
    }

}

mod osx {
    use std::str::FromStr;

    use keelback_types::Version;

    use super::DetectVirtualPackageError;

    #[cfg(target_os = "macos")]
    pub(super) fn product_version() -> Result<Option<Version>, DetectVirtualPackageError> {
        let contents =
            std::fs::read_to_string("/System/Library/CoreServices/SystemVersion.plist")?;
        Ok(parse_product_version(&contents))
    }

    #[cfg(not(target_os = "macos"))]
    pub(super) fn product_version() -> Result<Option<Version>, DetectVirtualPackageError> {
        Ok(None)
    }

    /// Pulls `ProductVersion` out of `SystemVersion.plist` without a full
    /// plist parser; the file is a stable two-line key/value pattern.
    pub(super) fn parse_product_version(plist: &str) -> Option<Version> {
        let caps = lazy_regex::regex!(
            r"<key>ProductVersion</key>\s*<string>([0-9.]+)</string>"
        )
        .captures(plist)?;
        Version::from_str(&caps[1]).ok()
    }

    #[cfg(test)]
    mod test {
        use std::str::FromStr;

        use keelback_types::Version;

        use super::parse_product_version;

        #[test]
        fn product_version_from_plist() {
            let plist = r"<dict>
                <key>ProductName</key><string>macOS</string>
                <key>ProductVersion</key>
                <string>14.2.1</string>
            </dict>";
            assert_eq!(
                parse_product_version(plist),
                Some(Version::from_str("14.2.1").unwrap())
            );
        }
    }
}

#[cfg(test)]
mod test {
    use keelback_types::{GenericVirtualPackage, Platform};

    use super::{detect_virtual_packages, VirtualPackage};

    #[test]
    fn overrides_take_precedence() {
        temp_env::with_vars(
            [
                ("CONDA_OVERRIDE_GLIBC", Some("2.17")),
                ("CONDA_OVERRIDE_LINUX", Some("5.10")),
                ("CONDA_OVERRIDE_CUDA", Some("12.2")),
            ],
            || {
                let packages = detect_virtual_packages(Platform::Linux64).unwrap();
                assert!(packages
                    .iter()
                    .any(|p| matches!(p, VirtualPackage::Glibc(v) if v.to_string() == "2.17")));
                assert!(packages
                    .iter()
                    .any(|p| matches!(p, VirtualPackage::Linux(v) if v.to_string() == "5.10")));
                assert!(packages
                    .iter()
                    .any(|p| matches!(p, VirtualPackage::Cuda(v) if v.to_string() == "12.2")));
            },
        );
    }

    #[test]
    fn empty_override_disables_the_package() {
        temp_env::with_vars(
            [
                ("CONDA_OVERRIDE_LINUX", Some("5.10")),
                ("CONDA_OVERRIDE_GLIBC", Some("")),
            ],
            || {
                let packages = detect_virtual_packages(Platform::Linux64).unwrap();
                assert!(!packages
                    .iter()
                    .any(|p| matches!(p, VirtualPackage::Glibc(_))));
            },
        );
    }

    #[test]
    fn platform_family_packages() {
        temp_env::with_vars(
            [
                ("CONDA_OVERRIDE_LINUX", Some("5.10")),
                ("CONDA_OVERRIDE_GLIBC", Some("2.28")),
            ],
            || {
                let packages = detect_virtual_packages(Platform::Linux64).unwrap();
                assert!(packages.contains(&VirtualPackage::Unix));
                assert!(!packages.contains(&VirtualPackage::Win));
            },
        );

        let windows = detect_virtual_packages(Platform::Win64).unwrap();
        assert!(windows.contains(&VirtualPackage::Win));
    }

    #[test]
    fn invalid_override_is_an_error() {
        temp_env::with_var("CONDA_OVERRIDE_CUDA", Some("not-a-version$"), || {
            assert!(detect_virtual_packages(Platform::Linux64).is_err());
        });
    }

    #[test]
    fn converts_to_generic_records() {
        let generic: GenericVirtualPackage = VirtualPackage::Archspec("x86_64".to_owned()).into();
        assert_eq!(generic.name.as_str(), "__archspec");
        assert_eq!(generic.build_string, "x86_64");
    }
}
