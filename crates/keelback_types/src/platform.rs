use std::{fmt, str::FromStr};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// A platform-architecture slug, the `subdir` dimension of a channel.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Platform {
    NoArch,
    Linux32,
    Linux64,
    LinuxAarch64,
    LinuxArmV6l,
    LinuxArmV7l,
    LinuxPpc64,
    LinuxPpc64le,
    LinuxRiscv64,
    LinuxS390X,
    Osx64,
    OsxArm64,
    Win32,
    Win64,
    WinArm64,
}

/// The error returned when a subdir string is not recognized.
#[derive(Debug, Clone, Eq, PartialEq, Error)]
#[error("'{0}' is not a known platform (e.g. linux-64, osx-arm64, noarch)")]
pub struct ParsePlatformError(pub String);

impl Platform {
    /// The platform the binary was compiled for, unless overridden through
    /// the `CONDA_SUBDIR` environment variable.
    pub fn current() -> Platform {
        if let Ok(subdir) = std::env::var("CONDA_SUBDIR") {
            if let Ok(platform) = subdir.parse() {
                return platform;
            }
        }
        Platform::host()
    }

    /// The platform the binary was compiled for.
    pub fn host() -> Platform {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        return Platform::Linux64;
        #[cfg(all(target_os = "linux", target_arch = "x86"))]
        return Platform::Linux32;
        #[cfg(all(target_os = "linux", target_arch = "aarch64"))]
        return Platform::LinuxAarch64;
        #[cfg(all(target_os = "linux", target_arch = "powerpc64"))]
        return Platform::LinuxPpc64;
        #[cfg(all(target_os = "linux", target_arch = "riscv64"))]
        return Platform::LinuxRiscv64;
        #[cfg(all(target_os = "linux", target_arch = "s390x"))]
        return Platform::LinuxS390X;
        #[cfg(all(target_os = "macos", target_arch = "x86_64"))]
        return Platform::Osx64;
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        return Platform::OsxArm64;
        #[cfg(all(target_os = "windows", target_arch = "x86_64"))]
        return Platform::Win64;
        #[cfg(all(target_os = "windows", target_arch = "x86"))]
        return Platform::Win32;
        #[cfg(all(target_os = "windows", target_arch = "aarch64"))]
        return Platform::WinArm64;
        #[cfg(not(any(
            all(
                target_os = "linux",
                any(
                    target_arch = "x86_64",
                    target_arch = "x86",
                    target_arch = "aarch64",
                    target_arch = "powerpc64",
                    target_arch = "riscv64",
                    target_arch = "s390x"
                )
            ),
            all(target_os = "macos", any(target_arch = "x86_64", target_arch = "aarch64")),
            all(
                target_os = "windows",
                any(target_arch = "x86_64", target_arch = "x86", target_arch = "aarch64")
            )
        )))]
        compile_error!("unsupported target platform");
    }

    /// The subdir string, e.g. `linux-64`.
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::NoArch => "noarch",
            Platform::Linux32 => "linux-32",
            Platform::Linux64 => "linux-64",
            Platform::LinuxAarch64 => "linux-aarch64",
            Platform::LinuxArmV6l => "linux-armv6l",
            Platform::LinuxArmV7l => "linux-armv7l",
            Platform::LinuxPpc64 => "linux-ppc64",
            Platform::LinuxPpc64le => "linux-ppc64le",
            Platform::LinuxRiscv64 => "linux-riscv64",
            Platform::LinuxS390X => "linux-s390x",
            Platform::Osx64 => "osx-64",
            Platform::OsxArm64 => "osx-arm64",
            Platform::Win32 => "win-32",
            Platform::Win64 => "win-64",
            Platform::WinArm64 => "win-arm64",
        }
    }

    /// Returns true if the platform is linux based.
    pub fn is_linux(self) -> bool {
        matches!(
            self,
            Platform::Linux32
                | Platform::Linux64
                | Platform::LinuxAarch64
                | Platform::LinuxArmV6l
                | Platform::LinuxArmV7l
                | Platform::LinuxPpc64
                | Platform::LinuxPpc64le
                | Platform::LinuxRiscv64
                | Platform::LinuxS390X
        )
    }

    /// Returns true if the platform is macOS based.
    pub fn is_osx(self) -> bool {
        matches!(self, Platform::Osx64 | Platform::OsxArm64)
    }

    /// Returns true if the platform is a unix (linux or macOS).
    pub fn is_unix(self) -> bool {
        self.is_linux() || self.is_osx()
    }

    /// Returns true if the platform is windows based.
    pub fn is_windows(self) -> bool {
        matches!(self, Platform::Win32 | Platform::Win64 | Platform::WinArm64)
    }
}

impl FromStr for Platform {
    type Err = ParsePlatformError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "noarch" => Platform::NoArch,
            "linux-32" => Platform::Linux32,
            "linux-64" => Platform::Linux64,
            "linux-aarch64" => Platform::LinuxAarch64,
            "linux-armv6l" => Platform::LinuxArmV6l,
            "linux-armv7l" => Platform::LinuxArmV7l,
            "linux-ppc64" => Platform::LinuxPpc64,
            "linux-ppc64le" => Platform::LinuxPpc64le,
            "linux-riscv64" => Platform::LinuxRiscv64,
            "linux-s390x" => Platform::LinuxS390X,
            "osx-64" => Platform::Osx64,
            "osx-arm64" => Platform::OsxArm64,
            "win-32" => Platform::Win32,
            "win-64" => Platform::Win64,
            "win-arm64" => Platform::WinArm64,
            other => return Err(ParsePlatformError(other.to_owned())),
        })
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Platform {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Platform {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = std::borrow::Cow::<str>::deserialize(deserializer)?;
        source.parse().map_err(serde::de::Error::custom)
    }
}
