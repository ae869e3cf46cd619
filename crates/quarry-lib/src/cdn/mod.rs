//! CDN URL layout: platform triple and channel mapping.

pub mod probe;

pub use probe::{HttpProbeTransport, ProbeTransport, VersionProbe};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

static PLATFORM: Lazy<(OsType, Arch)> = Lazy::new(|| (OsType::current(), Arch::current()));

/// The build platform's CDN triple components, detected once.
pub fn platform() -> (OsType, Arch) {
    *PLATFORM
}

/// Operating system component of the CDN path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsType {
    Windows,
    Linux,
    MacOs,
}

impl OsType {
    /// Detect the current OS.
    pub fn current() -> Self {
        #[cfg(target_os = "windows")]
        return OsType::Windows;

        #[cfg(target_os = "macos")]
        return OsType::MacOs;

        #[cfg(not(any(target_os = "windows", target_os = "macos")))]
        return OsType::Linux;
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Windows => "windows",
            OsType::Linux => "linux",
            OsType::MacOs => "darwin",
        }
    }
}

/// Architecture component of the CDN path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Arch {
    X64,
    Arm64,
}

impl Arch {
    /// Detect the current architecture.
    pub fn current() -> Self {
        #[cfg(target_arch = "aarch64")]
        return Arch::Arm64;

        #[cfg(not(target_arch = "aarch64"))]
        return Arch::X64;
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::Arm64 => "arm64",
        }
    }
}

/// CDN directory name for a release channel. Only `beta` maps to the
/// pre-release tree; everything else is served from `release`.
pub fn cdn_channel(channel: &str) -> &'static str {
    if channel == "beta" {
        "pre-release"
    } else {
        "release"
    }
}

/// `<base>/<os>/<arch>/<cdn_channel>/` with a trailing slash.
pub fn channel_base_url(base: &str, os: OsType, arch: Arch, channel: &str) -> String {
    format!(
        "{}/{}/{}/{}/",
        base.trim_end_matches('/'),
        os.as_str(),
        arch.as_str(),
        cdn_channel(channel)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beta_maps_to_prerelease() {
        assert_eq!(cdn_channel("beta"), "pre-release");
        assert_eq!(cdn_channel("latest"), "release");
        assert_eq!(cdn_channel("anything-else"), "release");
    }

    #[test]
    fn base_url_shape() {
        let url = channel_base_url("https://cdn.example/game", OsType::Linux, Arch::X64, "latest");
        assert_eq!(url, "https://cdn.example/game/linux/x64/release/");
    }

    #[test]
    fn base_url_tolerates_trailing_slash() {
        let url = channel_base_url("https://cdn.example/game/", OsType::Windows, Arch::Arm64, "beta");
        assert_eq!(url, "https://cdn.example/game/windows/arm64/pre-release/");
    }
}
