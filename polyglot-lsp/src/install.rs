//! Materializes a language's server binaries under the static cache.
//!
//! Each profile ships a descriptor listing per-platform binaries or install
//! commands. On first use the selected entry is downloaded/installed into
//! `<cache>/polyglot/static/<lang>/`; subsequent sessions find the binary
//! there (or on `$PATH`, which always wins).

use crate::config::Language;
use crate::fsutil;
use crate::languages::ServerProfile;
use crate::{Error, Result};
use anyhow::Context;
use etcetera::base_strategy::{choose_base_strategy, BaseStrategy};
use log::info;
use serde::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformId {
    LinuxX64,
    LinuxArm64,
    OsxX64,
    OsxArm64,
    WinX64,
    WinArm64,
}

impl PlatformId {
    pub fn current() -> Result<PlatformId> {
        use std::env::consts::{ARCH, OS};
        match (OS, ARCH) {
            ("linux", "x86_64") => Ok(PlatformId::LinuxX64),
            ("linux", "aarch64") => Ok(PlatformId::LinuxArm64),
            ("macos", "x86_64") => Ok(PlatformId::OsxX64),
            ("macos", "aarch64") => Ok(PlatformId::OsxArm64),
            ("windows", "x86_64") => Ok(PlatformId::WinX64),
            ("windows", "aarch64") => Ok(PlatformId::WinArm64),
            (os, arch) => Err(Error::UnsupportedPlatform(format!("{os}-{arch}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlatformId::LinuxX64 => "linux-x64",
            PlatformId::LinuxArm64 => "linux-arm64",
            PlatformId::OsxX64 => "osx-x64",
            PlatformId::OsxArm64 => "osx-arm64",
            PlatformId::WinX64 => "win-x64",
            PlatformId::WinArm64 => "win-arm64",
        }
    }
}

impl fmt::Display for PlatformId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One installable artifact from a profile's descriptor.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDependency {
    pub id: String,
    #[serde(default)]
    pub description: Option<String>,
    /// A [`PlatformId`] tag, or "any".
    pub platform_id: String,
    #[serde(default)]
    pub url: Option<String>,
    /// "gz", "tar.gz" or "zip"; absent means the download is the binary.
    #[serde(default)]
    pub archive_type: Option<String>,
    /// Path of the installed binary, relative to the static dir.
    pub binary_name: String,
    /// Shell command run in the static dir instead of a download.
    #[serde(default)]
    pub command: Option<String>,
    /// Extra environment for `command`; values may use `$staticDir`.
    #[serde(default)]
    pub env: HashMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeDependencyManifest {
    pub runtime_dependencies: Vec<RuntimeDependency>,
}

pub fn parse_manifest(text: &str) -> Result<RuntimeDependencyManifest> {
    serde_json::from_str(text).map_err(Into::into)
}

/// Root of the client's cache, `<platform cache dir>/polyglot`.
pub fn cache_dir() -> PathBuf {
    let strategy = choose_base_strategy().expect("Unable to find the cache directory!");
    let mut path = strategy.cache_dir();
    path.push("polyglot");
    path
}

/// The binary cache for one language.
pub fn static_dir(language: Language) -> PathBuf {
    cache_dir().join("static").join(language.tag())
}

/// Pick the descriptor entry for `platform`: an exact tag wins over "any".
pub fn select_dependency(
    manifest: &RuntimeDependencyManifest,
    platform: PlatformId,
) -> Result<&RuntimeDependency> {
    manifest
        .runtime_dependencies
        .iter()
        .find(|dep| dep.platform_id == platform.as_str())
        .or_else(|| {
            manifest
                .runtime_dependencies
                .iter()
                .find(|dep| dep.platform_id == "any")
        })
        .ok_or_else(|| Error::UnsupportedPlatform(platform.to_string()))
}

/// Make sure the profile's server binary exists in the static cache,
/// installing it if needed. Returns the binary path.
pub fn ensure_installed(profile: &dyn ServerProfile) -> Result<PathBuf> {
    let manifest = parse_manifest(profile.runtime_dependencies())?;
    let platform = PlatformId::current()?;
    let dependency = select_dependency(&manifest, platform)?;

    let static_dir = static_dir(profile.language());
    let target = static_dir.join(&dependency.binary_name);
    if target.is_file() {
        return Ok(target);
    }

    info!(
        "{}: materializing {} under {}",
        profile.name(),
        dependency.id,
        static_dir.display()
    );
    std::fs::create_dir_all(&static_dir)
        .with_context(|| format!("could not create {}", static_dir.display()))?;
    let static_dir_str = static_dir
        .to_str()
        .context("static dir path is not valid UTF-8")?;

    if let Some(command) = &dependency.command {
        let command = command.replace("$staticDir", static_dir_str);
        let env: HashMap<String, String> = dependency
            .env
            .iter()
            .map(|(key, value)| (key.clone(), value.replace("$staticDir", static_dir_str)))
            .collect();
        fsutil::run_install_command(&command, &static_dir, &env)?;
    } else if let Some(url) = &dependency.url {
        let downloaded = static_dir.join(format!("{}.download", dependency.id));
        fsutil::download(url, &downloaded)?;
        match dependency.archive_type.as_deref() {
            Some("gz") => {
                fsutil::gunzip(&downloaded, &target)?;
                let _ = std::fs::remove_file(&downloaded);
            }
            Some("tar.gz") | Some("tgz") => {
                fsutil::untar_gz(&downloaded, &static_dir)?;
                let _ = std::fs::remove_file(&downloaded);
            }
            Some("zip") => {
                fsutil::unzip(&downloaded, &static_dir)?;
                let _ = std::fs::remove_file(&downloaded);
            }
            None | Some("none") => {
                std::fs::rename(&downloaded, &target)?;
            }
            Some(other) => {
                return Err(Error::Other(anyhow::anyhow!(
                    "unknown archive type '{other}' for {}",
                    dependency.id
                )))
            }
        }
        fsutil::make_executable(&target)?;
    } else {
        return Err(Error::Other(anyhow::anyhow!(
            "dependency {} declares neither a command nor a url",
            dependency.id
        )));
    }

    if target.is_file() {
        Ok(target)
    } else {
        Err(Error::MissingBinary(format!(
            "{} did not appear at {} after installation",
            dependency.id,
            target.display()
        )))
    }
}
