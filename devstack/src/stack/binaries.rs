// File: devstack/src/stack/binaries.rs
//
// Stack Binary Provisioning
//
// Fetches the node, worker and relay executables of a published release
// when they are not present yet. Files that already exist are never
// downloaded again.

use std::path::{Path, PathBuf};

use reqwest::{header, Client, StatusCode};
use serde::Deserialize;

use crate::config::StackConfig;
use crate::error::DownloadError;

/// Version selecting the most recent release.
pub const LATEST: &str = "latest";

// Release APIs reject anonymous clients
const USER_AGENT: &str = concat!("devstack/", env!("CARGO_PKG_VERSION"));

/// One published release as listed by the releases API.
#[derive(Debug, Clone, Deserialize)]
pub struct Release {
    pub name: String,
    pub tag_name: String,
    #[serde(default)]
    pub assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub browser_download_url: String,
}

/// Downloads missing stack binaries from a release.
///
/// Executable assets (`phala-node`, `pruntime`, `pherry`) land at the path
/// configured for their role and are made executable. Any other asset of
/// the release goes next to the node binary.
///
/// # Example
///
/// ```rust,ignore
/// let downloader = StackBinaryDownloader::from_config(&config);
/// if let Some(version) = config.stack_version.as_deref() {
///     downloader.download(version).await?;
/// }
/// ```
pub struct StackBinaryDownloader {
    client: Client,
    releases_url: String,
    stack_dir: PathBuf,
    executables: Vec<(&'static str, PathBuf)>,
}

impl StackBinaryDownloader {
    pub fn new(releases_url: impl Into<String>, stack_dir: impl Into<PathBuf>) -> Self {
        let stack_dir = stack_dir.into();
        let executables = ["phala-node", "pruntime", "pherry"]
            .into_iter()
            .map(|name| (name, stack_dir.join(name)))
            .collect();
        Self {
            client: Client::new(),
            releases_url: releases_url.into(),
            stack_dir,
            executables,
        }
    }

    pub fn from_config(config: &StackConfig) -> Self {
        let stack_dir = config
            .node_binary
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let mut downloader = Self::new(config.releases_url.clone(), stack_dir);
        downloader.executables = vec![
            ("phala-node", config.node_binary.clone()),
            ("pruntime", config.worker_binary.clone()),
            ("pherry", config.relay_binary.clone()),
        ];
        downloader
    }

    /// Where the asset called `name` is stored.
    pub fn target_path(&self, name: &str) -> PathBuf {
        self.executables
            .iter()
            .find(|(executable, _)| *executable == name)
            .map(|(_, path)| path.clone())
            .unwrap_or_else(|| self.stack_dir.join(name))
    }

    fn is_executable(&self, name: &str) -> bool {
        self.executables.iter().any(|(executable, _)| *executable == name)
    }

    /// True when every executable is already in place.
    pub fn is_provisioned(&self) -> bool {
        self.executables.iter().all(|(_, path)| path.exists())
    }

    /// Published releases, newest first.
    ///
    /// # Errors
    ///
    /// `DownloadError::ReleasesList` on a transport error, a non-200 answer
    /// or a body that is not a release list.
    pub async fn releases(&self) -> Result<Vec<Release>, DownloadError> {
        let response = self
            .client
            .get(&self.releases_url)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| DownloadError::ReleasesList(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(DownloadError::ReleasesList(format!("HTTP {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|e| DownloadError::ReleasesList(e.to_string()))
    }

    /// Release carrying tag `version`, or the newest one for `latest`.
    pub async fn find_release(&self, version: &str) -> Result<Release, DownloadError> {
        let releases = self.releases().await?;
        let release = if version == LATEST {
            releases.into_iter().next()
        } else {
            releases.into_iter().find(|release| release.tag_name == version)
        };
        release.ok_or_else(|| DownloadError::ReleaseNotFound(version.to_string()))
    }

    /// Download the assets of release `version` that are not present yet.
    ///
    /// Does nothing, without contacting the releases API, when every
    /// executable already exists. Returns the paths written.
    ///
    /// # Errors
    ///
    /// Fails on the first asset that cannot be fetched or written; assets
    /// written before it stay on disk.
    pub async fn download(&self, version: &str) -> Result<Vec<PathBuf>, DownloadError> {
        if self.is_provisioned() {
            log::debug!("Stack binaries already present in {}", self.stack_dir.display());
            return Ok(Vec::new());
        }

        let release = self.find_release(version).await?;
        log::info!("Downloading stack binaries {} ({})", release.name, release.tag_name);

        let mut written = Vec::new();
        for asset in &release.assets {
            let path = self.target_path(&asset.name);
            if path.exists() {
                continue;
            }
            log::info!("Downloading {}", asset.name);
            let bytes = self.fetch_asset(asset).await?;
            self.store(&path, &bytes, self.is_executable(&asset.name)).await?;
            written.push(path);
        }

        let missing: Vec<_> = self
            .executables
            .iter()
            .filter(|(_, path)| !path.exists())
            .map(|(name, _)| *name)
            .collect();
        if !missing.is_empty() {
            log::warn!(
                "Release {} does not provide {}",
                release.tag_name,
                missing.join(", ")
            );
        }
        Ok(written)
    }

    async fn fetch_asset(&self, asset: &ReleaseAsset) -> Result<Vec<u8>, DownloadError> {
        let failed = |reason: String| DownloadError::Asset {
            asset: asset.name.clone(),
            reason,
        };
        let response = self
            .client
            .get(&asset.browser_download_url)
            .header(header::USER_AGENT, USER_AGENT)
            .send()
            .await
            .map_err(|e| failed(e.to_string()))?;
        if response.status() != StatusCode::OK {
            return Err(failed(format!("HTTP {}", response.status())));
        }
        let bytes = response.bytes().await.map_err(|e| failed(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn store(&self, path: &Path, bytes: &[u8], executable: bool) -> Result<(), DownloadError> {
        let io_error = |source| DownloadError::Io {
            path: path.to_path_buf(),
            source,
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(io_error)?;
        }
        tokio::fs::write(path, bytes).await.map_err(io_error)?;
        if executable {
            make_executable(path).await.map_err(io_error)?;
        }
        Ok(())
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
