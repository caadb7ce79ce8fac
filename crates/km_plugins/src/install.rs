//! Manifest fetch and verified plugin install.
//!
//! Downloads stream through the backend proxy into a temp file, are hash-
//! and signature-verified, then atomically renamed into the plugin
//! directory — on any failure the previously installed binary and the
//! registry are untouched.

use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use base64::Engine as _;
use km_api::{
    types::{InstalledPlugin, ManifestRequest, ManifestResponse, PlatformInfo, PluginManifestEntry, ProvisionRequest},
    ApiClient, KeyRing, SCOPE_GENERAL,
};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::{discovery::PLUGIN_PREFIX, package, registry::Registry, PluginError};

/// Manifest cache freshness window.
const MANIFEST_CACHE_TTL: Duration = Duration::from_secs(300);

/// Download progress callback: `(bytes_so_far, total_if_known)`.
pub type Progress<'a> = &'a mut dyn FnMut(u64, Option<u64>);

#[derive(Debug, Eq, PartialEq)]
pub enum UpdateOutcome {
    AlreadyCurrent,
    Updated { from: String, to: String },
}

/// Drives `/api/plugins/manifest` and verified installs into one plugin
/// directory.
pub struct Installer {
    api: Arc<ApiClient>,
    keyring: KeyRing,
    plugin_dir: PathBuf,
    registry: Arc<Registry>,
    download_timeout: Duration,
    cli_version: String,
    api_key: String,
}

impl Installer {
    pub fn new(
        api: Arc<ApiClient>,
        keyring: KeyRing,
        plugin_dir: PathBuf,
        registry: Arc<Registry>,
        download_timeout: Duration,
        cli_version: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            api,
            keyring,
            plugin_dir,
            registry,
            download_timeout,
            cli_version: cli_version.into(),
            api_key: api_key.into(),
        }
    }

    /// Queries the backend catalog, serving from the TTL cache when fresh.
    pub async fn fetch_manifest(
        &self,
        installed: &[InstalledPlugin],
    ) -> Result<Vec<PluginManifestEntry>, PluginError> {
        if let Some(entries) = self.read_cache()? {
            debug!("serving plugin manifest from cache");
            return Ok(entries);
        }

        let request = ManifestRequest {
            plugins: installed.to_vec(),
            platform: PlatformInfo::current(),
            cli_version: self.cli_version.clone(),
        };
        let response: ManifestResponse = self
            .api
            .post_json("/api/plugins/manifest", SCOPE_GENERAL, &request)
            .await?;

        self.write_cache(&response.plugins)?;
        Ok(response.plugins)
    }

    /// Verified install of one manifest entry. The destination is only
    /// replaced after the downloaded bytes pass the hash (and, when
    /// declared, signature) checks.
    pub async fn install(
        &self,
        name: &str,
        entries: &[PluginManifestEntry],
        progress: Progress<'_>,
    ) -> Result<PathBuf, PluginError> {
        let entry = entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| PluginError::NotInManifest(name.to_string()))?;

        let bytes = self
            .api
            .download(&entry.url, SCOPE_GENERAL, self.download_timeout, progress)
            .await?;

        let actual = hex::encode(Sha256::digest(&bytes));
        if !actual.eq_ignore_ascii_case(&entry.hash) {
            return Err(PluginError::DownloadHashMismatch {
                expected: entry.hash.clone(),
                actual,
            });
        }

        let signature = match &entry.signature {
            Some(signature_b64) => {
                let signature = base64::engine::general_purpose::STANDARD
                    .decode(signature_b64.trim())
                    .map_err(|_| PluginError::DownloadSignatureInvalid)?;
                self.keyring
                    .verify_detached(&bytes, &signature)
                    .map_err(|_| PluginError::DownloadSignatureInvalid)?;
                Some(signature)
            }
            None => None,
        };

        fs::create_dir_all(&self.plugin_dir)?;
        let target = self.plugin_dir.join(format!("{PLUGIN_PREFIX}{name}"));
        atomic_install(&self.plugin_dir, &target, &bytes)?;

        let sidecar = self.plugin_dir.join(format!("{name}.manifest.json"));
        let sidecar_body = serde_json::to_vec_pretty(&serde_json::json!({
            "name": entry.name,
            "version": entry.version,
            "requiredTier": entry.tier,
        }))?;
        fs::write(sidecar, sidecar_body)?;
        if let Some(signature) = signature {
            fs::write(
                self.plugin_dir.join(format!("{PLUGIN_PREFIX}{name}.sig")),
                base64::engine::general_purpose::STANDARD.encode(signature),
            )?;
        }

        self.registry
            .record_install(name, &entry.version, entry.tier)?;
        info!(plugin = name, version = entry.version.as_str(), "plugin installed");
        Ok(target)
    }

    /// Installs when the manifest advertises a strictly newer version.
    /// Any live instance must be shut down by the caller first.
    pub async fn update(
        &self,
        name: &str,
        entries: &[PluginManifestEntry],
        progress: Progress<'_>,
    ) -> Result<UpdateOutcome, PluginError> {
        let entry = entries
            .iter()
            .find(|entry| entry.name == name)
            .ok_or_else(|| PluginError::NotInManifest(name.to_string()))?;

        let installed = self.registry.installed_version(name)?;
        if let Some(installed) = &installed {
            if !is_newer(&entry.version, installed) {
                return Ok(UpdateOutcome::AlreadyCurrent);
            }
        }

        self.install(name, entries, progress).await?;
        Ok(UpdateOutcome::Updated {
            from: installed.unwrap_or_else(|| "none".to_string()),
            to: entry.version.clone(),
        })
    }

    /// Removes the binary and its sidecars, then the registry entry.
    pub fn uninstall(&self, name: &str) -> Result<(), PluginError> {
        let binary = self.plugin_dir.join(format!("{PLUGIN_PREFIX}{name}"));
        let sidecar = self.plugin_dir.join(format!("{name}.manifest.json"));
        let signature = self.plugin_dir.join(format!("{PLUGIN_PREFIX}{name}.sig"));
        for path in [&binary, &sidecar, &signature] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }
        self.registry.remove(name)?;
        info!(plugin = name, "plugin uninstalled");
        Ok(())
    }

    /// Alternate install path: asks the backend to provision a build, then
    /// installs from the returned manifest entry.
    pub async fn provision(
        &self,
        name: &str,
        progress: Progress<'_>,
    ) -> Result<PathBuf, PluginError> {
        let request = ProvisionRequest {
            plugin_name: name.to_string(),
            platform: PlatformInfo::current(),
            cli_version: self.cli_version.clone(),
        };
        let entry: PluginManifestEntry = self
            .api
            .post_json("/api/plugins/provision", SCOPE_GENERAL, &request)
            .await?;
        self.install(name, std::slice::from_ref(&entry), progress)
            .await
    }

    /// Installs a locally discovered `.kmpkg` package.
    pub fn install_package(&self, package_path: &Path) -> Result<PathBuf, PluginError> {
        let binary = package::extract_package(package_path, &self.plugin_dir)?;
        let metadata = package::read_package_metadata(package_path)?;
        self.registry
            .record_install(&metadata.name, &metadata.version, metadata.required_tier)?;
        Ok(binary)
    }

    fn cache_path(&self) -> PathBuf {
        let digest = hex::encode(Sha256::digest(self.api_key.as_bytes()));
        self.plugin_dir
            .join(".cache")
            .join(format!("manifest_{}.json", &digest[..16]))
    }

    fn read_cache(&self) -> Result<Option<Vec<PluginManifestEntry>>, PluginError> {
        let raw = match fs::read(self.cache_path()) {
            Ok(raw) => raw,
            Err(_) => return Ok(None),
        };
        let cached: ManifestCache = match serde_json::from_slice(&raw) {
            Ok(cached) => cached,
            Err(err) => {
                warn!(error = %err, "discarding unreadable manifest cache");
                return Ok(None);
            }
        };
        let age = now_epoch().saturating_sub(cached.fetched_at);
        if age > MANIFEST_CACHE_TTL.as_secs() {
            return Ok(None);
        }
        Ok(Some(cached.entries))
    }

    fn write_cache(&self, entries: &[PluginManifestEntry]) -> Result<(), PluginError> {
        let cache_path = self.cache_path();
        let dir = cache_path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)?;
        let body = serde_json::to_vec_pretty(&ManifestCache {
            fetched_at: now_epoch(),
            entries: entries.to_vec(),
        })?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        std::io::Write::write_all(&mut temp, &body)?;
        temp.persist(&cache_path)
            .map_err(|err| PluginError::Io(err.error))?;
        Ok(())
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct ManifestCache {
    fetched_at: u64,
    entries: Vec<PluginManifestEntry>,
}

/// Writes through a temp file in the destination directory and renames into
/// place, so an observer sees either the old binary or the new one.
fn atomic_install(dir: &Path, target: &Path, bytes: &[u8]) -> Result<(), PluginError> {
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    std::io::Write::write_all(&mut temp, bytes)?;
    temp.as_file().sync_all()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        temp.as_file()
            .set_permissions(fs::Permissions::from_mode(0o755))?;
    }
    temp.persist(target)
        .map_err(|err| PluginError::Io(err.error))?;
    Ok(())
}

/// Semver comparison with a lenient fallback for unparseable versions.
fn is_newer(candidate: &str, installed: &str) -> bool {
    match (
        semver::Version::parse(candidate.trim_start_matches('v')),
        semver::Version::parse(installed.trim_start_matches('v')),
    ) {
        (Ok(candidate), Ok(installed)) => candidate > installed,
        _ => candidate != installed,
    }
}

fn now_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_comparison() {
        assert!(is_newer("1.3.0", "1.2.9"));
        assert!(is_newer("v2.0.0", "1.9.9"));
        assert!(!is_newer("1.2.0", "1.2.0"));
        assert!(!is_newer("1.1.0", "1.2.0"));
        // Unparseable versions fall back to inequality.
        assert!(is_newer("nightly-2", "nightly-1"));
        assert!(!is_newer("unknown", "unknown"));
    }

    #[test]
    fn atomic_install_replaces_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("km-plugin-console");
        fs::write(&target, b"old").unwrap();
        atomic_install(tmp.path(), &target, b"new binary").unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"new binary");
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_ne!(
                fs::metadata(&target).unwrap().permissions().mode() & 0o111,
                0
            );
        }
    }
}
