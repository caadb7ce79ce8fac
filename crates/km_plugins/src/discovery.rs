use std::{
    fs,
    path::{Path, PathBuf},
};

use base64::Engine as _;
use km_api::Tier;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{package, PluginError};

/// Installed plugin binaries are named `km-plugin-<name>`.
pub const PLUGIN_PREFIX: &str = "km-plugin-";

/// A discovered plugin binary and its declared metadata.
#[derive(Clone, Debug)]
pub struct PluginBinary {
    pub path: PathBuf,
    pub name: String,
    pub version: String,
    pub required_tier: Tier,
    /// Detached EdDSA signature from the `.sig` sidecar, when present.
    pub signature: Option<Vec<u8>>,
}

/// Sidecar `<dir>/<name>.manifest.json` written at install time.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestSidecar {
    #[serde(default)]
    version: Option<String>,
    #[serde(default, alias = "required_tier")]
    required_tier: Option<Tier>,
}

/// Enumerates plugin binaries and packaged archives under the configured
/// directories.
pub struct Discovery {
    dirs: Vec<PathBuf>,
}

impl Discovery {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    /// Scans every configured directory (creating missing ones) for
    /// executable `km-plugin-*` files. Unreadable candidates are skipped
    /// with a warning rather than failing the scan.
    pub fn discover(&self) -> Result<Vec<PluginBinary>, PluginError> {
        let mut found = Vec::new();
        for dir in &self.dirs {
            fs::create_dir_all(dir)?;
            let entries = match fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(dir = %dir.display(), error = %err, "cannot read plugin directory");
                    continue;
                }
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(name) = file_name.strip_prefix(PLUGIN_PREFIX) else {
                    continue;
                };
                if name.is_empty() || file_name.ends_with(".sig") {
                    continue;
                }
                if !is_regular_executable(&path) {
                    debug!(path = %path.display(), "skipping non-executable plugin candidate");
                    continue;
                }
                found.push(load_binary(dir, &path, name));
            }
        }
        Ok(found)
    }

    /// Walks the directory trees for `.kmpkg` archives and reads their
    /// metadata without extracting the binary entry.
    pub fn discover_packages(&self) -> Result<Vec<package::PackagedPlugin>, PluginError> {
        let mut found = Vec::new();
        for dir in &self.dirs {
            fs::create_dir_all(dir)?;
            walk_for_packages(dir, &mut found);
        }
        Ok(found)
    }
}

fn walk_for_packages(dir: &Path, found: &mut Vec<package::PackagedPlugin>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk_for_packages(&path, found);
            continue;
        }
        if path.extension().and_then(|e| e.to_str()) != Some("kmpkg") {
            continue;
        }
        match package::read_package_metadata(&path) {
            Ok(metadata) => found.push(package::PackagedPlugin { path, metadata }),
            Err(err) => {
                warn!(path = %path.display(), error = %err, "unreadable plugin package");
            }
        }
    }
}

fn load_binary(dir: &Path, path: &Path, name: &str) -> PluginBinary {
    let sidecar = read_sidecar(&dir.join(format!("{name}.manifest.json")));
    let signature = read_signature(&PathBuf::from(format!("{}.sig", path.display())));
    PluginBinary {
        path: path.to_path_buf(),
        name: name.to_string(),
        version: sidecar
            .version
            .clone()
            .unwrap_or_else(|| "unknown".to_string()),
        required_tier: sidecar.required_tier.unwrap_or_default(),
        signature,
    }
}

fn read_sidecar(path: &Path) -> ManifestSidecar {
    match fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_else(|err| {
            warn!(path = %path.display(), error = %err, "malformed manifest sidecar");
            ManifestSidecar::default()
        }),
        Err(_) => ManifestSidecar::default(),
    }
}

/// Reads a detached signature sidecar. Accepts raw 64-byte signatures or
/// base64 text (what the manifest carries).
fn read_signature(path: &Path) -> Option<Vec<u8>> {
    let raw = fs::read(path).ok()?;
    if raw.len() == 64 {
        return Some(raw);
    }
    let text = String::from_utf8(raw).ok()?;
    base64::engine::general_purpose::STANDARD
        .decode(text.trim())
        .ok()
}

#[cfg(unix)]
fn is_regular_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    match fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn is_regular_executable(path: &Path) -> bool {
    path.is_file()
}
