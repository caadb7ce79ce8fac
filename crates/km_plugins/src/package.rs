//! `.kmpkg` plugin archives: a gzip-compressed tar holding a
//! `metadata.json` sidecar and the plugin binary entry.
//!
//! Metadata reads stream the archive without touching the binary;
//! extraction validates every entry path and type so a hostile archive
//! cannot write outside the target directory.

use std::{
    fs,
    io::Read,
    path::{Component, Path, PathBuf},
};

use flate2::read::GzDecoder;
use km_api::Tier;
use serde::{Deserialize, Serialize};
use tar::Archive;

use crate::{discovery::PLUGIN_PREFIX, PluginError};

/// Entries above this count or cumulative size abort extraction.
const MAX_ENTRY_COUNT: usize = 256;
const MAX_EXTRACTED_SIZE: u64 = 200 * 1024 * 1024;

/// The `metadata.json` entry inside a package.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageMetadata {
    pub name: String,
    pub version: String,
    /// Name of the binary entry inside the archive.
    pub binary: String,
    #[serde(default, alias = "required_tier")]
    pub required_tier: Tier,
}

/// A discovered `.kmpkg` archive with its parsed metadata.
#[derive(Clone, Debug)]
pub struct PackagedPlugin {
    pub path: PathBuf,
    pub metadata: PackageMetadata,
}

/// Reads `metadata.json` out of a package without extracting anything.
pub fn read_package_metadata(path: &Path) -> Result<PackageMetadata, PluginError> {
    let file = fs::File::open(path)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        if entry_path.file_name().and_then(|n| n.to_str()) != Some("metadata.json") {
            continue;
        }
        let mut raw = Vec::new();
        entry.read_to_end(&mut raw)?;
        return Ok(serde_json::from_slice(&raw)?);
    }

    Err(PluginError::PackageMetadataMissing(
        path.display().to_string(),
    ))
}

/// Extracts the binary entry into `dest_dir` as `km-plugin-<name>` with the
/// executable bit set, and writes the manifest sidecar next to it. Returns
/// the installed binary path.
pub fn extract_package(path: &Path, dest_dir: &Path) -> Result<PathBuf, PluginError> {
    let metadata = read_package_metadata(path)?;
    fs::create_dir_all(dest_dir)?;

    let file = fs::File::open(path)?;
    let mut archive = Archive::new(GzDecoder::new(file));

    let mut entry_count = 0usize;
    let mut total_size = 0u64;
    let mut binary_written = false;
    let target = dest_dir.join(format!("{PLUGIN_PREFIX}{}", metadata.name));

    for entry in archive.entries()? {
        let mut entry = entry?;
        entry_count += 1;
        if entry_count > MAX_ENTRY_COUNT {
            return Err(PluginError::DownloadUnsafePath {
                path: format!("more than {MAX_ENTRY_COUNT} entries"),
            });
        }

        let entry_type = entry.header().entry_type();
        if !matches!(entry_type, tar::EntryType::Regular | tar::EntryType::Directory) {
            let entry_path = entry
                .path()
                .map_or_else(|_| "<unknown>".to_string(), |p| p.display().to_string());
            return Err(PluginError::UnsafeEntryType {
                entry_type: format!("{entry_type:?}"),
                path: entry_path,
            });
        }

        total_size = total_size.saturating_add(entry.header().size()?);
        if total_size > MAX_EXTRACTED_SIZE {
            return Err(PluginError::DownloadUnsafePath {
                path: format!("archive exceeds {MAX_EXTRACTED_SIZE} bytes"),
            });
        }

        let entry_path = entry.path()?.into_owned();
        validate_entry_path(&entry_path)?;

        if entry_path.file_name().and_then(|n| n.to_str()) == Some(metadata.binary.as_str())
            && entry_type == tar::EntryType::Regular
        {
            let mut raw = Vec::new();
            entry.read_to_end(&mut raw)?;
            write_executable(&target, &raw)?;
            binary_written = true;
        }
        // Everything else (metadata, docs) stays inside the archive; the
        // sidecar below carries what discovery needs.
    }

    if !binary_written {
        return Err(PluginError::PackageMetadataMissing(format!(
            "binary entry `{}` not found in {}",
            metadata.binary,
            path.display()
        )));
    }

    let sidecar = dest_dir.join(format!("{}.manifest.json", metadata.name));
    let sidecar_body = serde_json::to_vec_pretty(&serde_json::json!({
        "name": metadata.name,
        "version": metadata.version,
        "requiredTier": metadata.required_tier,
    }))?;
    fs::write(sidecar, sidecar_body)?;

    Ok(target)
}

/// Rejects absolute paths and any traversal-capable component.
fn validate_entry_path(path: &Path) -> Result<(), PluginError> {
    if path.is_absolute() {
        return Err(PluginError::DownloadUnsafePath {
            path: path.display().to_string(),
        });
    }
    for component in path.components() {
        if matches!(
            component,
            Component::ParentDir | Component::Prefix(_) | Component::RootDir
        ) {
            return Err(PluginError::DownloadUnsafePath {
                path: path.display().to_string(),
            });
        }
    }
    Ok(())
}

pub(crate) fn write_executable(target: &Path, bytes: &[u8]) -> Result<(), PluginError> {
    fs::write(target, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}
