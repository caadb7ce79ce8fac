use std::{
    collections::BTreeMap,
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::Mutex,
};

use km_api::Tier;
use serde::{Deserialize, Serialize};

use crate::PluginError;

/// Persisted record of what is installed, plus the customer identity the
/// installs were authorized under.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDoc {
    #[serde(default)]
    pub customer_id: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub plugins: BTreeMap<String, RegistryEntry>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEntry {
    pub version: String,
    pub required_tier: Tier,
    /// RFC3339 install time.
    pub installed_at: String,
    pub enabled: bool,
}

/// The on-disk registry. Every write replaces the whole document through a
/// temp-file + fsync + rename so readers never observe a partial file.
pub struct Registry {
    path: PathBuf,
    lock: Mutex<()>,
}

impl Registry {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// `<config dir>/kilometers/registry.json`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kilometers")
            .join("registry.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing file is an empty registry; an unparseable one is
    /// [`PluginError::RegistryCorrupt`] and is never auto-repaired.
    pub fn load(&self) -> Result<RegistryDoc, PluginError> {
        let _guard = self.lock.lock().expect("registry lock");
        self.load_locked()
    }

    pub fn record_install(
        &self,
        name: &str,
        version: &str,
        required_tier: Tier,
    ) -> Result<(), PluginError> {
        let _guard = self.lock.lock().expect("registry lock");
        let mut doc = self.load_locked()?;
        doc.plugins.insert(
            name.to_string(),
            RegistryEntry {
                version: version.to_string(),
                required_tier,
                installed_at: now_rfc3339(),
                enabled: true,
            },
        );
        self.store_locked(&doc)
    }

    pub fn remove(&self, name: &str) -> Result<(), PluginError> {
        let _guard = self.lock.lock().expect("registry lock");
        let mut doc = self.load_locked()?;
        doc.plugins.remove(name);
        self.store_locked(&doc)
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<(), PluginError> {
        let _guard = self.lock.lock().expect("registry lock");
        let mut doc = self.load_locked()?;
        if let Some(entry) = doc.plugins.get_mut(name) {
            entry.enabled = enabled;
        }
        self.store_locked(&doc)
    }

    pub fn set_identity(&self, customer_id: &str, tier: Tier) -> Result<(), PluginError> {
        let _guard = self.lock.lock().expect("registry lock");
        let mut doc = self.load_locked()?;
        doc.customer_id = customer_id.to_string();
        doc.tier = tier;
        self.store_locked(&doc)
    }

    pub fn installed_version(&self, name: &str) -> Result<Option<String>, PluginError> {
        Ok(self.load()?.plugins.get(name).map(|e| e.version.clone()))
    }

    fn load_locked(&self) -> Result<RegistryDoc, PluginError> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RegistryDoc::default())
            }
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|err| PluginError::RegistryCorrupt(format!("{}: {err}", self.path.display())))
    }

    fn store_locked(&self, doc: &RegistryDoc) -> Result<(), PluginError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(doc)?;
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut temp = tempfile::NamedTempFile::new_in(parent)?;
        temp.write_all(&body)?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .map_err(|err| PluginError::Io(err.error))?;
        Ok(())
    }
}

fn now_rfc3339() -> String {
    time::OffsetDateTime::now_utc()
        .format(&time::format_description::well_known::Rfc3339)
        .unwrap_or_default()
}
