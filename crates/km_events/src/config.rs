use std::{path::PathBuf, time::Duration};

/// Fully resolved, immutable configuration for one wrapper invocation.
///
/// Discovery (files, environment precedence) happens outside the core; by
/// the time this record exists every path is absolute and every knob has a
/// value. Components receive the fields they need through constructors —
/// there is no process-wide configuration singleton.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    /// Absolute backend base URL; empty disables egress together with
    /// `api_key`.
    pub api_url: String,
    /// `User-Agent` sent on every backend call.
    pub user_agent: String,
    /// Static API key; empty means anonymous / Free tier.
    pub api_key: String,
    /// Ordered plugin directories, absolute after `~` expansion.
    pub plugin_dirs: Vec<PathBuf>,
    pub debug: bool,
    /// Egress batch size N.
    pub batch_size: usize,
    /// Egress flush interval T.
    pub flush_interval: Duration,
    /// Per-attempt deadline for general HTTP calls.
    pub http_timeout: Duration,
    /// Per-attempt deadline for plugin binary downloads.
    pub download_timeout: Duration,
    pub max_retries: u32,
    /// Abort plugin loads on bad detached signatures. Defaults to strict
    /// outside debug mode.
    pub strict_signatures: bool,
    /// Cadence for plugin reload attempts and auth refresh.
    pub auth_refresh_interval: Duration,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            user_agent: format!("km/{}", env!("CARGO_PKG_VERSION")),
            api_key: String::new(),
            plugin_dirs: Vec::new(),
            debug: false,
            batch_size: 10,
            flush_interval: Duration::from_secs(5),
            http_timeout: Duration::from_secs(30),
            download_timeout: Duration::from_secs(240),
            max_retries: 3,
            strict_signatures: true,
            auth_refresh_interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("backend URL `{0}` is not absolute")]
    RelativeUrl(String),
    #[error("plugin directory `{0}` is not absolute")]
    RelativePluginDir(PathBuf),
    #[error("batch size must be at least 1")]
    ZeroBatchSize,
    #[error("flush interval must be positive")]
    ZeroFlushInterval,
}

impl ResolvedConfig {
    /// Whether any backend is configured at all. With neither an API key
    /// nor a URL the egress pipeline and plugin authorization become
    /// no-ops and no network traffic is attempted.
    pub fn backend_enabled(&self) -> bool {
        !(self.api_key.is_empty() && self.api_url.is_empty())
    }

    /// Checks the record's invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.api_url.is_empty()
            && !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://"))
        {
            return Err(ConfigError::RelativeUrl(self.api_url.clone()));
        }
        for dir in &self.plugin_dirs {
            if !dir.is_absolute() {
                return Err(ConfigError::RelativePluginDir(dir.clone()));
            }
        }
        if self.batch_size == 0 {
            return Err(ConfigError::ZeroBatchSize);
        }
        if self.flush_interval.is_zero() {
            return Err(ConfigError::ZeroFlushInterval);
        }
        Ok(())
    }
}

/// Expands a leading `~` against the user's home directory.
pub fn expand_home(raw: &str) -> PathBuf {
    if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs_home() {
            return home.join(rest);
        }
    } else if raw == "~" {
        if let Some(home) = dirs_home() {
            return home;
        }
    }
    PathBuf::from(raw)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        ResolvedConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_relative_url() {
        let cfg = ResolvedConfig {
            api_url: "api.example.com".into(),
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::RelativeUrl(_))));
    }

    #[test]
    fn rejects_zero_batch() {
        let cfg = ResolvedConfig {
            batch_size: 0,
            ..Default::default()
        };
        assert!(matches!(cfg.validate(), Err(ConfigError::ZeroBatchSize)));
    }

    #[test]
    fn backend_disabled_when_both_empty() {
        let cfg = ResolvedConfig::default();
        assert!(!cfg.backend_enabled());
        let cfg = ResolvedConfig {
            api_key: "km_live_abc".into(),
            ..Default::default()
        };
        assert!(cfg.backend_enabled());
    }

    #[test]
    fn expand_home_keeps_absolute_paths() {
        assert_eq!(expand_home("/opt/plugins"), PathBuf::from("/opt/plugins"));
    }
}
