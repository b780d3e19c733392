//! Configuration
//!
//! Settings come from a TOML file, then `TUFROOT_*` environment variables,
//! then command line flags, each layer overriding the previous one.
//!
//! ```toml
//! server-url = "https://api.foundries.io"
//! factory = "acme"
//! token = "..."
//! default-key-type = "ed25519"
//!
//! [audit]
//! enabled = true
//! file = "/var/log/tufroot-audit.log"
//! ```

use crate::api::HttpFactoryApi;
use crate::audit::{AuditConfig, LogDestination};
use crate::error::TufError;
use crate::signature::KeyType;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_URL: &str = "https://api.foundries.io";

pub const CONFIG_ENV: &str = "TUFROOT_CONFIG";
pub const SERVER_ENV: &str = "TUFROOT_SERVER";
pub const FACTORY_ENV: &str = "TUFROOT_FACTORY";
pub const TOKEN_ENV: &str = "TUFROOT_TOKEN";

const CONFIG_FILE_NAME: &str = "tufroot.toml";

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    pub server_url: String,
    pub factory: Option<String>,
    pub token: Option<String>,
    /// Key type of newly generated offline keys
    pub default_key_type: KeyType,
    pub audit: AuditSection,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct AuditSection {
    pub enabled: bool,
    /// Append audit events to this file instead of stderr
    pub file: Option<String>,
    pub json: bool,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            enabled: false,
            file: None,
            json: true,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            factory: None,
            token: None,
            default_key_type: KeyType::Ed25519,
            audit: AuditSection::default(),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("server_url", &self.server_url)
            .field("factory", &self.factory)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .field("default_key_type", &self.default_key_type)
            .field("audit", &self.audit)
            .finish()
    }
}

impl Config {
    pub fn from_toml(text: &str) -> Result<Self, TufError> {
        toml::from_str(text).map_err(|e| TufError::ConfigError(e.to_string()))
    }

    /// Load the configuration file and apply environment overrides.
    ///
    /// An explicit `path` must exist. Otherwise a missing file at the default
    /// location yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, TufError> {
        let lookup = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        let mut config = match path {
            Some(p) => Self::read(p)?,
            None => match default_path(lookup) {
                Some(p) if p.exists() => Self::read(&p)?,
                _ => Self::default(),
            },
        };
        config.apply_env(lookup);
        Ok(config)
    }

    fn read(path: &Path) -> Result<Self, TufError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            TufError::ConfigError(format!("Unable to read '{}': {}", path.display(), e))
        })?;
        log::debug!("Loaded configuration from {}", path.display());
        Self::from_toml(&text)
            .map_err(|e| TufError::ConfigError(format!("'{}': {}", path.display(), e)))
    }

    /// Apply `TUFROOT_SERVER`, `TUFROOT_FACTORY` and `TUFROOT_TOKEN`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup(SERVER_ENV) {
            self.server_url = v;
        }
        if let Some(v) = lookup(FACTORY_ENV) {
            self.factory = Some(v);
        }
        if let Some(v) = lookup(TOKEN_ENV) {
            self.token = Some(v);
        }
    }

    /// Apply command line flags.
    pub fn with_overrides(
        mut self,
        factory: Option<&str>,
        server_url: Option<&str>,
        token: Option<&str>,
    ) -> Self {
        if let Some(v) = factory {
            self.factory = Some(v.to_string());
        }
        if let Some(v) = server_url {
            self.server_url = v.to_string();
        }
        if let Some(v) = token {
            self.token = Some(v.to_string());
        }
        self
    }

    /// Check that everything a server command needs is set.
    pub fn validate(&self) -> Result<(), TufError> {
        if self.server_url.is_empty() {
            return Err(TufError::ConfigError("The server URL is empty".to_string()));
        }
        if self.factory.as_deref().map_or(true, str::is_empty) {
            return Err(TufError::ConfigError(format!(
                "No Factory configured: pass --factory or set {}",
                FACTORY_ENV
            )));
        }
        if self.token.as_deref().map_or(true, str::is_empty) {
            return Err(TufError::ConfigError(format!(
                "No API token configured: pass --token or set {}",
                TOKEN_ENV
            )));
        }
        Ok(())
    }

    /// HTTP client for the configured Factory.
    pub fn api(&self) -> Result<HttpFactoryApi, TufError> {
        self.validate()?;
        Ok(HttpFactoryApi::new(
            &self.server_url,
            self.factory.as_deref().unwrap_or_default(),
            self.token.as_deref().unwrap_or_default(),
        ))
    }

    pub fn audit_config(&self) -> AuditConfig {
        AuditConfig {
            enabled: self.audit.enabled || self.audit.file.is_some(),
            destination: match &self.audit.file {
                Some(path) => LogDestination::File(path.clone()),
                None => LogDestination::Stderr,
            },
            json_format: self.audit.json,
            ..Default::default()
        }
    }
}

/// `$TUFROOT_CONFIG`, else `$XDG_CONFIG_HOME/tufroot.toml`, else `$HOME/.config/tufroot.toml`.
pub fn default_path<F>(lookup: F) -> Option<PathBuf>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(p) = lookup(CONFIG_ENV) {
        return Some(PathBuf::from(p));
    }
    if let Some(dir) = lookup("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(dir).join(CONFIG_FILE_NAME));
    }
    lookup("HOME").map(|home| PathBuf::from(home).join(".config").join(CONFIG_FILE_NAME))
}
