//! Agent configuration.
//!
//! Configuration is read from a single YAML, JSON, or TOML file (chosen by
//! extension) and finished with the documented environment overrides.
//! Relative paths in the file resolve against the file's own directory, so
//! a config bundle can be moved around as a unit.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::format::{Item, StrftimeItems};
use figment::providers::{Format as _, Json, Toml, Yaml};
use figment::Figment;
use serde::Deserialize;
use url::Url;

use raftsnap_upload::UploadersConfig;
use raftsnap_vault::auth::AuthMethod;
use raftsnap_vault::VaultConfig;

/// Environment variable overriding `vault.url`.
const ENV_VAULT_ADDR: &str = "VAULT_ADDR";
/// Environment variables overriding the S3 uploader's static credentials.
const ENV_AWS_KEY: &str = "AWS_ACCESS_KEY_ID";
const ENV_AWS_SECRET: &str = "AWS_SECRET_ACCESS_KEY";

/// Errors from loading or validating the configuration. All of them are
/// fatal at startup; during a reload they leave the previous configuration
/// in place.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unsupported configuration format: {}", path.display())]
    UnsupportedFormat { path: PathBuf },

    #[error("could not read configuration from {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: Box<figment::Error>,
    },

    #[error("invalid value in {var}: {reason}")]
    Env { var: &'static str, reason: String },

    #[error("no uploaders configured")]
    NoUploadersConfigured,

    #[error(transparent)]
    Vault(#[from] raftsnap_vault::ConfigError),

    #[error("invalid timestamp format {format:?}")]
    InvalidTimestampFormat { format: String },
}

/// Timing and naming of snapshot runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct SnapshotsConfig {
    /// How often a snapshot is taken.
    #[serde(with = "humantime_serde")]
    pub frequency: Duration,
    /// How many snapshots to keep per destination; zero keeps all.
    pub retain: usize,
    /// Deadline for a single snapshot run, including uploads.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub name_prefix: String,
    pub name_suffix: String,
    /// chrono strftime pattern rendered into the snapshot name.
    pub timestamp_format: String,
}

impl Default for SnapshotsConfig {
    fn default() -> Self {
        Self {
            frequency: Duration::from_secs(60 * 60),
            retain: 0,
            timeout: Duration::from_secs(60),
            name_prefix: "raft-snapshot-".to_owned(),
            name_suffix: ".snap".to_owned(),
            timestamp_format: "%Y-%m-%dT%H-%M-%S%z".to_owned(),
        }
    }
}

/// The complete agent configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct Config {
    pub vault: VaultConfig,
    pub snapshots: SnapshotsConfig,
    pub uploaders: UploadersConfig,
}

impl Config {
    /// Load the configuration from `path`, apply environment overrides,
    /// resolve relative paths, and validate.
    ///
    /// # Errors
    ///
    /// See [`ConfigError`].
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let extension = path
            .extension()
            .and_then(|extension| extension.to_str())
            .unwrap_or_default();

        let figment = match extension {
            "yaml" | "yml" => Figment::from(Yaml::file_exact(path)),
            "json" => Figment::from(Json::file_exact(path)),
            "toml" => Figment::from(Toml::file_exact(path)),
            _ => {
                return Err(ConfigError::UnsupportedFormat {
                    path: path.to_path_buf(),
                })
            }
        };

        let mut config: Self = figment.extract().map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source: Box::new(source),
        })?;

        config.apply_env_overrides()?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        config.validate()?;

        Ok(config)
    }

    /// Apply the documented environment bindings, which always win over the
    /// file.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    fn apply_overrides(
        &mut self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(address) = env(ENV_VAULT_ADDR) {
            self.vault.url = Url::parse(&address).map_err(|err| ConfigError::Env {
                var: ENV_VAULT_ADDR,
                reason: err.to_string(),
            })?;
        }

        // The credential binding is unconditional: with no aws block in the
        // file, the variables alone bring the destination into existence.
        if let (Some(key), Some(secret)) = (env(ENV_AWS_KEY), env(ENV_AWS_SECRET)) {
            self.uploaders
                .aws
                .get_or_insert_with(raftsnap_upload::S3UploaderConfig::default)
                .credentials = Some(raftsnap_upload::S3CredentialsConfig { key, secret });
        }

        Ok(())
    }

    /// Resolve relative paths against the config file's directory.
    fn resolve_paths(&mut self, base: &Path) {
        if let Some(local) = &mut self.uploaders.local {
            if local.path.is_relative() {
                local.path = base.join(&local.path);
            }
        }

        if let Some(kubernetes) = &mut self.vault.auth.kubernetes {
            if kubernetes.jwt_path.is_relative() {
                kubernetes.jwt_path = base.join(&kubernetes.jwt_path);
            }
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.uploaders.has_uploaders() {
            return Err(ConfigError::NoUploadersConfigured);
        }

        // Fail early on an unusable auth block instead of on the first run.
        AuthMethod::from_config(&self.vault.auth)?;

        let format = &self.snapshots.timestamp_format;
        if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
            return Err(ConfigError::InvalidTimestampFormat {
                format: format.clone(),
            });
        }

        Ok(())
    }
}
