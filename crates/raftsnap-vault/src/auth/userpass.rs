//! Userpass auth backend.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::api::VaultApi;
use crate::auth::{login_error, AuthError};

fn default_path() -> String {
    "userpass".to_owned()
}

/// Configuration for the userpass auth backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserPassAuthConfig {
    /// Mount path of the backend.
    #[serde(default = "default_path")]
    pub path: String,
    pub username: String,
    pub password: String,
}

/// Logs in with a username/password pair.
#[derive(Debug)]
pub struct UserPassAuth {
    config: UserPassAuthConfig,
}

impl UserPassAuth {
    #[must_use]
    pub fn new(config: UserPassAuthConfig) -> Self {
        Self { config }
    }

    pub(crate) async fn login(&self, api: &dyn VaultApi) -> Result<Duration, AuthError> {
        let path = format!(
            "auth/{}/login/{}",
            self.config.path, self.config.username
        );

        api.login(&path, json!({"password": self.config.password}))
            .await
            .map_err(|err| login_error("userpass", err))
    }
}
