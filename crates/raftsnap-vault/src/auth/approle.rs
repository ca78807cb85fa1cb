//! AppRole auth backend.

use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::api::VaultApi;
use crate::auth::{login_error, AuthError};

fn default_path() -> String {
    "approle".to_owned()
}

/// Configuration for the AppRole auth backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppRoleAuthConfig {
    /// Mount path of the backend.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(rename = "id")]
    pub role_id: String,
    #[serde(rename = "secret")]
    pub secret_id: String,
}

/// Logs in with a role-id/secret-id pair.
#[derive(Debug)]
pub struct AppRoleAuth {
    config: AppRoleAuthConfig,
}

impl AppRoleAuth {
    #[must_use]
    pub fn new(config: AppRoleAuthConfig) -> Self {
        Self { config }
    }

    pub(crate) async fn login(&self, api: &dyn VaultApi) -> Result<Duration, AuthError> {
        let credentials = json!({
            "role_id": self.config.role_id,
            "secret_id": self.config.secret_id,
        });

        api.login(&format!("auth/{}/login", self.config.path), credentials)
            .await
            .map_err(|err| login_error("approle", err))
    }
}
