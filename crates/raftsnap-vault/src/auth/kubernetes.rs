//! Kubernetes auth backend.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::api::VaultApi;
use crate::auth::{login_error, AuthError};

fn default_path() -> String {
    "kubernetes".to_owned()
}

fn default_jwt_path() -> PathBuf {
    PathBuf::from("/var/run/secrets/kubernetes.io/serviceaccount/token")
}

/// Configuration for the Kubernetes auth backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct KubernetesAuthConfig {
    /// Mount path of the backend.
    #[serde(default = "default_path")]
    pub path: String,
    pub role: String,
    /// Location of the projected service-account token.
    #[serde(default = "default_jwt_path")]
    pub jwt_path: PathBuf,
}

/// Logs in with the pod's projected service-account JWT.
#[derive(Debug)]
pub struct KubernetesAuth {
    config: KubernetesAuthConfig,
}

impl KubernetesAuth {
    #[must_use]
    pub fn new(config: KubernetesAuthConfig) -> Self {
        Self { config }
    }

    pub(crate) async fn login(&self, api: &dyn VaultApi) -> Result<Duration, AuthError> {
        let jwt = tokio::fs::read_to_string(&self.config.jwt_path)
            .await
            .map_err(|err| AuthError::Credentials {
                method: "kubernetes",
                reason: format!(
                    "unable to read service-account token {}: {err}",
                    self.config.jwt_path.display()
                ),
            })?;

        let credentials = json!({
            "role": self.config.role,
            "jwt": jwt.trim(),
        });

        api.login(&format!("auth/{}/login", self.config.path), credentials)
            .await
            .map_err(|err| login_error("kubernetes", err))
    }
}
