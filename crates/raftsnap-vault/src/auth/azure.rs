//! Azure auth backend.
//!
//! Logs in with a managed-service-identity JWT obtained from the Azure
//! instance metadata service, together with the VM's identifying metadata.

use std::time::Duration;

use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::VaultApi;
use crate::auth::{login_error, AuthError};

const IMDS_TOKEN_URL: &str = "http://169.254.169.254/metadata/identity/oauth2/token";
const IMDS_INSTANCE_URL: &str = "http://169.254.169.254/metadata/instance";

fn default_path() -> String {
    "azure".to_owned()
}

fn default_resource() -> String {
    "https://management.azure.com/".to_owned()
}

/// Configuration for the Azure auth backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AzureAuthConfig {
    /// Mount path of the backend.
    #[serde(default = "default_path")]
    pub path: String,
    pub role: String,
    /// Audience the MSI token is requested for.
    #[serde(default = "default_resource")]
    pub resource: String,
}

#[derive(Deserialize)]
struct MsiTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InstanceMetadata {
    compute: ComputeMetadata,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeMetadata {
    #[serde(default)]
    subscription_id: String,
    #[serde(default)]
    resource_group_name: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    vm_scale_set_name: String,
}

/// Logs in with an MSI JWT from the instance metadata service.
#[derive(Debug)]
pub struct AzureAuth {
    config: AzureAuthConfig,
}

impl AzureAuth {
    #[must_use]
    pub fn new(config: AzureAuthConfig) -> Self {
        Self { config }
    }

    pub(crate) async fn login(&self, api: &dyn VaultApi) -> Result<Duration, AuthError> {
        let credentials = self.credentials().await?;

        api.login(&format!("auth/{}/login", self.config.path), credentials)
            .await
            .map_err(|err| login_error("azure", err))
    }

    async fn credentials(&self) -> Result<Value, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| credentials_error(format!("unable to build metadata client: {err}")))?;

        let token: MsiTokenResponse = http
            .get(IMDS_TOKEN_URL)
            .query(&[("api-version", "2018-02-01"), ("resource", &self.config.resource)])
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|err| credentials_error(format!("unable to fetch msi token: {err}")))?
            .error_for_status()
            .map_err(|err| credentials_error(format!("msi token request failed: {err}")))?
            .json()
            .await
            .map_err(|err| credentials_error(format!("invalid msi token response: {err}")))?;

        let instance: InstanceMetadata = http
            .get(IMDS_INSTANCE_URL)
            .query(&[("api-version", "2017-08-01")])
            .header("Metadata", "true")
            .send()
            .await
            .map_err(|err| credentials_error(format!("unable to fetch instance metadata: {err}")))?
            .error_for_status()
            .map_err(|err| credentials_error(format!("instance metadata request failed: {err}")))?
            .json()
            .await
            .map_err(|err| credentials_error(format!("invalid instance metadata: {err}")))?;

        let mut credentials = json!({
            "role": self.config.role,
            "jwt": token.access_token,
            "subscription_id": instance.compute.subscription_id,
            "resource_group_name": instance.compute.resource_group_name,
        });

        // A VM reports either its own name or its scale-set's name.
        if instance.compute.vm_scale_set_name.is_empty() {
            credentials["vm_name"] = json!(instance.compute.name);
        } else {
            credentials["vmss_name"] = json!(instance.compute.vm_scale_set_name);
        }

        Ok(credentials)
    }
}

fn credentials_error(reason: String) -> AuthError {
    AuthError::Credentials {
        method: "azure",
        reason,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_path_and_resource() {
        let config: AzureAuthConfig = serde_json::from_str(r#"{"role": "snapshots"}"#).unwrap();

        assert_eq!(config.path, "azure");
        assert_eq!(config.resource, "https://management.azure.com/");
    }
}
