//! GCP auth backend.
//!
//! GCE mode fetches a Vault-audience identity JWT from the metadata server.
//! IAM mode is selected by configuring a service-account email; the JWT is
//! then signed via the IAM credentials `signJwt` API.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::VaultApi;
use crate::auth::{login_error, AuthError};

const METADATA_BASE: &str = "http://metadata.google.internal/computeMetadata/v1";
const IAM_CREDENTIALS_BASE: &str = "https://iamcredentials.googleapis.com/v1";

/// Lifetime of self-signed IAM JWTs.
const JWT_TTL_SECS: u64 = 900;

fn default_path() -> String {
    "gcp".to_owned()
}

/// Configuration for the GCP auth backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GcpAuthConfig {
    /// Mount path of the backend.
    #[serde(default = "default_path")]
    pub path: String,
    pub role: String,
    /// Selects IAM mode: the JWT is signed for this service account instead
    /// of being requested from the GCE metadata server.
    #[serde(default)]
    pub service_account_email: Option<String>,
}

#[derive(Deserialize)]
struct AccessTokenResponse {
    access_token: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignJwtResponse {
    signed_jwt: String,
}

/// Logs in with a GCE identity JWT or an IAM-signed JWT.
#[derive(Debug)]
pub struct GcpAuth {
    config: GcpAuthConfig,
}

impl GcpAuth {
    #[must_use]
    pub fn new(config: GcpAuthConfig) -> Self {
        Self { config }
    }

    pub(crate) async fn login(&self, api: &dyn VaultApi) -> Result<Duration, AuthError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| credentials_error(format!("unable to build metadata client: {err}")))?;

        let jwt = match &self.config.service_account_email {
            Some(email) => self.signed_jwt(&http, email).await?,
            None => self.gce_identity_jwt(&http).await?,
        };

        let credentials: Value = json!({
            "role": self.config.role,
            "jwt": jwt,
        });

        api.login(&format!("auth/{}/login", self.config.path), credentials)
            .await
            .map_err(|err| login_error("gcp", err))
    }

    async fn gce_identity_jwt(&self, http: &reqwest::Client) -> Result<String, AuthError> {
        let audience = format!("vault/{}", self.config.role);

        http.get(format!(
            "{METADATA_BASE}/instance/service-accounts/default/identity"
        ))
        .query(&[("audience", audience.as_str()), ("format", "full")])
        .header("Metadata-Flavor", "Google")
        .send()
        .await
        .map_err(|err| credentials_error(format!("unable to fetch identity token: {err}")))?
        .error_for_status()
        .map_err(|err| credentials_error(format!("identity token request failed: {err}")))?
        .text()
        .await
        .map_err(|err| credentials_error(format!("unable to read identity token: {err}")))
    }

    async fn signed_jwt(
        &self,
        http: &reqwest::Client,
        email: &str,
    ) -> Result<String, AuthError> {
        let token: AccessTokenResponse = http
            .get(format!(
                "{METADATA_BASE}/instance/service-accounts/default/token"
            ))
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|err| credentials_error(format!("unable to fetch access token: {err}")))?
            .error_for_status()
            .map_err(|err| credentials_error(format!("access token request failed: {err}")))?
            .json()
            .await
            .map_err(|err| credentials_error(format!("invalid access token response: {err}")))?;

        let expires_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_err(|err| credentials_error(format!("system clock is before epoch: {err}")))?
            .as_secs()
            + JWT_TTL_SECS;

        let claims = json!({
            "sub": email,
            "aud": format!("vault/{}", self.config.role),
            "exp": expires_at,
        });

        let response: SignJwtResponse = http
            .post(format!(
                "{IAM_CREDENTIALS_BASE}/projects/-/serviceAccounts/{email}:signJwt"
            ))
            .bearer_auth(token.access_token)
            .json(&json!({"payload": claims.to_string()}))
            .send()
            .await
            .map_err(|err| credentials_error(format!("unable to sign jwt: {err}")))?
            .error_for_status()
            .map_err(|err| credentials_error(format!("signJwt request failed: {err}")))?
            .json()
            .await
            .map_err(|err| credentials_error(format!("invalid signJwt response: {err}")))?;

        Ok(response.signed_jwt)
    }
}

fn credentials_error(reason: String) -> AuthError {
    AuthError::Credentials {
        method: "gcp",
        reason,
    }
}
