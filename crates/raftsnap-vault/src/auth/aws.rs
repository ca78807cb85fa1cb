//! AWS auth backend.
//!
//! Two modes, mirroring Vault's backend: EC2 instance-identity login when an
//! `ec2Nonce` is configured, IAM login with the caller's credentials
//! otherwise. The IAM flow signs an `sts:GetCallerIdentity` request and
//! hands the signed parts to Vault, which replays them against STS.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::VaultApi;
use crate::auth::{login_error, AuthError};

const STS_URL: &str = "https://sts.amazonaws.com/";
const STS_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";

const IMDS_BASE: &str = "http://169.254.169.254";
const IMDS_TOKEN_TTL_SECS: &str = "60";

fn default_path() -> String {
    "aws".to_owned()
}

/// Signature flavor for the EC2 instance-identity login.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ec2SignatureType {
    /// PKCS#7 signature (SHA-1), the backend's default.
    #[default]
    Pkcs7,
    /// Plain identity document plus detached signature.
    Identity,
    /// PKCS#7 signature over the RSA-2048 document.
    Rsa2048,
}

/// Configuration for the AWS auth backend.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AwsAuthConfig {
    /// Mount path of the backend.
    #[serde(default = "default_path")]
    pub path: String,
    #[serde(default)]
    pub role: Option<String>,
    /// Region used to sign the IAM request; the STS default region applies
    /// when absent.
    #[serde(default)]
    pub region: Option<String>,
    /// Enables EC2 instance-identity login and pins the reauthentication
    /// nonce.
    #[serde(default)]
    pub ec2_nonce: Option<String>,
    #[serde(default)]
    pub ec2_signature_type: Ec2SignatureType,
    /// Value for the `X-Vault-AWS-IAM-Server-ID` header, signed along with
    /// the IAM request.
    #[serde(default)]
    pub iam_server_id_header: Option<String>,
}

/// Logs in via EC2 instance identity or signed IAM credentials.
#[derive(Debug)]
pub struct AwsAuth {
    config: AwsAuthConfig,
}

impl AwsAuth {
    #[must_use]
    pub fn new(config: AwsAuthConfig) -> Self {
        Self { config }
    }

    pub(crate) async fn login(&self, api: &dyn VaultApi) -> Result<Duration, AuthError> {
        let mut credentials = if self.config.ec2_nonce.is_some() {
            self.ec2_credentials().await?
        } else {
            self.iam_credentials().await?
        };

        if let Some(role) = &self.config.role {
            credentials["role"] = json!(role);
        }

        api.login(&format!("auth/{}/login", self.config.path), credentials)
            .await
            .map_err(|err| login_error("aws", err))
    }

    /// Fetch the instance-identity material from IMDS in the configured
    /// signature flavor.
    async fn ec2_credentials(&self) -> Result<Value, AuthError> {
        let Some(nonce) = &self.config.ec2_nonce else {
            return Err(credentials_error("ec2 login requires a nonce"));
        };

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| credentials_error(format!("unable to build imds client: {err}")))?;

        // IMDSv2 when available; fall back to IMDSv1 silently.
        let imds_token = http
            .put(format!("{IMDS_BASE}/latest/api/token"))
            .header("X-aws-ec2-metadata-token-ttl-seconds", IMDS_TOKEN_TTL_SECS)
            .send()
            .await
            .ok()
            .filter(|response| response.status().is_success());
        let imds_token = match imds_token {
            Some(response) => response.text().await.ok(),
            None => None,
        };

        let fetch = |doc: &'static str| {
            let http = http.clone();
            let imds_token = imds_token.clone();
            async move {
                let mut request =
                    http.get(format!("{IMDS_BASE}/latest/dynamic/instance-identity/{doc}"));
                if let Some(token) = &imds_token {
                    request = request.header("X-aws-ec2-metadata-token", token);
                }
                let response = request.send().await.map_err(|err| {
                    credentials_error(format!("unable to fetch instance identity {doc}: {err}"))
                })?;
                if !response.status().is_success() {
                    return Err(credentials_error(format!(
                        "instance identity {doc} request returned {}",
                        response.status()
                    )));
                }
                response.text().await.map_err(|err| {
                    credentials_error(format!("unable to read instance identity {doc}: {err}"))
                })
            }
        };

        let credentials = match self.config.ec2_signature_type {
            Ec2SignatureType::Pkcs7 => {
                let pkcs7 = fetch("pkcs7").await?;
                json!({"pkcs7": pkcs7.replace('\n', ""), "nonce": nonce})
            }
            Ec2SignatureType::Identity => {
                let document = fetch("document").await?;
                let signature = fetch("signature").await?;
                json!({
                    "identity": BASE64.encode(document),
                    "signature": signature.replace('\n', ""),
                    "nonce": nonce,
                })
            }
            Ec2SignatureType::Rsa2048 => {
                let pkcs7 = fetch("rsa2048").await?;
                json!({"pkcs7": pkcs7.replace('\n', ""), "nonce": nonce})
            }
        };

        Ok(credentials)
    }

    /// Sign an `sts:GetCallerIdentity` request with the caller's credentials
    /// and encode the parts the way the backend expects them.
    async fn iam_credentials(&self) -> Result<Value, AuthError> {
        use aws_config::BehaviorVersion;
        use aws_credential_types::provider::ProvideCredentials as _;
        use aws_sigv4::http_request::{sign, SignableBody, SignableRequest, SigningSettings};
        use aws_sigv4::sign::v4;

        let sdk_config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        let provider = sdk_config
            .credentials_provider()
            .ok_or_else(|| credentials_error("no aws credentials provider available"))?;
        let credentials = provider
            .provide_credentials()
            .await
            .map_err(|err| credentials_error(format!("unable to resolve aws credentials: {err}")))?;

        let mut headers: BTreeMap<&'static str, String> = BTreeMap::new();
        headers.insert("Host", "sts.amazonaws.com".to_owned());
        headers.insert(
            "Content-Type",
            "application/x-www-form-urlencoded; charset=utf-8".to_owned(),
        );
        if let Some(server_id) = &self.config.iam_server_id_header {
            headers.insert("X-Vault-AWS-IAM-Server-ID", server_id.clone());
        }

        let region = self.config.region.as_deref().unwrap_or("us-east-1");
        let identity = credentials.into();
        let signing_params = v4::SigningParams::builder()
            .identity(&identity)
            .region(region)
            .name("sts")
            .time(SystemTime::now())
            .settings(SigningSettings::default())
            .build()
            .map_err(|err| credentials_error(format!("unable to build signing params: {err}")))?;

        let signable = SignableRequest::new(
            "POST",
            STS_URL,
            headers.iter().map(|(name, value)| (*name, value.as_str())),
            SignableBody::Bytes(STS_BODY.as_bytes()),
        )
        .map_err(|err| credentials_error(format!("unable to build sts request: {err}")))?;

        let (instructions, _signature) = sign(signable, &signing_params.into())
            .map_err(|err| credentials_error(format!("unable to sign sts request: {err}")))?
            .into_parts();

        let mut signed_headers: BTreeMap<String, Vec<String>> = headers
            .into_iter()
            .map(|(name, value)| (name.to_owned(), vec![value]))
            .collect();
        for (name, value) in instructions.headers() {
            signed_headers.insert(name.to_owned(), vec![value.to_owned()]);
        }

        let headers_json = serde_json::to_string(&signed_headers)
            .map_err(|err| credentials_error(format!("unable to encode headers: {err}")))?;

        Ok(json!({
            "iam_http_request_method": "POST",
            "iam_request_url": BASE64.encode(STS_URL),
            "iam_request_body": BASE64.encode(STS_BODY),
            "iam_request_headers": BASE64.encode(headers_json),
        }))
    }
}

fn credentials_error(reason: impl Into<String>) -> AuthError {
    AuthError::Credentials {
        method: "aws",
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_defaults_to_iam_mode_with_pkcs7_fallback() {
        let config: AwsAuthConfig = serde_json::from_str(r#"{"role": "snapshots"}"#).unwrap();

        assert_eq!(config.path, "aws");
        assert_eq!(config.ec2_nonce, None);
        assert_eq!(config.ec2_signature_type, Ec2SignatureType::Pkcs7);
    }

    #[test]
    fn signature_type_parses_lowercase_names() {
        let config: AwsAuthConfig = serde_json::from_str(
            r#"{"ec2Nonce": "nonce", "ec2SignatureType": "rsa2048"}"#,
        )
        .unwrap();

        assert_eq!(config.ec2_signature_type, Ec2SignatureType::Rsa2048);
    }
}
