//! Low-level Vault HTTP API.

use std::sync::RwLock;
use std::time::Duration;

use futures::StreamExt as _;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt as _};
use url::Url;

use crate::VaultConfig;

/// Errors from talking to the Vault HTTP API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request never produced a response.
    #[error("request to vault failed: {0}")]
    Transport(#[from] reqwest::Error),

    /// Vault answered with a non-success status.
    #[error("vault returned status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// Vault answered 2xx but the body was not in the expected shape.
    #[error("unexpected response from vault: {reason}")]
    Response { reason: String },

    /// Writing the snapshot stream into the sink failed.
    #[error("writing snapshot failed: {0}")]
    Sink(#[from] std::io::Error),
}

/// The operations the client needs from a Vault server.
///
/// [`VaultHttpApi`] is the production implementation; tests substitute
/// stubs to script leader state and snapshot payloads.
#[async_trait::async_trait]
pub trait VaultApi: Send + Sync {
    /// Address of the server, for error messages and logs.
    fn address(&self) -> &str;

    /// Whether this node is the current Raft leader.
    async fn is_leader(&self) -> Result<bool, ApiError>;

    /// Stream a consistent Raft snapshot into `sink`.
    async fn take_snapshot(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), ApiError>;

    /// Log into an auth backend (e.g. `auth/approle/login`) with the given
    /// credential payload. Stores the returned client token and returns the
    /// lease duration.
    async fn login(&self, path: &str, credentials: Value) -> Result<Duration, ApiError>;

    /// Use a preconfigured token: store it, look up its TTL via
    /// `auth/token/lookup-self` and return it. The token is cleared again
    /// when the lookup fails.
    async fn login_with_token(&self, token: &str) -> Result<Duration, ApiError>;
}

/// Production implementation of [`VaultApi`] over reqwest.
pub struct VaultHttpApi {
    address: Url,
    address_str: String,
    http: reqwest::Client,
    token: RwLock<Option<String>>,
}

#[derive(Deserialize)]
struct LeaderResponse {
    is_self: bool,
}

#[derive(Deserialize)]
struct LoginResponse {
    auth: Option<LoginAuth>,
}

#[derive(Deserialize)]
struct LoginAuth {
    client_token: String,
    lease_duration: u64,
}

#[derive(Deserialize)]
struct LookupSelfResponse {
    data: LookupSelfData,
}

#[derive(Deserialize)]
struct LookupSelfData {
    ttl: u64,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    errors: Vec<String>,
}

impl VaultHttpApi {
    /// Build the HTTP client with the configured timeout and TLS mode.
    ///
    /// # Errors
    ///
    /// Returns [`ApiError::Transport`] when the underlying client cannot be
    /// constructed.
    pub fn new(config: &VaultConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()?;

        Ok(Self {
            address_str: config.url.as_str().trim_end_matches('/').to_owned(),
            address: config.url.clone(),
            http,
            token: RwLock::new(None),
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, ApiError> {
        self.address
            .join(&format!("v1/{path}"))
            .map_err(|err| ApiError::Response {
                reason: format!("invalid api path {path}: {err}"),
            })
    }

    fn current_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|token| token.clone())
    }

    fn set_token(&self, token: Option<String>) {
        if let Ok(mut slot) = self.token.write() {
            *slot = token;
        }
    }

    fn get(&self, url: Url) -> reqwest::RequestBuilder {
        let mut request = self.http.get(url);
        if let Some(token) = self.current_token() {
            request = request.header("X-Vault-Token", token);
        }
        request
    }

    /// Turn a non-success response into [`ApiError::Rejected`], extracting
    /// Vault's `errors` array when present.
    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = match response.json::<ErrorResponse>().await {
            Ok(body) if !body.errors.is_empty() => body.errors.join("; "),
            _ => status
                .canonical_reason()
                .unwrap_or("unknown error")
                .to_owned(),
        };

        Err(ApiError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait::async_trait]
impl VaultApi for VaultHttpApi {
    fn address(&self) -> &str {
        &self.address_str
    }

    async fn is_leader(&self) -> Result<bool, ApiError> {
        let response = self.get(self.endpoint("sys/leader")?).send().await?;
        let leader: LeaderResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| ApiError::Response {
                reason: format!("invalid leader response: {err}"),
            })?;

        Ok(leader.is_self)
    }

    async fn take_snapshot(
        &self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), ApiError> {
        let response = self
            .get(self.endpoint("sys/storage/raft/snapshot")?)
            .send()
            .await?;
        let mut stream = Self::check_status(response).await?.bytes_stream();

        while let Some(chunk) = stream.next().await {
            sink.write_all(&chunk?).await?;
        }
        sink.flush().await?;

        Ok(())
    }

    async fn login(&self, path: &str, credentials: Value) -> Result<Duration, ApiError> {
        let response = self
            .http
            .post(self.endpoint(path)?)
            .json(&credentials)
            .send()
            .await?;
        let body: LoginResponse = Self::check_status(response)
            .await?
            .json()
            .await
            .map_err(|err| ApiError::Response {
                reason: format!("invalid login response: {err}"),
            })?;

        let auth = body.auth.ok_or_else(|| ApiError::Response {
            reason: "login response contained no auth lease".to_owned(),
        })?;

        self.set_token(Some(auth.client_token));
        Ok(Duration::from_secs(auth.lease_duration))
    }

    async fn login_with_token(&self, token: &str) -> Result<Duration, ApiError> {
        self.set_token(Some(token.to_owned()));

        let lookup = async {
            let response = self.get(self.endpoint("auth/token/lookup-self")?).send().await?;
            let body: LookupSelfResponse = Self::check_status(response)
                .await?
                .json()
                .await
                .map_err(|err| ApiError::Response {
                    reason: format!("invalid token lookup response: {err}"),
                })?;
            Ok(Duration::from_secs(body.data.ttl))
        };

        match lookup.await {
            Ok(ttl) => Ok(ttl),
            Err(err) => {
                self.set_token(None);
                Err(err)
            }
        }
    }
}
