//! Authenticated Vault Raft client for raftsnap.
//!
//! This crate talks to Vault's HTTP API to take consistent Raft snapshots.
//! [`VaultClient`] guards every snapshot with two checks: the auth lease is
//! refreshed when it has passed its half-life, and the snapshot is only
//! streamed from the current cluster leader. The low-level API lives behind
//! the [`VaultApi`] trait so tests can stub the server away.
//!
//! Authentication strategies for the supported auth backends are in
//! [`auth`]; exactly one is active per client.

pub mod auth;

mod api;
mod client;

use std::time::Duration;

use serde::Deserialize;
use url::Url;

pub use api::{ApiError, VaultApi, VaultHttpApi};
pub use client::{ClientError, VaultClient};

use auth::AuthConfig;

/// Connection and authentication configuration for the Vault client.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct VaultConfig {
    /// Address of the Vault server.
    pub url: Url,
    /// Timeout applied to every HTTP request.
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Disable TLS certificate verification. Test environments only.
    pub insecure: bool,
    /// Auth backend configuration; exactly one block may be present.
    pub auth: AuthConfig,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            timeout: Duration::from_secs(60),
            insecure: false,
            auth: AuthConfig::default(),
        }
    }
}

fn default_url() -> Url {
    // The literal is a valid URL; parsing cannot fail.
    match Url::parse("http://127.0.0.1:8200") {
        Ok(url) => url,
        Err(_) => unreachable!(),
    }
}

/// Errors from assembling a Vault client out of its configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// No auth backend block is configured.
    #[error("no vault auth method configured")]
    NoAuthConfigured,

    /// The HTTP client could not be constructed.
    #[error("unable to create vault client: {0}")]
    Http(#[from] ApiError),
}
