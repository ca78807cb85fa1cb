//! Authentication strategies for the supported Vault auth backends.
//!
//! Each strategy is built from its typed configuration block and is
//! stateless beyond the credentials it was constructed with: it assembles a
//! credential payload and performs one login against its backend, returning
//! the granted lease duration. Lease bookkeeping (half-life renewal) lives
//! in the client, not here.

mod approle;
mod aws;
mod azure;
mod gcp;
mod kubernetes;
mod ldap;
mod token;
mod userpass;

use std::time::Duration;

use serde::Deserialize;

pub use approle::{AppRoleAuth, AppRoleAuthConfig};
pub use aws::{AwsAuth, AwsAuthConfig, Ec2SignatureType};
pub use azure::{AzureAuth, AzureAuthConfig};
pub use gcp::{GcpAuth, GcpAuthConfig};
pub use kubernetes::{KubernetesAuth, KubernetesAuthConfig};
pub use ldap::{LdapAuth, LdapAuthConfig};
pub use token::TokenAuth;
pub use userpass::{UserPassAuth, UserPassAuthConfig};

use crate::api::{ApiError, VaultApi};
use crate::ConfigError;

/// Configuration for the auth backends. At most one block may be present;
/// when several are, the first in the priority order of
/// [`AuthMethod::from_config`] wins.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AuthConfig {
    pub app_role: Option<AppRoleAuthConfig>,
    pub aws: Option<AwsAuthConfig>,
    pub azure: Option<AzureAuthConfig>,
    pub gcp: Option<GcpAuthConfig>,
    pub kubernetes: Option<KubernetesAuthConfig>,
    pub ldap: Option<LdapAuthConfig>,
    pub user_pass: Option<UserPassAuthConfig>,
    pub token: Option<String>,
}

/// Errors from logging into an auth backend.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// The login request could not be assembled, e.g. an unreadable
    /// service-account JWT file.
    #[error("unable to build credentials for {method} auth: {reason}")]
    Credentials {
        method: &'static str,
        reason: String,
    },

    /// The backend refused the login or granted no lease.
    #[error("login to {method} auth backend failed: {source}")]
    Rejected {
        method: &'static str,
        #[source]
        source: ApiError,
    },

    /// The backend was unreachable.
    #[error("vault is unreachable: {0}")]
    Transport(#[source] ApiError),
}

/// Classify a login failure: network problems are transient, everything
/// else counts as a rejection by the backend.
fn login_error(method: &'static str, source: ApiError) -> AuthError {
    match source {
        ApiError::Transport(_) | ApiError::Sink(_) => AuthError::Transport(source),
        ApiError::Rejected { .. } | ApiError::Response { .. } => {
            AuthError::Rejected { method, source }
        }
    }
}

/// The active authentication strategy.
#[derive(Debug)]
pub enum AuthMethod {
    AppRole(AppRoleAuth),
    Aws(AwsAuth),
    Azure(AzureAuth),
    Gcp(GcpAuth),
    Kubernetes(KubernetesAuth),
    Ldap(LdapAuth),
    UserPass(UserPassAuth),
    Token(TokenAuth),
}

impl AuthMethod {
    /// Select the strategy from configuration.
    ///
    /// The first configured block wins, in the fixed order AppRole, AWS,
    /// Azure, GCP, Kubernetes, LDAP, Userpass, Token.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoAuthConfigured`] when no block is present.
    pub fn from_config(config: &AuthConfig) -> Result<Self, ConfigError> {
        if let Some(app_role) = &config.app_role {
            Ok(Self::AppRole(AppRoleAuth::new(app_role.clone())))
        } else if let Some(aws) = &config.aws {
            Ok(Self::Aws(AwsAuth::new(aws.clone())))
        } else if let Some(azure) = &config.azure {
            Ok(Self::Azure(AzureAuth::new(azure.clone())))
        } else if let Some(gcp) = &config.gcp {
            Ok(Self::Gcp(GcpAuth::new(gcp.clone())))
        } else if let Some(kubernetes) = &config.kubernetes {
            Ok(Self::Kubernetes(KubernetesAuth::new(kubernetes.clone())))
        } else if let Some(ldap) = &config.ldap {
            Ok(Self::Ldap(LdapAuth::new(ldap.clone())))
        } else if let Some(user_pass) = &config.user_pass {
            Ok(Self::UserPass(UserPassAuth::new(user_pass.clone())))
        } else if let Some(token) = &config.token {
            Ok(Self::Token(TokenAuth::new(token.clone())))
        } else {
            Err(ConfigError::NoAuthConfigured)
        }
    }

    /// Name of the auth backend, for logs and errors.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::AppRole(_) => "approle",
            Self::Aws(_) => "aws",
            Self::Azure(_) => "azure",
            Self::Gcp(_) => "gcp",
            Self::Kubernetes(_) => "kubernetes",
            Self::Ldap(_) => "ldap",
            Self::UserPass(_) => "userpass",
            Self::Token(_) => "token",
        }
    }

    /// Log in and return the granted lease duration.
    ///
    /// # Errors
    ///
    /// See [`AuthError`].
    pub async fn login(&self, api: &dyn VaultApi) -> Result<Duration, AuthError> {
        match self {
            Self::AppRole(auth) => auth.login(api).await,
            Self::Aws(auth) => auth.login(api).await,
            Self::Azure(auth) => auth.login(api).await,
            Self::Gcp(auth) => auth.login(api).await,
            Self::Kubernetes(auth) => auth.login(api).await,
            Self::Ldap(auth) => auth.login(api).await,
            Self::UserPass(auth) => auth.login(api).await,
            Self::Token(auth) => auth.login(api).await,
        }
    }
}
