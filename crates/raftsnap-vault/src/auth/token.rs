//! Preconfigured-token auth.

use std::time::Duration;

use crate::api::VaultApi;
use crate::auth::{login_error, AuthError};

/// Uses a preconfigured token instead of logging into a backend. The token
/// is handed to the client, which looks up its own TTL; a failed lookup
/// clears the token again.
#[derive(Debug)]
pub struct TokenAuth {
    token: String,
}

impl TokenAuth {
    #[must_use]
    pub fn new(token: String) -> Self {
        Self { token }
    }

    pub(crate) async fn login(&self, api: &dyn VaultApi) -> Result<Duration, AuthError> {
        api.login_with_token(&self.token)
            .await
            .map_err(|err| login_error("token", err))
    }
}
