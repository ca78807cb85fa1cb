//! The leader-aware, auth-refreshing snapshot client.

use tokio::io::AsyncWrite;
use tokio::time::Instant;
use tracing::debug;

use crate::api::{ApiError, VaultApi, VaultHttpApi};
use crate::auth::{AuthError, AuthMethod};
use crate::{ConfigError, VaultConfig};

/// Errors from taking a snapshot.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Refreshing the auth lease failed; the server was not asked for a
    /// snapshot.
    #[error("could not refresh auth: {0}")]
    Auth(#[from] AuthError),

    /// The leader query itself failed.
    #[error("unable to determine leader status for {address}: {source}")]
    LeaderCheck {
        address: String,
        #[source]
        source: ApiError,
    },

    /// This node is not the Raft leader. Expected on standby nodes; the
    /// scheduler treats it as a skipped cycle.
    #[error("{address} is not the raft leader node")]
    NotLeader { address: String },

    /// Streaming the snapshot failed.
    #[error("unable to generate snapshot: {0}")]
    Snapshot(#[from] ApiError),
}

impl ClientError {
    /// Whether the error only means this node is not the leader.
    #[must_use]
    pub fn is_not_leader(&self) -> bool {
        matches!(self, Self::NotLeader { .. })
    }
}

/// Snapshot client holding the API handle, the active auth strategy and the
/// auth lease state.
///
/// The client is immutable apart from its lease bookkeeping;
/// reconfiguration constructs a new one.
pub struct VaultClient {
    api: Box<dyn VaultApi>,
    auth: AuthMethod,
    valid_until: Option<Instant>,
}

impl VaultClient {
    /// Build a client from configuration, selecting the auth strategy.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NoAuthConfigured`] when no auth block is
    /// present and [`ConfigError::Http`] when the HTTP client cannot be
    /// built.
    pub fn create(config: &VaultConfig) -> Result<Self, ConfigError> {
        let api = VaultHttpApi::new(config)?;
        let auth = AuthMethod::from_config(&config.auth)?;
        Ok(Self::new(Box::new(api), auth))
    }

    /// Assemble a client from parts. Tests use this to inject stub APIs.
    #[must_use]
    pub fn new(api: Box<dyn VaultApi>, auth: AuthMethod) -> Self {
        Self {
            api,
            auth,
            valid_until: None,
        }
    }

    /// Address of the Vault server this client talks to.
    #[must_use]
    pub fn address(&self) -> &str {
        self.api.address()
    }

    /// Stream a consistent Raft snapshot into `sink`.
    ///
    /// Refreshes the auth lease when it has passed its half-life and
    /// verifies this node is the cluster leader before streaming.
    ///
    /// # Errors
    ///
    /// See [`ClientError`]; [`ClientError::NotLeader`] is the expected
    /// outcome on standby nodes.
    pub async fn take_snapshot(
        &mut self,
        sink: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<(), ClientError> {
        self.refresh_auth().await?;

        let leader = self
            .api
            .is_leader()
            .await
            .map_err(|source| ClientError::LeaderCheck {
                address: self.api.address().to_owned(),
                source,
            })?;

        if !leader {
            return Err(ClientError::NotLeader {
                address: self.api.address().to_owned(),
            });
        }

        self.api
            .take_snapshot(sink)
            .await
            .map_err(ClientError::Snapshot)
    }

    /// Log in again once the previous lease has passed its half-life.
    ///
    /// Renewing at half-life keeps the token valid with margin to Vault's
    /// own expiry.
    async fn refresh_auth(&mut self) -> Result<(), ClientError> {
        let now = Instant::now();
        if self.valid_until.is_some_and(|valid_until| now < valid_until) {
            return Ok(());
        }

        let lease = self.auth.login(self.api.as_ref()).await?;
        self.valid_until = Some(now + lease / 2);
        debug!(
            method = self.auth.name(),
            lease_secs = lease.as_secs(),
            "auth refreshed"
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    use serde_json::Value;
    use tokio::io::AsyncWriteExt as _;

    use crate::auth::TokenAuth;

    use super::*;

    #[derive(Default)]
    struct ApiStub {
        leader: bool,
        leader_check_fails: bool,
        snapshot_data: &'static str,
        logins: AtomicUsize,
        snapshots: AtomicUsize,
        token_cleared: AtomicBool,
    }

    #[async_trait::async_trait]
    impl VaultApi for ApiStub {
        fn address(&self) -> &str {
            "http://stub:8200"
        }

        async fn is_leader(&self) -> Result<bool, ApiError> {
            if self.leader_check_fails {
                return Err(ApiError::Response {
                    reason: "leader check failed".to_owned(),
                });
            }
            Ok(self.leader)
        }

        async fn take_snapshot(
            &self,
            sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        ) -> Result<(), ApiError> {
            self.snapshots.fetch_add(1, Ordering::SeqCst);
            sink.write_all(self.snapshot_data.as_bytes()).await?;
            Ok(())
        }

        async fn login(&self, _path: &str, _credentials: Value) -> Result<Duration, ApiError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            Ok(Duration::from_secs(60))
        }

        async fn login_with_token(&self, _token: &str) -> Result<Duration, ApiError> {
            self.logins.fetch_add(1, Ordering::SeqCst);
            if self.token_cleared.load(Ordering::SeqCst) {
                return Err(ApiError::Rejected {
                    status: 403,
                    message: "token cleared".to_owned(),
                });
            }
            Ok(Duration::from_secs(60))
        }
    }

    #[async_trait::async_trait]
    impl VaultApi for &'static ApiStub {
        fn address(&self) -> &str {
            (**self).address()
        }
        async fn is_leader(&self) -> Result<bool, ApiError> {
            (**self).is_leader().await
        }
        async fn take_snapshot(
            &self,
            sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
        ) -> Result<(), ApiError> {
            (**self).take_snapshot(sink).await
        }
        async fn login(&self, path: &str, credentials: Value) -> Result<Duration, ApiError> {
            (**self).login(path, credentials).await
        }
        async fn login_with_token(&self, token: &str) -> Result<Duration, ApiError> {
            (**self).login_with_token(token).await
        }
    }

    fn client_with(stub: ApiStub) -> (VaultClient, &'static ApiStub) {
        let stub: &'static ApiStub = Box::leak(Box::new(stub));
        let client = VaultClient::new(
            Box::new(stub),
            AuthMethod::Token(TokenAuth::new("test-token".to_owned())),
        );
        (client, stub)
    }

    #[tokio::test]
    async fn snapshot_streams_data_from_the_leader() {
        let (mut client, _stub) = client_with(ApiStub {
            leader: true,
            snapshot_data: "snapshot-data",
            ..ApiStub::default()
        });

        let mut sink = Vec::new();
        client.take_snapshot(&mut sink).await.unwrap();

        assert_eq!(sink, b"snapshot-data");
    }

    #[tokio::test]
    async fn snapshot_from_a_standby_node_is_refused() {
        let (mut client, stub) = client_with(ApiStub {
            leader: false,
            ..ApiStub::default()
        });

        let mut sink = Vec::new();
        let err = client.take_snapshot(&mut sink).await.unwrap_err();

        assert!(err.is_not_leader());
        assert_eq!(stub.snapshots.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn leader_check_failure_is_distinguished_from_standby() {
        let (mut client, _stub) = client_with(ApiStub {
            leader_check_fails: true,
            ..ApiStub::default()
        });

        let mut sink = Vec::new();
        let err = client.take_snapshot(&mut sink).await.unwrap_err();

        assert!(matches!(err, ClientError::LeaderCheck { .. }));
        assert!(!err.is_not_leader());
    }

    #[tokio::test(start_paused = true)]
    async fn auth_is_renewed_at_lease_half_life() {
        // The stub issues 60s leases, so the client must log in again 30s
        // after the previous login.
        let (mut client, stub) = client_with(ApiStub {
            leader: true,
            ..ApiStub::default()
        });
        let mut sink = Vec::new();

        client.take_snapshot(&mut sink).await.unwrap();
        assert_eq!(stub.logins.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_secs(20)).await;
        client.take_snapshot(&mut sink).await.unwrap();
        assert_eq!(stub.logins.load(Ordering::SeqCst), 1, "lease still valid");

        tokio::time::advance(Duration::from_secs(11)).await;
        client.take_snapshot(&mut sink).await.unwrap();
        assert_eq!(stub.logins.load(Ordering::SeqCst), 2, "half-life passed");
    }

    #[tokio::test]
    async fn auth_failure_prevents_the_leader_check() {
        struct FailingAuthApi;

        #[async_trait::async_trait]
        impl VaultApi for FailingAuthApi {
            fn address(&self) -> &str {
                "http://stub:8200"
            }
            async fn is_leader(&self) -> Result<bool, ApiError> {
                panic!("leader check must not run when auth fails");
            }
            async fn take_snapshot(
                &self,
                _sink: &mut (dyn tokio::io::AsyncWrite + Send + Unpin),
            ) -> Result<(), ApiError> {
                panic!("snapshot must not run when auth fails");
            }
            async fn login(&self, _path: &str, _credentials: Value) -> Result<Duration, ApiError> {
                Err(ApiError::Rejected {
                    status: 403,
                    message: "permission denied".to_owned(),
                })
            }
            async fn login_with_token(&self, _token: &str) -> Result<Duration, ApiError> {
                Err(ApiError::Rejected {
                    status: 403,
                    message: "permission denied".to_owned(),
                })
            }
        }

        let mut client = VaultClient::new(
            Box::new(FailingAuthApi),
            AuthMethod::Token(TokenAuth::new("test-token".to_owned())),
        );

        let mut sink = Vec::new();
        let err = client.take_snapshot(&mut sink).await.unwrap_err();

        assert!(matches!(err, ClientError::Auth(_)));
    }
}
