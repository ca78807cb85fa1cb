//! OpenStack Swift destination.
//!
//! There is no maintained Swift SDK for Rust, so this adapter speaks the
//! Swift REST API directly: it authenticates once at construction (TempAuth
//! v1 or Keystone v2/v3, chosen from the auth URL), verifies the container,
//! and then uses the storage URL and token for all object operations.

use std::cmp::Ordering;
use std::time::Duration;

use anyhow::Context as _;
use chrono::NaiveDateTime;
use reqwest::{Body, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio_util::io::ReaderStream;
use url::Url;

use crate::snapshot_file::SnapshotFile;
use crate::uploader::Uploader;
use crate::{SnapshotStorage, UploaderError};

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

/// Configuration for the OpenStack Swift destination.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SwiftUploaderConfig {
    pub container: String,
    pub user_name: String,
    pub api_key: String,
    /// Authentication endpoint; the path decides the protocol
    /// (`/v3` Keystone v3, `/v2.0` Keystone v2, anything else TempAuth v1).
    pub auth_url: Url,
    #[serde(default)]
    pub domain: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,
}

/// Stores snapshots as objects in a Swift container.
pub struct SwiftStorage {
    http: reqwest::Client,
    storage_url: Url,
    token: String,
    container: String,
}

/// An object listing entry in the container.
#[derive(Debug, Clone, Deserialize)]
pub struct SwiftObject {
    pub name: String,
    #[serde(deserialize_with = "deserialize_swift_timestamp")]
    pub last_modified: NaiveDateTime,
}

/// Swift reports object timestamps as local-less ISO strings with
/// fractional seconds, e.g. `2016-04-28T23:11:47.511700`.
fn deserialize_swift_timestamp<'de, D>(deserializer: D) -> Result<NaiveDateTime, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f").map_err(serde::de::Error::custom)
}

impl SwiftStorage {
    /// Authenticate and create an uploader targeting the configured
    /// container.
    ///
    /// # Errors
    ///
    /// Returns [`UploaderError::Destination`] when authentication fails or
    /// the container does not exist.
    pub async fn create(config: &SwiftUploaderConfig) -> Result<Uploader<Self>, UploaderError> {
        let destination = format!("swift container {}", config.container);
        let unavailable = |source: anyhow::Error| UploaderError::Destination {
            destination: destination.clone(),
            source,
        };

        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| unavailable(anyhow::Error::new(err)))?;

        let (storage_url, token) = authenticate(&http, config)
            .await
            .map_err(&unavailable)?;

        let storage = Self {
            http,
            storage_url,
            token,
            container: config.container.clone(),
        };

        // Verify the container exists before accepting the configuration.
        let response = storage
            .http
            .head(storage.container_url().map_err(&unavailable)?)
            .header("X-Auth-Token", &storage.token)
            .send()
            .await
            .map_err(|err| unavailable(anyhow::Error::new(err)))?;
        if !response.status().is_success() {
            return Err(unavailable(anyhow::anyhow!(
                "container check returned {}",
                response.status()
            )));
        }

        Ok(Uploader::new(storage))
    }

    fn container_url(&self) -> anyhow::Result<Url> {
        join_segments(&self.storage_url, &[self.container.as_str()])
    }

    fn object_url(&self, name: &str) -> anyhow::Result<Url> {
        join_segments(&self.storage_url, &[self.container.as_str(), name])
    }
}

/// Append path segments to a base URL without disturbing its existing path.
fn join_segments(base: &Url, segments: &[&str]) -> anyhow::Result<Url> {
    let mut url = base.clone();
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|()| anyhow::anyhow!("storage url cannot be a base"))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    Ok(url)
}

/// Authenticate against the configured endpoint and return the object-store
/// URL and token.
async fn authenticate(
    http: &reqwest::Client,
    config: &SwiftUploaderConfig,
) -> anyhow::Result<(Url, String)> {
    let path = config.auth_url.path();
    if path.contains("/v3") {
        authenticate_v3(http, config).await
    } else if path.contains("/v2") {
        authenticate_v2(http, config).await
    } else {
        authenticate_v1(http, config).await
    }
}

/// TempAuth: credentials in headers, results in headers.
async fn authenticate_v1(
    http: &reqwest::Client,
    config: &SwiftUploaderConfig,
) -> anyhow::Result<(Url, String)> {
    let response = http
        .get(config.auth_url.clone())
        .header("X-Auth-User", &config.user_name)
        .header("X-Auth-Key", &config.api_key)
        .send()
        .await
        .context("requesting auth token")?
        .error_for_status()
        .context("authentication rejected")?;

    let header = |name: &str| -> anyhow::Result<String> {
        Ok(response
            .headers()
            .get(name)
            .with_context(|| format!("auth response is missing {name}"))?
            .to_str()?
            .to_owned())
    };

    let storage_url = Url::parse(&header("X-Storage-Url")?).context("invalid storage url")?;
    Ok((storage_url, header("X-Auth-Token")?))
}

#[derive(Deserialize)]
struct KeystoneV2Response {
    access: KeystoneV2Access,
}

#[derive(Deserialize)]
struct KeystoneV2Access {
    token: KeystoneV2Token,
    #[serde(rename = "serviceCatalog", default)]
    service_catalog: Vec<KeystoneV2Service>,
}

#[derive(Deserialize)]
struct KeystoneV2Token {
    id: String,
}

#[derive(Deserialize)]
struct KeystoneV2Service {
    #[serde(rename = "type")]
    service_type: String,
    endpoints: Vec<KeystoneV2Endpoint>,
}

#[derive(Deserialize)]
struct KeystoneV2Endpoint {
    region: Option<String>,
    #[serde(rename = "publicURL")]
    public_url: String,
}

async fn authenticate_v2(
    http: &reqwest::Client,
    config: &SwiftUploaderConfig,
) -> anyhow::Result<(Url, String)> {
    let mut auth = json!({
        "passwordCredentials": {
            "username": config.user_name,
            "password": config.api_key,
        },
    });
    if let Some(tenant_id) = &config.tenant_id {
        auth["tenantId"] = json!(tenant_id);
    }

    let response: KeystoneV2Response = http
        .post(join_segments(&config.auth_url, &["tokens"])?)
        .json(&json!({ "auth": auth }))
        .send()
        .await
        .context("requesting auth token")?
        .error_for_status()
        .context("authentication rejected")?
        .json()
        .await
        .context("decoding auth response")?;

    let endpoint = response
        .access
        .service_catalog
        .iter()
        .filter(|service| service.service_type == "object-store")
        .flat_map(|service| &service.endpoints)
        .find(|endpoint| match &config.region {
            Some(region) => endpoint.region.as_deref() == Some(region),
            None => true,
        })
        .context("no object-store endpoint in service catalog")?;

    let storage_url = Url::parse(&endpoint.public_url).context("invalid storage url")?;
    Ok((storage_url, response.access.token.id))
}

#[derive(Deserialize)]
struct KeystoneV3Response {
    token: KeystoneV3Token,
}

#[derive(Deserialize)]
struct KeystoneV3Token {
    #[serde(default)]
    catalog: Vec<KeystoneV3Service>,
}

#[derive(Deserialize)]
struct KeystoneV3Service {
    #[serde(rename = "type")]
    service_type: String,
    endpoints: Vec<KeystoneV3Endpoint>,
}

#[derive(Deserialize)]
struct KeystoneV3Endpoint {
    interface: String,
    region: Option<String>,
    url: String,
}

async fn authenticate_v3(
    http: &reqwest::Client,
    config: &SwiftUploaderConfig,
) -> anyhow::Result<(Url, String)> {
    let domain = config.domain.as_deref().unwrap_or("Default");
    let mut auth = json!({
        "identity": {
            "methods": ["password"],
            "password": {
                "user": {
                    "name": config.user_name,
                    "domain": { "name": domain },
                    "password": config.api_key,
                },
            },
        },
    });
    if let Some(tenant_id) = &config.tenant_id {
        auth["scope"] = json!({ "project": { "id": tenant_id } });
    }

    let response = http
        .post(join_segments(&config.auth_url, &["auth", "tokens"])?)
        .json(&json!({ "auth": auth }))
        .send()
        .await
        .context("requesting auth token")?
        .error_for_status()
        .context("authentication rejected")?;

    let token = response
        .headers()
        .get("X-Subject-Token")
        .context("auth response is missing X-Subject-Token")?
        .to_str()?
        .to_owned();

    let body: KeystoneV3Response = response.json().await.context("decoding auth response")?;
    let endpoint = body
        .token
        .catalog
        .iter()
        .filter(|service| service.service_type == "object-store")
        .flat_map(|service| &service.endpoints)
        .filter(|endpoint| endpoint.interface == "public")
        .find(|endpoint| match &config.region {
            Some(region) => endpoint.region.as_deref() == Some(region),
            None => true,
        })
        .context("no object-store endpoint in service catalog")?;

    let storage_url = Url::parse(&endpoint.url).context("invalid storage url")?;
    Ok((storage_url, token))
}

#[async_trait::async_trait]
impl SnapshotStorage for SwiftStorage {
    type Snapshot = SwiftObject;

    fn destination(&self) -> String {
        format!("swift container {}", self.container)
    }

    async fn upload_snapshot(&self, name: &str, snapshot: &SnapshotFile) -> anyhow::Result<()> {
        let source = snapshot.open().await.context("opening staged snapshot")?;

        self.http
            .put(self.object_url(name)?)
            .header("X-Auth-Token", &self.token)
            .header("Content-Length", snapshot.len())
            .body(Body::wrap_stream(ReaderStream::new(source)))
            .send()
            .await
            .with_context(|| format!("putting object {name}"))?
            .error_for_status()
            .with_context(|| format!("putting object {name}"))?;

        Ok(())
    }

    async fn list_snapshots(
        &self,
        prefix: &str,
        suffix: &str,
    ) -> anyhow::Result<Vec<SwiftObject>> {
        let mut snapshots = Vec::new();
        let mut marker = String::new();

        // Swift caps each listing response, so page with markers until an
        // empty page comes back.
        loop {
            let response = self
                .http
                .get(self.container_url()?)
                .header("X-Auth-Token", &self.token)
                .query(&[("format", "json"), ("prefix", prefix), ("marker", marker.as_str())])
                .send()
                .await
                .context("listing objects")?;

            if response.status() == StatusCode::NO_CONTENT {
                break;
            }

            let page: Vec<SwiftObject> = response
                .error_for_status()
                .context("listing objects")?
                .json()
                .await
                .context("decoding object listing")?;

            let Some(last) = page.last() else {
                break;
            };
            marker = last.name.clone();

            snapshots.extend(
                page.into_iter()
                    .filter(|o| o.name.starts_with(prefix) && o.name.ends_with(suffix)),
            );
        }

        Ok(snapshots)
    }

    async fn delete_snapshot(&self, snapshot: &SwiftObject) -> anyhow::Result<()> {
        self.http
            .delete(self.object_url(&snapshot.name)?)
            .header("X-Auth-Token", &self.token)
            .send()
            .await
            .with_context(|| format!("deleting object {}", snapshot.name))?
            .error_for_status()
            .with_context(|| format!("deleting object {}", snapshot.name))?;
        Ok(())
    }

    fn compare_snapshots(a: &SwiftObject, b: &SwiftObject) -> Ordering {
        a.last_modified.cmp(&b.last_modified)
    }
}
