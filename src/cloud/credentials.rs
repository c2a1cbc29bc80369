use crate::error::Error;
use crate::messaging::{EventMessage, Handler};
use crate::shadow::{ConfigHandler, ConfigUpdate, DesiredState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use url::Url;

pub const CLOUD_NAMESPACE: &str = "cloud_connection";

const THING_NAME_HEADER: &str = "x-amzn-iot-thingname";

/// Temporary cloud credentials issued for the device role
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    pub expiration: DateTime<Utc>,
}

impl Credentials {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiration <= now
    }

    /// Parse a credentials response, with or without the `credentials` envelope
    pub fn from_response(body: &[u8]) -> Result<Self> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Response {
            Wrapped { credentials: Credentials },
            Bare(Credentials),
        }

        let response: Response =
            serde_json::from_slice(body).context("Failed to parse credentials response")?;
        Ok(match response {
            Response::Wrapped { credentials } => credentials,
            Response::Bare(credentials) => credentials,
        })
    }
}

/// Device identity used to exchange a client certificate for credentials
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CloudConnection {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub ca_path: PathBuf,
    pub thing_name: String,
    pub role_alias: String,
    pub credentials_endpoint: String,
}

impl CloudConnection {
    /// Endpoint with an `https://` scheme
    pub fn endpoint(&self) -> String {
        let host = self.credentials_endpoint.trim().trim_end_matches('/');
        let host = host
            .strip_prefix("https://")
            .or_else(|| host.strip_prefix("http://"))
            .unwrap_or(host);
        format!("https://{}", host)
    }

    pub fn credentials_url(&self) -> Result<Url> {
        let base = Url::parse(&format!("{}/", self.endpoint()))
            .with_context(|| format!("Invalid credentials endpoint: {}", self.credentials_endpoint))?;
        base.join(&format!("role-aliases/{}/credentials", self.role_alias))
            .context("Invalid role alias")
    }

    /// Overlay desired fields on `base`; a missing base requires every field
    pub fn patched(base: Option<&Self>, fields: &Map<String, Value>) -> Result<Self> {
        let mut merged = match base {
            Some(connection) => match serde_json::to_value(connection)? {
                Value::Object(map) => map,
                _ => Map::new(),
            },
            None => Map::new(),
        };
        for (key, value) in fields {
            if merged.contains_key(key) || base.is_none() {
                merged.insert(key.clone(), value.clone());
            } else {
                debug!("Skipping unknown cloud connection field {}", key);
            }
        }
        serde_json::from_value(Value::Object(merged))
            .map_err(|e| Error::Config(format!("Invalid cloud connection: {}", e)).into())
    }
}

/// Fetches fresh credentials for a device identity
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn fetch(&self, connection: &CloudConnection) -> Result<Credentials>;
}

/// Credentials endpoint reached over mutual TLS
pub struct HttpCredentialProvider {
    timeout: Duration,
}

impl HttpCredentialProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    async fn client(&self, connection: &CloudConnection) -> Result<reqwest::Client> {
        let ca_pem = tokio::fs::read(&connection.ca_path)
            .await
            .with_context(|| format!("Failed to read CA certificate {:?}", connection.ca_path))?;
        let ca_cert =
            reqwest::Certificate::from_pem(&ca_pem).context("Failed to parse CA certificate")?;

        let mut identity_pem = tokio::fs::read(&connection.cert_path)
            .await
            .with_context(|| format!("Failed to read client certificate {:?}", connection.cert_path))?;
        let key_pem = tokio::fs::read(&connection.key_path)
            .await
            .with_context(|| format!("Failed to read client key {:?}", connection.key_path))?;
        identity_pem.extend_from_slice(&key_pem);
        let identity =
            reqwest::Identity::from_pem(&identity_pem).context("Failed to create client identity")?;

        reqwest::Client::builder()
            .timeout(self.timeout)
            .add_root_certificate(ca_cert)
            .identity(identity)
            .build()
            .context("Failed to build credentials client")
    }
}

impl Default for HttpCredentialProvider {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl CredentialProvider for HttpCredentialProvider {
    async fn fetch(&self, connection: &CloudConnection) -> Result<Credentials> {
        let url = connection.credentials_url()?;
        let client = self.client(connection).await?;
        let response = client
            .get(url.clone())
            .header(THING_NAME_HEADER, &connection.thing_name)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Credentials(format!("Request timeout to {}", url))
                } else {
                    Error::Credentials(format!("Request to {} failed: {}", url, e))
                }
            })?
            .error_for_status()
            .map_err(|e| Error::Credentials(format!("Credentials refused by {}: {}", url, e)))?;
        let body = response.bytes().await?;
        Credentials::from_response(&body)
    }
}

struct CacheState {
    connection: Option<CloudConnection>,
    credentials: Option<Credentials>,
}

/// Process-wide credential cache shared by every cloud-facing component.
///
/// At most one refresh runs at a time. Callers that queued behind a refresh
/// return its outcome instead of fetching again.
pub struct CredentialCache {
    provider: Arc<dyn CredentialProvider>,
    state: Mutex<CacheState>,
    /// Bumped after every completed fetch
    refreshes: AtomicU64,
}

impl CredentialCache {
    pub fn new(provider: Arc<dyn CredentialProvider>, connection: Option<CloudConnection>) -> Self {
        Self {
            provider,
            state: Mutex::new(CacheState {
                connection,
                credentials: None,
            }),
            refreshes: AtomicU64::new(0),
        }
    }

    /// Current credentials, refreshing when missing, expired or forced.
    ///
    /// Fetch failures are logged and yield `None`.
    pub async fn login(&self, force: bool) -> Option<Credentials> {
        let observed = self.refreshes.load(Ordering::SeqCst);
        let mut state = self.state.lock().await;

        if self.refreshes.load(Ordering::SeqCst) != observed {
            debug!("Credentials were refreshed while waiting");
            return state.credentials.clone();
        }
        if !force {
            if let Some(credentials) = state
                .credentials
                .as_ref()
                .filter(|credentials| !credentials.is_expired(Utc::now()))
            {
                return Some(credentials.clone());
            }
        }

        let Some(connection) = state.connection.clone() else {
            warn!("No cloud connection configured, cannot refresh credentials");
            return None;
        };
        state.credentials = None;
        let fetched = self.provider.fetch(&connection).await;
        self.refreshes.fetch_add(1, Ordering::SeqCst);

        match fetched {
            Ok(credentials) => {
                info!("Refreshed credentials for {}", connection.thing_name);
                state.credentials = Some(credentials.clone());
                Some(credentials)
            }
            Err(e) => {
                error!(
                    "Failed to refresh credentials from {}: {:#}",
                    connection.endpoint(),
                    e
                );
                None
            }
        }
    }

    pub async fn connection(&self) -> Option<CloudConnection> {
        self.state.lock().await.connection.clone()
    }

    /// Swap the device identity; cached credentials are dropped on change
    pub async fn set_connection(&self, connection: CloudConnection) -> bool {
        let mut state = self.state.lock().await;
        Self::replace_connection(&mut state, connection)
    }

    fn replace_connection(state: &mut CacheState, connection: CloudConnection) -> bool {
        if state.connection.as_ref() == Some(&connection) {
            return false;
        }
        info!("Cloud connection now uses {}", connection.thing_name);
        state.connection = Some(connection);
        state.credentials = None;
        true
    }
}

#[async_trait]
impl Handler for CredentialCache {
    async fn on_file_change(&self, event: &EventMessage) -> Result<()> {
        let Some(desired) = DesiredState::from_event(event) else {
            return Ok(());
        };
        let Some(fields) = desired.section(CLOUD_NAMESPACE)? else {
            return Ok(());
        };
        let mut state = self.state.lock().await;
        let next = CloudConnection::patched(state.connection.as_ref(), fields)?;
        Self::replace_connection(&mut state, next);
        Ok(())
    }
}

#[async_trait]
impl ConfigHandler for CredentialCache {
    fn namespace(&self) -> &'static str {
        CLOUD_NAMESPACE
    }

    async fn report(&self) -> Option<ConfigUpdate> {
        let connection = self.connection().await?;
        match serde_json::to_value(&connection) {
            Ok(body) => Some(ConfigUpdate::new(CLOUD_NAMESPACE, body)),
            Err(e) => {
                error!("Failed to serialize cloud connection: {}", e);
                None
            }
        }
    }
}
