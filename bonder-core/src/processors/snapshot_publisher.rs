//! Liquidity snapshot export.
//!
//! Builds a [`LiquiditySnapshot`] from every ledger and uploads it to
//! object storage. Nothing reads it back; it exists for dashboards.

use crate::config::SnapshotSettings;
use crate::store::{BridgeStore, StoreError};
use bonder_sdk::objects::LiquiditySnapshot;
use bonder_sdk::signature::{SIGNATURE_HEADER, SignedObject};
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;
use url::Url;

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("upload failed with status {status}: {body}")]
    UploadFailed { status: u16, body: String },

    #[error("payload serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid snapshot url: {0}")]
    Url(#[from] url::ParseError),
}

/// Request body plus the signature header value, when signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedSnapshot {
    pub body: String,
    pub signature: Option<String>,
}

pub struct SnapshotPublisher {
    store: Arc<dyn BridgeStore>,
    settings: SnapshotSettings,
    http_client: reqwest::Client,
}

impl SnapshotPublisher {
    pub fn new(store: Arc<dyn BridgeStore>, settings: SnapshotSettings) -> Self {
        Self {
            store,
            settings,
            http_client: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
        }
    }

    pub fn interval(&self) -> std::time::Duration {
        self.settings.interval
    }

    /// `{endpoint}/{key}`
    pub fn url(&self) -> Result<Url, PublishError> {
        let mut base = self.settings.endpoint.clone();
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(base.join(&self.settings.key)?)
    }

    pub async fn build(&self) -> Result<LiquiditySnapshot, PublishError> {
        let ledgers = self.store.ledgers().await?;
        Ok(LiquiditySnapshot {
            generated_at: OffsetDateTime::now_utc().unix_timestamp(),
            entries: ledgers.iter().map(|l| l.to_entry()).collect(),
        })
    }

    /// Signed envelope when a signing key is configured, bare JSON otherwise.
    pub fn encode(&self, snapshot: LiquiditySnapshot) -> Result<EncodedSnapshot, PublishError> {
        match &self.settings.signing_key {
            Some(key) => {
                let signed = SignedObject::new(snapshot, key)?;
                let signature = signed.to_header();
                Ok(EncodedSnapshot {
                    body: serde_json::to_string(&signed.into_envelope())?,
                    signature: Some(signature),
                })
            }
            None => Ok(EncodedSnapshot {
                body: serde_json::to_string(&snapshot)?,
                signature: None,
            }),
        }
    }

    pub async fn publish(&self) -> Result<LiquiditySnapshot, PublishError> {
        let snapshot = self.build().await?;
        let encoded = self.encode(snapshot.clone())?;
        let url = self.url()?;

        let mut request = self
            .http_client
            .put(url.clone())
            .header("Content-Type", "application/json");
        if let Some(signature) = &encoded.signature {
            request = request.header(SIGNATURE_HEADER, signature);
        }
        if let Some(token) = &self.settings.upload_token {
            request = request.bearer_auth(token);
        }

        let response = request.body(encoded.body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PublishError::UploadFailed {
                status: status.as_u16(),
                body,
            });
        }

        info!(
            url = %url,
            entries = snapshot.entries.len(),
            signed = encoded.signature.is_some(),
            "Liquidity snapshot published"
        );
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::types::Address;
    use crate::entities::LedgerKey;
    use crate::store::MemoryStore;
    use bonder_sdk::objects::{ChainId, TokenSymbol};
    use bonder_sdk::signature::SignedEnvelope;
    use rust_decimal::Decimal;
    use std::time::Duration;
    use wiremock::matchers::{header, header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .ensure_ledger(
                &LedgerKey {
                    chain_id: ChainId(10),
                    token: TokenSymbol::new("USDC"),
                    bonder: Address([0xb0; 20]),
                },
                Decimal::from(500),
            )
            .await
            .unwrap();
        store
    }

    fn settings(endpoint: &str, signing_key: Option<&[u8]>) -> SnapshotSettings {
        SnapshotSettings {
            interval: Duration::from_secs(60),
            endpoint: Url::parse(endpoint).unwrap(),
            key: "liquidity.json".to_owned(),
            signing_key: signing_key.map(|k| k.to_vec()),
            upload_token: Some("secret".to_owned()),
        }
    }

    #[test]
    fn url_joins_key_under_endpoint_path() {
        let publisher = SnapshotPublisher::new(
            Arc::new(MemoryStore::new()),
            settings("https://bucket.example/snapshots", None),
        );
        assert_eq!(
            publisher.url().unwrap().as_str(),
            "https://bucket.example/snapshots/liquidity.json"
        );
    }

    #[tokio::test]
    async fn signed_snapshot_round_trips_through_envelope() {
        let publisher = SnapshotPublisher::new(store().await, settings("http://x", Some(b"k")));
        let snapshot = publisher.build().await.unwrap();
        let encoded = publisher.encode(snapshot.clone()).unwrap();
        assert!(encoded.signature.is_some());
        let envelope: SignedEnvelope = serde_json::from_str(&encoded.body).unwrap();
        let opened = envelope
            .open::<LiquiditySnapshot>()
            .unwrap()
            .verify(b"k", None)
            .unwrap();
        assert_eq!(opened, snapshot);
        assert_eq!(opened.entries[0].available, Decimal::from(500));
    }

    #[tokio::test]
    async fn publish_puts_to_endpoint() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/liquidity.json"))
            .and(header("authorization", "Bearer secret"))
            .and(header_exists(SIGNATURE_HEADER))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let publisher = SnapshotPublisher::new(store().await, settings(&server.uri(), Some(b"k")));
        let snapshot = publisher.publish().await.unwrap();
        assert_eq!(snapshot.entries.len(), 1);
    }

    #[tokio::test]
    async fn rejected_upload_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let publisher = SnapshotPublisher::new(store().await, settings(&server.uri(), None));
        assert!(matches!(
            publisher.publish().await,
            Err(PublishError::UploadFailed { status: 403, .. })
        ));
    }
}
