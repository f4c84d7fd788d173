//! HTTP client for the published liquidity snapshot.
//!
//! Gated behind the `client` cargo feature so consumers that only need the
//! shared types do not pull in `reqwest`.

use reqwest::{Client, StatusCode};
use url::Url;

use crate::objects::LiquiditySnapshot;
use crate::signature::{SignatureError, SignedEnvelope};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("signature error: {0}")]
    Signature(#[from] SignatureError),

    #[error("unexpected status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Reads the snapshot document from its object-storage URL.
#[derive(Debug, Clone)]
pub struct SnapshotClient {
    http: Client,
    url: Url,
}

impl SnapshotClient {
    pub fn new(url: Url) -> Self {
        Self {
            http: Client::new(),
            url,
        }
    }

    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Fetch a snapshot that was published without a signing key.
    pub async fn fetch_unsigned(&self) -> Result<LiquiditySnapshot, ClientError> {
        let body = self.get_body().await?;
        Ok(serde_json::from_str(&body)?)
    }

    /// Fetch a signed snapshot envelope and verify it against `key`.
    ///
    /// `max_age` rejects snapshots signed more than that many seconds ago.
    pub async fn fetch_verified(
        &self,
        key: &[u8],
        max_age: Option<i64>,
    ) -> Result<LiquiditySnapshot, ClientError> {
        let body = self.get_body().await?;
        let envelope: SignedEnvelope = serde_json::from_str(&body)?;
        Ok(envelope.open::<LiquiditySnapshot>()?.verify(key, max_age)?)
    }

    async fn get_body(&self) -> Result<String, ClientError> {
        let resp = self.http.get(self.url.clone()).send().await?;
        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(ClientError::Status { status, body });
        }
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::objects::{ChainId, LiquidityEntry, TokenSymbol};
    use crate::signature::SignedObject;
    use rust_decimal::Decimal;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn snapshot() -> LiquiditySnapshot {
        LiquiditySnapshot {
            generated_at: 1_700_000_000,
            entries: vec![LiquidityEntry {
                chain_id: ChainId(10),
                token: TokenSymbol::new("USDC"),
                bonder: "0xb0".to_owned(),
                total: Decimal::from(500),
                available: Decimal::from(400),
                in_flight: Decimal::from(100),
                settled: Decimal::ZERO,
            }],
        }
    }

    #[tokio::test]
    async fn fetches_and_verifies_signed_snapshot() {
        let server = MockServer::start().await;
        let envelope = SignedObject::new(snapshot(), b"k").unwrap().into_envelope();
        Mock::given(method("GET"))
            .and(path("/liquidity.json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&envelope))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/liquidity.json", server.uri())).unwrap();
        let client = SnapshotClient::new(url);
        assert_eq!(client.fetch_verified(b"k", None).await.unwrap(), snapshot());
        assert!(matches!(
            client.fetch_verified(b"wrong", None).await,
            Err(ClientError::Signature(SignatureError::SignatureMismatch))
        ));
    }

    #[tokio::test]
    async fn non_success_status_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("missing"))
            .mount(&server)
            .await;

        let url = Url::parse(&format!("{}/liquidity.json", server.uri())).unwrap();
        let err = SnapshotClient::new(url).fetch_unsigned().await.unwrap_err();
        assert!(matches!(err, ClientError::Status { status, .. } if status == StatusCode::NOT_FOUND));
    }
}
