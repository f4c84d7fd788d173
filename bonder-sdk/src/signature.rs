//! HMAC-SHA256 signing for documents the bonder publishes.
//!
//! The signed message is `"{unix_timestamp}.{json_body}"`. The signature
//! travels either in the [`SIGNATURE_HEADER`] as `{timestamp}.{base64}` or
//! inside a [`SignedEnvelope`] stored next to the document.

use serde::{Deserialize, Serialize};

/// Header carrying `{unix_timestamp}.{base64_signature}` on uploads.
pub const SIGNATURE_HEADER: &str = "Bonder-Signature";

/// Marker trait for payloads that can be wrapped in a [`SignedObject`].
pub trait Signature: for<'de> Deserialize<'de> + Serialize {}

#[derive(Debug, thiserror::Error)]
pub enum SignatureError {
    #[error("invalid signature format")]
    InvalidFormat,
    #[error("invalid base64 encoding")]
    InvalidBase64,
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid signature")]
    SignatureMismatch,
    #[error("signature expired")]
    Expired,
}

impl From<ring::error::Unspecified> for SignatureError {
    fn from(_: ring::error::Unspecified) -> Self {
        Self::SignatureMismatch
    }
}

/// A payload together with the exact JSON that was signed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedObject<T: Signature> {
    pub body: T,
    pub timestamp: i64,
    pub json: String,
    pub signature: Box<[u8]>,
}

impl<T: Signature> SignedObject<T> {
    pub fn new(body: T, key: &[u8]) -> Result<Self, serde_json::Error> {
        let now = time::OffsetDateTime::now_utc().unix_timestamp();
        Self::new_at(body, key, now)
    }

    pub fn new_at(body: T, key: &[u8], timestamp: i64) -> Result<Self, serde_json::Error> {
        let json = serde_json::to_string(&body)?;
        let signature = sign(key, timestamp, &json);
        Ok(Self {
            body,
            timestamp,
            json,
            signature,
        })
    }

    /// Rebuild from a raw header value and the JSON body. The HMAC is not
    /// checked here; call [`verify`](Self::verify).
    pub fn from_header_and_body(
        header_value: &str,
        body_json: String,
    ) -> Result<Self, SignatureError> {
        let (timestamp, signature) = parse_signature_header(header_value)?;
        let body: T = serde_json::from_str(&body_json)?;
        Ok(Self {
            body,
            timestamp,
            json: body_json,
            signature,
        })
    }

    /// Check the HMAC and, when `max_age` is given, that the signature is not
    /// older than `max_age` seconds.
    pub fn verify(self, key: &[u8], max_age: Option<i64>) -> Result<T, SignatureError> {
        let data = format!("{}.{}", self.timestamp, self.json);
        ring::hmac::verify(
            &ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key),
            data.as_bytes(),
            self.signature.as_ref(),
        )?;
        if let Some(max_age) = max_age {
            let now = time::OffsetDateTime::now_utc().unix_timestamp();
            if now - self.timestamp > max_age {
                return Err(SignatureError::Expired);
            }
        }
        Ok(self.body)
    }

    pub fn to_header(&self) -> String {
        format_signature_header(self.timestamp, &self.signature)
    }

    pub fn into_envelope(self) -> SignedEnvelope {
        SignedEnvelope {
            timestamp: self.timestamp,
            signature: fast32::base64::RFC4648_NOPAD.encode(&self.signature),
            payload: self.json,
        }
    }
}

/// Self-contained JSON form of a [`SignedObject`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedEnvelope {
    pub timestamp: i64,
    /// The signed JSON document, kept as a string so it verifies byte-for-byte.
    pub payload: String,
    pub signature: String,
}

impl SignedEnvelope {
    pub fn open<T: Signature>(self) -> Result<SignedObject<T>, SignatureError> {
        let signature = fast32::base64::RFC4648_NOPAD
            .decode_str(&self.signature)
            .map_err(|_| SignatureError::InvalidBase64)?
            .into_boxed_slice();
        let body: T = serde_json::from_str(&self.payload)?;
        Ok(SignedObject {
            body,
            timestamp: self.timestamp,
            json: self.payload,
            signature,
        })
    }
}

fn sign(key: &[u8], timestamp: i64, json: &str) -> Box<[u8]> {
    let data = format!("{timestamp}.{json}");
    let tag = ring::hmac::sign(
        &ring::hmac::Key::new(ring::hmac::HMAC_SHA256, key),
        data.as_bytes(),
    );
    tag.as_ref().to_owned().into_boxed_slice()
}

/// Split `{timestamp}.{base64}` into its parts.
pub fn parse_signature_header(value: &str) -> Result<(i64, Box<[u8]>), SignatureError> {
    let (timestamp, signature) = value.split_once('.').ok_or(SignatureError::InvalidFormat)?;
    let timestamp: i64 = timestamp
        .parse()
        .map_err(|_| SignatureError::InvalidFormat)?;
    let signature = fast32::base64::RFC4648_NOPAD
        .decode_str(signature)
        .map_err(|_| SignatureError::InvalidBase64)?
        .into_boxed_slice();
    Ok((timestamp, signature))
}

pub fn format_signature_header(timestamp: i64, signature: &[u8]) -> String {
    format!(
        "{timestamp}.{}",
        fast32::base64::RFC4648_NOPAD.encode(signature)
    )
}
