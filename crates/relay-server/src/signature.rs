//! Interaction request signatures.
//!
//! The chat platform signs every webhook request with Ed25519 over the
//! timestamp header followed by the raw body. Requests that do not verify
//! against the application's public key are rejected.

use axum::http::HeaderMap;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use thiserror::Error;

/// Header carrying the hex-encoded signature.
pub const SIGNATURE_HEADER: &str = "x-signature-ed25519";

/// Header carrying the signed timestamp.
pub const TIMESTAMP_HEADER: &str = "x-signature-timestamp";

/// Signature verification failures.
#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("Invalid public key: {0}")]
    InvalidKey(String),

    #[error("No public key configured")]
    NotConfigured,

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Malformed signature")]
    MalformedSignature,

    #[error("Signature does not match")]
    Mismatch,
}

/// Verifies interaction requests against the application's public key.
#[derive(Debug, Clone)]
pub struct RequestVerifier {
    key: VerifyingKey,
}

impl RequestVerifier {
    /// Create a verifier from a hex-encoded Ed25519 public key.
    ///
    /// # Errors
    ///
    /// Returns an error if the key is not 32 hex-encoded bytes or not a valid
    /// curve point.
    pub fn from_hex(public_key: &str) -> Result<Self, SignatureError> {
        let bytes = hex::decode(public_key.trim())
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| SignatureError::InvalidKey("expected 32 bytes".into()))?;
        let key = VerifyingKey::from_bytes(&bytes)
            .map_err(|e| SignatureError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Verify the signature headers of a request over its raw `body`.
    ///
    /// # Errors
    ///
    /// Returns an error if a header is missing or malformed, or if the
    /// signature does not match.
    pub fn verify(&self, headers: &HeaderMap, body: &[u8]) -> Result<(), SignatureError> {
        let signature = header(headers, SIGNATURE_HEADER)?;
        let timestamp = header(headers, TIMESTAMP_HEADER)?;

        let bytes: [u8; 64] = hex::decode(signature)
            .map_err(|_| SignatureError::MalformedSignature)?
            .try_into()
            .map_err(|_| SignatureError::MalformedSignature)?;
        let signature = Signature::from_bytes(&bytes);

        let mut message = Vec::with_capacity(timestamp.len() + body.len());
        message.extend_from_slice(timestamp.as_bytes());
        message.extend_from_slice(body);

        self.key
            .verify(&message, &signature)
            .map_err(|_| SignatureError::Mismatch)
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, SignatureError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .ok_or(SignatureError::MissingHeader(name))
}
