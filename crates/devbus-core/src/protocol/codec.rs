//! JSON codec for encoding and decoding envelopes.
//!
//! Wire format: one compact JSON object per envelope (no embedded newlines,
//! so envelopes can be framed line-by-line on stream transports):
//!
//! ```text
//! {"v":1,"t":"res","id":"cli-3","src":"broker","ts":1719334455.93,"d":{"status":"ok"}}
//! ```
//!
//! Decoding validates the protocol version and the type discriminant *before*
//! deserializing the full structure, so [`DecodeError::UnsupportedVersion`]
//! and [`DecodeError::InvalidType`] are reported distinctly from structural
//! [`DecodeError::MalformedPayload`] failures.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::envelope::{Envelope, EnvelopeKind, PROTOCOL_VERSION};

/// Errors that can occur while decoding an envelope from bytes.
///
/// A decode failure is fatal for that message only, never for the connection
/// that carried it.
#[derive(Debug, Error, PartialEq)]
pub enum DecodeError {
    /// The bytes are not valid JSON, or the JSON does not have the envelope
    /// structure (missing fields, wrong field types).
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The `v` field does not match the single supported protocol version.
    #[error("unsupported protocol version: {0}")]
    UnsupportedVersion(i64),

    /// The `t` field is not one of `log`, `cmd`, `evt`, `res`.
    #[error("invalid envelope type: {0:?}")]
    InvalidType(String),
}

/// Errors that can occur while encoding an envelope to bytes.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// The envelope could not be serialized to JSON.
    #[error("envelope serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Encodes an envelope into compact JSON bytes.
///
/// # Errors
///
/// Returns [`EncodeError`] if serialization fails (which cannot happen for
/// envelopes built through the [`Envelope`] constructors).
pub fn encode(envelope: &Envelope) -> Result<Vec<u8>, EncodeError> {
    Ok(serde_json::to_vec(envelope)?)
}

/// Decodes one envelope from `bytes`.
///
/// Validation order:
///
/// 1. the bytes must parse as a JSON object,
/// 2. `v` must equal [`PROTOCOL_VERSION`],
/// 3. `t` must be one of the four enumerated kinds,
/// 4. the remaining fields must deserialize into [`Envelope`].
///
/// # Errors
///
/// Returns the corresponding [`DecodeError`] variant for each stage.
pub fn decode(bytes: &[u8]) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_slice(bytes)
        .map_err(|e| DecodeError::MalformedPayload(e.to_string()))?;

    let obj = value
        .as_object()
        .ok_or_else(|| DecodeError::MalformedPayload("envelope must be a JSON object".into()))?;

    let version = obj
        .get("v")
        .and_then(Value::as_i64)
        .ok_or_else(|| DecodeError::MalformedPayload("missing or non-integer `v` field".into()))?;
    if version != i64::from(PROTOCOL_VERSION) {
        return Err(DecodeError::UnsupportedVersion(version));
    }

    let kind = obj
        .get("t")
        .and_then(Value::as_str)
        .ok_or_else(|| DecodeError::MalformedPayload("missing or non-string `t` field".into()))?;
    if EnvelopeKind::from_wire(kind).is_none() {
        return Err(DecodeError::InvalidType(kind.to_string()));
    }

    serde_json::from_value(value).map_err(|e| DecodeError::MalformedPayload(e.to_string()))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
