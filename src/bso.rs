//! BSO (Basic Storage Object) model and validation.
//!
//! Incoming records arrive as loose JSON objects; this module turns
//! them into typed values with every validation failure named, so the
//! batch pipeline can report per-record reasons instead of rejecting a
//! whole POST.

use serde::Serialize;
use serde_json::Value;

use crate::timestamp::Timestamp;

/// Maximum BSO id length in bytes.
pub const MAX_ID_LENGTH: usize = 64;
/// Maximum collection name length in bytes.
pub const MAX_COLLECTION_NAME_LENGTH: usize = 32;
/// Maximum ttl in seconds (one year).
pub const MAX_TTL_SECONDS: i64 = 31_536_000;

/// Legacy wire fields accepted and dropped without complaint.
const IGNORED_FIELDS: &[&str] = &[
    "modified",
    "collection",
    "payload_size",
    "parentid",
    "predecessorid",
];

/// Checks a BSO id: 1..=64 bytes of printable ASCII, excluding `/`.
pub fn valid_bso_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= MAX_ID_LENGTH
        && id.bytes().all(|b| (0x20..=0x7e).contains(&b) && b != b'/')
}

/// Checks a collection name: 1..=32 bytes of `[a-zA-Z0-9._-]`.
pub fn valid_collection_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_COLLECTION_NAME_LENGTH
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'.' || b == b'_' || b == b'-')
}

/// Why a single BSO failed validation.
///
/// The display strings are the per-record reasons reported in the
/// `failed` map of a batch POST, so they are part of the wire contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BsoError {
    /// Record is not a JSON object.
    #[error("invalid bso")]
    NotAnObject,
    /// Id missing, overlong, or containing forbidden characters.
    #[error("invalid id")]
    InvalidId,
    /// Sortindex not an integer or outside the i32 range.
    #[error("invalid sortindex")]
    InvalidSortindex,
    /// Ttl negative, non-integer, or beyond one year.
    #[error("invalid ttl")]
    InvalidTtl,
    /// Payload is not a JSON string.
    #[error("payload not a string")]
    PayloadNotAString,
    /// Payload exceeds the configured per-record limit.
    #[error("payload too large")]
    PayloadTooLarge,
    /// Field outside the documented wire schema.
    #[error("unknown field {0:?}")]
    UnknownField(String),
}

/// A parsed, validated BSO body from a PUT or POST request.
///
/// `id` is optional because PUT bodies may omit it (the URL supplies
/// it); batch POST records must carry one. All other fields are
/// optional: an absent field means "leave the stored value alone".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BsoBody {
    pub id: Option<String>,
    pub sortindex: Option<i32>,
    pub payload: Option<String>,
    pub ttl: Option<i64>,
}

impl BsoBody {
    /// Parses and validates a single wire record.
    ///
    /// `max_payload_bytes` is the configured per-record payload limit.
    ///
    /// # Errors
    ///
    /// Returns the first [`BsoError`] encountered; field order matches
    /// the documented failure precedence (id first).
    pub fn from_value(value: &Value, max_payload_bytes: usize) -> Result<Self, BsoError> {
        let object = value.as_object().ok_or(BsoError::NotAnObject)?;

        let mut body = Self::default();
        if let Some(id) = object.get("id") {
            let id = id.as_str().ok_or(BsoError::InvalidId)?;
            if !valid_bso_id(id) {
                return Err(BsoError::InvalidId);
            }
            body.id = Some(id.to_string());
        }
        if let Some(sortindex) = object.get("sortindex") {
            let sortindex = sortindex.as_i64().ok_or(BsoError::InvalidSortindex)?;
            body.sortindex =
                Some(i32::try_from(sortindex).map_err(|_| BsoError::InvalidSortindex)?);
        }
        if let Some(ttl) = object.get("ttl") {
            let ttl = ttl.as_i64().ok_or(BsoError::InvalidTtl)?;
            if !(0..=MAX_TTL_SECONDS).contains(&ttl) {
                return Err(BsoError::InvalidTtl);
            }
            body.ttl = Some(ttl);
        }
        if let Some(payload) = object.get("payload") {
            let payload = payload.as_str().ok_or(BsoError::PayloadNotAString)?;
            if payload.len() > max_payload_bytes {
                return Err(BsoError::PayloadTooLarge);
            }
            body.payload = Some(payload.to_string());
        }
        for name in object.keys() {
            match name.as_str() {
                "id" | "sortindex" | "ttl" | "payload" => {}
                other if IGNORED_FIELDS.contains(&other) => {}
                other => return Err(BsoError::UnknownField(other.to_string())),
            }
        }
        Ok(body)
    }

    /// Returns the payload size in bytes, zero when absent.
    pub fn payload_bytes(&self) -> usize {
        self.payload.as_deref().map_or(0, str::len)
    }
}

/// A stored BSO as returned to clients.
///
/// `modified` is always server-assigned. `ttl` echoes the seconds value
/// from the last write that set it; expiry filtering happens in the
/// backend, never here.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bso {
    pub id: String,
    pub modified: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sortindex: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
    pub payload: String,
}
