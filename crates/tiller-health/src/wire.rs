//! Heartbeat wire format.
//!
//! A datagram is the JSON-encoded [`HeartbeatPayload`] followed by a
//! 32-byte HMAC-SHA256 tag over the payload bytes, keyed with the
//! pre-shared heartbeat secret. Verification is constant-time; a
//! datagram that fails any check is dropped by the caller, never
//! answered.

use std::time::Duration;

use hmac::{Hmac, Mac};
use sha2::Sha256;

use tiller_store::HeartbeatPayload;

use crate::error::WireError;

type HmacSha256 = Hmac<Sha256>;

/// Length of the trailing MAC tag.
pub const MAC_LEN: usize = 32;

/// Largest datagram the listener will read.
pub const MAX_DATAGRAM: usize = 64 * 1024;

/// Encode a heartbeat for the wire: JSON payload plus trailing MAC.
pub fn encode_heartbeat(payload: &HeartbeatPayload, secret: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut bytes =
        serde_json::to_vec(payload).map_err(|e| WireError::BadJson(e.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WireError::BadMac)?;
    mac.update(&bytes);
    bytes.extend_from_slice(&mac.finalize().into_bytes());
    Ok(bytes)
}

/// Verify and decode a heartbeat datagram.
///
/// The MAC is checked before the payload is parsed, and the payload's
/// send time must be within `max_age` of `now`.
pub fn decode_heartbeat(
    datagram: &[u8],
    secret: &[u8],
    max_age: Duration,
    now: u64,
) -> Result<HeartbeatPayload, WireError> {
    if datagram.len() <= MAC_LEN {
        return Err(WireError::TooShort);
    }
    let (body, tag) = datagram.split_at(datagram.len() - MAC_LEN);

    let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| WireError::BadMac)?;
    mac.update(body);
    mac.verify_slice(tag).map_err(|_| WireError::BadMac)?;

    let payload: HeartbeatPayload =
        serde_json::from_slice(body).map_err(|e| WireError::BadJson(e.to_string()))?;

    let age_secs = now.saturating_sub(payload.sent_at);
    if age_secs > max_age.as_secs() {
        return Err(WireError::TooOld { age_secs });
    }
    Ok(payload)
}
