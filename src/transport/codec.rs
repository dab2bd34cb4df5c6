//! NDJSON codec for QMP messages
//!
//! Shared by the sync and async transports. One JSON object per line.

use crate::error::{QmpError, Result};
use crate::protocol::Message;
use serde::Serialize;

/// Encode any message into NDJSON format (JSON + newline)
pub fn encode_message<T: Serialize + ?Sized>(message: &T) -> Result<Vec<u8>> {
    let mut json = serde_json::to_vec(message)?;
    json.push(b'\n');
    Ok(json)
}

/// Decode one line into a [`Message`].
///
/// Returns `Ok(None)` for a blank line. Anything that is not a JSON object is malformed.
pub fn decode_message(line: &[u8]) -> Result<Option<Message>> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(None);
    }

    let value: serde_json::Value =
        serde_json::from_slice(trimmed).map_err(|e| QmpError::malformed(line, e))?;

    Message::from_value(value)
        .map(Some)
        .ok_or_else(|| QmpError::malformed(line, "expected a JSON object"))
}
