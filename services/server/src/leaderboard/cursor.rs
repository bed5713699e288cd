//! Opaque pagination cursors for leaderboard record listings.
//!
//! The wire form is base64 over a JSON struct; clients round-trip it
//! untouched.  Decoding rejects anything the server did not produce.

use crate::error::{ServerError, ServerResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordCursor {
    pub score: i64,
    pub subscore: i64,
    pub owner: Uuid,
    pub expiry: i64,
    pub rank: i64,
}

pub fn encode(cursor: &RecordCursor) -> ServerResult<String> {
    let json = serde_json::to_vec(cursor)
        .map_err(|e| ServerError::internal(format!("cursor encode: {e}")))?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

pub fn decode(raw: &str) -> ServerResult<RecordCursor> {
    let json = URL_SAFE_NO_PAD
        .decode(raw)
        .map_err(|_| ServerError::invalid_input("malformed cursor"))?;
    serde_json::from_slice(&json).map_err(|_| ServerError::invalid_input("malformed cursor"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_round_trips() {
        let cursor = RecordCursor {
            score: 1500,
            subscore: -3,
            owner: Uuid::new_v4(),
            expiry: 1_700_000_000,
            rank: 42,
        };
        let encoded = encode(&cursor).expect("encode");
        assert_eq!(decode(&encoded).expect("decode"), cursor);
    }

    #[test]
    fn garbage_is_rejected_as_invalid_input() {
        assert!(decode("not base64!!").is_err());
        let valid_b64 = URL_SAFE_NO_PAD.encode(b"{\"nope\":1}");
        assert!(decode(&valid_b64).is_err());
    }
}
