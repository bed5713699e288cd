//! Session token mint and verification.
//!
//! Tokens are `base64url(claims_json) . base64url(hmac_sha256(signing_key,
//! claims_segment))`.  Claims carry the user id, username, expiry (seconds
//! since epoch) and the opaque vars map.  Verification recomputes the MAC
//! over the encoded claims segment and rejects expired tokens.

use crate::error::{ServerError, ServerResult};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::HashMap;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub uid: Uuid,
    pub usn: String,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub vrs: HashMap<String, String>,
}

fn sign(signing_key: &str, claims_segment: &str) -> ServerResult<String> {
    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|_| ServerError::internal("token signing key is empty"))?;
    mac.update(claims_segment.as_bytes());
    Ok(URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes()))
}

pub fn mint(signing_key: &str, claims: &Claims) -> ServerResult<String> {
    let claims_json = serde_json::to_vec(claims)
        .map_err(|e| ServerError::internal(format!("claims serialization: {e}")))?;
    let claims_segment = URL_SAFE_NO_PAD.encode(claims_json);
    let signature = sign(signing_key, &claims_segment)?;
    Ok(format!("{claims_segment}.{signature}"))
}

pub fn verify(signing_key: &str, token: &str, now_unix: i64) -> ServerResult<Claims> {
    let (claims_segment, signature) = token
        .split_once('.')
        .ok_or_else(|| ServerError::Unauthenticated("malformed token".to_owned()))?;

    let mut mac = HmacSha256::new_from_slice(signing_key.as_bytes())
        .map_err(|_| ServerError::internal("token signing key is empty"))?;
    mac.update(claims_segment.as_bytes());
    let given = URL_SAFE_NO_PAD
        .decode(signature)
        .map_err(|_| ServerError::Unauthenticated("malformed token signature".to_owned()))?;
    mac.verify_slice(&given)
        .map_err(|_| ServerError::Unauthenticated("invalid token signature".to_owned()))?;

    let claims_json = URL_SAFE_NO_PAD
        .decode(claims_segment)
        .map_err(|_| ServerError::Unauthenticated("malformed token claims".to_owned()))?;
    let claims: Claims = serde_json::from_slice(&claims_json)
        .map_err(|_| ServerError::Unauthenticated("malformed token claims".to_owned()))?;

    if claims.exp <= now_unix {
        return Err(ServerError::Unauthenticated("token expired".to_owned()));
    }
    Ok(claims)
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

/// Decode `Basic` credentials into (username, password).
pub fn parse_basic(authorization: &str) -> Option<(String, String)> {
    let encoded = authorization.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD.decode(encoded).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (user, pass) = decoded.split_once(':')?;
    Some((user.to_owned(), pass.to_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "test-signing-key";

    fn claims() -> Claims {
        let mut vrs = HashMap::new();
        let _ = vrs.insert("tier".to_owned(), "gold".to_owned());
        Claims {
            uid: Uuid::new_v4(),
            usn: "playerONE12".to_owned(),
            exp: 4_102_444_800, // far future
            vrs,
        }
    }

    #[test]
    fn mint_then_verify_round_trips_all_claims() {
        let claims = claims();
        let token = mint(KEY, &claims).expect("mint");
        let back = verify(KEY, &token, 0).expect("verify");
        assert_eq!(back, claims);
    }

    #[test]
    fn verify_rejects_wrong_key_and_tampered_claims() {
        let claims = claims();
        let token = mint(KEY, &claims).expect("mint");
        assert!(verify("other-key", &token, 0).is_err());

        let (seg, sig) = token.split_once('.').expect("two segments");
        let mut tampered_claims = claims.clone();
        tampered_claims.usn = "someoneELSE".to_owned();
        let tampered_seg = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&tampered_claims).expect("serialize"),
        );
        assert_ne!(seg, tampered_seg);
        assert!(verify(KEY, &format!("{tampered_seg}.{sig}"), 0).is_err());
    }

    #[test]
    fn verify_rejects_expired_tokens() {
        let mut claims = claims();
        claims.exp = 1000;
        let token = mint(KEY, &claims).expect("mint");
        assert!(verify(KEY, &token, 1000).is_err());
        assert!(verify(KEY, &token, 999).is_ok());
    }

    #[test]
    fn basic_credentials_parse_server_key_form() {
        let header = format!(
            "Basic {}",
            base64::engine::general_purpose::STANDARD.encode("defaultkey:")
        );
        let (user, pass) = parse_basic(&header).expect("parse basic");
        assert_eq!(user, "defaultkey");
        assert_eq!(pass, "");
        assert_eq!(parse_basic("Bearer abc"), None);
    }

    #[test]
    fn empty_vars_are_omitted_from_the_claims_json() {
        let claims = Claims {
            uid: Uuid::nil(),
            usn: "u".to_owned(),
            exp: 1,
            vrs: HashMap::new(),
        };
        let json = serde_json::to_string(&claims).expect("serialize");
        assert!(!json.contains("vrs"));
    }
}
