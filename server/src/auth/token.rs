//! Session tokens: signed, self-contained JWTs. No server-side session
//! state exists; everything a request needs is in the claims.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};

/// Claims embedded in a session token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id, or `"root"` for master-key sessions
    pub sub: String,
    pub username: String,
    #[serde(rename = "isRoot")]
    pub is_root: bool,
    pub exp: i64,
    pub iat: i64,
}

/// Mint a token. Returns the encoded token and its expiry (epoch seconds).
pub fn issue(
    secret: &str,
    user_id: &str,
    username: &str,
    is_root: bool,
    ttl_seconds: i64,
) -> Result<(String, i64)> {
    let now = chrono::Utc::now().timestamp();
    let exp = now + ttl_seconds;
    let claims = Claims {
        sub: user_id.to_string(),
        username: username.to_string(),
        is_root,
        exp,
        iat: now,
    };

    let token = encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AppError::Internal(format!("token encoding: {e}")))?;

    Ok((token, exp))
}

/// Verify a token and return its claims.
pub fn verify(secret: &str, token: &str) -> Result<Claims> {
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AppError::Unauthenticated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issue_and_verify_round_trip() {
        let (token, exp) = issue("secret", "u1", "alice", false, 3600).unwrap();
        let claims = verify("secret", &token).unwrap();
        assert_eq!(claims.sub, "u1");
        assert_eq!(claims.username, "alice");
        assert!(!claims.is_root);
        assert_eq!(claims.exp, exp);
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let (token, _) = issue("secret", "u1", "alice", false, 3600).unwrap();
        assert!(verify("other", &token).is_err());
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let (token, _) = issue("secret", "u1", "alice", true, -3600).unwrap();
        assert!(verify("secret", &token).is_err());
    }
}
