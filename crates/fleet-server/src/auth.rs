//! JWT mint and verify
//!
//! Nodes authenticate by possession of a bearer token minted at
//! registration. Tokens are HS256 with a shared secret; the subject is the
//! node id and the issuer is the control service's wire name.

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;
use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::{ApiError, Result};

/// Token issuer written into and required from every token
pub const ISSUER: &str = "agent-svc";

/// JWT claims
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub node_id: String,
    pub sub: String,
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
}

/// JWT service
pub struct JwtService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    expiration_secs: i64,
}

impl JwtService {
    pub fn new(secret: &str, expiration_secs: i64) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            expiration_secs,
        }
    }

    /// Mint a token for a node
    pub fn generate(&self, node_id: &str) -> Result<String> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            node_id: node_id.to_string(),
            sub: node_id.to_string(),
            iss: ISSUER.to_string(),
            iat: now,
            exp: now + self.expiration_secs,
        };
        encode(&Header::default(), &claims, &self.encoding)
            .map_err(|e| ApiError::internal(format!("failed to sign token: {e}")))
    }

    /// Verify a token and return the node id it was minted for
    pub fn verify(&self, token: &str) -> Result<String> {
        let mut validation = Validation::default();
        validation.set_issuer(&[ISSUER]);
        validation.set_required_spec_claims(&["exp", "sub", "iss"]);

        let data = decode::<Claims>(token, &self.decoding, &validation)
            .map_err(|e| ApiError::unauthorized(format!("invalid token: {e}")))?;
        Ok(data.claims.sub)
    }
}

/// Extract the node id from a request's bearer token
pub fn node_id_from_headers(jwt: &JwtService, headers: &HeaderMap) -> Result<String> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::unauthorized("missing bearer token"))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::unauthorized("malformed authorization header"))?;

    jwt.verify(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> JwtService {
        JwtService::new("test-secret", 3600)
    }

    #[test]
    fn test_round_trip() {
        let jwt = service();
        let token = jwt.generate("edge-1").unwrap();
        assert_eq!(jwt.verify(&token).unwrap(), "edge-1");
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = service().generate("edge-1").unwrap();
        let other = JwtService::new("other-secret", 3600);
        assert!(other.verify(&token).is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let jwt = JwtService::new("test-secret", -120);
        let token = jwt.generate("edge-1").unwrap();
        assert!(jwt.verify(&token).is_err());
    }

    #[test]
    fn test_header_extraction() {
        let jwt = service();
        let token = jwt.generate("edge-1").unwrap();

        let mut headers = HeaderMap::new();
        assert!(node_id_from_headers(&jwt, &headers).is_err());

        headers.insert(AUTHORIZATION, format!("Bearer {token}").parse().unwrap());
        assert_eq!(node_id_from_headers(&jwt, &headers).unwrap(), "edge-1");

        headers.insert(AUTHORIZATION, "Basic abc".parse().unwrap());
        assert!(node_id_from_headers(&jwt, &headers).is_err());
    }
}
