//! JWT authentication.
//!
//! The owner identity is strictly the verified token's `sub`; owner ids
//! arriving in query strings or bodies are ignored. JWKS-backed
//! verification is an external concern — deployments hand this module a
//! shared-secret or disable auth for local development.

use capstan_core::{Error, Result};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    #[default]
    Jwt,
    /// Local development only: every request authenticates as `sub`
    /// "dev".
    None,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

#[derive(Clone)]
pub struct ResolvedAuth {
    pub mode: AuthMode,
    decoding_key: Option<DecodingKey>,
}

impl ResolvedAuth {
    pub fn jwt(secret: &str) -> Self {
        Self {
            mode: AuthMode::Jwt,
            decoding_key: Some(DecodingKey::from_secret(secret.as_bytes())),
        }
    }

    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::None,
            decoding_key: None,
        }
    }

    pub fn from_env() -> Result<Self> {
        match std::env::var("CAPSTAN_JWT_SECRET") {
            Ok(secret) if !secret.is_empty() => Ok(Self::jwt(&secret)),
            _ if std::env::var("CAPSTAN_AUTH_DISABLED").is_ok() => Ok(Self::disabled()),
            _ => Err(Error::Config(
                "set CAPSTAN_JWT_SECRET (or CAPSTAN_AUTH_DISABLED for local dev)".into(),
            )),
        }
    }

    /// Verify a raw token and return the owner id (`sub`).
    pub fn verify(&self, token: Option<&str>) -> Result<String> {
        match self.mode {
            AuthMode::None => Ok("dev".to_string()),
            AuthMode::Jwt => {
                let token = token.ok_or_else(|| Error::auth_failed("missing bearer token"))?;
                let key = self
                    .decoding_key
                    .as_ref()
                    .ok_or_else(|| Error::auth_failed("no verification key configured"))?;
                let data = decode::<Claims>(token, key, &Validation::new(Algorithm::HS256))
                    .map_err(|e| Error::auth_failed(format!("invalid token: {e}")))?;
                Ok(data.claims.sub)
            }
        }
    }

    /// Verify an `Authorization: Bearer <token>` header value.
    pub fn verify_bearer(&self, header: Option<&str>) -> Result<String> {
        let token = header.and_then(|h| h.strip_prefix("Bearer "));
        if self.mode == AuthMode::Jwt && header.is_some() && token.is_none() {
            return Err(Error::auth_failed("malformed authorization header"));
        }
        self.verify(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn token_for(sub: &str, secret: &str) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_yields_sub() {
        let auth = ResolvedAuth::jwt("secret");
        let token = token_for("owner-42", "secret");
        assert_eq!(auth.verify(Some(&token)).unwrap(), "owner-42");
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let auth = ResolvedAuth::jwt("secret");
        let token = token_for("owner-42", "other-secret");
        assert!(auth.verify(Some(&token)).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let auth = ResolvedAuth::jwt("secret");
        let claims = Claims {
            sub: "owner".into(),
            exp: (chrono::Utc::now().timestamp() - 3600) as usize,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(auth.verify(Some(&token)).is_err());
    }

    #[test]
    fn missing_token_is_rejected() {
        let auth = ResolvedAuth::jwt("secret");
        assert!(auth.verify(None).is_err());
        assert!(auth.verify_bearer(None).is_err());
    }

    #[test]
    fn bearer_prefix_is_required() {
        let auth = ResolvedAuth::jwt("secret");
        let token = token_for("owner", "secret");
        assert!(auth.verify_bearer(Some(&format!("Bearer {token}"))).is_ok());
        assert!(auth.verify_bearer(Some(&token)).is_err());
    }

    #[test]
    fn disabled_mode_authenticates_as_dev() {
        let auth = ResolvedAuth::disabled();
        assert_eq!(auth.verify(None).unwrap(), "dev");
    }
}
