//! Token codec: issues and verifies the signed credentials that carry a
//! caller's identity between requests.
//!
//! Access and refresh tokens are independent signing domains with separate
//! secrets. The purpose discriminator is additionally embedded in the signed
//! payload, so a token from one domain cannot be reinterpreted as the other
//! even if the secrets were ever mixed.

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Secrets;
use crate::db::Role;

/// Access token lifetime: 15 minutes.
pub const ACCESS_TOKEN_TTL_MINUTES: i64 = 15;

/// Refresh token lifetime: 7 days. Must stay in step with the ledger's
/// row expiry.
pub const REFRESH_TOKEN_TTL_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("invalid token")]
    InvalidToken,
    #[error("token expired")]
    ExpiredToken,
    #[error("wrong token type")]
    WrongTokenType,
    #[error("token signing failed: {0}")]
    Signing(String),
}

/// Signing domain and embedded discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPurpose {
    Access,
    Refresh,
}

/// Signed claims. Never persisted; valid only within the signed lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub purpose: TokenPurpose,
    pub exp: i64,
    pub iat: i64,
}

/// A freshly issued access + refresh pair.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
}

pub struct TokenCodec {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
}

impl TokenCodec {
    pub fn new(secrets: &Secrets) -> Self {
        Self::from_raw(&secrets.access, &secrets.refresh)
    }

    pub fn from_raw(access_secret: &str, refresh_secret: &str) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(refresh_secret.as_bytes()),
            refresh_decoding: DecodingKey::from_secret(refresh_secret.as_bytes()),
        }
    }

    /// Sign a token for the given subject under the requested domain.
    pub fn issue(
        &self,
        subject: &str,
        role: Role,
        purpose: TokenPurpose,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let ttl = match purpose {
            TokenPurpose::Access => Duration::minutes(ACCESS_TOKEN_TTL_MINUTES),
            TokenPurpose::Refresh => Duration::days(REFRESH_TOKEN_TTL_DAYS),
        };
        let claims = Claims {
            sub: subject.to_string(),
            role,
            purpose,
            exp: (now + ttl).timestamp(),
            iat: now.timestamp(),
        };
        let key = match purpose {
            TokenPurpose::Access => &self.access_encoding,
            TokenPurpose::Refresh => &self.refresh_encoding,
        };
        encode(&Header::default(), &claims, key).map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Issue an access + refresh pair for the same subject.
    pub fn issue_pair(&self, subject: &str, role: Role) -> Result<TokenPair, AuthError> {
        Ok(TokenPair {
            access_token: self.issue(subject, role, TokenPurpose::Access)?,
            refresh_token: self.issue(subject, role, TokenPurpose::Refresh)?,
        })
    }

    /// Issue a token with an explicit lifetime. Exists for expiry tests.
    #[doc(hidden)]
    pub fn issue_with_ttl(
        &self,
        subject: &str,
        role: Role,
        purpose: TokenPurpose,
        ttl_seconds: i64,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let claims = Claims {
            sub: subject.to_string(),
            role,
            purpose,
            exp: (now + Duration::seconds(ttl_seconds)).timestamp(),
            iat: now.timestamp(),
        };
        let key = match purpose {
            TokenPurpose::Access => &self.access_encoding,
            TokenPurpose::Refresh => &self.refresh_encoding,
        };
        encode(&Header::default(), &claims, key).map_err(|e| AuthError::Signing(e.to_string()))
    }

    /// Verify a token against the expected domain.
    ///
    /// Errors are split so callers can distinguish "please refresh"
    /// (`ExpiredToken`) from "please log in again" (everything else).
    pub fn verify(&self, token: &str, expected: TokenPurpose) -> Result<Claims, AuthError> {
        let key = match expected {
            TokenPurpose::Access => &self.access_decoding,
            TokenPurpose::Refresh => &self.refresh_decoding,
        };
        let mut validation = Validation::default();
        validation.validate_exp = true;
        validation.leeway = 0;

        let data = decode::<Claims>(token, key, &validation).map_err(|e| match e.kind() {
            ErrorKind::ExpiredSignature => AuthError::ExpiredToken,
            _ => AuthError::InvalidToken,
        })?;

        if data.claims.purpose != expected {
            return Err(AuthError::WrongTokenType);
        }
        Ok(data.claims)
    }
}
