//! Acknowledgment tokens
//!
//! The resolve link mailed to an on-caller embeds an HMAC-SHA256 signed
//! token over the incident, the service, and the on-caller's address. The
//! claim names (`inc_id`, `svc_id`, `email`) and the 72-hour expiry are part
//! of the contract with the link format. Tokens are bearer credentials:
//! whoever presents a valid one acknowledges the incident.

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

pub const ISSUER: &str = "alerting-platform";

const TOKEN_TTL_HOURS: i64 = 72;

/// Claims carried by an acknowledgment token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckClaims {
    #[serde(rename = "inc_id")]
    pub incident_id: String,

    #[serde(rename = "svc_id")]
    pub service_id: u64,

    #[serde(rename = "email")]
    pub oncaller: String,

    pub iss: String,

    /// Unix expiry
    pub exp: i64,
}

/// Signs and verifies acknowledgment tokens with a shared secret
pub struct TokenCodec {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl TokenCodec {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[ISSUER]);

        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Sign a token valid for the standard 72 hours
    pub fn sign(&self, incident_id: &str, service_id: u64, oncaller: &str) -> Result<String> {
        let expires_at = Utc::now() + Duration::hours(TOKEN_TTL_HOURS);
        self.sign_with_expiry(incident_id, service_id, oncaller, expires_at.timestamp())
    }

    fn sign_with_expiry(
        &self,
        incident_id: &str,
        service_id: u64,
        oncaller: &str,
        expires_at: i64,
    ) -> Result<String> {
        let claims = AckClaims {
            incident_id: incident_id.to_string(),
            service_id,
            oncaller: oncaller.to_string(),
            iss: ISSUER.to_string(),
            exp: expires_at,
        };

        encode(&Header::default(), &claims, &self.encoding)
            .context("Failed to sign acknowledgment token")
    }

    /// Verify signature, expiry and issuer; returns the claims on success
    pub fn verify(&self, token: &str) -> Result<AckClaims> {
        decode::<AckClaims>(token, &self.decoding, &self.validation)
            .map(|data| data.claims)
            .context("Invalid acknowledgment token")
    }
}
