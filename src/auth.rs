//! Short-lived signed authentication tokens
//!
//! The broker authenticates a device by a JWT passed as the MQTT password.
//! Tokens carry `iat`, `exp` (one hour later) and `aud` (the project id) and
//! are signed with the device's private key using RS256 or ES256.

use crate::error::{DeviceError, DeviceResult};
use crate::protocol::DeviceIdentity;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::debug;

/// Lifetime of every issued token
pub const TOKEN_LIFETIME_SECS: i64 = 3600;

/// Username sent alongside the token; the broker ignores it
pub const UNUSED_USERNAME: &str = "unused";

/// Supported signing families
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum SigningAlgorithm {
    /// RSASSA-PKCS1-v1_5 with SHA-256
    #[default]
    Rs256,
    /// ECDSA P-256 with SHA-256
    Es256,
}

impl SigningAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SigningAlgorithm::Rs256 => "RS256",
            SigningAlgorithm::Es256 => "ES256",
        }
    }

    fn jwt_algorithm(&self) -> Algorithm {
        match self {
            SigningAlgorithm::Rs256 => Algorithm::RS256,
            SigningAlgorithm::Es256 => Algorithm::ES256,
        }
    }

    fn encoding_key(&self, pem: &[u8]) -> Result<EncodingKey, jsonwebtoken::errors::Error> {
        match self {
            SigningAlgorithm::Rs256 => EncodingKey::from_rsa_pem(pem),
            SigningAlgorithm::Es256 => EncodingKey::from_ec_pem(pem),
        }
    }
}

impl FromStr for SigningAlgorithm {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "RS256" => Ok(SigningAlgorithm::Rs256),
            "ES256" => Ok(SigningAlgorithm::Es256),
            other => Err(DeviceError::signing_failure(format!(
                "Unsupported algorithm '{other}', expected RS256 or ES256"
            ))),
        }
    }
}

impl TryFrom<String> for SigningAlgorithm {
    type Error = DeviceError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SigningAlgorithm> for String {
    fn from(algorithm: SigningAlgorithm) -> Self {
        algorithm.as_str().to_string()
    }
}

impl fmt::Display for SigningAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claims carried by a device token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Issue time, seconds since the epoch
    pub iat: i64,
    /// Expiry time, seconds since the epoch
    pub exp: i64,
    /// Audience: the project id
    pub aud: String,
}

impl TokenClaims {
    /// Build claims for a token issued at `now` (pure function)
    pub fn issued_at(project_id: &str, now: DateTime<Utc>) -> Self {
        let iat = now.timestamp();
        Self {
            iat,
            exp: iat + TOKEN_LIFETIME_SECS,
            aud: project_id.to_string(),
        }
    }
}

/// A signed token, ready to hand to the broker client
#[derive(Clone)]
pub struct AuthToken {
    claims: TokenClaims,
    algorithm: SigningAlgorithm,
    encoded: String,
}

impl AuthToken {
    pub fn claims(&self) -> &TokenClaims {
        &self.claims
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    pub fn issued_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.claims.iat, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_opt(self.claims.exp, 0)
            .single()
            .unwrap_or_default()
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now.timestamp() >= self.claims.exp
    }

    /// Compact JWS form, used as the MQTT password
    pub fn as_str(&self) -> &str {
        &self.encoded
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("claims", &self.claims)
            .field("algorithm", &self.algorithm)
            .field("encoded", &"***")
            .finish()
    }
}

/// Issues a fresh token per connection attempt
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    credential_path: PathBuf,
    algorithm: SigningAlgorithm,
}

impl TokenIssuer {
    pub fn new(credential_path: impl Into<PathBuf>, algorithm: SigningAlgorithm) -> Self {
        Self {
            credential_path: credential_path.into(),
            algorithm,
        }
    }

    pub fn credential_path(&self) -> &Path {
        &self.credential_path
    }

    pub fn algorithm(&self) -> SigningAlgorithm {
        self.algorithm
    }

    /// Issue a token valid for one hour from now
    pub fn issue(&self, identity: &DeviceIdentity) -> DeviceResult<AuthToken> {
        self.issue_at(identity, Utc::now())
    }

    /// Issue a token as if the current time were `now`
    pub fn issue_at(&self, identity: &DeviceIdentity, now: DateTime<Utc>) -> DeviceResult<AuthToken> {
        let pem = std::fs::read(&self.credential_path).map_err(|source| {
            DeviceError::CredentialUnavailable {
                path: self.credential_path.clone(),
                source,
            }
        })?;

        debug!(
            algorithm = %self.algorithm,
            key_file = %self.credential_path.display(),
            "Creating JWT"
        );

        let claims = TokenClaims::issued_at(identity.project_id(), now);
        let encoded = sign_claims(&claims, &pem, self.algorithm)?;

        Ok(AuthToken {
            claims,
            algorithm: self.algorithm,
            encoded,
        })
    }
}

/// Sign claims with a PEM-encoded private key
pub fn sign_claims(
    claims: &TokenClaims,
    pem: &[u8],
    algorithm: SigningAlgorithm,
) -> DeviceResult<String> {
    let key = algorithm
        .encoding_key(pem)
        .map_err(|e| DeviceError::signing_failure(format!("Invalid {algorithm} key: {e}")))?;

    jsonwebtoken::encode(&Header::new(algorithm.jwt_algorithm()), claims, &key)
        .map_err(|e| DeviceError::signing_failure(e.to_string()))
}
