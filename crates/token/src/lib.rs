//! # eRx Token
//!
//! Self-contained bearer-token protocol: issuance and verification of signed
//! access/refresh token pairs with no external round-trip at verification
//! time.
//!
//! A token is three segments joined by `.`: a base64url (no padding) encoded
//! header, a payload, and an HMAC-SHA-256 signature over `header.payload`.
//! Access and refresh tokens share one process-wide secret and algorithm but
//! carry different claim sets: the refresh payload is deliberately narrow
//! (`sub`, `type`, `iat`, `exp`) so that a refresh token can never grant
//! scopes by itself.
//!
//! Verification failures are uniform. A malformed, tampered or expired token
//! all yield the same [`InvalidToken`] value so that callers (and attackers)
//! cannot distinguish why a token was rejected.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use erx_types::{Identity, LicenseNumber, Role};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::collections::BTreeSet;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;
const REFRESH_TYPE: &str = "refresh";

/// Errors that can occur when constructing a [`TokenService`].
#[derive(Debug, thiserror::Error)]
pub enum TokenConfigError {
    #[error("signing secret must not be empty")]
    EmptySecret,
    #[error("token lifetime must be positive")]
    NonPositiveLifetime,
}

/// Errors that can occur while issuing a token pair.
///
/// Issuance fails only on programming error, never on valid input.
#[derive(Debug, thiserror::Error)]
pub enum IssueError {
    #[error("failed to encode claims: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The single, uniform verification failure.
///
/// Deliberately carries no detail: expired, tampered and malformed tokens are
/// indistinguishable to the caller, which prevents oracle attacks against the
/// signing secret.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid token")]
pub struct InvalidToken;

/// An issued access/refresh token pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
    /// Space-separated scope list, mirroring the access token's claims.
    pub scope: String,
}

#[derive(Serialize)]
struct Header {
    alg: &'static str,
    typ: &'static str,
}

const HEADER: Header = Header {
    alg: "HS256",
    typ: "JWT",
};

#[derive(Serialize, Deserialize)]
struct AccessClaims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    license: Option<LicenseNumber>,
    name: String,
    role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    specialty: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    facility_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    facility_name: Option<String>,
    #[serde(default)]
    scopes: BTreeSet<String>,
    iat: i64,
    exp: i64,
}

#[derive(Serialize, Deserialize)]
struct RefreshClaims {
    sub: String,
    #[serde(rename = "type")]
    token_type: String,
    iat: i64,
    exp: i64,
}

/// A verified refresh token.
///
/// Carries only the subject: the credential gate must re-assemble the
/// identity (and re-check credential status) before issuing a new pair. The
/// token protocol never trusts scopes embedded in a refresh token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefreshGrant {
    pub subject: String,
}

/// Configuration for the token protocol, resolved once at startup.
#[derive(Debug, Clone)]
pub struct TokenConfig {
    pub secret: String,
    pub access_ttl_secs: i64,
    pub refresh_ttl_secs: i64,
}

/// Issues and verifies bearer tokens.
///
/// Pure, stateless computation over a read-only secret; safe to share across
/// arbitrary numbers of concurrent callers.
pub struct TokenService {
    secret: Vec<u8>,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(config: TokenConfig) -> Result<Self, TokenConfigError> {
        if config.secret.is_empty() {
            return Err(TokenConfigError::EmptySecret);
        }
        if config.access_ttl_secs <= 0 || config.refresh_ttl_secs <= 0 {
            return Err(TokenConfigError::NonPositiveLifetime);
        }
        Ok(Self {
            secret: config.secret.into_bytes(),
            access_ttl: Duration::seconds(config.access_ttl_secs),
            refresh_ttl: Duration::seconds(config.refresh_ttl_secs),
        })
    }

    /// Issues an access/refresh pair for an assembled identity.
    pub fn issue(&self, identity: &Identity) -> Result<TokenPair, IssueError> {
        let now = Utc::now();

        let access = AccessClaims {
            sub: identity.id.clone(),
            license: identity.license.clone(),
            name: identity.name.clone(),
            role: identity.role,
            specialty: identity.specialty.clone(),
            facility_id: identity.facility_id.clone(),
            facility_name: identity.facility_name.clone(),
            scopes: identity.scopes.clone(),
            iat: now.timestamp(),
            exp: (now + self.access_ttl).timestamp(),
        };
        let refresh = RefreshClaims {
            sub: identity.id.clone(),
            token_type: REFRESH_TYPE.to_owned(),
            iat: now.timestamp(),
            exp: (now + self.refresh_ttl).timestamp(),
        };

        let scope = identity
            .scopes
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join(" ");

        Ok(TokenPair {
            access_token: self.encode(&access)?,
            refresh_token: self.encode(&refresh)?,
            token_type: "Bearer".to_owned(),
            expires_in: self.access_ttl.num_seconds(),
            scope,
        })
    }

    /// Verifies an access token and reconstructs the caller identity.
    ///
    /// Local computation only: signature recomputation (constant-time
    /// comparison), expiry check, claim decoding. Any failure is reported as
    /// the uniform [`InvalidToken`].
    pub fn verify_access(&self, token: &str) -> Result<Identity, InvalidToken> {
        let payload = self.verified_payload(token)?;
        let claims: AccessClaims = serde_json::from_slice(&payload).map_err(|_| InvalidToken)?;

        if claims.exp <= Utc::now().timestamp() {
            return Err(InvalidToken);
        }

        Ok(Identity {
            id: claims.sub,
            license: claims.license,
            name: claims.name,
            role: claims.role,
            specialty: claims.specialty,
            facility_id: claims.facility_id,
            facility_name: claims.facility_name,
            scopes: claims.scopes,
            issued_at: timestamp(claims.iat)?,
            expires_at: timestamp(claims.exp)?,
        })
    }

    /// Verifies a refresh token and returns the bare grant.
    pub fn verify_refresh(&self, token: &str) -> Result<RefreshGrant, InvalidToken> {
        let payload = self.verified_payload(token)?;
        let claims: RefreshClaims = serde_json::from_slice(&payload).map_err(|_| InvalidToken)?;

        if claims.token_type != REFRESH_TYPE {
            return Err(InvalidToken);
        }
        if claims.exp <= Utc::now().timestamp() {
            return Err(InvalidToken);
        }

        Ok(RefreshGrant {
            subject: claims.sub,
        })
    }

    fn encode<T: Serialize>(&self, claims: &T) -> Result<String, IssueError> {
        let header = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&HEADER)?);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let signing_input = format!("{header}.{payload}");
        let signature = URL_SAFE_NO_PAD.encode(self.mac(signing_input.as_bytes()));
        Ok(format!("{signing_input}.{signature}"))
    }

    /// Checks segment structure and signature, returning the decoded payload.
    fn verified_payload(&self, token: &str) -> Result<Vec<u8>, InvalidToken> {
        let mut segments = token.split('.');
        let (Some(header), Some(payload), Some(signature), None) = (
            segments.next(),
            segments.next(),
            segments.next(),
            segments.next(),
        ) else {
            return Err(InvalidToken);
        };

        let presented = URL_SAFE_NO_PAD.decode(signature).map_err(|_| InvalidToken)?;
        if presented.len() != SIGNATURE_LEN {
            return Err(InvalidToken);
        }

        let expected = self.mac(format!("{header}.{payload}").as_bytes());
        // Fixed-time comparison regardless of where the bytes first differ.
        if !bool::from(expected.as_slice().ct_eq(presented.as_slice())) {
            return Err(InvalidToken);
        }

        URL_SAFE_NO_PAD.decode(payload).map_err(|_| InvalidToken)
    }

    fn mac(&self, input: &[u8]) -> Vec<u8> {
        // HMAC accepts keys of any length; the secret is validated non-empty
        // at construction.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC-SHA-256 accepts keys of any length");
        mac.update(input);
        mac.finalize().into_bytes().to_vec()
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, InvalidToken> {
    DateTime::from_timestamp(secs, 0).ok_or(InvalidToken)
}
