//! Outbound HTTP clients for the external collaborators.
//!
//! The identity provider and credential registry are queried, never
//! reimplemented. Calls are async and unretried: a transport failure is
//! surfaced immediately as `ServiceUnavailable` and retry policy stays with
//! the caller.

use async_trait::async_trait;
use erx_core::{
    CredentialRecord, CredentialRegistry, CredentialStatus, CredentialVerification,
    IdentityProvider, ProviderClaims, ProviderToken,
};
use erx_types::{LicenseNumber, ServiceError, ServiceResult};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

fn http_client() -> reqwest::Client {
    // A plain client with only a timeout set cannot fail to build; a panic
    // here means the TLS backend itself is broken, which is fatal anyway.
    reqwest::Client::builder()
        .timeout(REQUEST_TIMEOUT)
        .build()
        .expect("static reqwest client configuration")
}

/// Identity provider reached over HTTP.
pub struct HttpIdentityProvider {
    base_url: String,
    http: reqwest::Client,
}

impl HttpIdentityProvider {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            http: http_client(),
        }
    }
}

#[derive(Serialize)]
struct AuthenticateReq<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Deserialize)]
struct AuthenticateRes {
    token: String,
}

#[derive(Serialize)]
struct ClaimsReq<'a> {
    token: &'a str,
}

#[derive(Deserialize)]
struct ClaimsRes {
    subject: String,
    email: Option<String>,
    preferred_handle: Option<String>,
    name: String,
    #[serde(default)]
    roles: Vec<String>,
}

impl From<ClaimsRes> for ProviderClaims {
    fn from(res: ClaimsRes) -> Self {
        Self {
            subject: res.subject,
            email: res.email,
            preferred_handle: res.preferred_handle,
            name: res.name,
            roles: res.roles,
        }
    }
}

fn provider_unreachable(err: reqwest::Error) -> ServiceError {
    tracing::warn!(error = %err, "identity provider call failed");
    ServiceError::unavailable("identity provider unreachable")
}

fn registry_unreachable(err: reqwest::Error) -> ServiceError {
    tracing::warn!(error = %err, "credential registry call failed");
    ServiceError::unavailable("credential registry unreachable")
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn authenticate(&self, username: &str, password: &str) -> ServiceResult<ProviderToken> {
        let response = self
            .http
            .post(format!("{}/auth/authenticate", self.base_url))
            .json(&AuthenticateReq { username, password })
            .send()
            .await
            .map_err(provider_unreachable)?;

        match response.status() {
            StatusCode::OK => {
                let body: AuthenticateRes =
                    response.json().await.map_err(provider_unreachable)?;
                Ok(ProviderToken(body.token))
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(ServiceError::unauthorized("authentication failed"))
            }
            status => {
                tracing::warn!(%status, "unexpected identity provider response");
                Err(ServiceError::unavailable("identity provider unreachable"))
            }
        }
    }

    async fn get_claims(&self, token: &ProviderToken) -> ServiceResult<ProviderClaims> {
        let response = self
            .http
            .post(format!("{}/auth/claims", self.base_url))
            .json(&ClaimsReq { token: &token.0 })
            .send()
            .await
            .map_err(provider_unreachable)?;

        if response.status() != StatusCode::OK {
            return Err(ServiceError::unauthorized("provider rejected the token"));
        }
        let body: ClaimsRes = response.json().await.map_err(provider_unreachable)?;
        Ok(body.into())
    }

    async fn find_subject(&self, subject: &str) -> ServiceResult<Option<ProviderClaims>> {
        let response = self
            .http
            .get(format!("{}/subjects/{subject}", self.base_url))
            .send()
            .await
            .map_err(provider_unreachable)?;

        match response.status() {
            StatusCode::OK => {
                let body: ClaimsRes = response.json().await.map_err(provider_unreachable)?;
                Ok(Some(body.into()))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                tracing::warn!(%status, "unexpected identity provider response");
                Err(ServiceError::unavailable("identity provider unreachable"))
            }
        }
    }

    async fn revoke(&self, refresh_handle: &str) -> ServiceResult<()> {
        self.http
            .post(format!("{}/auth/revoke", self.base_url))
            .json(&serde_json::json!({ "refresh_handle": refresh_handle }))
            .send()
            .await
            .map_err(provider_unreachable)?
            .error_for_status()
            .map_err(provider_unreachable)?;
        Ok(())
    }
}

/// Credential registry reached over HTTP.
pub struct HttpCredentialRegistry {
    base_url: String,
    http: reqwest::Client,
}

impl HttpCredentialRegistry {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_owned(),
            http: http_client(),
        }
    }
}

#[derive(Deserialize)]
struct CredentialRes {
    status: CredentialStatus,
    credential_id: String,
    name: String,
    specialty: Option<String>,
    facility_id: Option<String>,
    facility_name: Option<String>,
}

#[derive(Deserialize)]
struct VerificationRes {
    verified: bool,
    reason: Option<String>,
}

#[async_trait]
impl CredentialRegistry for HttpCredentialRegistry {
    async fn lookup(&self, license: &LicenseNumber) -> ServiceResult<Option<CredentialRecord>> {
        let response = self
            .http
            .get(format!("{}/credentials/{license}", self.base_url))
            .send()
            .await
            .map_err(registry_unreachable)?;

        match response.status() {
            StatusCode::OK => {
                let body: CredentialRes = response.json().await.map_err(registry_unreachable)?;
                Ok(Some(CredentialRecord {
                    status: body.status,
                    credential_id: body.credential_id,
                    name: body.name,
                    specialty: body.specialty,
                    facility_id: body.facility_id,
                    facility_name: body.facility_name,
                }))
            }
            StatusCode::NOT_FOUND => Ok(None),
            status => {
                tracing::warn!(%status, "unexpected credential registry response");
                Err(ServiceError::unavailable("credential registry unreachable"))
            }
        }
    }

    async fn verify_credential(&self, credential_id: &str) -> ServiceResult<CredentialVerification> {
        let response = self
            .http
            .get(format!(
                "{}/credentials/{credential_id}/verification",
                self.base_url
            ))
            .send()
            .await
            .map_err(registry_unreachable)?;

        if response.status() != StatusCode::OK {
            return Err(ServiceError::unavailable("credential registry unreachable"));
        }
        let body: VerificationRes = response.json().await.map_err(registry_unreachable)?;
        Ok(CredentialVerification {
            verified: body.verified,
            reason: body.reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clients_build_with_the_configured_timeout() {
        // Construction must not fall back to an unconfigured client.
        let provider = HttpIdentityProvider::new("http://idp.local:8100/");
        assert_eq!(provider.base_url, "http://idp.local:8100");

        let registry = HttpCredentialRegistry::new("http://registry.local:8200");
        assert_eq!(registry.base_url, "http://registry.local:8200");
    }
}
