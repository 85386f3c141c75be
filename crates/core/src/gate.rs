//! The credential gate.
//!
//! Orchestrates login, refresh and logout against two external collaborators:
//! the identity provider (authentication, identity claims) and the
//! practitioner credential registry (license status and verification).
//! Both are consumed through injected traits so the gate is testable without
//! global state or live services.
//!
//! The gate is the only place a token pair is ever assembled: it resolves a
//! practitioner license from provider claims, re-checks registry status, maps
//! the role to scopes through the policy, and hands the finished identity to
//! the token protocol. On refresh the whole assembly is re-run from scratch —
//! a credential suspended after login fails the next refresh even though the
//! refresh token itself is still valid.

use async_trait::async_trait;
use erx_policy::PolicyEngine;
use erx_token::{TokenPair, TokenService};
use erx_types::{Identity, LicenseNumber, Role, ServiceError, ServiceResult};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// An opaque token returned by the identity provider at authentication time.
#[derive(Debug, Clone)]
pub struct ProviderToken(pub String);

/// Identity claims returned by the provider.
#[derive(Debug, Clone)]
pub struct ProviderClaims {
    pub subject: String,
    pub email: Option<String>,
    pub preferred_handle: Option<String>,
    pub name: String,
    pub roles: Vec<String>,
}

/// The external identity provider, queried but never reimplemented.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn authenticate(&self, username: &str, password: &str) -> ServiceResult<ProviderToken>;

    async fn get_claims(&self, token: &ProviderToken) -> ServiceResult<ProviderClaims>;

    /// Looks up the current claims for a known subject.
    ///
    /// Used on refresh, where only the token's `sub` is available and the
    /// identity must be re-assembled from fresh provider state.
    async fn find_subject(&self, subject: &str) -> ServiceResult<Option<ProviderClaims>>;

    /// Best-effort revocation of a refresh handle.
    async fn revoke(&self, refresh_handle: &str) -> ServiceResult<()>;
}

/// License status as recorded by the credential registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    Active,
    Suspended,
    Revoked,
    Expired,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::Suspended => "suspended",
            CredentialStatus::Revoked => "revoked",
            CredentialStatus::Expired => "expired",
        }
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A credential registry entry for a license.
#[derive(Debug, Clone)]
pub struct CredentialRecord {
    pub status: CredentialStatus,
    pub credential_id: String,
    pub name: String,
    pub specialty: Option<String>,
    pub facility_id: Option<String>,
    pub facility_name: Option<String>,
}

/// The registry's verification verdict for a credential.
#[derive(Debug, Clone)]
pub struct CredentialVerification {
    pub verified: bool,
    pub reason: Option<String>,
}

/// The external practitioner credential registry.
#[async_trait]
pub trait CredentialRegistry: Send + Sync {
    async fn lookup(&self, license: &LicenseNumber) -> ServiceResult<Option<CredentialRecord>>;

    async fn verify_credential(&self, credential_id: &str) -> ServiceResult<CredentialVerification>;
}

/// Checks that a license resolves to a verified, active credential.
///
/// Used at login, signing and refresh time. Any other outcome is `Forbidden`;
/// registry unavailability propagates as `ServiceUnavailable` from the
/// registry implementation.
pub async fn ensure_active(
    registry: &dyn CredentialRegistry,
    license: &LicenseNumber,
) -> ServiceResult<CredentialRecord> {
    let record = registry
        .lookup(license)
        .await?
        .ok_or_else(|| ServiceError::forbidden(format!("license {license} is not registered")))?;

    let verification = registry.verify_credential(&record.credential_id).await?;
    if !verification.verified {
        let reason = verification
            .reason
            .unwrap_or_else(|| "credential is not verified".into());
        return Err(ServiceError::forbidden(reason));
    }

    if record.status != CredentialStatus::Active {
        return Err(ServiceError::forbidden(format!(
            "credential for {license} is {}",
            record.status
        )));
    }

    Ok(record)
}

/// Orchestrates authentication flows; see the module docs.
pub struct CredentialGate {
    provider: Arc<dyn IdentityProvider>,
    registry: Arc<dyn CredentialRegistry>,
    tokens: Arc<TokenService>,
    policy: Arc<PolicyEngine>,
}

impl CredentialGate {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        registry: Arc<dyn CredentialRegistry>,
        tokens: Arc<TokenService>,
        policy: Arc<PolicyEngine>,
    ) -> Self {
        Self {
            provider,
            registry,
            tokens,
            policy,
        }
    }

    /// Authenticates raw credentials and issues a token pair.
    ///
    /// Accounts that resolve to a practitioner license must hold a verified,
    /// active registry credential; accounts that do not resolve to one (e.g.
    /// integrators) log in with role and scopes derived solely from provider
    /// role claims.
    pub async fn login(&self, username: &str, password: &str) -> ServiceResult<TokenPair> {
        let provider_token = self.provider.authenticate(username, password).await?;
        let claims = self.provider.get_claims(&provider_token).await?;
        let pair = self.issue_for_claims(claims).await?;
        tracing::info!(user = %username, "login succeeded");
        Ok(pair)
    }

    /// Exchanges a refresh token for a fresh pair.
    ///
    /// The refresh token proves only the subject. The identity is re-assembled
    /// from current provider and registry state, so the active-status check is
    /// re-run: a license suspended since login fails here.
    pub async fn refresh(&self, refresh_token: &str) -> ServiceResult<TokenPair> {
        let grant = self
            .tokens
            .verify_refresh(refresh_token)
            .map_err(|_| ServiceError::unauthorized("invalid refresh token"))?;

        let claims = self
            .provider
            .find_subject(&grant.subject)
            .await?
            .ok_or_else(|| ServiceError::unauthorized("unknown subject"))?;

        self.issue_for_claims(claims).await
    }

    /// Best-effort logout.
    ///
    /// Revocation failures are logged and swallowed; the caller's session is
    /// gone either way once its tokens expire.
    pub async fn logout(&self, refresh_handle: &str) {
        if let Err(err) = self.provider.revoke(refresh_handle).await {
            tracing::warn!(error = %err, "best-effort provider revoke failed");
        }
    }

    async fn issue_for_claims(&self, claims: ProviderClaims) -> ServiceResult<TokenPair> {
        let license = resolve_license(&claims);
        let credential = match &license {
            Some(license) => Some(ensure_active(self.registry.as_ref(), license).await?),
            None => None,
        };

        let identity = self.assemble_identity(&claims, license, credential.as_ref());
        self.tokens
            .issue(&identity)
            .map_err(|err| ServiceError::internal(format!("token issuance failed: {err}")))
    }

    fn assemble_identity(
        &self,
        claims: &ProviderClaims,
        license: Option<LicenseNumber>,
        credential: Option<&CredentialRecord>,
    ) -> Identity {
        let role = claims
            .roles
            .iter()
            .find_map(|claim| Role::from_claim(claim))
            .unwrap_or(Role::Unknown);

        let now = chrono::Utc::now();
        Identity {
            id: claims.subject.clone(),
            license,
            name: credential
                .map(|c| c.name.clone())
                .unwrap_or_else(|| claims.name.clone()),
            role,
            specialty: credential.and_then(|c| c.specialty.clone()),
            facility_id: credential.and_then(|c| c.facility_id.clone()),
            facility_name: credential.and_then(|c| c.facility_name.clone()),
            scopes: self.policy.scopes_for_role(role),
            issued_at: now,
            expires_at: now,
        }
    }
}

/// Resolves a practitioner license from provider claims.
///
/// Prefers the preferred-handle field, falling back to the email local part;
/// each candidate must match the registry identifier pattern. Accounts where
/// neither matches simply have no license.
fn resolve_license(claims: &ProviderClaims) -> Option<LicenseNumber> {
    if let Some(handle) = claims.preferred_handle.as_deref() {
        if let Ok(license) = LicenseNumber::parse(handle) {
            return Some(license);
        }
    }
    let local_part = claims.email.as_deref()?.split('@').next()?;
    LicenseNumber::parse(local_part).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use erx_token::TokenConfig;
    use erx_types::ErrorKind;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct MockProvider {
        // username -> (password, claims)
        accounts: HashMap<String, (String, ProviderClaims)>,
        revoke_fails: bool,
        revoked: Mutex<Vec<String>>,
    }

    impl MockProvider {
        fn new(accounts: Vec<(&str, &str, ProviderClaims)>) -> Self {
            Self {
                accounts: accounts
                    .into_iter()
                    .map(|(user, pass, claims)| {
                        (user.to_string(), (pass.to_string(), claims))
                    })
                    .collect(),
                revoke_fails: false,
                revoked: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl IdentityProvider for MockProvider {
        async fn authenticate(
            &self,
            username: &str,
            password: &str,
        ) -> ServiceResult<ProviderToken> {
            match self.accounts.get(username) {
                Some((expected, _)) if expected == password => {
                    Ok(ProviderToken(format!("pt-{username}")))
                }
                _ => Err(ServiceError::unauthorized("bad credentials")),
            }
        }

        async fn get_claims(&self, token: &ProviderToken) -> ServiceResult<ProviderClaims> {
            let username = token.0.strip_prefix("pt-").unwrap_or_default();
            self.accounts
                .get(username)
                .map(|(_, claims)| claims.clone())
                .ok_or_else(|| ServiceError::unauthorized("unknown provider token"))
        }

        async fn find_subject(&self, subject: &str) -> ServiceResult<Option<ProviderClaims>> {
            Ok(self
                .accounts
                .values()
                .map(|(_, claims)| claims)
                .find(|claims| claims.subject == subject)
                .cloned())
        }

        async fn revoke(&self, refresh_handle: &str) -> ServiceResult<()> {
            if self.revoke_fails {
                return Err(ServiceError::unavailable("provider unreachable"));
            }
            self.revoked.lock().unwrap().push(refresh_handle.to_owned());
            Ok(())
        }
    }

    struct MockRegistry {
        records: Mutex<HashMap<String, CredentialRecord>>,
    }

    impl MockRegistry {
        fn with(license: &str, record: CredentialRecord) -> Self {
            Self {
                records: Mutex::new(HashMap::from([(license.to_string(), record)])),
            }
        }

        fn empty() -> Self {
            Self {
                records: Mutex::new(HashMap::new()),
            }
        }

        fn set_status(&self, license: &str, status: CredentialStatus) {
            if let Some(record) = self.records.lock().unwrap().get_mut(license) {
                record.status = status;
            }
        }
    }

    #[async_trait]
    impl CredentialRegistry for MockRegistry {
        async fn lookup(&self, license: &LicenseNumber) -> ServiceResult<Option<CredentialRecord>> {
            Ok(self.records.lock().unwrap().get(license.as_str()).cloned())
        }

        async fn verify_credential(
            &self,
            credential_id: &str,
        ) -> ServiceResult<CredentialVerification> {
            // Credentials prefixed "unv-" are registered but unverified.
            Ok(CredentialVerification {
                verified: !credential_id.starts_with("unv-"),
                reason: credential_id
                    .starts_with("unv-")
                    .then(|| "identity documents pending review".to_string()),
            })
        }
    }

    fn physician_claims() -> ProviderClaims {
        ProviderClaims {
            subject: "sub-1".into(),
            email: Some("dana.osei@riverside.example".into()),
            preferred_handle: Some("MD-10234".into()),
            name: "Dana Osei".into(),
            roles: vec!["physician".into()],
        }
    }

    fn active_record() -> CredentialRecord {
        CredentialRecord {
            status: CredentialStatus::Active,
            credential_id: "cred-1".into(),
            name: "Dr Dana Osei".into(),
            specialty: Some("General Practice".into()),
            facility_id: Some("fac-9".into()),
            facility_name: Some("Riverside Clinic".into()),
        }
    }

    fn gate(provider: MockProvider, registry: MockRegistry) -> (CredentialGate, Arc<TokenService>) {
        let tokens = Arc::new(
            TokenService::new(TokenConfig {
                secret: "gate-test-secret".into(),
                access_ttl_secs: 900,
                refresh_ttl_secs: 86_400,
            })
            .unwrap(),
        );
        let gate = CredentialGate::new(
            Arc::new(provider),
            Arc::new(registry),
            tokens.clone(),
            Arc::new(PolicyEngine::builtin()),
        );
        (gate, tokens)
    }

    #[tokio::test]
    async fn login_issues_tokens_for_active_practitioner() {
        let provider = MockProvider::new(vec![("dosei", "pw", physician_claims())]);
        let registry = MockRegistry::with("MD-10234", active_record());
        let (gate, tokens) = gate(provider, registry);

        let pair = gate.login("dosei", "pw").await.unwrap();
        let identity = tokens.verify_access(&pair.access_token).unwrap();

        assert_eq!(identity.role, Role::Physician);
        assert_eq!(
            identity.license,
            Some(LicenseNumber::parse("MD-10234").unwrap())
        );
        // Registry data enriches the identity.
        assert_eq!(identity.name, "Dr Dana Osei");
        assert_eq!(identity.facility_id.as_deref(), Some("fac-9"));
        assert!(identity.has_scope("prescription.sign"));
    }

    #[tokio::test]
    async fn suspended_license_cannot_log_in() {
        let mut record = active_record();
        record.status = CredentialStatus::Suspended;
        let provider = MockProvider::new(vec![("dosei", "pw", physician_claims())]);
        let registry = MockRegistry::with("MD-10234", record);
        let (gate, _) = gate(provider, registry);

        let err = gate.login("dosei", "pw").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn unverified_credential_cannot_log_in() {
        let mut record = active_record();
        record.credential_id = "unv-cred-1".into();
        let provider = MockProvider::new(vec![("dosei", "pw", physician_claims())]);
        let registry = MockRegistry::with("MD-10234", record);
        let (gate, _) = gate(provider, registry);

        let err = gate.login("dosei", "pw").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
        assert!(err.message.contains("pending review"));
    }

    #[tokio::test]
    async fn unregistered_license_cannot_log_in() {
        let provider = MockProvider::new(vec![("dosei", "pw", physician_claims())]);
        let (gate, _) = gate(provider, MockRegistry::empty());

        let err = gate.login("dosei", "pw").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn licenseless_integrator_logs_in_with_provider_roles_only() {
        let claims = ProviderClaims {
            subject: "sub-int".into(),
            email: Some("feeds@partner.example".into()),
            preferred_handle: Some("partner-feeds".into()),
            name: "Partner Feed".into(),
            roles: vec!["integrator".into()],
        };
        let provider = MockProvider::new(vec![("feeds", "pw", claims)]);
        let (gate, tokens) = gate(provider, MockRegistry::empty());

        let pair = gate.login("feeds", "pw").await.unwrap();
        let identity = tokens.verify_access(&pair.access_token).unwrap();
        assert_eq!(identity.role, Role::Integrator);
        assert_eq!(identity.license, None);
        assert!(identity.has_scope("catalog.read"));
        assert!(!identity.has_scope("prescription.sign"));
    }

    #[tokio::test]
    async fn license_resolves_from_email_local_part_as_fallback() {
        let claims = ProviderClaims {
            preferred_handle: Some("dr.dana".into()),
            email: Some("MD-10234@riverside.example".into()),
            ..physician_claims()
        };
        let provider = MockProvider::new(vec![("dosei", "pw", claims)]);
        let registry = MockRegistry::with("MD-10234", active_record());
        let (gate, tokens) = gate(provider, registry);

        let pair = gate.login("dosei", "pw").await.unwrap();
        let identity = tokens.verify_access(&pair.access_token).unwrap();
        assert_eq!(
            identity.license,
            Some(LicenseNumber::parse("MD-10234").unwrap())
        );
    }

    #[tokio::test]
    async fn refresh_reruns_the_active_status_check() {
        let provider = MockProvider::new(vec![("dosei", "pw", physician_claims())]);
        let registry = MockRegistry::with("MD-10234", active_record());
        let registry_handle = Arc::new(registry);

        let tokens = Arc::new(
            TokenService::new(TokenConfig {
                secret: "gate-test-secret".into(),
                access_ttl_secs: 900,
                refresh_ttl_secs: 86_400,
            })
            .unwrap(),
        );
        let gate = CredentialGate::new(
            Arc::new(provider),
            registry_handle.clone(),
            tokens.clone(),
            Arc::new(PolicyEngine::builtin()),
        );

        let pair = gate.login("dosei", "pw").await.unwrap();
        // Refresh works while the credential stays active.
        gate.refresh(&pair.refresh_token).await.unwrap();

        registry_handle.set_status("MD-10234", CredentialStatus::Suspended);
        let err = gate.refresh(&pair.refresh_token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn refresh_rejects_garbage_and_access_tokens() {
        let provider = MockProvider::new(vec![("dosei", "pw", physician_claims())]);
        let registry = MockRegistry::with("MD-10234", active_record());
        let (gate, _) = gate(provider, registry);

        let pair = gate.login("dosei", "pw").await.unwrap();
        let err = gate.refresh("not-a-token").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
        let err = gate.refresh(&pair.access_token).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn bad_password_is_unauthorized() {
        let provider = MockProvider::new(vec![("dosei", "pw", physician_claims())]);
        let registry = MockRegistry::with("MD-10234", active_record());
        let (gate, _) = gate(provider, registry);

        let err = gate.login("dosei", "wrong").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::Unauthorized);
    }

    #[tokio::test]
    async fn logout_swallows_provider_failures() {
        let mut provider = MockProvider::new(vec![("dosei", "pw", physician_claims())]);
        provider.revoke_fails = true;
        let registry = MockRegistry::with("MD-10234", active_record());
        let (gate, _) = gate(provider, registry);

        // Must not propagate the failure.
        gate.logout("some-refresh-handle").await;
    }
}
