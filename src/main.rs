use std::sync::Arc;

use erx_api_rest::clients::{HttpCredentialRegistry, HttpIdentityProvider};
use erx_api_rest::{router, ApiDoc, AppState};
use erx_core::{CredentialGate, MemoryPrescriptionStore, PrescriptionService, PrescriptionSigner};
use erx_policy::PolicyEngine;
use erx_token::{TokenConfig, TokenService};
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

/// Main entry point for the eRx platform.
///
/// Resolves configuration once, constructs every component explicitly and
/// passes it down (no module-scoped singletons), then serves the REST API.
///
/// # Environment Variables
/// - `ERX_REST_ADDR`: REST server address (default: "0.0.0.0:3000")
/// - `ERX_TOKEN_SECRET`: HMAC signing secret for bearer tokens (required)
/// - `ERX_ACCESS_TTL_SECS`: access token lifetime (default: 900)
/// - `ERX_REFRESH_TTL_SECS`: refresh token lifetime (default: 86400)
/// - `ERX_POLICY_FILE`: optional path to a policy YAML overriding the built-in
/// - `ERX_IDP_URL`: base URL of the identity provider
/// - `ERX_REGISTRY_URL`: base URL of the credential registry
/// - `ERX_SIGNING_KEY_PEM`: optional PKCS#8 PEM for the prescription signing
///   key; an ephemeral key is generated when absent
/// - `ERX_CERTIFICATE_ID`: identifier recorded on signatures (default: "local-dev")
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env().add_directive("erx=info".parse()?))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let rest_addr = std::env::var("ERX_REST_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".into());

    let tokens = Arc::new(TokenService::new(TokenConfig {
        secret: std::env::var("ERX_TOKEN_SECRET")
            .map_err(|_| anyhow::anyhow!("ERX_TOKEN_SECRET must be set"))?,
        access_ttl_secs: env_i64("ERX_ACCESS_TTL_SECS", 900)?,
        refresh_ttl_secs: env_i64("ERX_REFRESH_TTL_SECS", 86_400)?,
    })?);

    let policy = Arc::new(match std::env::var("ERX_POLICY_FILE") {
        Ok(path) => {
            tracing::info!(%path, "loading policy document");
            PolicyEngine::from_file(&path)?
        }
        Err(_) => PolicyEngine::builtin(),
    });

    let idp_url = std::env::var("ERX_IDP_URL").unwrap_or_else(|_| "http://localhost:8100".into());
    let registry_url =
        std::env::var("ERX_REGISTRY_URL").unwrap_or_else(|_| "http://localhost:8200".into());
    let provider = Arc::new(HttpIdentityProvider::new(idp_url));
    let registry = Arc::new(HttpCredentialRegistry::new(registry_url));

    let certificate_id =
        std::env::var("ERX_CERTIFICATE_ID").unwrap_or_else(|_| "local-dev".into());
    let signer = Arc::new(match std::env::var("ERX_SIGNING_KEY_PEM") {
        Ok(pem) => PrescriptionSigner::from_pkcs8_pem(&pem, certificate_id)?,
        Err(_) => {
            tracing::warn!("ERX_SIGNING_KEY_PEM not set, generating an ephemeral signing key");
            PrescriptionSigner::generate(certificate_id)
        }
    });

    let gate = Arc::new(CredentialGate::new(
        provider,
        registry.clone(),
        tokens.clone(),
        policy.clone(),
    ));
    let prescriptions = Arc::new(PrescriptionService::new(
        Arc::new(MemoryPrescriptionStore::new()),
        registry,
        policy,
        signer,
    ));

    let app = router(AppState {
        gate,
        prescriptions,
        tokens,
    })
    .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
    .layer(CorsLayer::permissive());

    tracing::info!("++ Starting eRx REST on {}", rest_addr);
    let listener = tokio::net::TcpListener::bind(&rest_addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn env_i64(name: &str, default: i64) -> anyhow::Result<i64> {
    match std::env::var(name) {
        Ok(value) => value
            .parse()
            .map_err(|_| anyhow::anyhow!("{name} must be an integer")),
        Err(_) => Ok(default),
    }
}
