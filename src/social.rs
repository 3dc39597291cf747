//
// Social login via upstream OpenID Connect providers.
//
use once_cell::sync::Lazy;
use std::time::Duration;

use moka::future::Cache;
use openidconnect::core::{CoreAuthenticationFlow, CoreClient, CoreProviderMetadata};
use openidconnect::{
    AuthorizationCode, ClientSecret, CsrfToken, IssuerUrl, Nonce, PkceCodeChallenge, PkceCodeVerifier, RedirectUrl,
    Scope, TokenResponse,
};

use crate::{
    api::ApiResult,
    config::SocialProvider,
    error::{Error, ErrorKind},
    CONFIG,
};

// Redirects are disabled; an identity provider that redirects its token
// endpoint is not one we want to follow blindly.
static HTTP_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    crate::http_client::get_reqwest_client_builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("Failed to build OIDC HTTP client")
});

static METADATA_CACHE: Lazy<Cache<String, CoreProviderMetadata>> =
    Lazy::new(|| Cache::builder().max_capacity(16).time_to_live(Duration::from_secs(3600)).build());

/// Login attempts in flight, keyed by the `state` sent to the provider.
static PENDING_LOGINS: Lazy<Cache<String, PendingSocialLogin>> =
    Lazy::new(|| Cache::builder().max_capacity(10_000).time_to_live(Duration::from_secs(600)).build());

#[derive(Clone)]
struct PendingSocialLogin {
    provider: String,
    nonce: String,
    pkce_verifier: String,
}

/// What the provider asserted about the authenticated person.
pub struct SocialUser {
    pub provider: String,
    pub provider_user_id: String,
    pub email: Option<String>,
    pub email_verified: bool,
    pub name: Option<String>,
    pub picture: Option<String>,
}

fn provider_config(provider: &str) -> ApiResult<SocialProvider> {
    CONFIG
        .social_provider(provider)
        .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("Unknown social provider '{provider}'")))
}

fn callback_url(provider: &str) -> String {
    format!("{}/api/v1/auth/oauth/{provider}/callback", CONFIG.domain())
}

async fn provider_metadata(provider: &str, config: &SocialProvider) -> ApiResult<CoreProviderMetadata> {
    if let Some(metadata) = METADATA_CACHE.get(provider).await {
        return Ok(metadata);
    }

    let issuer_url = IssuerUrl::new(config.issuer.clone())
        .map_err(|e| Error::new(ErrorKind::Internal, format!("Invalid issuer URL for '{provider}': {e}")))?;

    let metadata = CoreProviderMetadata::discover_async(issuer_url, &*HTTP_CLIENT)
        .await
        .map_err(|e| Error::new(ErrorKind::Internal, format!("Failed to discover provider '{provider}': {e}")))?;

    METADATA_CACHE.insert(provider.to_string(), metadata.clone()).await;
    Ok(metadata)
}

/// Builds the provider's authorization URL and parks the flow state until the
/// callback arrives.
pub async fn authorize_url(provider: &str) -> ApiResult<String> {
    let config = provider_config(provider)?;
    let metadata = provider_metadata(provider, &config).await?;

    let client = CoreClient::from_provider_metadata(
        metadata,
        openidconnect::ClientId::new(config.client_id.clone()),
        Some(ClientSecret::new(config.client_secret.clone())),
    )
    .set_redirect_uri(
        RedirectUrl::new(callback_url(provider))
            .map_err(|e| Error::new(ErrorKind::Internal, format!("Invalid callback URL: {e}")))?,
    );

    let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

    let mut request = client
        .authorize_url(CoreAuthenticationFlow::AuthorizationCode, CsrfToken::new_random, Nonce::new_random)
        .set_pkce_challenge(pkce_challenge);

    for scope in &config.scopes {
        request = request.add_scope(Scope::new(scope.clone()));
    }

    let (auth_url, csrf_state, nonce) = request.url();

    PENDING_LOGINS
        .insert(
            csrf_state.secret().clone(),
            PendingSocialLogin {
                provider: provider.to_string(),
                nonce: nonce.secret().clone(),
                pkce_verifier: pkce_verifier.secret().clone(),
            },
        )
        .await;

    Ok(auth_url.to_string())
}

/// Redeems the provider callback. The state must match a pending login, the
/// ID token must verify against the provider keys, and the nonce must match
/// the one bound at authorize time.
pub async fn exchange_callback(provider: &str, state: &str, code: &str) -> ApiResult<SocialUser> {
    let Some(pending) = PENDING_LOGINS.get(state).await else {
        err!(InvalidCredentials, "Unknown or expired login state")
    };
    PENDING_LOGINS.invalidate(state).await;

    if pending.provider != provider {
        err!(InvalidCredentials, "Login state does not belong to this provider")
    }

    let config = provider_config(provider)?;
    let metadata = provider_metadata(provider, &config).await?;

    let client = CoreClient::from_provider_metadata(
        metadata,
        openidconnect::ClientId::new(config.client_id.clone()),
        Some(ClientSecret::new(config.client_secret.clone())),
    )
    .set_redirect_uri(
        RedirectUrl::new(callback_url(provider))
            .map_err(|e| Error::new(ErrorKind::Internal, format!("Invalid callback URL: {e}")))?,
    );

    let token_response = client
        .exchange_code(AuthorizationCode::new(code.to_string()))
        .map_err(|e| Error::new(ErrorKind::Internal, format!("Provider has no token endpoint: {e}")))?
        .set_pkce_verifier(PkceCodeVerifier::new(pending.pkce_verifier))
        .request_async(&*HTTP_CLIENT)
        .await
        .map_err(|e| Error::new(ErrorKind::InvalidCredentials, format!("Code exchange with '{provider}' failed: {e}")))?;

    let Some(id_token) = token_response.id_token() else {
        err!(InvalidCredentials, "Provider returned no ID token")
    };

    let nonce = Nonce::new(pending.nonce);
    let claims = id_token
        .claims(&client.id_token_verifier(), &nonce)
        .map_err(|e| Error::new(ErrorKind::InvalidCredentials, format!("ID token verification failed: {e}")))?;

    Ok(SocialUser {
        provider: provider.to_string(),
        provider_user_id: claims.subject().to_string(),
        email: claims.email().map(|e| e.to_string()),
        email_verified: claims.email_verified().unwrap_or(false),
        name: claims.name().and_then(|n| n.get(None)).map(|n| n.to_string()),
        picture: claims.picture().and_then(|p| p.get(None)).map(|p| p.to_string()),
    })
}
