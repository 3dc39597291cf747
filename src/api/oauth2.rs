//
// OAuth 2.0 / OpenID Connect provider endpoints.
//
use chrono::{NaiveDateTime, Utc};
use rocket::form::Form;
use rocket::http::CookieJar;
use rocket::response::status::Custom;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::Route;
use serde_json::{Map, Value};

use crate::{
    api::{ApiResult, JsonResult},
    auth::{self, ClientIp, FirstPartyHeaders, Headers},
    crypto,
    db::{
        models::{AppScope, Application, AuditLog, AuthorizationCode, ClientId, CodeBinding, RefreshToken, User, UserId},
        DbConn,
    },
    CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![authorize, validate, consent, token_form, token_json, introspect, userinfo, revoke]
}

pub fn well_known_routes() -> Vec<Route> {
    routes![openid_configuration, jwks]
}

pub const SCOPE_OPENID: &str = "openid";

//
// Authorization endpoint
//

pub struct AuthorizeParams {
    pub client_id: String,
    pub redirect_uri: String,
    pub response_type: Option<String>,
    pub scope: Option<String>,
    pub state: Option<String>,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
}

/// The browser-facing entry of the code flow. With a valid SSO session the
/// user is silently re-authorized; without one every OAuth parameter is
/// propagated to the login page so the flow can resume after authentication.
#[allow(clippy::too_many_arguments)]
#[get("/oauth2/authorize?<client_id>&<redirect_uri>&<response_type>&<scope>&<state>&<code_challenge>&<code_challenge_method>&<nonce>")]
async fn authorize(
    client_id: String,
    redirect_uri: String,
    response_type: Option<String>,
    scope: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    nonce: Option<String>,
    cookies: &CookieJar<'_>,
    mut conn: DbConn,
) -> ApiResult<Redirect> {
    let params = AuthorizeParams {
        client_id,
        redirect_uri,
        response_type,
        scope,
        state,
        code_challenge,
        code_challenge_method,
        nonce,
    };

    let app = match validate_authorize_client(&params, &mut conn).await? {
        ClientValidation::Valid(app) => app,
        ClientValidation::ErrorRedirect(url) => return Ok(Redirect::found(url)),
    };

    if params.response_type.as_deref().unwrap_or("code") != "code" {
        return Ok(Redirect::found(error_redirect_url(&params.redirect_uri, "unsupported_response_type", params.state.as_deref())?));
    }

    if let Err(error) = validate_pkce_params(&app, &params) {
        return Ok(Redirect::found(error_redirect_url(&params.redirect_uri, error, params.state.as_deref())?));
    }

    // Silent path: a live central session lets the user through without
    // re-authenticating; the application joins the session as a side effect.
    if let Some(session) = auth::resolve_sso_cookie(cookies, &mut conn).await {
        let user_uuid = session.user_uuid.clone();
        let url = issue_code_url(&user_uuid, &app, &params, Some(session.created_at), &mut conn).await?;
        session.join(&app.client_id, &mut conn).await?;
        return Ok(Redirect::found(url));
    }

    // No session: hand over to the login UI with the whole parameter set
    // intact, so it can re-invoke this flow after authentication.
    Ok(Redirect::found(login_redirect_url(&params)))
}

enum ClientValidation {
    Valid(Application),
    ErrorRedirect(String),
}

/// Client validation for the authorize endpoint. An unregistered redirect URI
/// must never be redirected to; an unknown client may bounce back to a URI
/// that is registered for some application.
async fn validate_authorize_client(params: &AuthorizeParams, conn: &mut DbConn) -> ApiResult<ClientValidation> {
    let client_id = ClientId::from(params.client_id.clone());

    let app = match Application::find_by_client_id(&client_id, conn).await {
        Some(app) if app.active => app,
        _ => {
            let usable = url::Url::parse(&params.redirect_uri).is_ok()
                && Application::any_with_redirect_uri(&params.redirect_uri, conn).await;
            if usable {
                return Ok(ClientValidation::ErrorRedirect(error_redirect_url(
                    &params.redirect_uri,
                    "invalid_client",
                    params.state.as_deref(),
                )?));
            }
            err!(InvalidClient, "Unknown or inactive client")
        }
    };

    if !app.is_registered_redirect_uri(&params.redirect_uri) {
        err!(RedirectUriMismatch, "redirect_uri is not registered for this client")
    }

    if !app.allows_grant("authorization_code") {
        return Ok(ClientValidation::ErrorRedirect(error_redirect_url(
            &params.redirect_uri,
            "unauthorized_client",
            params.state.as_deref(),
        )?));
    }

    Ok(ClientValidation::Valid(app))
}

fn validate_pkce_params(app: &Application, params: &AuthorizeParams) -> Result<(), &'static str> {
    match params.code_challenge {
        None => {
            // Public clients have no other way to prove themselves
            if app.is_public() {
                return Err("invalid_request");
            }
        }
        Some(_) => {
            let method = params.code_challenge_method.as_deref().unwrap_or("plain");
            match method {
                "S256" => (),
                "plain" if app.allow_plain_pkce => (),
                _ => return Err("invalid_request"),
            }
        }
    }
    Ok(())
}

/// Creates the bound authorization code and returns the full redirect URL
/// carrying `code` and the preserved `state`.
async fn issue_code_url(
    user_uuid: &UserId,
    app: &Application,
    params: &AuthorizeParams,
    auth_time: Option<NaiveDateTime>,
    conn: &mut DbConn,
) -> ApiResult<String> {
    let method = params
        .code_challenge
        .as_ref()
        .map(|_| params.code_challenge_method.clone().unwrap_or_else(|| String::from("plain")));

    let (code_row, raw_code) = AuthorizationCode::new(CodeBinding {
        user_uuid: user_uuid.clone(),
        client_id: app.client_id.clone(),
        redirect_uri: params.redirect_uri.clone(),
        scope: params.scope.clone().unwrap_or_default(),
        code_challenge: params.code_challenge.clone(),
        code_challenge_method: method,
        nonce: params.nonce.clone(),
        auth_time,
    });
    code_row.save(conn).await?;

    let mut url = url::Url::parse(&params.redirect_uri)?;
    url.query_pairs_mut().append_pair("code", &raw_code);
    if let Some(ref state) = params.state {
        url.query_pairs_mut().append_pair("state", state);
    }

    Ok(url.to_string())
}

fn error_redirect_url(redirect_uri: &str, error: &str, state: Option<&str>) -> ApiResult<String> {
    let mut url = url::Url::parse(redirect_uri)?;
    url.query_pairs_mut().append_pair("error", error);
    if let Some(state) = state {
        url.query_pairs_mut().append_pair("state", state);
    }
    Ok(url.to_string())
}

fn login_redirect_url(params: &AuthorizeParams) -> String {
    let mut url = url::Url::parse(&CONFIG.login_page()).expect("LOGIN_PAGE is validated at startup");

    {
        let mut query = url.query_pairs_mut();
        query.append_pair("client_id", &params.client_id);
        query.append_pair("redirect_uri", &params.redirect_uri);
        for (key, value) in [
            ("response_type", &params.response_type),
            ("scope", &params.scope),
            ("state", &params.state),
            ("code_challenge", &params.code_challenge),
            ("code_challenge_method", &params.code_challenge_method),
            ("nonce", &params.nonce),
        ] {
            if let Some(value) = value {
                query.append_pair(key, value);
            }
        }
    }

    url.to_string()
}

/// Silent-auth probe for application frontends: answers whether the browser
/// holds a session that would let `/oauth2/authorize` pass without a login.
#[get("/oauth2/validate?<client_id>")]
async fn validate(client_id: String, cookies: &CookieJar<'_>, mut conn: DbConn) -> JsonResult {
    let client_id = ClientId::from(client_id);
    let Some(app) = Application::find_by_client_id(&client_id, &mut conn).await else {
        err!(InvalidClient, "Unknown client")
    };

    match auth::resolve_sso_cookie(cookies, &mut conn).await {
        Some(session) => Ok(Json(json!({
            "authenticated": true,
            "user_id": session.user_uuid,
            "joined": session.apps().contains(&*app.client_id),
            "trusted": app.is_trusted,
        }))),
        None => Ok(Json(json!({"authenticated": false}))),
    }
}

//
// Consent flow (explicit approval for untrusted applications)
//

#[derive(Deserialize)]
struct ConsentData {
    client_id: String,
    redirect_uri: String,
    scope: Option<String>,
    state: Option<String>,
    code_challenge: Option<String>,
    code_challenge_method: Option<String>,
    nonce: Option<String>,
}

#[post("/oauth2/authorize", data = "<data>")]
async fn consent(data: Json<ConsentData>, headers: FirstPartyHeaders, cookies: &CookieJar<'_>, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    let params = AuthorizeParams {
        client_id: data.client_id,
        redirect_uri: data.redirect_uri,
        response_type: Some(String::from("code")),
        scope: data.scope,
        state: data.state,
        code_challenge: data.code_challenge,
        code_challenge_method: data.code_challenge_method,
        nonce: data.nonce,
    };

    let client_id = ClientId::from(params.client_id.clone());
    let Some(app) = Application::find_by_client_id(&client_id, &mut conn).await else {
        err!(InvalidClient, "Unknown client")
    };
    if !app.active {
        err!(InvalidClient, "This application has been deactivated")
    }
    if !app.is_registered_redirect_uri(&params.redirect_uri) {
        err!(RedirectUriMismatch, "redirect_uri is not registered for this client")
    }
    if !app.allows_grant("authorization_code") {
        err!(Forbidden, "This application may not use the authorization code flow")
    }
    if validate_pkce_params(&app, &params).is_err() {
        err!("PKCE parameters are missing or not acceptable for this client")
    }

    let session = auth::resolve_sso_cookie(cookies, &mut conn).await;
    let auth_time = session.as_ref().map(|s| s.created_at);

    let redirect_url = issue_code_url(&headers.user.uuid, &app, &params, auth_time, &mut conn).await?;
    if let Some(session) = session {
        session.join(&app.client_id, &mut conn).await?;
    }

    AuditLog::new(Some(headers.user.uuid.clone()), "oauth.consent", Some(headers.ip.ip.to_string()))
        .with_detail(app.client_id.to_string())
        .save(&mut conn)
        .await
        .ok();

    Ok(Json(json!({"success": true, "redirect_url": redirect_url})))
}

//
// Token endpoint
//

/// One field set shared by every grant; the `grant_type` discriminator picks
/// which subset is read. Accepted as form data and as JSON.
#[derive(Debug, Default, Deserialize, FromForm)]
struct TokenRequest {
    grant_type: String,

    // authorization_code
    code: Option<String>,
    redirect_uri: Option<String>,
    code_verifier: Option<String>,

    // refresh_token
    refresh_token: Option<String>,

    // client auth (alternative to HTTP Basic)
    client_id: Option<String>,
    client_secret: Option<String>,

    // client_credentials
    scope: Option<String>,
}

#[post("/oauth2/token", format = "application/x-www-form-urlencoded", data = "<data>", rank = 1)]
async fn token_form(data: Form<TokenRequest>, basic: ClientAuthBasic, ip: ClientIp, conn: DbConn) -> JsonResult {
    handle_token(data.into_inner(), basic, ip, conn).await
}

#[post("/oauth2/token", format = "application/json", data = "<data>", rank = 2)]
async fn token_json(data: Json<TokenRequest>, basic: ClientAuthBasic, ip: ClientIp, conn: DbConn) -> JsonResult {
    handle_token(data.into_inner(), basic, ip, conn).await
}

async fn handle_token(mut data: TokenRequest, basic: ClientAuthBasic, ip: ClientIp, mut conn: DbConn) -> JsonResult {
    // HTTP Basic wins over body credentials when both are present
    if let Some((id, secret)) = basic.0 {
        data.client_id = Some(id);
        data.client_secret = Some(secret);
    }

    match data.grant_type.as_str() {
        "authorization_code" => grant_authorization_code(data, &ip, &mut conn).await,
        "refresh_token" => grant_refresh_token(data, &ip, &mut conn).await,
        "client_credentials" => grant_client_credentials(data, &ip, &mut conn).await,
        _ => err_oauth!(UnsupportedGrant, "Unsupported grant type"),
    }
}

/// Client credentials from the `Authorization: Basic` header, when present.
pub struct ClientAuthBasic(Option<(String, String)>);

#[rocket::async_trait]
impl<'r> rocket::request::FromRequest<'r> for ClientAuthBasic {
    type Error = ();

    async fn from_request(req: &'r rocket::Request<'_>) -> rocket::request::Outcome<Self, Self::Error> {
        let parsed = req.headers().get_one("Authorization").and_then(decode_basic_auth);
        rocket::request::Outcome::Success(ClientAuthBasic(parsed))
    }
}

fn decode_basic_auth(header: &str) -> Option<(String, String)> {
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = data_encoding::BASE64.decode(encoded.trim().as_bytes()).ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (id, secret) = decoded.split_once(':')?;
    Some((id.to_string(), secret.to_string()))
}

/// Loads the client named in the request and, for confidential clients,
/// checks its secret. Public clients pass without a secret but must present
/// a PKCE verifier downstream.
async fn authenticate_client(data: &TokenRequest, conn: &mut DbConn) -> ApiResult<Application> {
    let Some(ref client_id) = data.client_id else {
        err_oauth!(InvalidClient, "client_id is required")
    };

    let client_id = ClientId::from(client_id.clone());
    let Some(app) = Application::find_by_client_id(&client_id, conn).await else {
        err_oauth!(InvalidClient, "Unknown client")
    };
    if !app.active {
        err_oauth!(InvalidClient, "This application has been deactivated")
    }

    if !app.is_public() {
        let Some(ref secret) = data.client_secret else {
            err_oauth!(InvalidClient, "Client authentication required")
        };
        if !app.check_client_secret(secret) {
            err_oauth!(InvalidClient, "Invalid client credentials")
        }
    }

    Ok(app)
}

async fn grant_authorization_code(data: TokenRequest, ip: &ClientIp, conn: &mut DbConn) -> JsonResult {
    let Some(ref raw_code) = data.code else {
        err_oauth!(InvalidRequest, "code is required")
    };
    let Some(ref redirect_uri) = data.redirect_uri else {
        err_oauth!(InvalidRequest, "redirect_uri is required")
    };

    let app = authenticate_client(&data, conn).await?;
    if !app.allows_grant("authorization_code") {
        err_oauth!(UnsupportedGrant, "This client may not use the authorization code grant")
    }

    // Single use: the consume marks the row used, a second redemption of the
    // same code finds nothing.
    let Some(code) = AuthorizationCode::consume(raw_code, conn).await else {
        err_oauth!(InvalidGrant, "Authorization code is invalid or expired")
    };

    // Exact-match binding of client and redirect URI
    if code.client_id != app.client_id || &code.redirect_uri != redirect_uri {
        err_oauth!(InvalidGrant, "Authorization code was issued to a different client or redirect_uri")
    }

    // PKCE: a bound challenge requires the matching verifier
    if let Some(ref challenge) = code.code_challenge {
        let method = code.code_challenge_method.as_deref().unwrap_or("plain");
        let Some(ref verifier) = data.code_verifier else {
            err_oauth!(InvalidGrant, "code_verifier is required")
        };
        if !crypto::verify_code_challenge(method, challenge, verifier) {
            err_oauth!(InvalidGrant, "code_verifier does not match the challenge")
        }
    } else if app.is_public() {
        err_oauth!(InvalidGrant, "Public clients must use PKCE")
    }

    let Some(user) = User::find_by_uuid(&code.user_uuid, conn).await else {
        err_oauth!(InvalidGrant, "Unknown user")
    };
    if !user.is_active() {
        err_oauth!(Suspended, "This account has been suspended")
    }

    let (refresh_row, refresh_raw) = RefreshToken::new(
        user.uuid.clone(),
        Some(app.uuid.clone()),
        code.scope.clone(),
        None,
        ip.ip.to_string(),
    );
    refresh_row.save(conn).await?;

    let scope = if code.scope.is_empty() {
        None
    } else {
        Some(code.scope.clone())
    };
    let claims = auth::generate_access_token_claims(&user.uuid, &app.client_id, scope.clone(), Some(&app.client_id));
    let access_token = auth::sign_claims(&claims)?;

    let mut response = json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": CONFIG.access_token_validity(),
        "refresh_token": refresh_raw,
        "scope": code.scope,
    });

    if code.scope.split(' ').any(|s| s == SCOPE_OPENID) {
        let id_claims = build_id_token_claims(&user, &app, code.nonce.as_deref(), code.auth_time);
        response["id_token"] = Value::String(auth::sign_id_token(&id_claims)?);
    }

    AuditLog::new(Some(user.uuid.clone()), "oauth.code_redeemed", Some(ip.ip.to_string()))
        .with_detail(app.client_id.to_string())
        .save(conn)
        .await
        .ok();

    Ok(Json(response))
}

async fn grant_refresh_token(data: TokenRequest, ip: &ClientIp, conn: &mut DbConn) -> JsonResult {
    let Some(ref raw) = data.refresh_token else {
        err_oauth!(InvalidRequest, "refresh_token is required")
    };

    // The rotation path revokes the old token and inserts the replacement in
    // one transaction; replays of revoked tokens burn their whole family.
    let (user, new_token, new_raw) =
        crate::api::auth::rotate_refresh_token(raw, ip, conn).await.map_err(|e| e.into_oauth())?;

    // A client-bound token can only be refreshed by its client
    let audience = match new_token.client_uuid {
        Some(ref app_uuid) => {
            let app = authenticate_client(&data, conn).await?;
            if &app.uuid != app_uuid {
                err_oauth!(InvalidGrant, "Refresh token was issued to a different client")
            }
            app.client_id.to_string()
        }
        None => auth::FIRST_PARTY_AUDIENCE.to_string(),
    };

    let scope = if new_token.scope.is_empty() {
        None
    } else {
        Some(new_token.scope.clone())
    };
    let azp = match audience.as_str() {
        auth::FIRST_PARTY_AUDIENCE => None,
        other => Some(ClientId::from(other.to_string())),
    };
    let claims = auth::generate_access_token_claims(&user.uuid, &audience, scope, azp.as_ref());
    let access_token = auth::sign_claims(&claims)?;

    Ok(Json(json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": CONFIG.access_token_validity(),
        "refresh_token": new_raw,
        "scope": new_token.scope,
    })))
}

async fn grant_client_credentials(data: TokenRequest, ip: &ClientIp, conn: &mut DbConn) -> JsonResult {
    let app = authenticate_client(&data, conn).await?;

    if app.app_type() != crate::db::models::AppType::M2m {
        err_oauth!(UnsupportedGrant, "Only machine-to-machine clients may use client_credentials")
    }
    if !app.allows_grant("client_credentials") {
        err_oauth!(UnsupportedGrant, "This client may not use the client_credentials grant")
    }

    // The requested scope must be a subset of what the application was granted
    let permitted = AppScope::find_by_app(&app.uuid, conn).await;
    let requested: Vec<&str> = data.scope.as_deref().unwrap_or_default().split_whitespace().collect();
    for scope in &requested {
        if !permitted.iter().any(|p| p == scope) {
            err_oauth!(InvalidScope, format!("Scope '{scope}' is not permitted for this client"))
        }
    }

    // Always a space-separated string on the wire
    let scope = if requested.is_empty() {
        None
    } else {
        Some(requested.join(" "))
    };

    let claims = auth::generate_access_token_claims(&app.client_id, &app.client_id, scope.clone(), Some(&app.client_id));
    let access_token = auth::sign_claims(&claims)?;

    AuditLog::new(None, "oauth.client_credentials", Some(ip.ip.to_string()))
        .with_detail(app.client_id.to_string())
        .save(conn)
        .await
        .ok();

    // No refresh token for machine callers
    Ok(Json(json!({
        "access_token": access_token,
        "token_type": "Bearer",
        "expires_in": CONFIG.access_token_validity(),
        "scope": scope.unwrap_or_default(),
    })))
}

//
// ID token claims
//

/// Registered and profile claims always win a name collision with custom
/// claims, no matter what the application configured.
const PROTECTED_CLAIMS: &[&str] = &[
    "iss",
    "sub",
    "aud",
    "exp",
    "iat",
    "nonce",
    "auth_time",
    "email",
    "email_verified",
    "phone_number",
    "phone_verified",
    "name",
    "picture",
];

fn build_id_token_claims(user: &User, app: &Application, nonce: Option<&str>, auth_time: Option<NaiveDateTime>) -> Value {
    let now = Utc::now();

    // Custom claims first, everything standard afterwards, so no custom claim
    // can shadow a protected one.
    let mut claims = Map::new();
    if let Value::Object(custom) = app.custom_claims() {
        for (key, value) in custom {
            if !PROTECTED_CLAIMS.contains(&key.as_str()) {
                claims.insert(key, value);
            }
        }
    }

    claims.insert("iss".into(), json!(CONFIG.issuer()));
    claims.insert("sub".into(), json!(user.uuid));
    claims.insert("aud".into(), json!(app.client_id));
    claims.insert("iat".into(), json!(now.timestamp()));
    claims.insert("exp".into(), json!((now + chrono::TimeDelta::seconds(CONFIG.id_token_validity())).timestamp()));

    claims.insert("email".into(), json!(user.email));
    claims.insert("email_verified".into(), json!(user.email_verified));
    claims.insert("phone_number".into(), json!(user.phone));
    claims.insert("phone_verified".into(), json!(user.phone_verified));
    claims.insert("name".into(), json!(user.display_name()));
    claims.insert("picture".into(), json!(user.avatar));

    if let Some(nonce) = nonce {
        claims.insert("nonce".into(), json!(nonce));
    }
    if let Some(auth_time) = auth_time {
        claims.insert("auth_time".into(), json!(auth_time.and_utc().timestamp()));
    }

    Value::Object(claims)
}

//
// Introspection (RFC 7662)
//

#[derive(Deserialize, FromForm)]
struct IntrospectData {
    token: String,
    client_id: Option<String>,
    client_secret: Option<String>,
}

#[post("/oauth2/introspect", data = "<data>")]
async fn introspect(
    data: Form<IntrospectData>,
    basic: ClientAuthBasic,
    mut conn: DbConn,
) -> Result<Json<Value>, Custom<Json<Value>>> {
    let data = data.into_inner();

    // The caller must authenticate as a confidential client; anything else
    // gets 401 and learns nothing about the token.
    let credentials = basic.0.or_else(|| data.client_id.clone().zip(data.client_secret.clone()));
    let authenticated = match credentials {
        Some((id, secret)) => {
            let client_id = ClientId::from(id);
            match Application::find_by_client_id(&client_id, &mut conn).await {
                Some(app) if app.active && app.check_client_secret(&secret) => true,
                _ => false,
            }
        }
        None => false,
    };
    if !authenticated {
        return Err(Custom(rocket::http::Status::Unauthorized, Json(json!({"active": false}))));
    }

    // Access tokens verify offline; refresh tokens resolve against the store.
    if let Ok(claims) = auth::decode_access_token(&data.token, None) {
        return Ok(Json(json!({
            "active": true,
            "scope": claims.scope,
            "client_id": claims.azp,
            "sub": claims.sub,
            "exp": claims.exp,
            "iat": claims.iat,
            "iss": claims.iss,
            "aud": claims.aud,
            "token_type": "Bearer",
        })));
    }

    if let Some(token) = RefreshToken::find_by_raw_token(&data.token, &mut conn).await {
        if !token.revoked && !token.is_expired() {
            let client_id = match token.client_uuid {
                Some(ref app_uuid) => Application::find_by_uuid(app_uuid, &mut conn).await.map(|a| a.client_id.to_string()),
                None => None,
            };
            return Ok(Json(json!({
                "active": true,
                "scope": token.scope,
                "client_id": client_id,
                "sub": token.user_uuid,
                "exp": token.expires_at.and_utc().timestamp(),
                "iat": token.created_at.and_utc().timestamp(),
                "iss": CONFIG.issuer(),
                "token_type": "refresh_token",
            })));
        }
    }

    Ok(Json(json!({"active": false})))
}

//
// Userinfo
//

/// Claims are filtered by the token's granted scopes. Tokens without a scope
/// claim (first-party logins) see the full set.
#[get("/oauth2/userinfo")]
async fn userinfo(headers: Headers) -> JsonResult {
    let user = headers.user;
    let scopes: Vec<&str> = headers.claims.scope.as_deref().unwrap_or_default().split_whitespace().collect();
    let granted = |scope: &str| scopes.is_empty() || scopes.contains(&scope);

    let mut body = json!({ "sub": user.uuid });
    if granted("email") {
        body["email"] = json!(user.email);
        body["email_verified"] = json!(user.email_verified);
    }
    if granted("phone") {
        body["phone_number"] = json!(user.phone);
        body["phone_verified"] = json!(user.phone_verified);
    }
    if granted("profile") {
        body["name"] = json!(user.display_name());
        body["picture"] = json!(user.avatar);
    }

    Ok(Json(body))
}

//
// Revocation (RFC 7009)
//

#[derive(Deserialize, FromForm)]
struct RevokeData {
    token: String,
    #[field(name = "token_type_hint")]
    #[serde(rename = "token_type_hint")]
    _token_type_hint: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
}

/// Revokes a refresh token. Unknown tokens still answer 200, a caller can
/// not probe which tokens exist.
#[post("/oauth2/revoke", data = "<data>")]
async fn revoke(data: Form<RevokeData>, basic: ClientAuthBasic, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    if let Some(token) = RefreshToken::find_by_raw_token(&data.token, &mut conn).await {
        // A client may only revoke its own tokens
        let authorized = match token.client_uuid {
            Some(ref app_uuid) => {
                let credentials = basic.0.or_else(|| data.client_id.clone().zip(data.client_secret.clone()));
                match credentials {
                    Some((id, secret)) => {
                        let client_id = ClientId::from(id);
                        match Application::find_by_client_id(&client_id, &mut conn).await {
                            Some(app) => &app.uuid == app_uuid && (app.is_public() || app.check_client_secret(&secret)),
                            None => false,
                        }
                    }
                    None => false,
                }
            }
            None => true,
        };

        if authorized {
            token.revoke(&mut conn).await?;
        }
    }

    Ok(Json(json!({})))
}

//
// Discovery
//

#[get("/openid-configuration")]
fn openid_configuration() -> Json<Value> {
    let issuer = CONFIG.issuer();
    let domain = CONFIG.domain();

    Json(json!({
        "issuer": issuer,
        "authorization_endpoint": format!("{domain}/api/v1/oauth2/authorize"),
        "token_endpoint": format!("{domain}/api/v1/oauth2/token"),
        "userinfo_endpoint": format!("{domain}/api/v1/oauth2/userinfo"),
        "jwks_uri": format!("{domain}/.well-known/jwks.json"),
        "response_types_supported": ["code"],
        "grant_types_supported": ["authorization_code", "refresh_token", "client_credentials"],
        "subject_types_supported": ["public"],
        "id_token_signing_alg_values_supported": ["RS256"],
        "scopes_supported": ["openid", "profile", "email", "phone"],
        "claims_supported": PROTECTED_CLAIMS,
        "code_challenge_methods_supported": ["S256", "plain"],
    }))
}

#[get("/jwks.json")]
fn jwks() -> JsonResult {
    Ok(Json(auth::public_jwks()?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::AppType;

    fn test_app(custom_claims: Option<&str>) -> Application {
        let mut app = Application::new(
            UserId::from("owner"),
            String::from("Test App"),
            AppType::Web,
            vec![String::from("https://app.example.com/callback")],
        );
        app.custom_claims = custom_claims.map(|c| c.to_string());
        app
    }

    fn test_user() -> User {
        let mut user = User::new_with_email(String::from("jane@example.com"));
        user.email_verified = true;
        user.nickname = Some(String::from("Jane"));
        user
    }

    #[test]
    fn custom_claims_cannot_shadow_protected_claims() {
        let app = test_app(Some(r#"{"sub":"spoofed","email":"evil@example.com","tenant":"acme"}"#));
        let user = test_user();

        let claims = build_id_token_claims(&user, &app, Some("nonce-1"), None);

        assert_eq!(claims["sub"], json!(user.uuid));
        assert_eq!(claims["email"], json!("jane@example.com"));
        assert_eq!(claims["tenant"], json!("acme"));
        assert_eq!(claims["nonce"], json!("nonce-1"));
    }

    #[test]
    fn id_token_carries_profile_and_registered_claims() {
        let app = test_app(None);
        let user = test_user();
        let auth_time = Utc::now().naive_utc();

        let claims = build_id_token_claims(&user, &app, None, Some(auth_time));

        assert_eq!(claims["iss"], json!(CONFIG.issuer()));
        assert_eq!(claims["aud"], json!(app.client_id));
        assert_eq!(claims["name"], json!("Jane"));
        assert_eq!(claims["email_verified"], json!(true));
        assert_eq!(claims["auth_time"], json!(auth_time.and_utc().timestamp()));
        assert!(claims.get("nonce").is_none());
        assert!(claims["exp"].as_i64().unwrap() > claims["iat"].as_i64().unwrap());
    }

    #[test]
    fn pkce_is_mandatory_for_public_clients() {
        let mut app = test_app(None);
        app.app_type = AppType::Spa as i32;

        let mut params = AuthorizeParams {
            client_id: app.client_id.to_string(),
            redirect_uri: String::from("https://app.example.com/callback"),
            response_type: Some(String::from("code")),
            scope: None,
            state: None,
            code_challenge: None,
            code_challenge_method: None,
            nonce: None,
        };

        assert_eq!(validate_pkce_params(&app, &params), Err("invalid_request"));

        params.code_challenge = Some(String::from("E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"));
        params.code_challenge_method = Some(String::from("S256"));
        assert!(validate_pkce_params(&app, &params).is_ok());
    }

    #[test]
    fn plain_pkce_needs_explicit_registration() {
        let mut app = test_app(None);
        app.app_type = AppType::Native as i32;

        let params = AuthorizeParams {
            client_id: app.client_id.to_string(),
            redirect_uri: String::from("https://app.example.com/callback"),
            response_type: Some(String::from("code")),
            scope: None,
            state: None,
            code_challenge: Some(String::from("some-challenge")),
            code_challenge_method: Some(String::from("plain")),
            nonce: None,
        };

        assert_eq!(validate_pkce_params(&app, &params), Err("invalid_request"));

        let mut app = app;
        app.allow_plain_pkce = true;
        assert!(validate_pkce_params(&app, &params).is_ok());
    }

    #[test]
    fn basic_auth_decoding() {
        assert_eq!(
            decode_basic_auth("Basic YXBwXzEyMzpzM2NyM3Q="),
            Some((String::from("app_123"), String::from("s3cr3t")))
        );
        assert_eq!(decode_basic_auth("Bearer abc"), None);
        assert_eq!(decode_basic_auth("Basic !!!"), None);
    }

    #[test]
    fn error_redirects_preserve_state() {
        let url = error_redirect_url("https://app.example.com/cb", "invalid_client", Some("xyz")).unwrap();
        assert!(url.contains("error=invalid_client"));
        assert!(url.contains("state=xyz"));
    }
}
