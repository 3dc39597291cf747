//
// JWT Handling
//
use chrono::{TimeDelta, Utc};
use once_cell::sync::Lazy;
use std::fs;
use std::path::PathBuf;

use jsonwebtoken::{self, Algorithm, DecodingKey, EncodingKey, Header};
use serde::de::DeserializeOwned;
use serde::ser::Serialize;
use serde_json::Value;

use crate::{
    error::{Error, ErrorKind},
    CONFIG,
};

const JWT_ALGORITHM: Algorithm = Algorithm::RS256;

pub const MFA_TOKEN_TYPE: &str = "mfa";

/// The audience access tokens carry when no OAuth client is involved.
pub const FIRST_PARTY_AUDIENCE: &str = "uniauth";

struct SigningKey {
    kid: String,
    encoding: EncodingKey,
    decoding: DecodingKey,
    public_pem: Vec<u8>,
}

/// Ordered signing key set. The highest key id signs; every loaded key
/// verifies. Retiring a key means deleting its PEM from the key folder.
static KEY_SET: Lazy<Vec<SigningKey>> = Lazy::new(|| {
    load_or_create_keys().unwrap_or_else(|e| panic!("Error loading signing keys.\n{e}"))
});

fn key_folder() -> PathBuf {
    PathBuf::from(CONFIG.signing_key_folder())
}

fn load_or_create_keys() -> Result<Vec<SigningKey>, Error> {
    let folder = key_folder();
    fs::create_dir_all(&folder)?;

    let mut kids: Vec<String> = fs::read_dir(&folder)?
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let name = e.file_name().to_string_lossy().into_owned();
            name.strip_suffix(".pem").map(|kid| kid.to_string())
        })
        .collect();

    if kids.is_empty() {
        let kid = generate_signing_key(&folder)?;
        kids.push(kid);
    }

    kids.sort();

    let mut keys = Vec::with_capacity(kids.len());
    for kid in kids {
        let pem = fs::read(folder.join(format!("{kid}.pem")))?;
        let rsa = openssl::rsa::Rsa::private_key_from_pem(&pem)?;
        let public_pem = rsa.public_key_to_pem()?;

        keys.push(SigningKey {
            kid,
            encoding: EncodingKey::from_rsa_pem(&pem).map_err(Error::from)?,
            decoding: DecodingKey::from_rsa_pem(&public_pem).map_err(Error::from)?,
            public_pem,
        });
    }

    Ok(keys)
}

fn generate_signing_key(folder: &std::path::Path) -> Result<String, Error> {
    let kid = format!("rsa-{}", Utc::now().format("%Y%m%d%H%M%S"));
    let rsa = openssl::rsa::Rsa::generate(2048)?;
    let pem = rsa.private_key_to_pem()?;

    crate::util::write_file(&folder.join(format!("{kid}.pem")).to_string_lossy(), &pem)?;
    info!("Generated new token signing key {kid}");
    Ok(kid)
}

pub fn load_keys() {
    Lazy::force(&KEY_SET);
}

fn current_key() -> &'static SigningKey {
    KEY_SET.last().expect("Signing key set is never empty")
}

/// The only signing entry point. Access, ID and MFA tokens all go through
/// here so they share one algorithm and one key set.
pub fn sign_claims<T: Serialize>(claims: &T) -> Result<String, Error> {
    let key = current_key();
    let mut header = Header::new(JWT_ALGORITHM);
    header.kid = Some(key.kid.clone());

    jsonwebtoken::encode(&header, claims, &key.encoding).map_err(Error::from)
}

fn decode_jwt<T: DeserializeOwned>(token: &str, expected_aud: Option<&str>) -> Result<T, Error> {
    let mut validation = jsonwebtoken::Validation::new(JWT_ALGORITHM);
    validation.leeway = 30; // 30 seconds
    validation.set_issuer(&[CONFIG.issuer()]);
    match expected_aud {
        Some(aud) => validation.set_audience(&[aud]),
        None => validation.validate_aud = false,
    }

    let token = token.trim();
    let header = jsonwebtoken::decode_header(token).map_err(map_jwt_error)?;

    // Prefer the key named by the header, fall back to scanning the set so
    // tokens signed before a rotation keep verifying.
    let keys: Vec<&SigningKey> = match header.kid {
        Some(ref kid) => match KEY_SET.iter().find(|k| &k.kid == kid) {
            Some(key) => vec![key],
            None => KEY_SET.iter().collect(),
        },
        None => KEY_SET.iter().collect(),
    };

    let mut last_err = Error::new(ErrorKind::InvalidToken, "Invalid token");
    for key in keys {
        match jsonwebtoken::decode(token, &key.decoding, &validation) {
            Ok(data) => return Ok(data.claims),
            Err(e) => last_err = map_jwt_error(e),
        }
    }
    Err(last_err)
}

fn map_jwt_error(e: jsonwebtoken::errors::Error) -> Error {
    use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
    let kind = match e.kind() {
        JwtErrorKind::ExpiredSignature => ErrorKind::TokenExpired,
        _ => ErrorKind::InvalidToken,
    };
    Error::from(e).with_kind(kind).with_msg("Invalid token")
}

//
// Claims
//
use crate::db::models::{ClientId, UserId};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    // Issuer
    pub iss: String,
    // Subject, the user uuid (or client_id for client_credentials tokens)
    pub sub: String,
    // Audience, a client_id or the first-party marker
    pub aud: String,
    // Issued at
    pub iat: i64,
    // Expiration time
    pub exp: i64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    // Authorized party, set for tokens issued to OAuth clients
    #[serde(skip_serializing_if = "Option::is_none")]
    pub azp: Option<String>,
}

pub fn generate_access_token_claims(
    sub: &str,
    aud: &str,
    scope: Option<String>,
    azp: Option<&ClientId>,
) -> AccessTokenClaims {
    let time_now = Utc::now();
    AccessTokenClaims {
        iss: CONFIG.issuer(),
        sub: sub.to_string(),
        aud: aud.to_string(),
        iat: time_now.timestamp(),
        exp: (time_now + TimeDelta::seconds(CONFIG.access_token_validity())).timestamp(),
        scope,
        azp: azp.map(|a| a.to_string()),
    }
}

pub fn decode_access_token(token: &str, expected_aud: Option<&str>) -> Result<AccessTokenClaims, Error> {
    decode_jwt(token, expected_aud)
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MfaTokenClaims {
    // Issuer
    pub iss: String,
    // Subject, the half-authenticated user
    pub sub: UserId,
    // Expiration time
    pub exp: i64,

    #[serde(rename = "type")]
    pub token_type: String,
}

pub fn generate_mfa_token_claims(user_uuid: UserId) -> MfaTokenClaims {
    let time_now = Utc::now();
    MfaTokenClaims {
        iss: CONFIG.issuer(),
        sub: user_uuid,
        exp: (time_now + TimeDelta::seconds(CONFIG.mfa_token_validity())).timestamp(),
        token_type: MFA_TOKEN_TYPE.to_string(),
    }
}

pub fn decode_mfa_token(token: &str) -> Result<MfaTokenClaims, Error> {
    let claims: MfaTokenClaims = decode_jwt(token, None)?;
    if claims.token_type != MFA_TOKEN_TYPE {
        return Err(Error::new(ErrorKind::InvalidToken, "Not an MFA token"));
    }
    Ok(claims)
}

/// ID tokens are assembled as a JSON object because the claim set varies per
/// application; see the claims builder in the OAuth engine.
pub fn sign_id_token(claims: &Value) -> Result<String, Error> {
    sign_claims(claims)
}

//
// JWKS
//
use data_encoding::BASE64URL_NOPAD;

/// The public half of every loaded key, served at /.well-known/jwks.json.
pub fn public_jwks() -> Result<Value, Error> {
    let mut keys = Vec::with_capacity(KEY_SET.len());

    for key in KEY_SET.iter() {
        let rsa = openssl::rsa::Rsa::public_key_from_pem(&key.public_pem)?;
        keys.push(json!({
            "kty": "RSA",
            "use": "sig",
            "alg": "RS256",
            "kid": key.kid,
            "n": BASE64URL_NOPAD.encode(&rsa.n().to_vec()),
            "e": BASE64URL_NOPAD.encode(&rsa.e().to_vec()),
        }));
    }

    Ok(json!({ "keys": keys }))
}

//
// Bearer token authentication
//
use rocket::request::{FromRequest, Outcome, Request};

use crate::db::{
    models::{SsoSession, User},
    DbConn,
};

/// Per-process cache of verified access tokens. Entries live at most 60
/// seconds, and expiry inside the window is re-checked on every hit, so the
/// effective lifetime is min(claims.exp, now + 60s).
static TOKEN_CACHE: Lazy<moka::future::Cache<String, AccessTokenClaims>> =
    Lazy::new(|| moka::future::Cache::builder().max_capacity(10_000).time_to_live(std::time::Duration::from_secs(60)).build());

async fn verify_bearer(token: &str) -> Result<AccessTokenClaims, Error> {
    if let Some(claims) = TOKEN_CACHE.get(token).await {
        if claims.exp > Utc::now().timestamp() {
            return Ok(claims);
        }
        TOKEN_CACHE.invalidate(token).await;
        return Err(Error::new(ErrorKind::TokenExpired, "Token has expired"));
    }

    let claims = decode_access_token(token, None)?;
    TOKEN_CACHE.insert(token.to_string(), claims.clone()).await;
    Ok(claims)
}

/// Bearer guard accepting any valid access token, regardless of which
/// audience it was minted for. Only resource endpoints that must serve
/// third-party tokens (userinfo) use this directly; everything else goes
/// through `FirstPartyHeaders`.
pub struct Headers {
    pub user: User,
    pub claims: AccessTokenClaims,
    pub ip: ClientIp,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for Headers {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let headers = request.headers();

        let ip = match ClientIp::from_request(request).await {
            Outcome::Success(ip) => ip,
            _ => err_handler!("Error getting Client IP"),
        };

        // Get access_token
        let access_token: &str = match headers.get_one("Authorization") {
            Some(a) => match a.rsplit("Bearer ").next() {
                Some(split) => split,
                None => err_handler!("No access token provided"),
            },
            None => err_handler!("No access token provided"),
        };

        let claims = match verify_bearer(access_token).await {
            Ok(claims) => claims,
            Err(_) => err_handler!("Invalid claim"),
        };

        // Client-credentials tokens assert an application, not a user
        let user_uuid = UserId::from(claims.sub.clone());

        let mut conn = match DbConn::from_request(request).await {
            Outcome::Success(conn) => conn,
            _ => err_handler!("Error getting DB"),
        };

        let user = match User::find_by_uuid(&user_uuid, &mut conn).await {
            Some(user) => user,
            None => err_handler!("Token subject is not a user"),
        };

        if !user.is_active() {
            err_handler!("This account has been suspended")
        }

        Outcome::Success(Headers {
            user,
            claims,
            ip,
        })
    }
}

/// The guard for the account and developer surfaces. Only tokens the server
/// minted for itself pass; tokens issued to OAuth clients carry the client
/// as audience and stay confined to the resource endpoints (userinfo),
/// no matter whose `sub` they assert.
pub struct FirstPartyHeaders {
    pub user: User,
    pub ip: ClientIp,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for FirstPartyHeaders {
    type Error = &'static str;

    async fn from_request(request: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        match Headers::from_request(request).await {
            Outcome::Forward(f) => Outcome::Forward(f),
            Outcome::Error(e) => Outcome::Error(e),
            Outcome::Success(headers) => {
                if headers.claims.aud != FIRST_PARTY_AUDIENCE || headers.claims.azp.is_some() {
                    err_handler!("Token was issued to an application and cannot manage the account")
                }

                Outcome::Success(FirstPartyHeaders {
                    user: headers.user,
                    ip: headers.ip,
                })
            }
        }
    }
}

//
// Client IP address detection
//
use std::net::IpAddr;

pub struct ClientIp {
    pub ip: IpAddr,
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for ClientIp {
    type Error = ();

    async fn from_request(req: &'r Request<'_>) -> Outcome<Self, Self::Error> {
        let ip = req.headers().get_one("X-Real-IP").and_then(|ip| {
            ip.find(',').map_or(ip, |idx| &ip[..idx]).parse().map_err(|_| warn!("'X-Real-IP' header is malformed: {ip}")).ok()
        });

        let ip = ip.or_else(|| req.client_ip()).unwrap_or_else(|| "0.0.0.0".parse().unwrap());

        Outcome::Success(ClientIp {
            ip,
        })
    }
}

//
// SSO session cookie handling
//
use rocket::http::{Cookie, CookieJar, SameSite};

pub fn set_sso_cookie(cookies: &CookieJar<'_>, raw_token: String, remember: bool) {
    let max_age = if remember {
        rocket::time::Duration::days(CONFIG.session_remember_days())
    } else {
        rocket::time::Duration::hours(CONFIG.session_validity_hours())
    };

    let cookie = Cookie::build((CONFIG.sso_cookie_name(), raw_token))
        .path("/")
        .http_only(true)
        .same_site(SameSite::Lax)
        .secure(CONFIG.cookie_secure())
        .max_age(max_age);

    cookies.add(cookie);
}

pub fn remove_sso_cookie(cookies: &CookieJar<'_>) {
    cookies.remove(Cookie::build((CONFIG.sso_cookie_name(), "")).path("/"));
}

/// Resolves the SSO session the browser presented, if any. Expired sessions
/// are dropped by the model and read as "no session".
pub async fn resolve_sso_cookie(cookies: &CookieJar<'_>, conn: &mut DbConn) -> Option<SsoSession> {
    let cookie = cookies.get(&CONFIG.sso_cookie_name())?;
    SsoSession::resolve(cookie.value(), conn).await
}
