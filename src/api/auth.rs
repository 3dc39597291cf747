//
// Login flows: phone and email codes, email password, social providers and
// the MFA step-up exchange.
//
use chrono::Utc;
use rocket::http::CookieJar;
use rocket::response::Redirect;
use rocket::serde::json::Json;
use rocket::Route;

use crate::{
    api::{ApiResult, EmptyResult, JsonResult},
    auth::{self, ClientIp, FirstPartyHeaders},
    db::{
        models::{AuditLog, CodeType, CodeVerification, OAuthAccount, RefreshToken, SsoSession, User, VerificationCode},
        DbConn,
    },
    dispatch,
    error::{Error, ErrorKind},
    ratelimit, social, util, webhooks, CONFIG,
};

pub fn routes() -> Vec<Route> {
    routes![
        phone_send_code,
        phone_verify,
        email_register,
        email_login,
        email_send_code,
        email_verify,
        email_verify_code,
        mfa_verify_login,
        social_authorize,
        social_callback,
        refresh_token,
        logout,
        logout_all,
    ]
}

//
// Verification code issuance
//

#[derive(Deserialize)]
struct SendPhoneCodeData {
    phone: String,
    #[serde(rename = "type")]
    code_type: Option<String>,
}

#[post("/auth/phone/send-code", data = "<data>")]
async fn phone_send_code(data: Json<SendPhoneCodeData>, ip: ClientIp, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let Some(phone) = util::normalize_phone(&data.phone) else {
        err!("Invalid phone number")
    };
    let code_type = parse_code_type(data.code_type.as_deref())?;

    let code = issue_code(&phone, code_type, &ip, &mut conn).await?;
    dispatch::send_sms_code(&phone, &code).await?;

    Ok(Json(json!({
        "success": true,
        "expires_in": CONFIG.code_validity(),
        "retry_after": CONFIG.code_cooldown(),
    })))
}

#[derive(Deserialize)]
struct SendEmailCodeData {
    email: String,
    #[serde(rename = "type")]
    code_type: Option<String>,
}

#[post("/auth/email/send-code", data = "<data>")]
async fn email_send_code(data: Json<SendEmailCodeData>, ip: ClientIp, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    if !email_address::EmailAddress::is_valid(&data.email) {
        err!("Invalid email address")
    }
    let email = data.email.to_lowercase();
    let code_type = parse_code_type(data.code_type.as_deref())?;

    let code = issue_code(&email, code_type, &ip, &mut conn).await?;
    dispatch::send_email_code(&email, &code).await?;

    Ok(Json(json!({
        "success": true,
        "expires_in": CONFIG.code_validity(),
        "retry_after": CONFIG.code_cooldown(),
    })))
}

fn parse_code_type(name: Option<&str>) -> ApiResult<CodeType> {
    match name {
        None => Ok(CodeType::Login),
        Some(name) => CodeType::from_name(name).ok_or_else(|| Error::new(ErrorKind::InvalidRequest, "Unknown code type")),
    }
}

/// Both limiter dimensions are checked before a code row is written. The raw
/// code only exists in this request, on its way to the dispatcher.
async fn issue_code(target: &str, code_type: CodeType, ip: &ClientIp, conn: &mut DbConn) -> ApiResult<String> {
    ratelimit::check_limit_send_code_ip(&ip.ip)?;
    ratelimit::check_and_record_target(target)?;

    let code = crate::crypto::generate_code(CONFIG.code_length())?;
    VerificationCode::new(target.to_string(), &code, code_type).issue(conn).await?;

    Ok(code)
}

//
// Phone login
//

#[derive(Deserialize)]
struct PhoneVerifyData {
    phone: String,
    code: String,
    remember_me: Option<bool>,
    device_fingerprint: Option<String>,
}

#[post("/auth/phone/verify", data = "<data>")]
async fn phone_verify(data: Json<PhoneVerifyData>, ip: ClientIp, cookies: &CookieJar<'_>, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let Some(phone) = util::normalize_phone(&data.phone) else {
        err!("Invalid phone number")
    };

    check_code(&phone, CodeType::Login, &data.code, &mut conn).await?;

    // Find-or-create by phone; a first login creates the account
    let (mut user, is_new) = match User::find_by_phone(&phone, &mut conn).await {
        Some(mut user) => {
            if !user.phone_verified {
                user.phone_verified = true;
            }
            (user, false)
        }
        None => (User::new_with_phone(phone), true),
    };

    login_success(&mut user, is_new, false, data.remember_me.unwrap_or(false), data.device_fingerprint, &ip, Some(cookies), &mut conn)
        .await
}

/// Maps a code-engine outcome onto the wire. Mismatch and exhaustion are the
/// same error on purpose, a caller can not probe whether a code is burned.
pub(crate) async fn check_code(target: &str, code_type: CodeType, code: &str, conn: &mut DbConn) -> EmptyResult {
    match VerificationCode::verify(target, code_type, code, conn).await? {
        CodeVerification::Valid => Ok(()),
        CodeVerification::Expired => Err(Error::new(ErrorKind::TokenExpired, "Verification code has expired")),
        CodeVerification::Invalid | CodeVerification::TooManyAttempts => {
            Err(Error::new(ErrorKind::InvalidCredentials, "Invalid verification code"))
        }
    }
}

//
// Email flows
//

#[derive(Deserialize)]
struct EmailRegisterData {
    email: String,
    password: String,
    code: String,
    nickname: Option<String>,
}

#[post("/auth/email/register", data = "<data>")]
async fn email_register(data: Json<EmailRegisterData>, ip: ClientIp, cookies: &CookieJar<'_>, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    if !email_address::EmailAddress::is_valid(&data.email) {
        err!("Invalid email address")
    }
    if data.password.len() < 8 {
        err!("Password must be at least 8 characters")
    }
    let email = data.email.to_lowercase();

    check_code(&email, CodeType::Register, &data.code, &mut conn).await?;

    if User::find_by_email(&email, &mut conn).await.is_some() {
        err!(Conflict, "An account with this email already exists")
    }

    let mut user = User::new_with_email(email);
    user.email_verified = true;
    user.password_hash = Some(crate::crypto::hash_password(&data.password)?);
    user.nickname = data.nickname;

    login_success(&mut user, true, false, false, None, &ip, Some(cookies), &mut conn).await
}

#[derive(Deserialize)]
struct EmailLoginData {
    email: String,
    password: String,
    remember_me: Option<bool>,
    device_fingerprint: Option<String>,
}

#[post("/auth/email/login", data = "<data>")]
async fn email_login(data: Json<EmailLoginData>, ip: ClientIp, cookies: &CookieJar<'_>, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    // Unknown email and wrong password answer identically
    let Some(mut user) = User::find_by_email(&data.email, &mut conn).await else {
        err!(InvalidCredentials, "Invalid email or password")
    };
    if !user.check_valid_password(&data.password) {
        AuditLog::new(Some(user.uuid.clone()), "login.failed", Some(ip.ip.to_string())).save(&mut conn).await.ok();
        err!(InvalidCredentials, "Invalid email or password")
    }

    login_success(&mut user, false, false, data.remember_me.unwrap_or(false), data.device_fingerprint, &ip, Some(cookies), &mut conn)
        .await
}

#[derive(Deserialize)]
struct EmailVerifyCodeData {
    email: String,
    code: String,
    remember_me: Option<bool>,
    device_fingerprint: Option<String>,
}

#[post("/auth/email/verify-code", data = "<data>")]
async fn email_verify_code(
    data: Json<EmailVerifyCodeData>,
    ip: ClientIp,
    cookies: &CookieJar<'_>,
    mut conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();
    let email = data.email.to_lowercase();

    check_code(&email, CodeType::Login, &data.code, &mut conn).await?;

    // Symmetric to the phone path: first code login creates the account
    let (mut user, is_new) = match User::find_by_email(&email, &mut conn).await {
        Some(mut user) => {
            if !user.email_verified {
                user.email_verified = true;
            }
            (user, false)
        }
        None => {
            let mut user = User::new_with_email(email);
            user.email_verified = true;
            (user, true)
        }
    };

    login_success(&mut user, is_new, false, data.remember_me.unwrap_or(false), data.device_fingerprint, &ip, Some(cookies), &mut conn)
        .await
}

#[derive(Deserialize)]
struct EmailVerifyData {
    code: String,
}

/// Confirms ownership of the account's email address with an
/// `email_verify` code.
#[post("/auth/email/verify", data = "<data>")]
async fn email_verify(data: Json<EmailVerifyData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut user = headers.user;

    let Some(email) = user.email.clone() else {
        err!("No email address bound to this account")
    };

    check_code(&email, CodeType::EmailVerify, &data.code, &mut conn).await?;

    user.email_verified = true;
    user.save(&mut conn).await?;

    Ok(Json(json!({"success": true, "email_verified": true})))
}

//
// MFA step-up
//

#[derive(Deserialize)]
struct MfaVerifyData {
    mfa_token: String,
    code: Option<String>,
    recovery_code: Option<String>,
    remember_me: Option<bool>,
    device_fingerprint: Option<String>,
}

#[post("/auth/mfa/verify-login", data = "<data>")]
async fn mfa_verify_login(data: Json<MfaVerifyData>, ip: ClientIp, cookies: &CookieJar<'_>, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    let claims = auth::decode_mfa_token(&data.mfa_token)?;
    let Some(mut user) = User::find_by_uuid(&claims.sub, &mut conn).await else {
        err!(InvalidToken, "Unknown user")
    };
    if !user.mfa_enabled {
        err!("Multi-factor authentication is not enabled")
    }

    match (data.code.as_deref(), data.recovery_code.as_deref()) {
        (Some(code), _) => validate_totp_login(&mut user, code, &mut conn).await?,
        (None, Some(recovery)) => {
            if !user.check_valid_recovery_code(recovery) {
                err!(InvalidCredentials, "Invalid recovery code")
            }
            // Recovery codes are single use
            user.totp_recover = None;
        }
        (None, None) => err!("Provide a TOTP code or a recovery code"),
    }

    login_success(&mut user, false, true, data.remember_me.unwrap_or(false), data.device_fingerprint, &ip, Some(cookies), &mut conn)
        .await
}

/// Accepts the current TOTP step and one step of drift either way, and
/// refuses any step at or before the last accepted one so codes can not be
/// replayed inside their window.
pub(crate) async fn validate_totp_login(user: &mut User, code: &str, conn: &mut DbConn) -> EmptyResult {
    use totp_lite::{totp_custom, Sha1};

    let Some(ref secret_b32) = user.totp_secret else {
        err!("Multi-factor authentication is not configured")
    };
    let Ok(secret) = data_encoding::BASE32_NOPAD.decode(secret_b32.as_bytes()) else {
        err!(Internal, "Stored TOTP secret is malformed")
    };

    let current_time = Utc::now().timestamp() as u64;

    for drift in [0i64, -30, 30] {
        let time = current_time.saturating_add_signed(drift);
        let step = (time / 30) as i64;
        let generated = totp_custom::<Sha1>(30, 6, &secret, time);

        if crate::crypto::ct_eq(&generated, code) {
            if step <= user.totp_last_used {
                warn!("This or a later TOTP code has already been used");
                err!(InvalidCredentials, "Invalid TOTP code")
            }
            user.totp_last_used = step;
            user.save(conn).await?;
            return Ok(());
        }
    }

    err!(InvalidCredentials, "Invalid TOTP code")
}

//
// Social login
//

#[get("/auth/oauth/<provider>/authorize")]
async fn social_authorize(provider: &str) -> ApiResult<Redirect> {
    let url = social::authorize_url(provider).await?;
    Ok(Redirect::to(url))
}

#[get("/auth/oauth/<provider>/callback?<code>&<state>")]
async fn social_callback(
    provider: &str,
    code: &str,
    state: &str,
    ip: ClientIp,
    cookies: &CookieJar<'_>,
    mut conn: DbConn,
) -> JsonResult {
    let social_user = social::exchange_callback(provider, state, code).await?;

    // Match an existing link, then an account with the asserted email,
    // otherwise create a fresh user and link it.
    let (mut user, is_new) = match OAuthAccount::find_by_provider_user(provider, &social_user.provider_user_id, &mut conn).await
    {
        Some(account) => match User::find_by_uuid(&account.user_uuid, &mut conn).await {
            Some(user) => (user, false),
            None => err!(Internal, "Linked account without user"),
        },
        None => {
            let (user, is_new) = match &social_user.email {
                Some(email) => match User::find_by_email(email, &mut conn).await {
                    Some(user) => (user, false),
                    None => {
                        let mut user = User::new_with_email(email.clone());
                        user.email_verified = social_user.email_verified;
                        user.nickname = social_user.name.clone();
                        user.avatar = social_user.picture.clone();
                        (user, true)
                    }
                },
                None => {
                    let mut user = User::new_with_email(format!("{}@{}.social.invalid", social_user.provider_user_id, provider));
                    user.nickname = social_user.name.clone();
                    (user, true)
                }
            };

            // The user row must exist before the link can point at it
            let mut user = user;
            user.save(&mut conn).await?;
            OAuthAccount::new(
                user.uuid.clone(),
                social_user.provider.clone(),
                social_user.provider_user_id.clone(),
                social_user.email.clone(),
            )
            .save(&mut conn)
            .await?;
            (user, is_new)
        }
    };

    login_success(&mut user, is_new, false, false, None, &ip, Some(cookies), &mut conn).await
}

//
// Token refresh and logout (first-party surface)
//

#[derive(Deserialize)]
struct RefreshData {
    refresh_token: String,
}

#[post("/auth/refresh", data = "<data>")]
async fn refresh_token(data: Json<RefreshData>, ip: ClientIp, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    let (user, _old, new_raw) = rotate_refresh_token(&data.refresh_token, &ip, &mut conn).await?;

    let claims = auth::generate_access_token_claims(&user.uuid, auth::FIRST_PARTY_AUDIENCE, None, None);
    let access_token = auth::sign_claims(&claims)?;

    Ok(Json(json!({
        "success": true,
        "access_token": access_token,
        "refresh_token": new_raw,
        "token_type": "Bearer",
        "expires_in": CONFIG.access_token_validity(),
    })))
}

/// Shared rotation path for the first-party refresh endpoint and the OAuth
/// refresh_token grant. Replay of a revoked token burns the whole family.
pub(crate) async fn rotate_refresh_token(
    raw: &str,
    ip: &ClientIp,
    conn: &mut DbConn,
) -> ApiResult<(User, RefreshToken, String)> {
    let Some(old) = RefreshToken::find_by_raw_token(raw, conn).await else {
        err!(InvalidGrant, "Refresh token is invalid")
    };

    if old.revoked {
        // A revoked token coming back means someone replayed it; nothing
        // descended from this grant can be trusted any more.
        warn!("Replay of revoked refresh token from family {}", old.family);
        old.revoke_family(conn).await?;
        AuditLog::new(Some(old.user_uuid.clone()), "token.replay_detected", Some(ip.ip.to_string()))
            .save(conn)
            .await
            .ok();
        err!(InvalidGrant, "Refresh token is invalid")
    }
    if old.is_expired() {
        err!(InvalidGrant, "Refresh token has expired")
    }

    let Some(user) = User::find_by_uuid(&old.user_uuid, conn).await else {
        err!(InvalidGrant, "Refresh token is invalid")
    };
    if !user.is_active() {
        err!(Suspended, "This account has been suspended")
    }

    let (replacement, new_raw) = old.successor(ip.ip.to_string());
    old.rotate(&replacement, conn).await?;

    Ok((user, replacement, new_raw))
}

#[derive(Deserialize)]
struct LogoutData {
    refresh_token: Option<String>,
}

#[post("/auth/logout", data = "<data>")]
async fn logout(data: Option<Json<LogoutData>>, cookies: &CookieJar<'_>, mut conn: DbConn) -> JsonResult {
    if let Some(raw) = data.and_then(|d| d.into_inner().refresh_token) {
        if let Some(token) = RefreshToken::find_by_raw_token(&raw, &mut conn).await {
            token.revoke(&mut conn).await?;
        }
    }

    if let Some(session) = auth::resolve_sso_cookie(cookies, &mut conn).await {
        session.delete(&mut conn).await?;
    }
    auth::remove_sso_cookie(cookies);

    Ok(Json(json!({"success": true})))
}

#[post("/auth/logout-all")]
async fn logout_all(headers: FirstPartyHeaders, cookies: &CookieJar<'_>, mut conn: DbConn) -> JsonResult {
    let user = headers.user;

    RefreshToken::revoke_all_by_user(&user.uuid, &mut conn).await?;
    let count = SsoSession::delete_all_by_user(&user.uuid, &mut conn).await?;
    auth::remove_sso_cookie(cookies);

    AuditLog::new(Some(user.uuid.clone()), "logout.all", Some(headers.ip.ip.to_string())).save(&mut conn).await.ok();

    Ok(Json(json!({"success": true, "sessions_removed": count})))
}

//
// Common login completion
//

/// Everything that happens after a credential checked out: the MFA gate,
/// token minting, the audit trail, webhook events and the SSO session.
pub(crate) async fn login_success(
    user: &mut User,
    is_new_user: bool,
    mfa_verified: bool,
    remember: bool,
    device_fingerprint: Option<String>,
    ip: &ClientIp,
    cookies: Option<&CookieJar<'_>>,
    conn: &mut DbConn,
) -> JsonResult {
    if !user.is_active() {
        err!(Suspended, "This account has been suspended")
    }

    // Enrolled users get a short-lived step-up token instead of the pair
    if user.mfa_enabled && !is_new_user && !mfa_verified {
        user.save(conn).await?;
        let mfa_token = auth::sign_claims(&auth::generate_mfa_token_claims(user.uuid.clone()))?;
        return Ok(Json(json!({
            "success": true,
            "mfa_required": true,
            "mfa_token": mfa_token,
        })));
    }

    user.last_login_at = Some(Utc::now().naive_utc());
    user.save(conn).await?;

    let (token_row, refresh_raw) =
        RefreshToken::new(user.uuid.clone(), None, String::new(), device_fingerprint, ip.ip.to_string());
    token_row.save(conn).await?;

    let claims = auth::generate_access_token_claims(&user.uuid, auth::FIRST_PARTY_AUDIENCE, None, None);
    let access_token = auth::sign_claims(&claims)?;

    AuditLog::new(Some(user.uuid.clone()), "login.success", Some(ip.ip.to_string())).save(conn).await.ok();

    if is_new_user {
        webhooks::enqueue_event(webhooks::EVENT_USER_CREATED, user.to_json(), conn).await;
    }
    webhooks::enqueue_event(webhooks::EVENT_USER_LOGIN, json!({"user_id": user.uuid, "ip": ip.ip.to_string()}), conn)
        .await;

    // Outside an OAuth flow the login establishes the central session
    if let Some(cookies) = cookies {
        let (session, session_raw) = SsoSession::new(user.uuid.clone(), None, remember, ip.ip.to_string(), None);
        session.save(conn).await?;
        auth::set_sso_cookie(cookies, session_raw, remember);
    }

    Ok(Json(json!({
        "success": true,
        "user": user.to_json(),
        "access_token": access_token,
        "refresh_token": refresh_raw,
        "token_type": "Bearer",
        "expires_in": CONFIG.access_token_validity(),
        "is_new_user": is_new_user,
    })))
}
