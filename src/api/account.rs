//
// User self-service: profile, sessions, channel bindings, authorized
// applications, MFA enrollment and account removal.
//
use rocket::http::CookieJar;
use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{
    api::JsonResult,
    auth::FirstPartyHeaders,
    db::{
        models::{
            AuditLog, Application, ClientId, CodeType, OAuthAccount, RefreshToken, SessionId, SsoSession, User,
        },
        DbConn,
    },
    util, webhooks,
};

pub fn routes() -> Vec<Route> {
    routes![
        get_me,
        update_me,
        list_sessions,
        delete_session,
        get_bindings,
        bind_phone,
        bind_email,
        unbind_provider,
        authorized_apps,
        revoke_authorized_app,
        delete_account,
        audit_log,
        mfa_setup,
        mfa_enable,
        mfa_disable,
    ]
}

#[get("/user/me")]
async fn get_me(headers: FirstPartyHeaders) -> JsonResult {
    Ok(Json(json!({"success": true, "user": headers.user.to_json()})))
}

#[derive(Deserialize)]
struct UpdateMeData {
    nickname: Option<String>,
    avatar: Option<String>,
}

#[patch("/user/me", data = "<data>")]
async fn update_me(data: Json<UpdateMeData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut user = headers.user;

    if let Some(nickname) = data.nickname {
        if nickname.chars().count() > 64 {
            err!("Nickname is too long")
        }
        user.nickname = if nickname.is_empty() {
            None
        } else {
            Some(nickname)
        };
    }
    if let Some(avatar) = data.avatar {
        if !avatar.is_empty() {
            url::Url::parse(&avatar).map_err(|_| {
                crate::error::Error::new(crate::error::ErrorKind::InvalidRequest, "Avatar must be a URL")
            })?;
        }
        user.avatar = if avatar.is_empty() {
            None
        } else {
            Some(avatar)
        };
    }

    user.save(&mut conn).await?;
    Ok(Json(json!({"success": true, "user": user.to_json()})))
}

//
// Sessions
//

#[get("/user/sessions")]
async fn list_sessions(headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let sessions = SsoSession::find_by_user(&headers.user.uuid, &mut conn).await;
    let sessions: Vec<Value> = sessions.iter().map(SsoSession::to_json).collect();

    Ok(Json(json!({"success": true, "sessions": sessions})))
}

#[delete("/user/sessions/<session_id>")]
async fn delete_session(session_id: SessionId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let Some(session) = SsoSession::find_by_uuid_and_user(&session_id, &headers.user.uuid, &mut conn).await else {
        err!(NotFound, "Session not found")
    };

    session.delete(&mut conn).await?;
    AuditLog::new(Some(headers.user.uuid.clone()), "session.revoked", Some(headers.ip.ip.to_string()))
        .save(&mut conn)
        .await
        .ok();

    Ok(Json(json!({"success": true})))
}

//
// Channel bindings
//

#[get("/user/bindings")]
async fn get_bindings(headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let user = &headers.user;
    let accounts = OAuthAccount::find_by_user(&user.uuid, &mut conn).await;

    let social: Vec<Value> = accounts
        .iter()
        .map(|a| {
            json!({
                "provider": a.provider,
                "email": a.email,
                "bound_at": util::format_date(&a.created_at),
            })
        })
        .collect();

    Ok(Json(json!({
        "success": true,
        "phone": user.phone,
        "phone_verified": user.phone_verified,
        "email": user.email,
        "email_verified": user.email_verified,
        "social": social,
    })))
}

#[derive(Deserialize)]
struct BindPhoneData {
    phone: String,
    code: String,
}

#[post("/user/bind/phone", data = "<data>")]
async fn bind_phone(data: Json<BindPhoneData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut user = headers.user;

    let Some(phone) = util::normalize_phone(&data.phone) else {
        err!("Invalid phone number")
    };

    // The new number must prove itself with a code sent to it
    super::auth::check_code(&phone, CodeType::Login, &data.code, &mut conn).await?;

    if let Some(existing) = User::find_by_phone(&phone, &mut conn).await {
        if existing.uuid != user.uuid {
            err!(Conflict, "This phone number is bound to another account")
        }
    }

    user.phone = Some(phone);
    user.phone_verified = true;
    user.save(&mut conn).await?;

    AuditLog::new(Some(user.uuid.clone()), "binding.phone", Some(headers.ip.ip.to_string())).save(&mut conn).await.ok();

    Ok(Json(json!({"success": true, "user": user.to_json()})))
}

#[derive(Deserialize)]
struct BindEmailData {
    email: String,
    code: String,
}

#[post("/user/bind/email", data = "<data>")]
async fn bind_email(data: Json<BindEmailData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut user = headers.user;

    if !email_address::EmailAddress::is_valid(&data.email) {
        err!("Invalid email address")
    }
    let email = data.email.to_lowercase();

    super::auth::check_code(&email, CodeType::Login, &data.code, &mut conn).await?;

    if let Some(existing) = User::find_by_email(&email, &mut conn).await {
        if existing.uuid != user.uuid {
            err!(Conflict, "This email is bound to another account")
        }
    }

    user.email = Some(email);
    user.email_verified = true;
    user.save(&mut conn).await?;

    AuditLog::new(Some(user.uuid.clone()), "binding.email", Some(headers.ip.ip.to_string())).save(&mut conn).await.ok();

    Ok(Json(json!({"success": true, "user": user.to_json()})))
}

#[delete("/user/unbind/<provider>")]
async fn unbind_provider(provider: &str, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let user = &headers.user;

    // Unbinding must not lock the user out entirely; a verified email keeps
    // the passwordless email-code login available.
    let remaining_logins = user.phone_verified
        || user.email_verified
        || user.password_hash.is_some()
        || OAuthAccount::find_by_user(&user.uuid, &mut conn).await.len() > 1;
    if !remaining_logins {
        err!("Cannot unbind the only way to sign in")
    }

    OAuthAccount::delete_by_user_and_provider(&user.uuid, provider, &mut conn).await?;

    AuditLog::new(Some(user.uuid.clone()), "binding.removed", Some(headers.ip.ip.to_string()))
        .with_detail(provider.to_string())
        .save(&mut conn)
        .await
        .ok();

    Ok(Json(json!({"success": true})))
}

//
// Authorized applications
//

#[get("/user/authorized-apps")]
async fn authorized_apps(headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let app_uuids = RefreshToken::find_authorized_client_uuids(&headers.user.uuid, &mut conn).await;

    let mut apps = Vec::with_capacity(app_uuids.len());
    for uuid in app_uuids {
        if let Some(app) = Application::find_by_uuid(&uuid, &mut conn).await {
            apps.push(json!({
                "client_id": app.client_id,
                "name": app.name,
                "type": app.app_type().name(),
            }));
        }
    }

    Ok(Json(json!({"success": true, "apps": apps})))
}

/// Withdraws every grant the user gave to one application.
#[delete("/user/authorized-apps/<client_id>")]
async fn revoke_authorized_app(client_id: ClientId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let Some(app) = Application::find_by_client_id(&client_id, &mut conn).await else {
        err!(NotFound, "Application not found")
    };

    RefreshToken::revoke_by_user_and_client(&headers.user.uuid, &app.uuid, &mut conn).await?;

    webhooks::enqueue_event(
        webhooks::EVENT_TOKEN_REVOKED,
        json!({"user_id": headers.user.uuid, "client_id": app.client_id}),
        &mut conn,
    )
    .await;

    Ok(Json(json!({"success": true})))
}

//
// Account removal
//

#[derive(Deserialize)]
struct DeleteAccountData {
    password: Option<String>,
    code: Option<String>,
}

/// Deletes the account and cascades to every owned row. Requires the
/// password, or a reset code sent to a verified channel.
#[delete("/user/account", data = "<data>")]
async fn delete_account(
    data: Json<DeleteAccountData>,
    headers: FirstPartyHeaders,
    cookies: &CookieJar<'_>,
    mut conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();
    let user = headers.user;

    let verified = match (&data.password, &data.code) {
        (Some(password), _) if user.password_hash.is_some() => user.check_valid_password(password),
        (_, Some(code)) => {
            let target = user.phone.clone().or_else(|| user.email.clone());
            let Some(target) = target else {
                err!("No verified channel for confirmation")
            };
            super::auth::check_code(&target, CodeType::Reset, code, &mut conn).await.is_ok()
        }
        _ => false,
    };
    if !verified {
        err!(InvalidCredentials, "Confirmation failed")
    }

    let user_json = user.to_json();
    let user_uuid = user.uuid.clone();

    user.delete(&mut conn).await?;
    crate::auth::remove_sso_cookie(cookies);

    AuditLog::new(None, "account.deleted", Some(headers.ip.ip.to_string()))
        .with_detail(user_uuid.to_string())
        .save(&mut conn)
        .await
        .ok();
    webhooks::enqueue_event(webhooks::EVENT_USER_DELETED, user_json, &mut conn).await;

    Ok(Json(json!({"success": true})))
}

#[get("/user/audit-log")]
async fn audit_log(headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let entries = AuditLog::find_recent_by_user(&headers.user.uuid, 100, &mut conn).await;
    let entries: Vec<Value> = entries.iter().map(AuditLog::to_json).collect();

    Ok(Json(json!({"success": true, "entries": entries})))
}

//
// MFA enrollment
//

#[post("/user/mfa/setup")]
async fn mfa_setup(headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let mut user = headers.user;

    if user.mfa_enabled {
        err!(Conflict, "Multi-factor authentication is already enabled")
    }

    // A fresh secret replaces any unconfirmed one
    let secret = data_encoding::BASE32_NOPAD.encode(&crate::crypto::get_random_bytes::<20>());
    user.totp_secret = Some(secret.clone());
    user.save(&mut conn).await?;

    Ok(Json(json!({
        "success": true,
        "secret": secret,
        "otpauth_url": format!("otpauth://totp/UniAuth:{}?secret={}&issuer=UniAuth", user.display_name(), secret),
    })))
}

#[derive(Deserialize)]
struct MfaEnableData {
    code: String,
}

#[post("/user/mfa/enable", data = "<data>")]
async fn mfa_enable(data: Json<MfaEnableData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut user = headers.user;

    if user.mfa_enabled {
        err!(Conflict, "Multi-factor authentication is already enabled")
    }
    if user.totp_secret.is_none() {
        err!("Run setup first")
    }

    // The first valid code proves the authenticator was provisioned
    super::auth::validate_totp_login(&mut user, &data.code, &mut conn).await?;

    let recovery = crate::crypto::encode_random_bytes::<10>(data_encoding::BASE32_NOPAD).to_lowercase();
    user.mfa_enabled = true;
    user.totp_recover = Some(recovery.clone());
    user.save(&mut conn).await?;

    AuditLog::new(Some(user.uuid.clone()), "mfa.enabled", Some(headers.ip.ip.to_string())).save(&mut conn).await.ok();

    Ok(Json(json!({"success": true, "recovery_code": recovery})))
}

#[derive(Deserialize)]
struct MfaDisableData {
    password: Option<String>,
    code: Option<String>,
}

#[delete("/user/mfa", data = "<data>")]
async fn mfa_disable(data: Json<MfaDisableData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut user = headers.user;

    if !user.mfa_enabled {
        err!("Multi-factor authentication is not enabled")
    }

    let verified = match (&data.password, &data.code) {
        (Some(password), _) if user.password_hash.is_some() => user.check_valid_password(password),
        (_, Some(code)) => super::auth::validate_totp_login(&mut user, code, &mut conn).await.is_ok(),
        _ => false,
    };
    if !verified {
        err!(InvalidCredentials, "Confirmation failed")
    }

    user.mfa_enabled = false;
    user.totp_secret = None;
    user.totp_recover = None;
    user.totp_last_used = 0;
    user.save(&mut conn).await?;

    AuditLog::new(Some(user.uuid.clone()), "mfa.disabled", Some(headers.ip.ip.to_string())).save(&mut conn).await.ok();

    Ok(Json(json!({"success": true})))
}
