//
// Developer console surface: applications, credentials, webhooks, custom
// claims and branding.
//
use rocket::serde::json::Json;
use rocket::Route;
use serde_json::Value;

use crate::{
    api::{ApiResult, JsonResult},
    auth::FirstPartyHeaders,
    db::{
        models::{AppScope, AppType, Application, ClientId, Scope, Webhook, WebhookDelivery, WebhookId},
        DbConn,
    },
    error::{Error, ErrorKind},
    webhooks,
};

pub fn routes() -> Vec<Route> {
    routes![
        list_apps,
        create_app,
        get_app,
        update_app,
        delete_app,
        rotate_secret,
        list_webhooks,
        create_webhook,
        update_webhook,
        delete_webhook,
        list_deliveries,
        test_webhook,
        put_claims,
        put_branding,
        get_scopes,
        put_scopes,
    ]
}

/// Loads an application and checks it belongs to the calling developer.
async fn owned_app(client_id: &ClientId, headers: &FirstPartyHeaders, conn: &mut DbConn) -> ApiResult<Application> {
    let Some(app) = Application::find_by_client_id(client_id, conn).await else {
        err!(NotFound, "Application not found")
    };
    if app.owner_uuid != headers.user.uuid {
        // Not yours: indistinguishable from not existing
        err!(NotFound, "Application not found")
    }
    Ok(app)
}

#[get("/developer/apps")]
async fn list_apps(headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let apps = Application::find_by_owner(&headers.user.uuid, &mut conn).await;
    let apps: Vec<Value> = apps.iter().map(Application::to_json).collect();

    Ok(Json(json!({"success": true, "apps": apps})))
}

#[derive(Deserialize)]
struct CreateAppData {
    name: String,
    #[serde(rename = "type")]
    app_type: String,
    redirect_uris: Option<Vec<String>>,
    allow_plain_pkce: Option<bool>,
}

#[post("/developer/apps", data = "<data>")]
async fn create_app(data: Json<CreateAppData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();

    if data.name.trim().is_empty() {
        err!("Application name must not be empty")
    }
    let Some(app_type) = AppType::from_name(&data.app_type) else {
        err!("Unknown application type, expected web, spa, native or m2m")
    };

    let redirect_uris = data.redirect_uris.unwrap_or_default();
    for uri in &redirect_uris {
        validate_redirect_uri(uri)?;
    }

    let mut app = Application::new(headers.user.uuid.clone(), data.name.trim().to_string(), app_type, redirect_uris);
    app.allow_plain_pkce = data.allow_plain_pkce.unwrap_or(false);

    // Confidential clients get a secret, shown exactly once
    let secret = if app.is_public() {
        None
    } else {
        Some(app.rotate_secret())
    };

    app.save(&mut conn).await?;

    let mut body = json!({"success": true, "app": app.to_json()});
    if let Some(secret) = secret {
        body["client_secret"] = Value::String(secret);
    }
    Ok(Json(body))
}

fn validate_redirect_uri(uri: &str) -> ApiResult<()> {
    let parsed = url::Url::parse(uri).map_err(|_| Error::new(ErrorKind::InvalidRequest, "Invalid redirect URI"))?;
    match parsed.scheme() {
        "https" => Ok(()),
        // Plain http only for loopback development targets and custom app schemes
        "http" if matches!(parsed.host_str(), Some("localhost" | "127.0.0.1" | "[::1]")) => Ok(()),
        "http" => Err(Error::new(ErrorKind::InvalidRequest, "http redirect URIs are only allowed for loopback hosts")),
        _ => Ok(()),
    }
}

#[get("/developer/apps/<client_id>")]
async fn get_app(client_id: ClientId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let app = owned_app(&client_id, &headers, &mut conn).await?;
    Ok(Json(json!({"success": true, "app": app.to_json()})))
}

#[derive(Deserialize)]
struct UpdateAppData {
    name: Option<String>,
    redirect_uris: Option<Vec<String>>,
    grant_types: Option<Vec<String>>,
    allow_plain_pkce: Option<bool>,
    active: Option<bool>,
}

#[patch("/developer/apps/<client_id>", data = "<data>")]
async fn update_app(client_id: ClientId, data: Json<UpdateAppData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut app = owned_app(&client_id, &headers, &mut conn).await?;

    if let Some(name) = data.name {
        if name.trim().is_empty() {
            err!("Application name must not be empty")
        }
        app.name = name.trim().to_string();
    }
    if let Some(uris) = data.redirect_uris {
        for uri in &uris {
            validate_redirect_uri(uri)?;
        }
        app.redirect_uris = serde_json::to_string(&uris)?;
    }
    if let Some(grants) = data.grant_types {
        const KNOWN: &[&str] = &["authorization_code", "refresh_token", "client_credentials"];
        for grant in &grants {
            if !KNOWN.contains(&grant.as_str()) {
                err!("Unknown grant type")
            }
            if grant == "authorization_code" && app.app_type() == AppType::M2m {
                err!("Machine-to-machine clients may not use the authorization code grant")
            }
        }
        app.grant_types = serde_json::to_string(&grants)?;
    }
    if let Some(allow_plain) = data.allow_plain_pkce {
        app.allow_plain_pkce = allow_plain;
    }
    if let Some(active) = data.active {
        app.active = active;
    }

    app.save(&mut conn).await?;
    Ok(Json(json!({"success": true, "app": app.to_json()})))
}

#[delete("/developer/apps/<client_id>")]
async fn delete_app(client_id: ClientId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let app = owned_app(&client_id, &headers, &mut conn).await?;
    app.delete(&mut conn).await?;
    Ok(Json(json!({"success": true})))
}

#[post("/developer/apps/<client_id>/secret")]
async fn rotate_secret(client_id: ClientId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let mut app = owned_app(&client_id, &headers, &mut conn).await?;

    if app.is_public() {
        err!("Public clients have no client secret")
    }

    let secret = app.rotate_secret();
    app.save(&mut conn).await?;

    Ok(Json(json!({"success": true, "client_secret": secret})))
}

//
// Webhooks
//

#[get("/developer/apps/<client_id>/webhooks")]
async fn list_webhooks(client_id: ClientId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let app = owned_app(&client_id, &headers, &mut conn).await?;
    let hooks = Webhook::find_by_app(&app.uuid, &mut conn).await;
    let hooks: Vec<Value> = hooks.iter().map(Webhook::to_json).collect();

    Ok(Json(json!({"success": true, "webhooks": hooks})))
}

#[derive(Deserialize)]
struct CreateWebhookData {
    url: String,
    events: Vec<String>,
}

#[post("/developer/apps/<client_id>/webhooks", data = "<data>")]
async fn create_webhook(
    client_id: ClientId,
    data: Json<CreateWebhookData>,
    headers: FirstPartyHeaders,
    mut conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();
    let app = owned_app(&client_id, &headers, &mut conn).await?;

    let parsed = url::Url::parse(&data.url).map_err(|_| Error::new(ErrorKind::InvalidRequest, "Invalid webhook URL"))?;
    if parsed.scheme() != "https" && parsed.scheme() != "http" {
        err!("Webhook URL must be http(s)")
    }
    if data.events.is_empty() {
        err!("Subscribe to at least one event")
    }

    let hook = Webhook::new(app.uuid.clone(), data.url, data.events);
    hook.save(&mut conn).await?;

    // The shared secret is only revealed at creation time
    Ok(Json(json!({"success": true, "webhook": hook.to_json(), "secret": hook.secret})))
}

#[derive(Deserialize)]
struct UpdateWebhookData {
    url: Option<String>,
    events: Option<Vec<String>>,
    active: Option<bool>,
}

#[patch("/developer/apps/<client_id>/webhooks/<webhook_id>", data = "<data>")]
async fn update_webhook(
    client_id: ClientId,
    webhook_id: WebhookId,
    data: Json<UpdateWebhookData>,
    headers: FirstPartyHeaders,
    mut conn: DbConn,
) -> JsonResult {
    let data = data.into_inner();
    let app = owned_app(&client_id, &headers, &mut conn).await?;
    let Some(mut hook) = Webhook::find_by_uuid_and_app(&webhook_id, &app.uuid, &mut conn).await else {
        err!(NotFound, "Webhook not found")
    };

    if let Some(url) = data.url {
        url::Url::parse(&url).map_err(|_| Error::new(ErrorKind::InvalidRequest, "Invalid webhook URL"))?;
        hook.url = url;
    }
    if let Some(events) = data.events {
        if events.is_empty() {
            err!("Subscribe to at least one event")
        }
        hook.events = serde_json::to_string(&events)?;
    }
    if let Some(active) = data.active {
        hook.active = active;
    }

    hook.save(&mut conn).await?;
    Ok(Json(json!({"success": true, "webhook": hook.to_json()})))
}

#[delete("/developer/apps/<client_id>/webhooks/<webhook_id>")]
async fn delete_webhook(client_id: ClientId, webhook_id: WebhookId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let app = owned_app(&client_id, &headers, &mut conn).await?;
    let Some(hook) = Webhook::find_by_uuid_and_app(&webhook_id, &app.uuid, &mut conn).await else {
        err!(NotFound, "Webhook not found")
    };

    hook.delete(&mut conn).await?;
    Ok(Json(json!({"success": true})))
}

#[get("/developer/apps/<client_id>/webhooks/<webhook_id>/deliveries")]
async fn list_deliveries(client_id: ClientId, webhook_id: WebhookId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let app = owned_app(&client_id, &headers, &mut conn).await?;
    let Some(hook) = Webhook::find_by_uuid_and_app(&webhook_id, &app.uuid, &mut conn).await else {
        err!(NotFound, "Webhook not found")
    };

    let deliveries = WebhookDelivery::find_by_webhook(&hook.uuid, 50, &mut conn).await;
    let deliveries: Vec<Value> = deliveries.iter().map(WebhookDelivery::to_json).collect();

    Ok(Json(json!({"success": true, "deliveries": deliveries})))
}

#[post("/developer/apps/<client_id>/webhooks/<webhook_id>/test")]
async fn test_webhook(client_id: ClientId, webhook_id: WebhookId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let app = owned_app(&client_id, &headers, &mut conn).await?;
    let Some(hook) = Webhook::find_by_uuid_and_app(&webhook_id, &app.uuid, &mut conn).await else {
        err!(NotFound, "Webhook not found")
    };

    webhooks::enqueue_test_event(&hook, &mut conn).await?;
    Ok(Json(json!({"success": true})))
}

//
// Custom claims and branding (opaque blobs, merged into ID tokens / served
// to the login UI elsewhere)
//

#[put("/developer/apps/<client_id>/claims", data = "<data>")]
async fn put_claims(client_id: ClientId, data: Json<Value>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut app = owned_app(&client_id, &headers, &mut conn).await?;

    if !data.is_object() {
        err!("Custom claims must be a JSON object")
    }
    app.custom_claims = Some(serde_json::to_string(&data)?);
    app.save(&mut conn).await?;

    Ok(Json(json!({"success": true, "custom_claims": data})))
}

#[put("/developer/apps/<client_id>/branding", data = "<data>")]
async fn put_branding(client_id: ClientId, data: Json<Value>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let mut app = owned_app(&client_id, &headers, &mut conn).await?;

    if !data.is_object() {
        err!("Branding must be a JSON object")
    }
    app.branding = Some(serde_json::to_string(&data)?);
    app.save(&mut conn).await?;

    Ok(Json(json!({"success": true, "branding": data})))
}

//
// Permitted scopes for client_credentials
//

#[get("/developer/apps/<client_id>/scopes")]
async fn get_scopes(client_id: ClientId, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let app = owned_app(&client_id, &headers, &mut conn).await?;
    let granted = AppScope::find_by_app(&app.uuid, &mut conn).await;

    Ok(Json(json!({"success": true, "scopes": granted})))
}

#[derive(Deserialize)]
struct PutScopesData {
    scopes: Vec<String>,
}

#[put("/developer/apps/<client_id>/scopes", data = "<data>")]
async fn put_scopes(client_id: ClientId, data: Json<PutScopesData>, headers: FirstPartyHeaders, mut conn: DbConn) -> JsonResult {
    let data = data.into_inner();
    let app = owned_app(&client_id, &headers, &mut conn).await?;

    if app.app_type() != AppType::M2m {
        err!("Scope grants only apply to machine-to-machine clients")
    }

    // Only scopes from the registry can be granted
    let known: Vec<String> = Scope::find_all(&mut conn).await.into_iter().map(|s| s.name).collect();
    for scope in &data.scopes {
        if !known.contains(scope) {
            err!(InvalidScope, format!("Unknown scope '{scope}'"))
        }
    }

    let current = AppScope::find_by_app(&app.uuid, &mut conn).await;
    for stale in current.iter().filter(|c| !data.scopes.contains(c)) {
        AppScope::revoke(&app.uuid, stale, &mut conn).await?;
    }
    for scope in &data.scopes {
        AppScope::grant(&app.uuid, scope, &mut conn).await?;
    }

    Ok(Json(json!({"success": true, "scopes": data.scopes})))
}
