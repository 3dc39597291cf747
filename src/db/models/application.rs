use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use num_traits::FromPrimitive;
use serde_json::Value;

use super::UserId;
use crate::api::EmptyResult;
use crate::db::schema::{app_scopes, applications, webhook_deliveries, webhooks};
use crate::db::DbConn;
use crate::error::MapResult;
use crate::{crypto, util};
use macros::IdFromParam;

#[derive(
    Clone, Debug, Default, DieselNewType, FromForm, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Deref, Display,
    From, IdFromParam,
)]
#[deref(forward)]
#[from(forward)]
pub struct ClientId(String);

impl ClientId {
    pub fn new() -> Self {
        Self(crypto::generate_client_id())
    }
}

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = applications)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct Application {
    pub uuid: String,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,

    pub owner_uuid: UserId,
    pub client_id: ClientId,
    // None for public clients, which have nothing to keep secret
    pub client_secret_hash: Option<String>,

    pub name: String,
    pub app_type: i32,
    pub is_trusted: bool,

    // JSON arrays, exact-match values
    pub redirect_uris: String,
    pub grant_types: String,
    pub allow_plain_pkce: bool,

    pub custom_claims: Option<String>,
    pub branding: Option<String>,
    pub active: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum AppType {
    Web = 0,
    Spa = 1,
    Native = 2,
    M2m = 3,
}

impl AppType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "web" => Some(Self::Web),
            "spa" => Some(Self::Spa),
            "native" => Some(Self::Native),
            "m2m" => Some(Self::M2m),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Spa => "spa",
            Self::Native => "native",
            Self::M2m => "m2m",
        }
    }
}

/// Local methods
impl Application {
    pub fn new(owner_uuid: UserId, name: String, app_type: AppType, redirect_uris: Vec<String>) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: util::get_uuid(),
            created_at: now,
            updated_at: now,

            owner_uuid,
            client_id: ClientId::new(),
            client_secret_hash: None,

            name,
            app_type: app_type as i32,
            is_trusted: false,

            redirect_uris: serde_json::to_string(&redirect_uris).unwrap_or_else(|_| String::from("[]")),
            grant_types: Self::default_grant_types(app_type),
            allow_plain_pkce: false,

            custom_claims: None,
            branding: None,
            active: true,
        }
    }

    fn default_grant_types(app_type: AppType) -> String {
        let grants: &[&str] = match app_type {
            AppType::M2m => &["client_credentials"],
            _ => &["authorization_code", "refresh_token"],
        };
        serde_json::to_string(grants).unwrap_or_else(|_| String::from("[]"))
    }

    pub fn app_type(&self) -> AppType {
        AppType::from_i32(self.app_type).unwrap_or(AppType::Web)
    }

    /// Public clients cannot keep a secret and must prove possession with PKCE.
    pub fn is_public(&self) -> bool {
        matches!(self.app_type(), AppType::Spa | AppType::Native)
    }

    pub fn redirect_uris(&self) -> Vec<String> {
        serde_json::from_str(&self.redirect_uris).unwrap_or_default()
    }

    pub fn grant_types(&self) -> Vec<String> {
        serde_json::from_str(&self.grant_types).unwrap_or_default()
    }

    /// Exact match including path, per registration.
    pub fn is_registered_redirect_uri(&self, uri: &str) -> bool {
        self.redirect_uris().iter().any(|r| r == uri)
    }

    pub fn allows_grant(&self, grant: &str) -> bool {
        self.grant_types().iter().any(|g| g == grant)
    }

    /// Generates and stores a fresh secret, returning the raw value. The raw
    /// secret is only ever visible in this return value.
    pub fn rotate_secret(&mut self) -> String {
        let secret = crypto::generate_client_secret();
        self.client_secret_hash = Some(crypto::sha256_hex(secret.as_bytes()));
        secret
    }

    pub fn check_client_secret(&self, secret: &str) -> bool {
        match self.client_secret_hash {
            Some(ref hash) => crypto::ct_eq(crypto::sha256_hex(secret.as_bytes()), hash),
            None => false,
        }
    }

    pub fn custom_claims(&self) -> Value {
        self.custom_claims.as_deref().and_then(|c| serde_json::from_str(c).ok()).unwrap_or_else(|| json!({}))
    }

    pub fn to_json(&self) -> Value {
        json!({
            "client_id": self.client_id,
            "name": self.name,
            "type": self.app_type().name(),
            "is_public": self.is_public(),
            "is_trusted": self.is_trusted,
            "redirect_uris": self.redirect_uris(),
            "grant_types": self.grant_types(),
            "allow_plain_pkce": self.allow_plain_pkce,
            "custom_claims": self.custom_claims.as_deref().and_then(|c| serde_json::from_str::<Value>(c).ok()),
            "branding": self.branding.as_deref().and_then(|b| serde_json::from_str::<Value>(b).ok()),
            "active": self.active,
            "created_at": util::format_date(&self.created_at),
        })
    }
}

use diesel::prelude::*;

/// Database methods
impl Application {
    pub async fn save(&mut self, conn: &mut DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(applications::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving application")
            }
            postgresql {
                diesel::insert_into(applications::table)
                    .values(&*self)
                    .on_conflict(applications::uuid)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving application")
            }
        }
    }

    /// Deletes the application and its webhooks, deliveries and scope grants.
    pub async fn delete(self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let webhook_ids: Vec<String> = webhooks::table
                    .filter(webhooks::app_uuid.eq(&self.uuid))
                    .select(webhooks::uuid)
                    .load(conn)?;
                diesel::delete(webhook_deliveries::table.filter(webhook_deliveries::webhook_uuid.eq_any(webhook_ids)))
                    .execute(conn)?;
                diesel::delete(webhooks::table.filter(webhooks::app_uuid.eq(&self.uuid))).execute(conn)?;
                diesel::delete(app_scopes::table.filter(app_scopes::app_uuid.eq(&self.uuid))).execute(conn)?;
                diesel::delete(applications::table.filter(applications::uuid.eq(&self.uuid))).execute(conn)?;
                Ok(())
            }).map_res("Error deleting application")
        }}
    }

    pub async fn find_by_uuid(uuid: &str, conn: &mut DbConn) -> Option<Self> {
        db_run! { conn: {
            applications::table
                .filter(applications::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_client_id(client_id: &ClientId, conn: &mut DbConn) -> Option<Self> {
        db_run! { conn: {
            applications::table
                .filter(applications::client_id.eq(client_id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    /// Whether any registered application carries this exact redirect URI.
    /// Decides if an authorize error may bounce back to the URI at all.
    pub async fn any_with_redirect_uri(uri: &str, conn: &mut DbConn) -> bool {
        let apps: Vec<Self> = db_run! { conn: {
            applications::table
                .filter(applications::active.eq(true))
                .load::<Application>(conn)
                .unwrap_or_default()
        }};

        apps.iter().any(|a| a.is_registered_redirect_uri(uri))
    }

    pub async fn find_by_owner(owner_uuid: &UserId, conn: &mut DbConn) -> Vec<Self> {
        db_run! { conn: {
            applications::table
                .filter(applications::owner_uuid.eq(owner_uuid))
                .order(applications::created_at.asc())
                .load::<Self>(conn)
                .expect("Error loading applications")
        }}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn app(app_type: AppType) -> Application {
        Application::new(
            UserId::from("owner"),
            String::from("Test"),
            app_type,
            vec![String::from("https://app.example.com/cb")],
        )
    }

    #[test]
    fn public_clients_are_spa_and_native() {
        assert!(!app(AppType::Web).is_public());
        assert!(app(AppType::Spa).is_public());
        assert!(app(AppType::Native).is_public());
        assert!(!app(AppType::M2m).is_public());
    }

    #[test]
    fn m2m_defaults_exclude_authorization_code() {
        let m2m = app(AppType::M2m);
        assert!(m2m.allows_grant("client_credentials"));
        assert!(!m2m.allows_grant("authorization_code"));

        let web = app(AppType::Web);
        assert!(web.allows_grant("authorization_code"));
        assert!(web.allows_grant("refresh_token"));
        assert!(!web.allows_grant("client_credentials"));
    }

    #[test]
    fn redirect_uri_matching_is_exact() {
        let web = app(AppType::Web);
        assert!(web.is_registered_redirect_uri("https://app.example.com/cb"));
        assert!(!web.is_registered_redirect_uri("https://app.example.com/cb/"));
        assert!(!web.is_registered_redirect_uri("https://app.example.com/other"));
        assert!(!web.is_registered_redirect_uri("http://app.example.com/cb"));
    }

    #[test]
    fn client_secret_roundtrip() {
        let mut web = app(AppType::Web);
        assert!(!web.check_client_secret("anything"));

        let secret = web.rotate_secret();
        assert!(web.check_client_secret(&secret));
        assert!(!web.check_client_secret("wrong"));

        let rotated = web.rotate_secret();
        assert!(!web.check_client_secret(&secret));
        assert!(web.check_client_secret(&rotated));
    }
}
