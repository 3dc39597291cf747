use chrono::{NaiveDateTime, TimeDelta, Utc};
use derive_more::{AsRef, Deref, Display, From};
use std::collections::BTreeSet;

use super::{ClientId, UserId};
use crate::api::EmptyResult;
use crate::db::schema::sso_sessions;
use crate::db::{DbConn, DbPool};
use crate::error::MapResult;
use crate::{crypto, util, CONFIG};
use macros::UuidFromParam;

#[derive(
    Clone, Debug, Default, DieselNewType, FromForm, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Deref, Display,
    From, UuidFromParam,
)]
#[deref(forward)]
#[from(forward)]
pub struct SessionId(String);

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = sso_sessions)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct SsoSession {
    pub uuid: SessionId,
    pub token_hash: String,
    pub user_uuid: UserId,
    // JSON array of client ids that have joined this session
    pub apps: String,
    pub remember: bool,
    pub ip: String,
    pub user_agent: Option<String>,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub last_activity: NaiveDateTime,
}

/// Local methods
impl SsoSession {
    /// Creates a session for the user with `app` as its first member and
    /// returns the raw cookie value. Only the SHA-256 is persisted.
    pub fn new(
        user_uuid: UserId,
        app: Option<&ClientId>,
        remember: bool,
        ip: String,
        user_agent: Option<String>,
    ) -> (Self, String) {
        let raw = crypto::generate_session_token();
        let now = Utc::now().naive_utc();
        let validity = if remember {
            TimeDelta::days(CONFIG.session_remember_days())
        } else {
            TimeDelta::hours(CONFIG.session_validity_hours())
        };

        let apps: Vec<String> = app.map(|a| vec![a.to_string()]).unwrap_or_default();

        let session = Self {
            uuid: SessionId(util::get_uuid()),
            token_hash: crypto::sha256_hex(raw.as_bytes()),
            user_uuid,
            apps: serde_json::to_string(&apps).unwrap_or_else(|_| String::from("[]")),
            remember,
            ip,
            user_agent,
            created_at: now,
            expires_at: now + validity,
            last_activity: now,
        };

        (session, raw)
    }

    pub fn apps(&self) -> BTreeSet<String> {
        serde_json::from_str::<Vec<String>>(&self.apps).map(|v| v.into_iter().collect()).unwrap_or_default()
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now().naive_utc()
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.uuid,
            "apps": self.apps(),
            "remember": self.remember,
            "ip": self.ip,
            "user_agent": self.user_agent,
            "created_at": util::format_date(&self.created_at),
            "expires_at": util::format_date(&self.expires_at),
            "last_activity": util::format_date(&self.last_activity),
        })
    }
}

use diesel::prelude::*;

/// Database methods
impl SsoSession {
    pub async fn save(&self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(sso_sessions::table)
                .values(self)
                .execute(conn)
                .map_res("Error saving SSO session")
        }}
    }

    /// Looks up a session by its raw cookie value. Expired sessions are
    /// deleted on sight and never returned; live sessions get their
    /// `last_activity` advanced.
    pub async fn resolve(raw_token: &str, conn: &mut DbConn) -> Option<Self> {
        let hash = crypto::sha256_hex(raw_token.as_bytes());
        let now = Utc::now().naive_utc();

        let session: Option<Self> = db_run! { conn: {
            sso_sessions::table
                .filter(sso_sessions::token_hash.eq(&hash))
                .first::<SsoSession>(conn)
                .ok()
        }};

        let mut session = session?;
        if session.is_expired() {
            session.delete(conn).await.ok();
            return None;
        }

        session.last_activity = now;
        let uuid = session.uuid.clone();
        db_run! { conn: {
            diesel::update(sso_sessions::table.filter(sso_sessions::uuid.eq(uuid)))
                .set(sso_sessions::last_activity.eq(now))
                .execute(conn)
                .ok()
        }};

        Some(session)
    }

    /// Idempotently adds the application to the session's `apps` set. The
    /// read-merge-write runs in one transaction so concurrent joins end with
    /// the union of both sets.
    pub async fn join(&self, app: &ClientId, conn: &mut DbConn) -> EmptyResult {
        let uuid = self.uuid.clone();
        let app = app.to_string();

        db_run! { conn: {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let current: String = sso_sessions::table
                    .filter(sso_sessions::uuid.eq(&uuid))
                    .select(sso_sessions::apps)
                    .first(conn)?;

                let mut apps: BTreeSet<String> =
                    serde_json::from_str::<Vec<String>>(&current).map(|v| v.into_iter().collect()).unwrap_or_default();

                if apps.insert(app.clone()) {
                    let merged = serde_json::to_string(&apps).unwrap_or(current);
                    diesel::update(sso_sessions::table.filter(sso_sessions::uuid.eq(&uuid)))
                        .set(sso_sessions::apps.eq(merged))
                        .execute(conn)?;
                }
                Ok(())
            })
            .map_res("Error joining application to session")
        }}
    }

    pub async fn delete(&self, conn: &mut DbConn) -> EmptyResult {
        let uuid = self.uuid.clone();
        db_run! { conn: {
            diesel::delete(sso_sessions::table.filter(sso_sessions::uuid.eq(uuid)))
                .execute(conn)
                .map_res("Error deleting SSO session")
        }}
    }

    /// Deletes every session of the user, returning how many were removed.
    pub async fn delete_all_by_user(user_uuid: &UserId, conn: &mut DbConn) -> Result<usize, crate::error::Error> {
        db_run! { conn: {
            diesel::delete(sso_sessions::table.filter(sso_sessions::user_uuid.eq(user_uuid)))
                .execute(conn)
                .map_err(|e| crate::error::Error::from(e).with_msg("Error deleting user sessions"))
        }}
    }

    pub async fn find_by_uuid_and_user(uuid: &SessionId, user_uuid: &UserId, conn: &mut DbConn) -> Option<Self> {
        db_run! { conn: {
            sso_sessions::table
                .filter(sso_sessions::uuid.eq(uuid))
                .filter(sso_sessions::user_uuid.eq(user_uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_user(user_uuid: &UserId, conn: &mut DbConn) -> Vec<Self> {
        db_run! { conn: {
            sso_sessions::table
                .filter(sso_sessions::user_uuid.eq(user_uuid))
                .order(sso_sessions::last_activity.desc())
                .load::<Self>(conn)
                .expect("Error loading sessions")
        }}
    }

    /// Background sweep removing sessions past their expiry.
    pub async fn purge_expired(pool: DbPool) -> EmptyResult {
        debug!("Purging expired SSO sessions");
        let Ok(mut conn) = pool.get().await else {
            err!(Internal, "Failed to get DB connection while purging expired sessions")
        };

        let now = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::delete(sso_sessions::table.filter(sso_sessions::expires_at.le(now)))
                .execute(conn)
                .map_res("Error purging expired sessions")
        }}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remember_me_extends_the_session() {
        let (short, _) = SsoSession::new(UserId::from("u1"), None, false, String::from("127.0.0.1"), None);
        let (long, _) = SsoSession::new(UserId::from("u1"), None, true, String::from("127.0.0.1"), None);

        assert!(long.expires_at > short.expires_at);
        assert!(!short.is_expired());
    }

    #[test]
    fn raw_token_is_not_stored() {
        let (session, raw) = SsoSession::new(UserId::from("u1"), None, false, String::from("127.0.0.1"), None);

        assert_ne!(session.token_hash, raw);
        assert_eq!(session.token_hash, crypto::sha256_hex(raw.as_bytes()));
    }

    #[test]
    fn first_app_joins_at_creation() {
        let client = ClientId::from("app_first");
        let (session, _) = SsoSession::new(UserId::from("u1"), Some(&client), false, String::from("127.0.0.1"), None);

        assert!(session.apps().contains("app_first"));
        assert_eq!(session.apps().len(), 1);
    }
}
