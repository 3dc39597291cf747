use chrono::{NaiveDateTime, TimeDelta, Utc};

use super::UserId;
use crate::api::{ApiResult, EmptyResult};
use crate::db::schema::refresh_tokens;
use crate::db::DbConn;
use crate::error::{Error, ErrorKind, MapResult};
use crate::{crypto, util, CONFIG};

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = refresh_tokens)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct RefreshToken {
    pub uuid: String,
    pub user_uuid: UserId,
    // None for first-party (direct) logins
    pub client_uuid: Option<String>,
    pub token_hash: String,
    pub scope: String,
    // Rotation chain id, shared by every successor of one grant
    pub family: String,
    pub device_fingerprint: Option<String>,
    pub ip: String,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
    pub revoked: bool,
}

/// Local methods
impl RefreshToken {
    /// Creates a token row and returns it together with the raw value the
    /// client gets to see. Only the SHA-256 of the raw value is persisted.
    pub fn new(
        user_uuid: UserId,
        client_uuid: Option<String>,
        scope: String,
        device_fingerprint: Option<String>,
        ip: String,
    ) -> (Self, String) {
        let raw = crypto::generate_refresh_token();
        let now = Utc::now().naive_utc();

        let token = Self {
            uuid: util::get_uuid(),
            user_uuid,
            client_uuid,
            token_hash: crypto::sha256_hex(raw.as_bytes()),
            scope,
            family: util::get_uuid(),
            device_fingerprint,
            ip,
            created_at: now,
            expires_at: now + TimeDelta::days(CONFIG.refresh_token_validity_days()),
            revoked: false,
        };

        (token, raw)
    }

    /// The replacement row minted during rotation, staying in the same family.
    pub fn successor(&self, ip: String) -> (Self, String) {
        let raw = crypto::generate_refresh_token();
        let now = Utc::now().naive_utc();

        let token = Self {
            uuid: util::get_uuid(),
            user_uuid: self.user_uuid.clone(),
            client_uuid: self.client_uuid.clone(),
            token_hash: crypto::sha256_hex(raw.as_bytes()),
            scope: self.scope.clone(),
            family: self.family.clone(),
            device_fingerprint: self.device_fingerprint.clone(),
            ip,
            created_at: now,
            expires_at: now + TimeDelta::days(CONFIG.refresh_token_validity_days()),
            revoked: false,
        };

        (token, raw)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now().naive_utc()
    }
}

use diesel::prelude::*;

/// Database methods
impl RefreshToken {
    pub async fn save(&self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(refresh_tokens::table)
                .values(self)
                .execute(conn)
                .map_res("Error saving refresh token")
        }}
    }

    /// Consumes `self` and inserts `replacement` in one transaction, so no
    /// observer ever sees both tokens valid. Fails with `invalid_grant` when
    /// a concurrent rotation got there first.
    pub async fn rotate(&self, replacement: &RefreshToken, conn: &mut DbConn) -> ApiResult<()> {
        let rotated = db_run! { conn: {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let consumed = diesel::update(
                    refresh_tokens::table
                        .filter(refresh_tokens::uuid.eq(&self.uuid))
                        .filter(refresh_tokens::revoked.eq(false)),
                )
                .set(refresh_tokens::revoked.eq(true))
                .execute(conn)?;

                if consumed != 1 {
                    return Ok(false);
                }

                diesel::insert_into(refresh_tokens::table).values(replacement).execute(conn)?;
                Ok(true)
            })
            .map_err(|e| Error::from(e).with_msg("Error rotating refresh token"))
        }}?;

        if !rotated {
            return Err(Error::new(ErrorKind::InvalidGrant, "Refresh token is no longer valid"));
        }
        Ok(())
    }

    /// Revokes every token in the same rotation family. Used when a revoked
    /// token is presented again, which indicates a replayed credential.
    pub async fn revoke_family(&self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(refresh_tokens::table.filter(refresh_tokens::family.eq(&self.family)))
                .set(refresh_tokens::revoked.eq(true))
                .execute(conn)
                .map_res("Error revoking token family")
        }}
    }

    pub async fn revoke(&self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(refresh_tokens::table.filter(refresh_tokens::uuid.eq(&self.uuid)))
                .set(refresh_tokens::revoked.eq(true))
                .execute(conn)
                .map_res("Error revoking refresh token")
        }}
    }

    pub async fn revoke_all_by_user(user_uuid: &UserId, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(refresh_tokens::table.filter(refresh_tokens::user_uuid.eq(user_uuid)))
                .set(refresh_tokens::revoked.eq(true))
                .execute(conn)
                .map_res("Error revoking user tokens")
        }}
    }

    pub async fn find_by_raw_token(raw: &str, conn: &mut DbConn) -> Option<Self> {
        let hash = crypto::sha256_hex(raw.as_bytes());
        db_run! { conn: {
            refresh_tokens::table
                .filter(refresh_tokens::token_hash.eq(hash))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_authorized_client_uuids(user_uuid: &UserId, conn: &mut DbConn) -> Vec<String> {
        db_run! { conn: {
            refresh_tokens::table
                .filter(refresh_tokens::user_uuid.eq(user_uuid))
                .filter(refresh_tokens::revoked.eq(false))
                .filter(refresh_tokens::client_uuid.is_not_null())
                .select(refresh_tokens::client_uuid.assume_not_null())
                .distinct()
                .load::<String>(conn)
                .expect("Error loading authorized clients")
        }}
    }

    pub async fn revoke_by_user_and_client(user_uuid: &UserId, client_uuid: &str, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::update(
                refresh_tokens::table
                    .filter(refresh_tokens::user_uuid.eq(user_uuid))
                    .filter(refresh_tokens::client_uuid.eq(client_uuid)),
            )
            .set(refresh_tokens::revoked.eq(true))
            .execute(conn)
            .map_res("Error revoking application grant")
        }}
    }

    pub async fn delete_expired(conn: &mut DbConn) -> EmptyResult {
        let cutoff = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::delete(refresh_tokens::table.filter(refresh_tokens::expires_at.lt(cutoff)))
                .execute(conn)
                .map_res("Error purging expired refresh tokens")
        }}
    }
}
