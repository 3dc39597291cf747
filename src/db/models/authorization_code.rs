use chrono::{NaiveDateTime, TimeDelta, Utc};

use super::{ClientId, UserId};
use crate::api::EmptyResult;
use crate::db::schema::authorization_codes;
use crate::db::DbConn;
use crate::error::MapResult;
use crate::{crypto, util, CONFIG};

#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = authorization_codes)]
#[diesel(primary_key(uuid))]
pub struct AuthorizationCode {
    pub uuid: String,
    pub code_hash: String,
    pub user_uuid: UserId,
    pub client_id: ClientId,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    // When the user originally authenticated, carried into the ID token
    pub auth_time: Option<NaiveDateTime>,
    pub used: bool,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

pub struct CodeBinding {
    pub user_uuid: UserId,
    pub client_id: ClientId,
    pub redirect_uri: String,
    pub scope: String,
    pub code_challenge: Option<String>,
    pub code_challenge_method: Option<String>,
    pub nonce: Option<String>,
    pub auth_time: Option<NaiveDateTime>,
}

/// Local methods
impl AuthorizationCode {
    /// Creates the code row and returns it with the raw opaque value that is
    /// put on the redirect URL. Only the SHA-256 is persisted.
    pub fn new(binding: CodeBinding) -> (Self, String) {
        let raw = crypto::generate_authorization_code();
        let now = Utc::now().naive_utc();

        let code = Self {
            uuid: util::get_uuid(),
            code_hash: crypto::sha256_hex(raw.as_bytes()),
            user_uuid: binding.user_uuid,
            client_id: binding.client_id,
            redirect_uri: binding.redirect_uri,
            scope: binding.scope,
            code_challenge: binding.code_challenge,
            code_challenge_method: binding.code_challenge_method,
            nonce: binding.nonce,
            auth_time: binding.auth_time,
            used: false,
            created_at: now,
            expires_at: now + TimeDelta::seconds(CONFIG.auth_code_validity()),
        };

        (code, raw)
    }
}

use diesel::prelude::*;

/// Database methods
impl AuthorizationCode {
    pub async fn save(&self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(authorization_codes::table)
                .values(self)
                .execute(conn)
                .map_res("Error saving authorization code")
        }}
    }

    /// Burns the code and returns its binding. The mark-used update and the
    /// read happen in one transaction, making the code single-use globally:
    /// any second redemption sees zero affected rows and gets `None`.
    pub async fn consume(raw_code: &str, conn: &mut DbConn) -> Option<Self> {
        let hash = crypto::sha256_hex(raw_code.as_bytes());
        let now = Utc::now().naive_utc();

        db_run! { conn: {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let burned = diesel::update(
                    authorization_codes::table
                        .filter(authorization_codes::code_hash.eq(&hash))
                        .filter(authorization_codes::used.eq(false))
                        .filter(authorization_codes::expires_at.gt(now)),
                )
                .set(authorization_codes::used.eq(true))
                .execute(conn)?;

                if burned != 1 {
                    return Ok(None);
                }

                authorization_codes::table
                    .filter(authorization_codes::code_hash.eq(&hash))
                    .first::<AuthorizationCode>(conn)
                    .optional()
            })
            .ok()
            .flatten()
        }}
    }

    pub async fn delete_expired(conn: &mut DbConn) -> EmptyResult {
        let cutoff = Utc::now().naive_utc();
        db_run! { conn: {
            diesel::delete(authorization_codes::table.filter(authorization_codes::expires_at.lt(cutoff)))
                .execute(conn)
                .map_res("Error purging expired authorization codes")
        }}
    }
}
