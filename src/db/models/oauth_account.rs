use chrono::{NaiveDateTime, Utc};

use super::UserId;
use crate::api::EmptyResult;
use crate::db::schema::oauth_accounts;
use crate::db::DbConn;
use crate::error::MapResult;
use crate::util;

#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = oauth_accounts)]
#[diesel(primary_key(uuid))]
pub struct OAuthAccount {
    pub uuid: String,
    pub user_uuid: UserId,
    pub provider: String,
    pub provider_user_id: String,
    pub email: Option<String>,
    // Raw provider profile, kept for diagnostics only
    pub profile: Option<String>,
    pub created_at: NaiveDateTime,
}

/// Local methods
impl OAuthAccount {
    pub fn new(user_uuid: UserId, provider: String, provider_user_id: String, email: Option<String>) -> Self {
        Self {
            uuid: util::get_uuid(),
            user_uuid,
            provider,
            provider_user_id,
            email,
            profile: None,
            created_at: Utc::now().naive_utc(),
        }
    }
}

use diesel::prelude::*;

/// Database methods
impl OAuthAccount {
    pub async fn save(&self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(oauth_accounts::table)
                .values(self)
                .execute(conn)
                .map_res("Error saving oauth account")
        }}
    }

    pub async fn find_by_provider_user(provider: &str, provider_user_id: &str, conn: &mut DbConn) -> Option<Self> {
        db_run! { conn: {
            oauth_accounts::table
                .filter(oauth_accounts::provider.eq(provider))
                .filter(oauth_accounts::provider_user_id.eq(provider_user_id))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_user(user_uuid: &UserId, conn: &mut DbConn) -> Vec<Self> {
        db_run! { conn: {
            oauth_accounts::table
                .filter(oauth_accounts::user_uuid.eq(user_uuid))
                .load::<Self>(conn)
                .expect("Error loading oauth accounts")
        }}
    }

    pub async fn delete_by_user_and_provider(user_uuid: &UserId, provider: &str, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::delete(
                oauth_accounts::table
                    .filter(oauth_accounts::user_uuid.eq(user_uuid))
                    .filter(oauth_accounts::provider.eq(provider)),
            )
            .execute(conn)
            .map_res("Error unbinding provider")
        }}
    }
}
