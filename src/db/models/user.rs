use chrono::{NaiveDateTime, Utc};
use derive_more::{AsRef, Deref, Display, From};
use num_traits::FromPrimitive;
use serde_json::Value;

use crate::api::EmptyResult;
use crate::db::schema::{audit_logs, oauth_accounts, refresh_tokens, sso_sessions, users, verification_codes};
use crate::db::DbConn;
use crate::error::MapResult;
use crate::util;
use macros::UuidFromParam;

#[derive(
    Clone, Debug, Default, DieselNewType, FromForm, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Deref, Display,
    From, UuidFromParam,
)]
#[deref(forward)]
#[from(forward)]
pub struct UserId(String);

impl UserId {
    pub fn new() -> Self {
        Self(util::get_uuid())
    }
}

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = users)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct User {
    pub uuid: UserId,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,

    pub phone: Option<String>,
    pub phone_verified: bool,
    pub email: Option<String>,
    pub email_verified: bool,
    pub password_hash: Option<String>,

    pub nickname: Option<String>,
    pub avatar: Option<String>,
    pub status: i32,

    pub mfa_enabled: bool,
    pub totp_secret: Option<String>,
    pub totp_recover: Option<String>,
    // Timestep of the last accepted TOTP code, rejects replays within the window
    pub totp_last_used: i64,

    pub last_login_at: Option<NaiveDateTime>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum UserStatus {
    Active = 0,
    Suspended = 1,
}

/// Local methods
impl User {
    fn new() -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: UserId::new(),
            created_at: now,
            updated_at: now,

            phone: None,
            phone_verified: false,
            email: None,
            email_verified: false,
            password_hash: None,

            nickname: None,
            avatar: None,
            status: UserStatus::Active as i32,

            mfa_enabled: false,
            totp_secret: None,
            totp_recover: None,
            totp_last_used: 0,

            last_login_at: None,
        }
    }

    pub fn new_with_phone(phone: String) -> Self {
        let mut user = Self::new();
        user.phone = Some(phone);
        user.phone_verified = true;
        user
    }

    pub fn new_with_email(email: String) -> Self {
        let mut user = Self::new();
        user.email = Some(email.to_lowercase());
        user
    }

    pub fn status(&self) -> UserStatus {
        UserStatus::from_i32(self.status).unwrap_or(UserStatus::Suspended)
    }

    pub fn is_active(&self) -> bool {
        self.status() == UserStatus::Active
    }

    pub fn check_valid_password(&self, password: &str) -> bool {
        match self.password_hash {
            Some(ref hash) => crate::crypto::verify_password(password, hash),
            None => false,
        }
    }

    pub fn check_valid_recovery_code(&self, recovery_code: &str) -> bool {
        if let Some(ref totp_recover) = self.totp_recover {
            crate::crypto::ct_eq(recovery_code.to_lowercase(), totp_recover.to_lowercase())
        } else {
            false
        }
    }

    /// The display name used for the `name` ID token claim and `/user/me`.
    pub fn display_name(&self) -> String {
        if let Some(ref nickname) = self.nickname {
            return nickname.clone();
        }
        if let Some(ref email) = self.email {
            return email.split('@').next().unwrap_or(email).to_string();
        }
        self.phone.clone().unwrap_or_else(|| self.uuid.to_string())
    }

    pub fn to_json(&self) -> Value {
        json!({
            "id": self.uuid,
            "phone": self.phone,
            "phone_verified": self.phone_verified,
            "email": self.email,
            "email_verified": self.email_verified,
            "nickname": self.nickname,
            "avatar": self.avatar,
            "mfa_enabled": self.mfa_enabled,
            "has_password": self.password_hash.is_some(),
            "created_at": util::format_date(&self.created_at),
        })
    }
}

use diesel::prelude::*;

/// Database methods
impl User {
    pub async fn save(&mut self, conn: &mut DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                crate::util::retry(
                    || diesel::replace_into(users::table).values(&*self).execute(conn),
                    10,
                ).map_res("Error saving user")
            }
            postgresql {
                crate::util::retry(
                    || diesel::insert_into(users::table).values(&*self).on_conflict(users::uuid).do_update().set(&*self).execute(conn),
                    10,
                ).map_res("Error saving user")
            }
        }
    }

    /// Deletes the user and every row it owns.
    pub async fn delete(self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::delete(refresh_tokens::table.filter(refresh_tokens::user_uuid.eq(&self.uuid))).execute(conn)?;
                diesel::delete(sso_sessions::table.filter(sso_sessions::user_uuid.eq(&self.uuid))).execute(conn)?;
                diesel::delete(oauth_accounts::table.filter(oauth_accounts::user_uuid.eq(&self.uuid))).execute(conn)?;
                if let Some(ref phone) = self.phone {
                    diesel::delete(verification_codes::table.filter(verification_codes::target.eq(phone))).execute(conn)?;
                }
                if let Some(ref email) = self.email {
                    diesel::delete(verification_codes::table.filter(verification_codes::target.eq(email))).execute(conn)?;
                }
                diesel::delete(audit_logs::table.filter(audit_logs::user_uuid.eq(Some(&self.uuid)))).execute(conn)?;
                diesel::delete(users::table.filter(users::uuid.eq(&self.uuid))).execute(conn)?;
                Ok(())
            }).map_res("Error deleting user")
        }}
    }

    pub async fn find_by_uuid(uuid: &UserId, conn: &mut DbConn) -> Option<Self> {
        db_run! { conn: {
            users::table
                .filter(users::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_phone(phone: &str, conn: &mut DbConn) -> Option<Self> {
        db_run! { conn: {
            users::table
                .filter(users::phone.eq(phone))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_email(email: &str, conn: &mut DbConn) -> Option<Self> {
        let lower = email.to_lowercase();
        db_run! { conn: {
            users::table
                .filter(users::email.eq(lower))
                .first::<Self>(conn)
                .ok()
        }}
    }
}
