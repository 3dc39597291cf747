use chrono::{NaiveDateTime, TimeDelta, Utc};

use crate::api::{ApiResult, EmptyResult};
use crate::db::schema::verification_codes;
use crate::db::DbConn;
use crate::error::MapResult;
use crate::{crypto, util, CONFIG};

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = verification_codes)]
#[diesel(primary_key(uuid))]
pub struct VerificationCode {
    pub uuid: String,
    // Phone number or email address the code was sent to
    pub target: String,
    pub code_hash: String,
    pub atype: i32,
    pub attempts: i32,
    pub used: bool,
    pub created_at: NaiveDateTime,
    pub expires_at: NaiveDateTime,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum CodeType {
    Login = 0,
    Register = 1,
    Reset = 2,
    EmailVerify = 3,
}

/// Outcome of a code submission. Mismatch and exhaustion both surface as
/// `Invalid` on the wire, the distinction only matters for the audit log.
#[derive(Debug, Eq, PartialEq)]
pub enum CodeVerification {
    Valid,
    Invalid,
    Expired,
    TooManyAttempts,
}

/// Local methods
impl VerificationCode {
    pub fn new(target: String, code: &str, atype: CodeType) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: util::get_uuid(),
            target,
            code_hash: crypto::sha256_hex(code.as_bytes()),
            atype: atype as i32,
            attempts: 0,
            used: false,
            created_at: now,
            expires_at: now + TimeDelta::seconds(CONFIG.code_validity()),
        }
    }
}

use diesel::prelude::*;

/// Database methods
impl VerificationCode {
    /// Persists a fresh code and invalidates every earlier unused code for
    /// the same (target, type), keeping at most one live code at any moment.
    pub async fn issue(self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::update(
                    verification_codes::table
                        .filter(verification_codes::target.eq(&self.target))
                        .filter(verification_codes::atype.eq(self.atype))
                        .filter(verification_codes::used.eq(false)),
                )
                .set(verification_codes::used.eq(true))
                .execute(conn)?;

                diesel::insert_into(verification_codes::table).values(&self).execute(conn)?;
                Ok(())
            }).map_res("Error saving verification code")
        }}
    }

    /// Checks a submitted code against the most recent live code for the
    /// target. The attempt counter is advanced and, on a match, the code is
    /// marked used inside the same transaction that reads it, so a code can
    /// never be accepted twice and a burned code never revives.
    pub async fn verify(target: &str, atype: CodeType, code: &str, conn: &mut DbConn) -> ApiResult<CodeVerification> {
        let now = Utc::now().naive_utc();
        let submitted_hash = crypto::sha256_hex(code.as_bytes());
        let max_attempts = CONFIG.code_attempts_limit();
        let target = target.to_string();

        db_run! { conn: {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                let candidate = verification_codes::table
                    .filter(verification_codes::target.eq(&target))
                    .filter(verification_codes::atype.eq(atype as i32))
                    .filter(verification_codes::used.eq(false))
                    .order(verification_codes::created_at.desc())
                    .first::<VerificationCode>(conn)
                    .optional()?;

                let Some(vc) = candidate else {
                    return Ok(CodeVerification::Invalid);
                };

                if vc.expires_at < now {
                    return Ok(CodeVerification::Expired);
                }

                // A burned code is rejected before the submitted value is even looked at
                if vc.attempts >= max_attempts {
                    return Ok(CodeVerification::TooManyAttempts);
                }

                if crypto::ct_eq(&submitted_hash, &vc.code_hash) {
                    // The guarded update is what actually consumes the code; a
                    // concurrent consumer makes this affect zero rows.
                    let consumed = diesel::update(
                        verification_codes::table
                            .filter(verification_codes::uuid.eq(&vc.uuid))
                            .filter(verification_codes::used.eq(false))
                            .filter(verification_codes::attempts.lt(max_attempts)),
                    )
                    .set((
                        verification_codes::used.eq(true),
                        verification_codes::attempts.eq(verification_codes::attempts + 1),
                    ))
                    .execute(conn)?;

                    if consumed == 1 {
                        Ok(CodeVerification::Valid)
                    } else {
                        Ok(CodeVerification::Invalid)
                    }
                } else {
                    diesel::update(verification_codes::table.filter(verification_codes::uuid.eq(&vc.uuid)))
                        .set(verification_codes::attempts.eq(verification_codes::attempts + 1))
                        .execute(conn)?;

                    Ok(CodeVerification::Invalid)
                }
            }).map_err(|e| crate::error::Error::from(e).with_msg("Error verifying code"))
        }}
    }

    pub async fn delete_expired(conn: &mut DbConn) -> EmptyResult {
        let cutoff = Utc::now().naive_utc() - TimeDelta::days(1);
        db_run! { conn: {
            diesel::delete(verification_codes::table.filter(verification_codes::expires_at.lt(cutoff)))
                .execute(conn)
                .map_res("Error purging expired verification codes")
        }}
    }
}

impl CodeType {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "login" => Some(Self::Login),
            "register" => Some(Self::Register),
            "reset" => Some(Self::Reset),
            "email_verify" => Some(Self::EmailVerify),
            _ => None,
        }
    }
}
