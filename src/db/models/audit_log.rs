use chrono::{NaiveDateTime, TimeDelta, Utc};

use super::UserId;
use crate::api::EmptyResult;
use crate::db::schema::audit_logs;
use crate::db::{DbConn, DbPool};
use crate::error::MapResult;
use crate::util;

// Append-only log of security relevant actions, keyed by user+action+time.
#[derive(Identifiable, Queryable, Insertable)]
#[diesel(table_name = audit_logs)]
#[diesel(primary_key(uuid))]
pub struct AuditLog {
    pub uuid: String,
    pub user_uuid: Option<UserId>,
    pub action: String,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub detail: Option<String>,
    pub created_at: NaiveDateTime,
}

impl AuditLog {
    pub fn new(user_uuid: Option<UserId>, action: &str, ip: Option<String>) -> Self {
        Self {
            uuid: util::get_uuid(),
            user_uuid,
            action: action.to_string(),
            ip,
            user_agent: None,
            detail: None,
            created_at: Utc::now().naive_utc(),
        }
    }

    pub fn with_detail(mut self, detail: String) -> Self {
        self.detail = Some(detail);
        self
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "action": self.action,
            "ip": self.ip,
            "detail": self.detail,
            "created_at": util::format_date(&self.created_at),
        })
    }
}

use diesel::prelude::*;

impl AuditLog {
    pub async fn save(&self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            diesel::insert_into(audit_logs::table)
                .values(self)
                .execute(conn)
                .map_res("Error writing audit log")
        }}
    }

    pub async fn find_recent_by_user(user_uuid: &UserId, limit: i64, conn: &mut DbConn) -> Vec<Self> {
        db_run! { conn: {
            audit_logs::table
                .filter(audit_logs::user_uuid.eq(Some(user_uuid)))
                .order(audit_logs::created_at.desc())
                .limit(limit)
                .load::<Self>(conn)
                .expect("Error loading audit log")
        }}
    }

    /// Retention sweep, entries older than `days` are dropped.
    pub async fn purge_old(days: i64, pool: DbPool) -> EmptyResult {
        debug!("Purging old audit log entries");
        let Ok(mut conn) = pool.get().await else {
            err!(Internal, "Failed to get DB connection while purging audit logs")
        };

        let cutoff = Utc::now().naive_utc() - TimeDelta::days(days);
        db_run! { conn: {
            diesel::delete(audit_logs::table.filter(audit_logs::created_at.lt(cutoff)))
                .execute(conn)
                .map_res("Error purging audit logs")
        }}
    }
}
