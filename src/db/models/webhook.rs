use chrono::{NaiveDateTime, TimeDelta, Utc};
use derive_more::{AsRef, Deref, Display, From};
use num_traits::FromPrimitive;

use crate::api::EmptyResult;
use crate::db::schema::{webhook_deliveries, webhooks};
use crate::db::DbConn;
use crate::error::MapResult;
use crate::{crypto, util, CONFIG};
use macros::UuidFromParam;

#[derive(
    Clone, Debug, Default, DieselNewType, FromForm, PartialEq, Eq, Hash, Serialize, Deserialize, AsRef, Deref, Display,
    From, UuidFromParam,
)]
#[deref(forward)]
#[from(forward)]
pub struct WebhookId(String);

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = webhooks)]
#[diesel(primary_key(uuid))]
pub struct Webhook {
    pub uuid: WebhookId,
    pub app_uuid: String,
    pub url: String,
    // Shared secret the payload HMAC is computed with
    pub secret: String,
    // JSON array of subscribed event names
    pub events: String,
    pub active: bool,
    pub created_at: NaiveDateTime,
}

/// Local methods
impl Webhook {
    pub fn new(app_uuid: String, url: String, events: Vec<String>) -> Self {
        Self {
            uuid: WebhookId(util::get_uuid()),
            app_uuid,
            url,
            secret: crypto::encode_random_bytes::<32>(data_encoding::BASE64URL_NOPAD),
            events: serde_json::to_string(&events).unwrap_or_else(|_| String::from("[]")),
            active: true,
            created_at: Utc::now().naive_utc(),
        }
    }

    pub fn events(&self) -> Vec<String> {
        serde_json::from_str(&self.events).unwrap_or_default()
    }

    pub fn subscribes_to(&self, event: &str) -> bool {
        self.events().iter().any(|e| e == event || e == "*")
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.uuid,
            "url": self.url,
            "events": self.events(),
            "active": self.active,
            "created_at": util::format_date(&self.created_at),
        })
    }
}

use diesel::prelude::*;

/// Database methods
impl Webhook {
    pub async fn save(&self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(webhooks::table)
                    .values(self)
                    .execute(conn)
                    .map_res("Error saving webhook")
            }
            postgresql {
                diesel::insert_into(webhooks::table)
                    .values(self)
                    .on_conflict(webhooks::uuid)
                    .do_update()
                    .set(self)
                    .execute(conn)
                    .map_res("Error saving webhook")
            }
        }
    }

    pub async fn delete(self, conn: &mut DbConn) -> EmptyResult {
        db_run! { conn: {
            conn.transaction::<_, diesel::result::Error, _>(|conn| {
                diesel::delete(webhook_deliveries::table.filter(webhook_deliveries::webhook_uuid.eq(&self.uuid)))
                    .execute(conn)?;
                diesel::delete(webhooks::table.filter(webhooks::uuid.eq(&self.uuid))).execute(conn)?;
                Ok(())
            })
            .map_res("Error deleting webhook")
        }}
    }

    pub async fn find_by_uuid(uuid: &WebhookId, conn: &mut DbConn) -> Option<Self> {
        db_run! { conn: {
            webhooks::table
                .filter(webhooks::uuid.eq(uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_uuid_and_app(uuid: &WebhookId, app_uuid: &str, conn: &mut DbConn) -> Option<Self> {
        db_run! { conn: {
            webhooks::table
                .filter(webhooks::uuid.eq(uuid))
                .filter(webhooks::app_uuid.eq(app_uuid))
                .first::<Self>(conn)
                .ok()
        }}
    }

    pub async fn find_by_app(app_uuid: &str, conn: &mut DbConn) -> Vec<Self> {
        db_run! { conn: {
            webhooks::table
                .filter(webhooks::app_uuid.eq(app_uuid))
                .load::<Self>(conn)
                .expect("Error loading webhooks")
        }}
    }

    pub async fn find_active_subscribed(event: &str, conn: &mut DbConn) -> Vec<Self> {
        let event = event.to_string();
        let hooks: Vec<Self> = db_run! { conn: {
            webhooks::table
                .filter(webhooks::active.eq(true))
                .load::<Self>(conn)
                .expect("Error loading webhooks")
        }};

        hooks.into_iter().filter(|h| h.subscribes_to(&event)).collect()
    }
}

#[derive(Identifiable, Queryable, Insertable, AsChangeset)]
#[diesel(table_name = webhook_deliveries)]
#[diesel(treat_none_as_null = true)]
#[diesel(primary_key(uuid))]
pub struct WebhookDelivery {
    pub uuid: String,
    pub webhook_uuid: WebhookId,
    pub event: String,
    // Payload snapshot; redeliveries always send the original body
    pub payload: String,
    pub status: i32,
    pub attempt_count: i32,
    pub next_retry_at: NaiveDateTime,
    pub response_code: Option<i32>,
    pub response_body: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum DeliveryStatus {
    Pending = 0,
    Retrying = 1,
    Success = 2,
    Failed = 3,
}

/// Local methods
impl WebhookDelivery {
    pub fn new(webhook_uuid: WebhookId, event: String, payload: String) -> Self {
        let now = Utc::now().naive_utc();

        Self {
            uuid: util::get_uuid(),
            webhook_uuid,
            event,
            payload,
            status: DeliveryStatus::Pending as i32,
            attempt_count: 0,
            next_retry_at: now,
            response_code: None,
            response_body: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> DeliveryStatus {
        DeliveryStatus::from_i32(self.status).unwrap_or(DeliveryStatus::Failed)
    }

    /// Delay before attempt `attempt` (1-based) is retried: 1, 2, 4, 8, 16 minutes.
    pub fn backoff(attempt: i32) -> TimeDelta {
        TimeDelta::minutes(1 << (attempt - 1).clamp(0, 4))
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "id": self.uuid,
            "event": self.event,
            "status": match self.status() {
                DeliveryStatus::Pending => "pending",
                DeliveryStatus::Retrying => "retrying",
                DeliveryStatus::Success => "success",
                DeliveryStatus::Failed => "failed",
            },
            "attempt_count": self.attempt_count,
            "next_retry_at": util::format_date(&self.next_retry_at),
            "response_code": self.response_code,
            "created_at": util::format_date(&self.created_at),
        })
    }
}

/// Database methods
impl WebhookDelivery {
    pub async fn save(&mut self, conn: &mut DbConn) -> EmptyResult {
        self.updated_at = Utc::now().naive_utc();

        db_run! { conn:
            sqlite, mysql {
                diesel::replace_into(webhook_deliveries::table)
                    .values(&*self)
                    .execute(conn)
                    .map_res("Error saving webhook delivery")
            }
            postgresql {
                diesel::insert_into(webhook_deliveries::table)
                    .values(&*self)
                    .on_conflict(webhook_deliveries::uuid)
                    .do_update()
                    .set(&*self)
                    .execute(conn)
                    .map_res("Error saving webhook delivery")
            }
        }
    }

    /// Claims up to `limit` due deliveries for exclusive processing by
    /// pushing their `next_retry_at` forward under an optimistic guard. A row
    /// whose guard misses was grabbed by another worker and is skipped, which
    /// gives SKIP LOCKED semantics on every backend.
    pub async fn claim_due(limit: usize, conn: &mut DbConn) -> Vec<Self> {
        let now = Utc::now().naive_utc();
        let lease_until = now + TimeDelta::minutes(2);

        let candidates: Vec<Self> = db_run! { conn: {
            webhook_deliveries::table
                .filter(webhook_deliveries::status.eq_any([DeliveryStatus::Pending as i32, DeliveryStatus::Retrying as i32]))
                .filter(webhook_deliveries::next_retry_at.le(now))
                .order(webhook_deliveries::next_retry_at.asc())
                .limit(limit as i64)
                .load::<WebhookDelivery>(conn)
                .unwrap_or_default()
        }};

        let mut claimed = Vec::with_capacity(candidates.len());
        for delivery in candidates {
            let uuid = delivery.uuid.clone();
            let guard = delivery.next_retry_at;
            let won: usize = db_run! { conn: {
                diesel::update(
                    webhook_deliveries::table
                        .filter(webhook_deliveries::uuid.eq(&uuid))
                        .filter(webhook_deliveries::next_retry_at.eq(guard)),
                )
                .set(webhook_deliveries::next_retry_at.eq(lease_until))
                .execute(conn)
                .unwrap_or(0)
            }};

            if won == 1 {
                claimed.push(delivery);
            }
        }
        claimed
    }

    /// Records a delivery outcome. Successful deliveries are terminal; failed
    /// attempts reschedule with exponential backoff until the attempt cap.
    pub async fn record_attempt(
        &mut self,
        response_code: Option<i32>,
        response_body: Option<String>,
        success: bool,
        conn: &mut DbConn,
    ) -> EmptyResult {
        self.attempt_count += 1;
        self.response_code = response_code;
        self.response_body = response_body.map(|b| b.chars().take(1000).collect());

        if success {
            self.status = DeliveryStatus::Success as i32;
        } else if self.attempt_count < CONFIG.webhook_max_attempts() {
            self.status = DeliveryStatus::Retrying as i32;
            self.next_retry_at = Utc::now().naive_utc() + Self::backoff(self.attempt_count);
        } else {
            self.status = DeliveryStatus::Failed as i32;
        }

        self.save(conn).await
    }

    pub async fn find_by_webhook(webhook_uuid: &WebhookId, limit: i64, conn: &mut DbConn) -> Vec<Self> {
        db_run! { conn: {
            webhook_deliveries::table
                .filter(webhook_deliveries::webhook_uuid.eq(webhook_uuid))
                .order(webhook_deliveries::created_at.desc())
                .limit(limit)
                .load::<Self>(conn)
                .expect("Error loading deliveries")
        }}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_schedule_is_monotonic_powers_of_two() {
        let minutes: Vec<i64> = (1..=5).map(|a| WebhookDelivery::backoff(a).num_minutes()).collect();
        assert_eq!(minutes, vec![1, 2, 4, 8, 16]);
        for w in minutes.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn subscription_matching() {
        let mut hook = Webhook::new("app".into(), "https://example.com/hook".into(), vec!["user.login".into()]);
        assert!(hook.subscribes_to("user.login"));
        assert!(!hook.subscribes_to("user.created"));

        hook.events = r#"["*"]"#.into();
        assert!(hook.subscribes_to("anything.at.all"));
    }

    #[test]
    fn new_delivery_is_due_immediately() {
        let d = WebhookDelivery::new(WebhookId::from("hook"), "user.login".into(), "{}".into());
        assert_eq!(d.status(), DeliveryStatus::Pending);
        assert_eq!(d.attempt_count, 0);
        assert!(d.next_retry_at <= Utc::now().naive_utc());
    }
}
