//
// Lifecycle event fan-out and the at-least-once delivery worker.
//
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;

use crate::{
    crypto,
    db::{
        models::{Webhook, WebhookDelivery},
        DbConn, DbPool,
    },
    http_client::make_http_request,
    CONFIG,
};

// Event names producers emit
pub const EVENT_USER_CREATED: &str = "user.created";
pub const EVENT_USER_LOGIN: &str = "user.login";
pub const EVENT_USER_DELETED: &str = "user.deleted";
pub const EVENT_TOKEN_REVOKED: &str = "token.revoked";
pub const EVENT_WEBHOOK_TEST: &str = "webhook.test";

const BATCH_SIZE: usize = 10;

/// Inserts one pending delivery per subscribed active webhook. Enqueue
/// failures are logged and swallowed; a lifecycle event must never fail the
/// request that produced it.
pub async fn enqueue_event(event: &str, data: Value, conn: &mut DbConn) {
    let hooks = Webhook::find_active_subscribed(event, conn).await;

    for hook in hooks {
        let mut delivery = WebhookDelivery::new(hook.uuid.clone(), event.to_string(), String::new());
        delivery.payload = json!({
            "event": event,
            "delivery_id": delivery.uuid,
            "data": data,
            "timestamp": Utc::now().timestamp(),
        })
        .to_string();

        if let Err(e) = delivery.save(conn).await {
            error!("Failed to enqueue {event} delivery for webhook {}: {e:#?}", hook.uuid);
        }
    }
}

/// Enqueues a single delivery for one specific webhook, used by the
/// developer console's test button.
pub async fn enqueue_test_event(hook: &Webhook, conn: &mut DbConn) -> crate::api::EmptyResult {
    let mut delivery = WebhookDelivery::new(hook.uuid.clone(), EVENT_WEBHOOK_TEST.to_string(), String::new());
    delivery.payload = json!({
        "event": EVENT_WEBHOOK_TEST,
        "delivery_id": delivery.uuid,
        "data": { "webhook_id": hook.uuid },
        "timestamp": Utc::now().timestamp(),
    })
    .to_string();

    delivery.save(conn).await
}

/// Runs the delivery loop until shutdown. The loop is self pacing: a full
/// batch re-selects immediately, an empty or partial one yields.
pub fn start_delivery_worker(pool: DbPool) {
    tokio::spawn(async move {
        loop {
            let processed = process_due_batch(&pool).await;
            if processed < BATCH_SIZE {
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    });
}

async fn process_due_batch(pool: &DbPool) -> usize {
    let Ok(mut conn) = pool.get().await else {
        warn!("Webhook worker could not get a DB connection");
        return 0;
    };

    let batch = WebhookDelivery::claim_due(BATCH_SIZE, &mut conn).await;
    let count = batch.len();

    for mut delivery in batch {
        deliver(&mut delivery, &mut conn).await;
    }
    count
}

async fn deliver(delivery: &mut WebhookDelivery, conn: &mut DbConn) {
    let Some(webhook) = Webhook::find_by_uuid(&delivery.webhook_uuid, conn).await else {
        warn!("Dropping delivery {} for vanished webhook", delivery.uuid);
        let _ = delivery.record_attempt(None, Some("webhook deleted".into()), false, conn).await;
        return;
    };

    if !webhook.active {
        let _ = delivery.record_attempt(None, Some("webhook inactive".into()), false, conn).await;
        return;
    }

    // The signature covers the exact bytes on the wire
    let signature = crypto::hmac_sha256_hex(webhook.secret.as_bytes(), delivery.payload.as_bytes());

    let request = match make_http_request(reqwest::Method::POST, &webhook.url) {
        Ok(r) => r
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .header("X-UniAuth-Event", &delivery.event)
            .header("X-UniAuth-Delivery", &delivery.uuid)
            .header("X-UniAuth-Signature", format!("sha256={signature}"))
            .timeout(Duration::from_secs(CONFIG.webhook_timeout()))
            .body(delivery.payload.clone()),
        Err(e) => {
            let _ = delivery.record_attempt(None, Some(e.to_string()), false, conn).await;
            return;
        }
    };

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let success = status.is_success();

            if !success {
                debug!("Webhook {} answered {} for delivery {}", webhook.uuid, status, delivery.uuid);
            }
            let _ = delivery.record_attempt(Some(i32::from(status.as_u16())), Some(body), success, conn).await;
        }
        Err(e) => {
            debug!("Webhook {} unreachable for delivery {}: {e}", webhook.uuid, delivery.uuid);
            let _ = delivery.record_attempt(None, Some(e.to_string()), false, conn).await;
        }
    }
}
