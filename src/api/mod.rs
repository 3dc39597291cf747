mod account;
mod auth;
mod developer;
mod oauth2;

pub use crate::api::{
    account::routes as account_routes,
    auth::routes as auth_routes,
    developer::routes as developer_routes,
    oauth2::routes as oauth2_routes,
    oauth2::well_known_routes,
};

// Type aliases for API methods results
pub type ApiResult<T> = Result<T, crate::error::Error>;
pub type JsonResult = ApiResult<rocket::serde::json::Json<serde_json::Value>>;
pub type EmptyResult = ApiResult<()>;

use rocket::serde::json::Json;
use serde_json::Value;

/// Liveness probe
#[get("/healthz")]
fn healthz() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

pub fn health_routes() -> Vec<rocket::Route> {
    routes![healthz]
}
