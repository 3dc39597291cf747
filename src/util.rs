//
// Web Headers and fairings
//
use std::io::Cursor;

use rocket::{
    fairing::{Fairing, Info, Kind},
    http::{ContentType, Header, HeaderMap, Method, Status},
    Data, Orbit, Request, Response, Rocket,
};

use crate::CONFIG;

pub struct AppHeaders();

#[rocket::async_trait]
impl Fairing for AppHeaders {
    fn info(&self) -> Info {
        Info {
            name: "Application Headers",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, _req: &'r Request<'_>, res: &mut Response<'r>) {
        res.set_raw_header("Referrer-Policy", "same-origin");
        res.set_raw_header("X-Frame-Options", "DENY");
        res.set_raw_header("X-Content-Type-Options", "nosniff");

        // Disable cache unless otherwise specified
        if !res.headers().contains("cache-control") {
            res.set_raw_header("Cache-Control", "no-cache, no-store, max-age=0");
        }
    }
}

pub struct Cors();

impl Cors {
    fn get_header(headers: &HeaderMap<'_>, name: &str) -> String {
        match headers.get_one(name) {
            Some(h) => h.to_string(),
            _ => String::new(),
        }
    }

    // Check a request's `Origin` header against the list of allowed origins.
    // If a match exists, return it. Otherwise, return None.
    fn get_allowed_origin(headers: &HeaderMap<'_>) -> Option<String> {
        let origin = Cors::get_header(headers, "Origin");
        if origin.is_empty() {
            return None;
        }
        if origin == CONFIG.domain_origin() || CONFIG.cors_allowed_origins().split(',').any(|o| o.trim() == origin) {
            Some(origin)
        } else {
            None
        }
    }
}

#[rocket::async_trait]
impl Fairing for Cors {
    fn info(&self) -> Info {
        Info {
            name: "Cors",
            kind: Kind::Response,
        }
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        let req_headers = request.headers();

        if let Some(origin) = Cors::get_allowed_origin(req_headers) {
            response.set_header(Header::new("Access-Control-Allow-Origin", origin));
            response.set_header(Header::new("Vary", "Origin"));
        }

        // Preflight request
        if request.method() == Method::Options {
            let req_allow_headers = Cors::get_header(req_headers, "Access-Control-Request-Headers");
            let req_allow_method = Cors::get_header(req_headers, "Access-Control-Request-Method");

            response.set_header(Header::new("Access-Control-Allow-Methods", req_allow_method));
            response.set_header(Header::new("Access-Control-Allow-Headers", req_allow_headers));
            response.set_header(Header::new("Access-Control-Allow-Credentials", "true"));
            response.set_header(Header::new("Access-Control-Max-Age", "600"));
            response.set_status(Status::Ok);
            response.set_header(ContentType::Plain);
            response.set_sized_body(Some(0), Cursor::new(""));
        }
    }
}

/// Ensures every request carries a request id and that the id is echoed on the
/// response, so error logs can be correlated with client reports.
pub struct RequestId();

#[rocket::async_trait]
impl Fairing for RequestId {
    fn info(&self) -> Info {
        Info {
            name: "Request Id",
            kind: Kind::Request | Kind::Response,
        }
    }

    async fn on_request(&self, req: &mut Request<'_>, _data: &mut Data<'_>) {
        if req.headers().get_one("X-Request-Id").is_none() {
            req.add_header(Header::new("X-Request-Id", get_uuid()));
        }
    }

    async fn on_response<'r>(&self, req: &'r Request<'_>, res: &mut Response<'r>) {
        if let Some(id) = req.headers().get_one("X-Request-Id") {
            res.set_raw_header("X-Request-Id", id.to_string());
        }
    }
}

// Log all the routes from the main paths list
// Effectively ignores any static file route, and the alive endpoint
const LOGGED_ROUTES: [&str; 3] = ["/api", "/.well-known", "/oauth2"];

// Boolean is extra debug, when true, we ignore the whitelist above and also print the mounts
pub struct BetterLogging(pub bool);

#[rocket::async_trait]
impl Fairing for BetterLogging {
    fn info(&self) -> Info {
        Info {
            name: "Better Logging",
            kind: Kind::Liftoff | Kind::Request | Kind::Response,
        }
    }

    async fn on_liftoff(&self, rocket: &Rocket<Orbit>) {
        if self.0 {
            info!(target: "routes", "Routes loaded:");
            let mut routes: Vec<_> = rocket.routes().collect();
            routes.sort_by_key(|r| r.uri.path());
            for route in routes {
                if route.rank < 0 {
                    info!(target: "routes", "{:<6} {}", route.method, route.uri);
                } else {
                    info!(target: "routes", "{:<6} {} [{}]", route.method, route.uri, route.rank);
                }
            }
        }

        let config = rocket.config();
        let scheme = if config.tls_enabled() {
            "https"
        } else {
            "http"
        };
        let addr = format!("{}://{}:{}", &scheme, &config.address, &config.port);
        info!(target: "start", "Rocket has launched from {addr}");
    }

    async fn on_request(&self, request: &mut Request<'_>, _data: &mut Data<'_>) {
        let method = request.method();
        if !self.0 && method == Method::Options {
            return;
        }
        let uri = request.uri();
        let uri_path = uri.path();
        let uri_subpath = uri_path.as_str().strip_prefix(&CONFIG.domain_path()).unwrap_or_else(|| uri_path.as_str());
        if self.0 || LOGGED_ROUTES.iter().any(|r| uri_subpath.starts_with(r)) {
            match uri.query() {
                Some(q) => {
                    let q = q.as_str();
                    info!(target: "request", "{} {}?{}", method, uri_path, &q[..q.len().min(30)]);
                }
                None => info!(target: "request", "{} {}", method, uri_path),
            };
        }
    }

    async fn on_response<'r>(&self, request: &'r Request<'_>, response: &mut Response<'r>) {
        if !self.0 && request.method() == Method::Options {
            return;
        }
        let uri_path = request.uri().path();
        let uri_subpath = uri_path.as_str().strip_prefix(&CONFIG.domain_path()).unwrap_or_else(|| uri_path.as_str());
        if self.0 || LOGGED_ROUTES.iter().any(|r| uri_subpath.starts_with(r)) {
            let status = response.status();
            if let Some(route) = request.route() {
                info!(target: "response", "{} => {}", route, status)
            } else {
                info!(target: "response", "{}", status)
            }
        }
    }
}

//
// File handling
//
use std::fs::{self, File};

pub fn write_file(path: &str, content: &[u8]) -> Result<(), crate::error::Error> {
    use std::io::Write;
    let mut f = File::create(path)?;
    f.write_all(content)?;
    f.flush()?;
    Ok(())
}

pub fn get_uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

//
// String util methods
//

use std::str::FromStr;

pub fn try_parse_string<S, T>(string: Option<S>) -> Option<T>
where
    S: AsRef<str>,
    T: FromStr,
{
    if let Some(Ok(value)) = string.map(|s| s.as_ref().parse::<T>()) {
        Some(value)
    } else {
        None
    }
}

//
// Env methods
//

use std::env;

pub fn get_env_str_value(key: &str) -> Option<String> {
    let key_file = format!("{key}_FILE");
    let value_from_env = env::var(key);
    let value_file = env::var(&key_file);

    match (value_from_env, value_file) {
        (Ok(_), Ok(_)) => panic!("You should not define both {key} and {key_file}!"),
        (Ok(v_env), Err(_)) => Some(v_env),
        (Err(_), Ok(v_file)) => match fs::read_to_string(v_file) {
            Ok(content) => Some(content.trim().to_string()),
            Err(e) => panic!("Failed to load {key}: {e:?}"),
        },
        _ => None,
    }
}

pub fn get_env<V>(key: &str) -> Option<V>
where
    V: FromStr,
{
    try_parse_string(get_env_str_value(key))
}

pub fn get_env_bool(key: &str) -> Option<bool> {
    const TRUE_VALUES: &[&str] = &["true", "t", "yes", "y", "1"];
    const FALSE_VALUES: &[&str] = &["false", "f", "no", "n", "0"];

    match get_env_str_value(key) {
        Some(val) if TRUE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(true),
        Some(val) if FALSE_VALUES.contains(&val.to_lowercase().as_ref()) => Some(false),
        _ => None,
    }
}

//
// Date util methods
//

use chrono::NaiveDateTime;

/// Formats a UTC `NaiveDateTime` the way API "date" fields are rendered.
pub fn format_date(dt: &NaiveDateTime) -> String {
    dt.format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string()
}

//
// Retry methods
//

/// Retries a closure until it returns `Ok` or the max attempts are reached.
/// Delay doubles on every attempt, starting at 100 ms. Only used for
/// idempotent statements; writes are never auto-retried.
pub fn retry<F, T, E>(mut func: F, max_tries: u32) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
{
    let mut tries = 0;

    loop {
        match func() {
            ok @ Ok(_) => return ok,
            err @ Err(_) => {
                tries += 1;

                if tries >= max_tries {
                    return err;
                }
                std::thread::sleep(std::time::Duration::from_millis(100 * u64::from(1u32 << (tries - 1))));
            }
        }
    }
}

pub async fn retry_db<F, T, E>(mut func: F, max_tries: u32) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    E: std::error::Error,
{
    let mut tries = 0;

    loop {
        match func() {
            ok @ Ok(_) => return ok,
            Err(e) => {
                tries += 1;

                if tries >= max_tries {
                    return Err(e);
                }
                warn!("Can't connect to database, retrying: {e:?}");
                tokio::time::sleep(std::time::Duration::from_millis(100 * u64::from(1u32 << (tries - 1)))).await;
            }
        }
    }
}

//
// IP address helpers
//

use std::net::IpAddr;

/// Stable-Rust approximation of `IpAddr::is_global`, used to keep outbound
/// requests (webhooks, SMS relay) away from internal address space.
pub fn is_global(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(ip) => {
            !(ip.is_private()
                || ip.is_loopback()
                || ip.is_link_local()
                || ip.is_broadcast()
                || ip.is_documentation()
                || ip.is_unspecified()
                // shared address space 100.64.0.0/10
                || (ip.octets()[0] == 100 && (ip.octets()[1] & 0b1100_0000 == 0b0100_0000))
                // benchmarking 198.18.0.0/15
                || (ip.octets()[0] == 198 && (ip.octets()[1] & 0xfe) == 18)
                // reserved 240.0.0.0/4
                || (ip.octets()[0] & 0xf0 == 240))
        }
        IpAddr::V6(ip) => {
            if let Some(v4) = ip.to_ipv4_mapped() {
                return is_global(IpAddr::V4(v4));
            }
            !(ip.is_loopback()
                || ip.is_unspecified()
                // unique local fc00::/7
                || (ip.segments()[0] & 0xfe00) == 0xfc00
                // link local fe80::/10
                || (ip.segments()[0] & 0xffc0) == 0xfe80
                // documentation 2001:db8::/32
                || (ip.segments()[0] == 0x2001 && ip.segments()[1] == 0xdb8))
        }
    }
}

/// Parses and normalizes an E.164 phone number. Accepts an optional leading
/// `+` and 8 to 15 digits, the first being non-zero.
pub fn normalize_phone(phone: &str) -> Option<String> {
    use once_cell::sync::Lazy;
    use regex::Regex;

    static E164: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\+?[1-9][0-9]{7,14}$").unwrap());

    let trimmed: String = phone.chars().filter(|c| !c.is_whitespace() && *c != '-').collect();
    if E164.is_match(&trimmed) {
        if trimmed.starts_with('+') {
            Some(trimmed)
        } else {
            Some(format!("+{trimmed}"))
        }
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_phone_accepts_e164() {
        assert_eq!(normalize_phone("+8613800138000").as_deref(), Some("+8613800138000"));
        assert_eq!(normalize_phone("8613800138000").as_deref(), Some("+8613800138000"));
        assert_eq!(normalize_phone("+49 151 1234567").as_deref(), Some("+491511234567"));
    }

    #[test]
    fn normalize_phone_rejects_garbage() {
        assert!(normalize_phone("").is_none());
        assert!(normalize_phone("+0123456789").is_none());
        assert!(normalize_phone("not-a-phone").is_none());
        assert!(normalize_phone("+1234").is_none());
    }

    #[test]
    fn is_global_blocks_internal_space() {
        assert!(!is_global("127.0.0.1".parse().unwrap()));
        assert!(!is_global("10.1.2.3".parse().unwrap()));
        assert!(!is_global("192.168.1.1".parse().unwrap()));
        assert!(!is_global("169.254.0.1".parse().unwrap()));
        assert!(!is_global("100.64.0.1".parse().unwrap()));
        assert!(!is_global("::1".parse().unwrap()));
        assert!(!is_global("fc00::1".parse().unwrap()));
        assert!(is_global("93.184.216.34".parse().unwrap()));
        assert!(is_global("2606:2800:220:1::1".parse().unwrap()));
    }
}
