//
// Error generator macro
//
use std::error::Error as StdError;

macro_rules! make_error {
    ( $( $name:ident ( $ty:ty ): $show_cause:expr ),+ $(,)? ) => {
        #[derive(Debug)]
        pub enum ErrorSource {
            None,
            $($name( $ty )),+
        }

        $(impl From<$ty> for Error {
            fn from(err: $ty) -> Self {
                Error {
                    message: String::from("Internal error"),
                    kind: ErrorKind::Internal,
                    source: ErrorSource::$name(err),
                    oauth: false,
                    retry_after: None,
                }
            }
        })+

        impl ErrorSource {
            fn log_cause(&self) {
                match self {
                    ErrorSource::None => (),
                    $(ErrorSource::$name(e) => {
                        if $show_cause {
                            error!("[CAUSE] {:?}", e);
                        }
                    }),+
                }
            }
        }
    };
}

use diesel::result::Error as DieselError;
use diesel::ConnectionError as DieselConError;
use jsonwebtoken::errors::Error as JwtError;
use lettre::address::AddressError as AddrError;
use lettre::transport::smtp::Error as SmtpError;
use log::SetLoggerError as LogError;
use openssl::error::ErrorStack as SslErrorStack;
use reqwest::Error as ReqError;
use rocket::error::Error as RocketError;
use serde_json::Error as SerdeError;
use std::io::Error as IoError;
use std::time::SystemTimeError as TimeError;
use url::ParseError as UrlParseError;

// Each variant wraps a source error kept for logging; the bool controls
// whether the cause is written to the log when the error is rendered.
make_error! {
    Diesel(DieselError): true,
    DieselCon(DieselConError): true,
    Serde(SerdeError): true,
    Jwt(JwtError): true,
    Io(IoError): true,
    Time(TimeError): true,
    Reqwest(ReqError): true,
    Smtp(SmtpError): true,
    Address(AddrError): true,
    Ssl(SslErrorStack): true,
    UrlParse(UrlParseError): true,
    Rocket(RocketError): true,
    Log(LogError): true,
}

/// The failure classes of the service. Every kind carries a fixed HTTP status
/// and a stable application error code.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorKind {
    InvalidRequest,
    InvalidCredentials,
    InvalidToken,
    TokenExpired,
    RateLimited,
    DailyLimitExceeded,
    NotFound,
    Conflict,
    Forbidden,
    Suspended,
    UnsupportedGrant,
    InvalidScope,
    InvalidGrant,
    InvalidClient,
    RedirectUriMismatch,
    Internal,
}

impl ErrorKind {
    pub fn status(self) -> u16 {
        match self {
            Self::InvalidRequest
            | Self::UnsupportedGrant
            | Self::InvalidScope
            | Self::InvalidGrant
            | Self::RedirectUriMismatch => 400,
            Self::InvalidCredentials | Self::InvalidToken | Self::TokenExpired | Self::InvalidClient => 401,
            Self::Forbidden | Self::Suspended => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::RateLimited | Self::DailyLimitExceeded => 429,
            Self::Internal => 500,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidCredentials => "invalid_credentials",
            Self::InvalidToken => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::RateLimited => "rate_limited",
            Self::DailyLimitExceeded => "daily_limit_exceeded",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::Forbidden => "forbidden",
            Self::Suspended => "account_suspended",
            Self::UnsupportedGrant => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidGrant => "invalid_grant",
            Self::InvalidClient => "invalid_client",
            Self::RedirectUriMismatch => "redirect_uri_mismatch",
            Self::Internal => "internal_error",
        }
    }

    /// The RFC 6749 error code used when the kind surfaces on an OAuth endpoint.
    pub fn oauth_code(self) -> &'static str {
        match self {
            Self::UnsupportedGrant => "unsupported_grant_type",
            Self::InvalidScope => "invalid_scope",
            Self::InvalidGrant | Self::TokenExpired => "invalid_grant",
            Self::InvalidClient | Self::InvalidCredentials => "invalid_client",
            Self::Forbidden | Self::Suspended => "access_denied",
            Self::Internal => "server_error",
            _ => "invalid_request",
        }
    }
}

#[derive(Debug)]
pub struct Error {
    message: String,
    kind: ErrorKind,
    source: ErrorSource,
    // When set, the body uses the OAuth envelope {error, error_description}
    oauth: bool,
    retry_after: Option<u64>,
}

impl Error {
    pub fn new<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Error {
            message: message.into(),
            kind,
            source: ErrorSource::None,
            oauth: false,
            retry_after: None,
        }
    }

    pub fn oauth<M: Into<String>>(kind: ErrorKind, message: M) -> Self {
        Error {
            oauth: true,
            ..Error::new(kind, message)
        }
    }

    pub fn with_msg<M: Into<String>>(mut self, msg: M) -> Self {
        self.message = msg.into();
        self
    }

    pub fn with_kind(mut self, kind: ErrorKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    /// Re-shapes the error into the OAuth envelope, for shared paths that
    /// also serve the token endpoint.
    pub fn into_oauth(mut self) -> Self {
        self.oauth = true;
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.code(), self.message)
    }
}

impl StdError for Error {}

pub trait MapResult<S> {
    fn map_res(self, msg: &str) -> Result<S, Error>;
}

impl MapResult<()> for diesel::QueryResult<usize> {
    fn map_res(self, msg: &str) -> Result<(), Error> {
        self.map(|_| ()).map_err(|e| Error::from(e).with_msg(msg))
    }
}

impl MapResult<()> for diesel::QueryResult<()> {
    fn map_res(self, msg: &str) -> Result<(), Error> {
        self.map_err(|e| Error::from(e).with_msg(msg))
    }
}

impl<S> MapResult<S> for Option<S> {
    fn map_res(self, msg: &str) -> Result<S, Error> {
        self.ok_or_else(|| Error::new(ErrorKind::NotFound, msg))
    }
}

//
// Rocket responder impl
//
use rocket::http::{ContentType, Header, Status};
use rocket::request::Request;
use rocket::response::{self, Responder, Response};
use std::io::Cursor;

impl<'r> Responder<'r, 'static> for Error {
    fn respond_to(self, req: &Request<'_>) -> response::Result<'static> {
        let request_id = req.headers().get_one("X-Request-Id").unwrap_or("-");

        match self.kind {
            ErrorKind::Internal => error!("[{request_id}] {self}"),
            _ => debug!("[{request_id}] {self}"),
        }
        self.source.log_cause();

        // Never leak internal detail; the log has the full story.
        let message = if self.kind == ErrorKind::Internal {
            "An internal error occurred".to_string()
        } else {
            self.message
        };

        let body = if self.oauth {
            serde_json::json!({
                "error": self.kind.oauth_code(),
                "error_description": message,
            })
        } else {
            let mut error = serde_json::json!({
                "code": self.kind.code(),
                "message": message,
            });
            if let Some(secs) = self.retry_after {
                error["retry_after"] = serde_json::json!(secs);
            }
            serde_json::json!({
                "success": false,
                "error": error,
            })
        };
        let body = body.to_string();

        let mut builder = Response::build();
        builder
            .status(Status::new(self.kind.status()))
            .header(ContentType::JSON)
            .sized_body(Some(body.len()), Cursor::new(body));

        if let Some(secs) = self.retry_after {
            builder.header(Header::new("Retry-After", secs.to_string()));
        }

        builder.ok()
    }
}

///
/// Error return macros
///
#[macro_export]
macro_rules! err {
    ($msg:expr) => {{
        return Err($crate::error::Error::new($crate::error::ErrorKind::InvalidRequest, $msg));
    }};
    ($kind:ident, $msg:expr) => {{
        return Err($crate::error::Error::new($crate::error::ErrorKind::$kind, $msg));
    }};
}

#[macro_export]
macro_rules! err_oauth {
    ($kind:ident, $msg:expr) => {{
        return Err($crate::error::Error::oauth($crate::error::ErrorKind::$kind, $msg));
    }};
}

#[macro_export]
macro_rules! err_handler {
    ($expr:expr) => {{
        warn!("Unauthorized Error: {}", $expr);
        return ::rocket::request::Outcome::Error((rocket::http::Status::Unauthorized, $expr));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_map_to_expected_statuses() {
        assert_eq!(ErrorKind::InvalidRequest.status(), 400);
        assert_eq!(ErrorKind::InvalidCredentials.status(), 401);
        assert_eq!(ErrorKind::Suspended.status(), 403);
        assert_eq!(ErrorKind::NotFound.status(), 404);
        assert_eq!(ErrorKind::Conflict.status(), 409);
        assert_eq!(ErrorKind::RateLimited.status(), 429);
        assert_eq!(ErrorKind::Internal.status(), 500);
    }

    #[test]
    fn oauth_codes_collapse_to_rfc6749_values() {
        assert_eq!(ErrorKind::InvalidGrant.oauth_code(), "invalid_grant");
        assert_eq!(ErrorKind::TokenExpired.oauth_code(), "invalid_grant");
        assert_eq!(ErrorKind::UnsupportedGrant.oauth_code(), "unsupported_grant_type");
        assert_eq!(ErrorKind::InvalidClient.oauth_code(), "invalid_client");
        assert_eq!(ErrorKind::RedirectUriMismatch.oauth_code(), "invalid_request");
        assert_eq!(ErrorKind::Internal.oauth_code(), "server_error");
    }
}
