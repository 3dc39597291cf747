mod application;
mod audit_log;
mod authorization_code;
mod oauth_account;
mod refresh_token;
mod scope;
mod sso_session;
mod user;
mod verification_code;
mod webhook;

pub use self::application::{AppType, Application, ClientId};
pub use self::audit_log::AuditLog;
pub use self::authorization_code::{AuthorizationCode, CodeBinding};
pub use self::oauth_account::OAuthAccount;
pub use self::refresh_token::RefreshToken;
pub use self::scope::{AppScope, Scope};
pub use self::sso_session::{SessionId, SsoSession};
pub use self::user::{User, UserId, UserStatus};
pub use self::verification_code::{CodeType, CodeVerification, VerificationCode};
pub use self::webhook::{DeliveryStatus, Webhook, WebhookDelivery, WebhookId};
