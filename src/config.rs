use std::process::exit;

use once_cell::sync::Lazy;
use reqwest::Url;

use crate::{
    db::DbConnType,
    error::Error,
    util::{get_env, get_env_bool},
};

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    Config::load().unwrap_or_else(|e| {
        println!("Error loading config:\n  {e:?}\n");
        exit(12)
    })
});

pub type Pass = String;

macro_rules! make_config {
    ($(
        $(#[doc = $groupdoc:literal])?
        $group:ident {
        $(
            $(#[doc = $doc:literal])+
            $name:ident : $ty:ident, $none_action:ident $(, $default:expr)?;
        )+},
    )+) => {
        pub struct Config {
            config: ConfigItems,
        }

        #[derive(Clone, Default, Deserialize, Serialize)]
        pub struct ConfigBuilder {
            $($(
                #[serde(skip_serializing_if = "Option::is_none")]
                $name: Option<$ty>,
            )+)+
        }

        impl ConfigBuilder {
            fn from_env() -> Self {
                let env_file = crate::util::get_env_str_value("ENV_FILE").unwrap_or_else(|| String::from(".env"));
                match dotenvy::from_path(&env_file) {
                    Ok(_) => {
                        println!("[INFO] Using environment file `{env_file}` for configuration.\n");
                    },
                    Err(e) => match e {
                        dotenvy::Error::LineParse(msg, pos) => {
                            println!("[ERROR] Failed parsing environment file: `{env_file}`\nNear {msg:?} on position {pos}\nPlease fix and restart!\n");
                            exit(255);
                        },
                        dotenvy::Error::Io(ioerr) => match ioerr.kind() {
                            std::io::ErrorKind::NotFound => {
                                // Only exit if this environment variable is set, but the file was not found.
                                // This prevents incorrectly configured environments.
                                if let Some(env_file) = get_env::<String>("ENV_FILE") {
                                    println!("[ERROR] The configured ENV_FILE `{env_file}` was not found!\n");
                                    exit(255);
                                }
                            },
                            _ => {
                                println!("[ERROR] Reading environment file `{env_file}` failed:\n{ioerr:?}\n");
                                exit(255);
                            }
                        },
                        _ => {
                            println!("[ERROR] Reading environment file `{env_file}` failed:\n{e:?}\n");
                            exit(255);
                        }
                    }
                };

                let mut builder = ConfigBuilder::default();
                $($(
                    builder.$name = make_config! { @getenv pastey::paste!(stringify!([<$name:upper>])), $ty };
                )+)+

                builder
            }

            fn build(&self) -> ConfigItems {
                let mut config = ConfigItems::default();
                let _domain_set = self.domain.is_some();
                $($(
                    config.$name = make_config!{ @build self.$name.clone(), &config, $none_action, $($default)? };
                )+)+
                config.domain_set = _domain_set;

                config.domain = config.domain.trim_end_matches('/').to_string();

                config
            }
        }

        #[derive(Clone, Default)]
        struct ConfigItems {
            $($( $name: make_config!{@type $ty, $none_action}, )+)+
            domain_set: bool,
        }

        #[allow(unused)]
        impl Config {
            $($(
                $(#[doc = $doc])+
                pub fn $name(&self) -> make_config!{@type $ty, $none_action} {
                    self.config.$name.clone()
                }
            )+)+

            pub fn domain_set(&self) -> bool {
                self.config.domain_set
            }
        }
    };

    // Wrap the optionals in an Option type
    ( @type $ty:ty, option) => { Option<$ty> };
    ( @type $ty:ty, $id:ident) => { $ty };

    // Generate the values depending on none_action
    ( @build $value:expr, $config:expr, option, ) => { $value };
    ( @build $value:expr, $config:expr, def, $default:expr ) => { $value.unwrap_or($default) };
    ( @build $value:expr, $config:expr, auto, $default_fn:expr ) => {{
        let f: &dyn Fn(&ConfigItems) -> _ = &$default_fn;
        match $value {
            Some(v) => v,
            None => f($config)
        }
    }};

    ( @getenv $name:expr, bool ) => { get_env_bool($name) };
    ( @getenv $name:expr, $ty:ident ) => { get_env($name) };
}

fn extract_url_origin(url: &str) -> String {
    match Url::parse(url) {
        Ok(u) => u.origin().ascii_serialization(),
        Err(e) => {
            println!("Error validating domain: {e}");
            String::new()
        }
    }
}

fn extract_url_path(url: &str) -> String {
    match Url::parse(url) {
        // Empty for a root domain so mount paths concatenate cleanly
        Ok(u) => u.path().trim_end_matches('/').to_string(),
        Err(_) => {
            // Url::parse() prints the error, no need to do it again
            String::new()
        }
    }
}

make_config! {
    main {
        /// Data folder |> Main data folder
        data_folder:            String, def,    String::from("data");
        /// Domain URL |> This needs to be set to the URL used to access the server, including 'http[s]://' and port
        domain:                 String, def,    String::from("http://localhost");
        /// Domain origin |> Domain URL origin (in https://example.com:8443/path, https://example.com:8443 is the origin)
        domain_origin:          String, auto,   |c| extract_url_origin(&c.domain);
        /// Domain path |> Domain URL path (in https://example.com:8443/path, /path is the path)
        domain_path:            String, auto,   |c| extract_url_path(&c.domain);
        /// Login page URL |> Where unauthenticated authorize requests are redirected. The login UI
        /// re-invokes the OAuth flow with the propagated query string after authentication.
        login_page:             String, auto,   |c| format!("{}/login", c.domain);
        /// Allowed CORS origins |> Comma separated list of origins allowed to call the API from a browser
        cors_allowed_origins:   String, def,    String::new();
    },

    database {
        /// Database URL
        database_url:           String, auto,   |c| format!("{}/{}", c.data_folder, "uniauth.sqlite3");
        /// Database connection pool size
        database_max_conns:     u32,    def,    10;
        /// Database connection min idle
        database_min_conns:     u32,    def,    2;
        /// Database timeout |> Timeout (seconds) when acquiring a connection from the pool
        database_timeout:       u64,    def,    30;
        /// Database idle timeout |> Timeout (seconds) before idle connections are closed
        database_idle_timeout:  u64,    def,    600;
        /// Database connection init |> SQL statements to run on every new connection
        database_conn_init:     String, def,    String::new();
    },

    tokens {
        /// Signing key folder |> Folder holding the rotating RS256 key pairs, `<kid>.pem` each
        signing_key_folder:     String, auto,   |c| format!("{}/keys", c.data_folder);
        /// Issuer |> `iss` claim of every signed token, defaults to the domain
        issuer:                 String, auto,   |c| c.domain.clone();
        /// Access token validity in seconds
        access_token_validity:  i64,    def,    3600;
        /// ID token validity in seconds
        id_token_validity:      i64,    def,    3600;
        /// MFA step-up token validity in seconds
        mfa_token_validity:     i64,    def,    300;
        /// Refresh token validity in days
        refresh_token_validity_days: i64, def,  30;
        /// Authorization code validity in seconds
        auth_code_validity:     i64,    def,    600;
    },

    codes {
        /// Verification code length
        code_length:            u32,    def,    6;
        /// Verification code validity in seconds
        code_validity:          i64,    def,    300;
        /// Verification attempts |> Failed attempts after which a code is burned
        code_attempts_limit:    i32,    def,    5;
        /// Send cooldown |> Minimum seconds between two codes to the same phone number or email address
        code_cooldown:          u64,    def,    60;
        /// Daily quota |> Codes per target per UTC day
        code_daily_limit:       u32,    def,    10;
        /// IP ratelimit window in seconds
        ip_ratelimit_seconds:   u64,    def,    60;
        /// IP ratelimit burst |> Requests allowed from one IP inside the window
        ip_ratelimit_max_burst: u32,    def,    10;
    },

    sessions {
        /// SSO cookie name
        sso_cookie_name:        String, def,    String::from("uniauth_sso_session");
        /// Session validity in hours
        session_validity_hours: i64,    def,    24;
        /// Remembered session validity in days
        session_remember_days:  i64,    def,    30;
    },

    webhooks {
        /// Webhook delivery timeout in seconds
        webhook_timeout:        u64,    def,    5;
        /// Webhook max attempts |> Attempts after which a delivery is marked failed
        webhook_max_attempts:   i32,    def,    5;
    },

    outbound {
        /// Block non-global IPs |> Refuse outbound requests (webhooks, SMS relay) that resolve to private address space
        http_request_block_non_global_ips: bool, def, true;
        /// Block regex |> Regex of hosts outbound requests may never target
        http_request_block_regex: String, option;
    },

    smtp {
        /// SMTP host |> When unset, issued email codes are only written to the log
        smtp_host:              String, option;
        /// SMTP port
        smtp_port:              u16,    def,    587;
        /// SMTP security |> "starttls", "force_tls" or "off"
        smtp_security:          String, def,    String::from("starttls");
        /// SMTP username
        smtp_username:          String, option;
        /// SMTP password
        smtp_password:          Pass,   option;
        /// SMTP from address
        smtp_from:              String, def,    String::new();
        /// SMTP from name
        smtp_from_name:         String, def,    String::from("UniAuth");
        /// SMTP connection timeout in seconds
        smtp_timeout:           u64,    def,    15;
    },

    sms {
        /// SMS relay URL |> External dispatcher the core hands phone codes to. When unset, codes are only written to the log
        sms_relay_uri:          String, option;
        /// SMS relay token
        sms_relay_token:        Pass,   option;
    },

    social {
        /// Social providers |> JSON map of provider name to {issuer, client_id, client_secret, scopes}
        social_providers:       String, def,    String::from("{}");
    },

    log {
        /// Log level
        log_level:              String, def,    String::from("info");
        /// Log file path
        log_file:               String, option;
        /// Enable syslog
        use_syslog:             bool,   def,    false;
        /// Log timestamp format
        log_timestamp_format:   String, def,    String::from("%Y-%m-%d %H:%M:%S.%3f");
        /// Extended logging |> Log requests and responses of the API surfaces
        extended_logging:       bool,   def,    true;
    },
}

/// A social login provider as configured in the `SOCIAL_PROVIDERS` JSON map.
#[derive(Clone, Debug, Deserialize)]
pub struct SocialProvider {
    pub issuer: String,
    pub client_id: String,
    pub client_secret: String,
    #[serde(default = "default_social_scopes")]
    pub scopes: Vec<String>,
}

fn default_social_scopes() -> Vec<String> {
    vec![String::from("openid"), String::from("email"), String::from("profile")]
}

fn validate_config(cfg: &ConfigItems) -> Result<(), Error> {
    let domain = cfg.domain.to_lowercase();
    if !domain.starts_with("http") || domain.contains(' ') {
        err!("DOMAIN variable needs to contain the protocol (http, https). Use 'http[s]://uniauth.example.com' instead of 'uniauth.example.com'");
    }

    Url::parse(&cfg.domain)?;
    if Url::parse(&cfg.login_page).is_err() {
        err!("LOGIN_PAGE is not a valid URL");
    }

    DbConnType::from_url(&cfg.database_url)?;

    if cfg.smtp_host.is_some() && cfg.smtp_from.is_empty() {
        err!("SMTP_FROM is mandatory when SMTP_HOST is set");
    }
    if cfg.smtp_host.is_some() && !cfg.smtp_from.is_empty() && !cfg.smtp_from.contains('@') {
        err!("SMTP_FROM does not contain a mandatory @ sign");
    }
    if cfg.smtp_username.is_some() && cfg.smtp_password.is_none() {
        err!("SMTP_PASSWORD is mandatory when SMTP_USERNAME is set");
    }

    if serde_json::from_str::<std::collections::HashMap<String, SocialProvider>>(&cfg.social_providers).is_err() {
        err!("SOCIAL_PROVIDERS is not a valid JSON provider map");
    }

    if let Some(ref regex) = cfg.http_request_block_regex {
        if regex::Regex::new(regex).is_err() {
            err!("HTTP_REQUEST_BLOCK_REGEX is not a valid regular expression");
        }
    }

    if cfg.code_length < 4 || cfg.code_length > 10 {
        err!("CODE_LENGTH needs to be between 4 and 10");
    }

    Ok(())
}

impl Config {
    pub fn load() -> Result<Self, Error> {
        // Loading from env
        let builder = ConfigBuilder::from_env();
        let config = builder.build();
        validate_config(&config)?;

        Ok(Config {
            config,
        })
    }

    pub fn social_provider(&self, name: &str) -> Option<SocialProvider> {
        let providers: std::collections::HashMap<String, SocialProvider> =
            serde_json::from_str(&self.config.social_providers).ok()?;
        providers.get(name).cloned()
    }

    pub fn smtp_enabled(&self) -> bool {
        self.config.smtp_host.is_some()
    }

    /// True when the SSO cookie should carry the `Secure` flag.
    pub fn cookie_secure(&self) -> bool {
        self.config.domain.starts_with("https://")
    }
}
