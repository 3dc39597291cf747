#[macro_use]
extern crate rocket;
#[macro_use]
extern crate serde;
#[macro_use]
extern crate serde_json;
#[macro_use]
extern crate log;
#[macro_use]
extern crate diesel;
#[macro_use]
extern crate diesel_migrations;
#[macro_use]
extern crate diesel_derive_newtype;

use std::{fs, path::Path, process::exit, str::FromStr, thread, time::Duration};

#[cfg(feature = "enable_mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[macro_use]
mod error;
#[macro_use]
mod db;

mod api;
mod auth;
mod config;
mod crypto;
mod dispatch;
mod http_client;
mod ratelimit;
mod social;
mod util;
mod webhooks;

pub use config::CONFIG;
pub use error::Error;

pub const VERSION: Option<&str> = option_env!("UA_VERSION");

fn main() -> Result<(), Error> {
    parse_args();
    launch_info();

    let level = init_logging()?;

    check_data_folder();
    auth::load_keys();

    let extra_debug = matches!(level, log::LevelFilter::Trace | log::LevelFilter::Debug);
    rocket::async_main(launch_rocket(extra_debug)) // Blocks until program termination
}

const HELP: &str = "\
Alternative OAuth 2.0 / OpenID Connect identity provider

USAGE:
    uniauth [FLAGS]

FLAGS:
    -h, --help       Prints help information
    -v, --version    Prints the app version
";

pub fn short_version() -> String {
    match VERSION {
        Some(version) => version.to_string(),
        None => String::from("(Version info from Git not present)"),
    }
}

fn parse_args() {
    let mut pargs = pico_args::Arguments::from_env();

    if pargs.contains(["-h", "--help"]) {
        println!("uniauth {}", short_version());
        print!("{HELP}");
        exit(0);
    } else if pargs.contains(["-v", "--version"]) {
        println!("uniauth {}", short_version());
        exit(0);
    }
}

fn launch_info() {
    println!("/--------------------------------------------------------------------\\");
    println!("|                        Starting UniAuth                            |");
    println!("|{:^68}|", format!("Version {}", short_version()));
    println!("\\--------------------------------------------------------------------/\n");
}

fn init_logging() -> Result<log::LevelFilter, Error> {
    let level = log::LevelFilter::from_str(&CONFIG.log_level()).unwrap_or_else(|_| {
        eprintln!("Log level must be one of: trace, debug, info, warn, error, off");
        exit(1);
    });

    let mut logger = fern::Dispatch::new()
        .level(level)
        // Hide unknown certificate errors since they are idle connection probes
        .level_for("rustls::session", log::LevelFilter::Off)
        // Hide failed to close stream messages
        .level_for("hyper::server", log::LevelFilter::Warn)
        // Silence Rocket's own request/response lines, BetterLogging covers them
        .level_for("rocket::server", log::LevelFilter::Warn)
        .level_for("_", log::LevelFilter::Off)
        .level_for("rocket::launch", log::LevelFilter::Error)
        .level_for("rocket::rocket", log::LevelFilter::Warn)
        .level_for("hickory_resolver::name_server", log::LevelFilter::Warn)
        .level_for("hickory_proto::xfer", log::LevelFilter::Warn)
        .chain(std::io::stdout());

    let time_format = CONFIG.log_timestamp_format();
    logger = logger.format(move |out, message, record| {
        out.finish(format_args!(
            "[{}][{}][{}] {}",
            chrono::Local::now().format(&time_format),
            record.target(),
            record.level(),
            message
        ))
    });

    if let Some(log_file) = CONFIG.log_file() {
        logger = logger.chain(fern::log_file(log_file)?);
    }

    #[cfg(unix)]
    {
        if CONFIG.use_syslog() {
            logger = chain_syslog(logger);
        }
    }

    logger.apply()?;

    Ok(level)
}

#[cfg(unix)]
fn chain_syslog(logger: fern::Dispatch) -> fern::Dispatch {
    let syslog_fmt = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_USER,
        hostname: None,
        process: "uniauth".into(),
        pid: 0,
    };

    match syslog::unix(syslog_fmt) {
        Ok(sl) => logger.chain(sl),
        Err(e) => {
            error!("Unable to connect to syslog: {e:?}");
            logger
        }
    }
}

fn check_data_folder() {
    let data_folder = CONFIG.data_folder();
    let path = Path::new(&data_folder);
    if !path.exists() {
        if let Err(e) = fs::create_dir_all(path) {
            error!("Could not create data folder '{data_folder}': {e:?}");
            exit(1);
        }
    }
    if !path.is_dir() {
        error!("Data folder '{data_folder}' is not a directory");
        exit(1);
    }
}

async fn launch_rocket(extra_debug: bool) -> Result<(), Error> {
    let pool = util::retry_db(db::DbPool::from_config, CONFIG.database_max_conns()).await?;

    schedule_jobs(pool.clone());
    webhooks::start_delivery_worker(pool.clone());

    let basepath = &CONFIG.domain_path();

    let mut instance = rocket::build()
        .mount([basepath, "/"].concat(), api::health_routes())
        .mount([basepath, "/api/v1"].concat(), api::auth_routes())
        .mount([basepath, "/api/v1"].concat(), api::oauth2_routes())
        .mount([basepath, "/api/v1"].concat(), api::developer_routes())
        .mount([basepath, "/api/v1"].concat(), api::account_routes())
        .mount([basepath, "/.well-known"].concat(), api::well_known_routes())
        .manage(pool)
        .attach(util::AppHeaders())
        .attach(util::Cors())
        .attach(util::RequestId());

    if CONFIG.extended_logging() {
        instance = instance.attach(util::BetterLogging(extra_debug));
    }

    let instance = instance.ignite().await?;

    let shutdown = instance.shutdown();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.expect("Error setting Ctrl-C handler");
        info!("Exiting UniAuth!");
        shutdown.notify();
    });

    instance.launch().await?;

    info!("UniAuth process exited!");
    Ok(())
}

async fn purge_expired_credentials(pool: db::DbPool) {
    debug!("Purging expired credentials");
    let Ok(mut conn) = pool.get().await else {
        warn!("Failed to get DB connection while purging expired credentials");
        return;
    };
    db::models::VerificationCode::delete_expired(&mut conn).await.ok();
    db::models::AuthorizationCode::delete_expired(&mut conn).await.ok();
    db::models::RefreshToken::delete_expired(&mut conn).await.ok();
}

fn schedule_jobs(pool: db::DbPool) {
    let runtime = tokio::runtime::Runtime::new().unwrap();

    thread::Builder::new()
        .name("job-scheduler".to_string())
        .spawn(move || {
            use job_scheduler_ng::{Job, JobScheduler};

            let _runtime_guard = runtime.enter();
            let mut sched = JobScheduler::new();

            // Remove expired SSO sessions
            sched.add(Job::new("0 */5 * * * *".parse().unwrap(), || {
                runtime.spawn(db::models::SsoSession::purge_expired(pool.clone()));
            }));

            // Remove spent and expired credentials
            sched.add(Job::new("0 30 * * * *".parse().unwrap(), || {
                runtime.spawn(purge_expired_credentials(pool.clone()));
            }));

            // Nightly housekeeping
            sched.add(Job::new("0 10 0 * * *".parse().unwrap(), || {
                ratelimit::purge_stale_windows();
                runtime.spawn(db::models::AuditLog::purge_old(365, pool.clone()));
            }));

            loop {
                sched.tick();
                runtime.block_on(tokio::time::sleep(Duration::from_millis(30_000)));
            }
        })
        .expect("Error spawning job scheduler thread");
}
