use std::{
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use hickory_resolver::{net::runtime::TokioRuntimeProvider, TokioResolver};
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{
    dns::{Name, Resolve, Resolving},
    header, Client, ClientBuilder,
};
use url::Host;

use crate::{util::is_global, CONFIG};

/// Builds a request against the shared outbound client. The destination host
/// is validated before the request is created and again at every DNS answer
/// and redirect hop, keeping webhook and relay traffic out of internal
/// address space.
pub fn make_http_request(method: reqwest::Method, url: &str) -> Result<reqwest::RequestBuilder, crate::error::Error> {
    let Ok(url) = url::Url::parse(url) else {
        err!("Invalid URL");
    };
    let Some(host) = url.host() else {
        err!("Invalid host");
    };

    should_block_host(host)?;

    static INSTANCE: Lazy<Client> = Lazy::new(|| get_reqwest_client_builder().build().expect("Failed to build client"));

    Ok(INSTANCE.request(method, url))
}

pub fn get_reqwest_client_builder() -> ClientBuilder {
    let mut headers = header::HeaderMap::new();
    headers.insert(header::USER_AGENT, header::HeaderValue::from_static("UniAuth"));

    let redirect_policy = reqwest::redirect::Policy::custom(|attempt| {
        if attempt.previous().len() >= 5 {
            return attempt.error("Too many redirects");
        }

        let Some(host) = attempt.url().host() else {
            return attempt.error("Invalid host");
        };

        if let Err(e) = should_block_host(host) {
            return attempt.error(e);
        }

        attempt.follow()
    });

    Client::builder()
        .default_headers(headers)
        .redirect(redirect_policy)
        .dns_resolver(CustomDnsResolver::instance())
        .timeout(Duration::from_secs(10))
}

fn should_block_ip(ip: IpAddr) -> bool {
    CONFIG.http_request_block_non_global_ips() && !is_global(ip)
}

fn should_block_address(domain_or_ip: &str) -> bool {
    if let Ok(ip) = domain_or_ip.parse::<IpAddr>() {
        if should_block_ip(ip) {
            return true;
        }
    }

    static BLOCK_REGEX: Lazy<Option<Regex>> =
        Lazy::new(|| CONFIG.http_request_block_regex().map(|r| Regex::new(&r).expect("Invalid HTTP_REQUEST_BLOCK_REGEX")));

    BLOCK_REGEX.as_ref().is_some_and(|regex| regex.is_match(domain_or_ip))
}

fn should_block_host(host: Host<&str>) -> Result<(), BlockedHostError> {
    let (ip, host_str): (Option<IpAddr>, String) = match host {
        Host::Ipv4(ip) => (Some(ip.into()), ip.to_string()),
        Host::Ipv6(ip) => (Some(ip.into()), ip.to_string()),
        Host::Domain(d) => (None, d.to_string()),
    };

    if let Some(ip) = ip {
        if should_block_ip(ip) {
            return Err(BlockedHostError::NonGlobalIp {
                domain: None,
                ip,
            });
        }
    }

    if should_block_address(&host_str) {
        return Err(BlockedHostError::Blocked {
            domain: host_str,
        });
    }

    Ok(())
}

#[derive(Clone, Debug)]
pub enum BlockedHostError {
    Blocked { domain: String },
    NonGlobalIp { domain: Option<String>, ip: IpAddr },
}

impl fmt::Display for BlockedHostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Blocked {
                domain,
            } => write!(f, "Blocked domain: {domain} matched HTTP_REQUEST_BLOCK_REGEX"),
            Self::NonGlobalIp {
                domain: Some(domain),
                ip,
            } => write!(f, "IP {ip} for domain '{domain}' is not a global IP!"),
            Self::NonGlobalIp {
                domain: None,
                ip,
            } => write!(f, "IP {ip} is not a global IP!"),
        }
    }
}

impl std::error::Error for BlockedHostError {}

impl From<BlockedHostError> for crate::error::Error {
    fn from(e: BlockedHostError) -> Self {
        crate::error::Error::new(crate::error::ErrorKind::InvalidRequest, e.to_string())
    }
}

#[derive(Clone, Debug)]
enum CustomDnsResolver {
    Default(),
    Hickory(Arc<TokioResolver>),
}
type BoxError = Box<dyn std::error::Error + Send + Sync>;

impl CustomDnsResolver {
    fn instance() -> Arc<Self> {
        static INSTANCE: Lazy<Arc<CustomDnsResolver>> = Lazy::new(CustomDnsResolver::new);
        Arc::clone(&*INSTANCE)
    }

    fn new() -> Arc<Self> {
        match TokioResolver::builder(TokioRuntimeProvider::default()) {
            Ok(builder) => match builder.build() {
                Ok(resolver) => Arc::new(Self::Hickory(Arc::new(resolver))),
                Err(e) => {
                    warn!("Error creating Hickory resolver, falling back to default: {e:?}");
                    Arc::new(Self::Default())
                }
            },
            Err(e) => {
                warn!("Error creating Hickory resolver, falling back to default: {e:?}");
                Arc::new(Self::Default())
            }
        }
    }

    // Note that we get an iterator of addresses, but we only grab the first one for convenience
    async fn resolve_domain(&self, name: &str) -> Result<Option<SocketAddr>, BoxError> {
        if should_block_address(name) {
            return Err(Box::new(BlockedHostError::Blocked {
                domain: name.to_string(),
            }));
        }

        let result = match self {
            Self::Default() => tokio::net::lookup_host(name).await?.next(),
            Self::Hickory(r) => r.lookup_ip(name).await?.iter().next().map(|a| SocketAddr::new(a, 0)),
        };

        if let Some(addr) = &result {
            if should_block_ip(addr.ip()) {
                return Err(Box::new(BlockedHostError::NonGlobalIp {
                    domain: Some(name.to_string()),
                    ip: addr.ip(),
                }));
            }
        }

        Ok(result)
    }
}

impl Resolve for CustomDnsResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let this = self.clone();
        Box::pin(async move {
            let name = name.as_str();
            let result = this.resolve_domain(name).await?;
            Ok::<reqwest::dns::Addrs, _>(Box::new(result.into_iter()))
        })
    }
}
