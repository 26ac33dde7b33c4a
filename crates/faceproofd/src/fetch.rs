//! Image input resolution: inline payloads are decoded in place, URLs are
//! downloaded under an SSRF host policy with a byte cap and timeout.
//!
//! The returned bytes still go through `faceproof_core::loader::decode_bytes`.

use faceproof_core::loader::{decode_inline, ImageSource, LoadError, MAX_IMAGE_BYTES, MAX_URL_LEN};
use reqwest::dns::{Addrs, Name, Resolve, Resolving};
use reqwest::redirect::{Attempt, Policy};
use reqwest::Url;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct FetchPolicy {
    pub timeout: Duration,
    pub max_bytes: usize,
    pub max_redirects: usize,
    /// Skip the loopback/private host checks. Development only.
    pub allow_private_hosts: bool,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_bytes: MAX_IMAGE_BYTES,
            max_redirects: 3,
            allow_private_hosts: false,
        }
    }
}

/// Resolves image input strings to encoded bytes.
#[derive(Clone)]
pub struct ImageFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
}

impl ImageFetcher {
    pub fn new(policy: FetchPolicy) -> Result<Self, LoadError> {
        let redirect_policy = {
            let max = policy.max_redirects;
            let allow_private = policy.allow_private_hosts;
            Policy::custom(move |attempt: Attempt| {
                if attempt.previous().len() >= max {
                    attempt.error("too many redirects")
                } else if let Err(err) = check_url(attempt.url(), allow_private) {
                    attempt.error(err.to_string())
                } else {
                    attempt.follow()
                }
            })
        };

        let mut builder = reqwest::Client::builder()
            .timeout(policy.timeout)
            .redirect(redirect_policy)
            .user_agent(concat!("faceproofd/", env!("CARGO_PKG_VERSION")));
        if !policy.allow_private_hosts {
            builder = builder.dns_resolver(Arc::new(PublicOnlyResolver));
        }
        let client = builder
            .build()
            .map_err(|e| LoadError::Network(format!("http client: {e}")))?;

        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Encoded image bytes for a URL or inline payload.
    pub async fn fetch(&self, input: &str) -> Result<Vec<u8>, LoadError> {
        match ImageSource::classify(input)? {
            ImageSource::Inline(payload) => decode_inline(payload),
            ImageSource::Url(url) => self.download(url).await,
        }
    }

    async fn download(&self, raw: &str) -> Result<Vec<u8>, LoadError> {
        if raw.len() > MAX_URL_LEN {
            return Err(LoadError::UrlTooLong(raw.len()));
        }
        let url = Url::parse(raw).map_err(|e| LoadError::InvalidUrl(e.to_string()))?;
        check_url(&url, self.policy.allow_private_hosts)?;

        let mut response = self.client.get(url.clone()).send().await.map_err(map_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(LoadError::HttpStatus(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.trim().to_ascii_lowercase().starts_with("image/") {
            return Err(LoadError::NotAnImage(content_type));
        }

        let limit = self.policy.max_bytes;
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(LoadError::TooLarge { limit });
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(map_reqwest)? {
            if body.len() + chunk.len() > limit {
                return Err(LoadError::TooLarge { limit });
            }
            body.extend_from_slice(&chunk);
        }

        tracing::debug!(
            host = url.host_str().unwrap_or_default(),
            bytes = body.len(),
            content_type = %content_type,
            "image downloaded"
        );
        Ok(body)
    }
}

fn map_reqwest(err: reqwest::Error) -> LoadError {
    if let Some(host) = resolver_block(&err) {
        LoadError::BlockedHost(host)
    } else if err.is_timeout() {
        LoadError::DownloadTimeout
    } else if err.is_redirect() {
        LoadError::BlockedHost(err.to_string())
    } else {
        LoadError::Network(err.to_string())
    }
}

/// Host named by a `BlockedHost` raised inside the resolver, if any.
fn resolver_block(err: &reqwest::Error) -> Option<String> {
    let mut source = std::error::Error::source(err);
    while let Some(inner) = source {
        if let Some(LoadError::BlockedHost(host)) = inner.downcast_ref::<LoadError>() {
            return Some(host.clone());
        }
        source = inner.source();
    }
    None
}

/// DNS resolution that refuses names pointing into private ranges, so a
/// public-looking hostname (or redirect target) cannot reach internal hosts.
struct PublicOnlyResolver;

impl Resolve for PublicOnlyResolver {
    fn resolve(&self, name: Name) -> Resolving {
        let host = name.as_str().to_string();
        Box::pin(async move {
            let addrs = resolve_public(&host).await?;
            let addrs: Addrs = Box::new(addrs.into_iter());
            Ok::<_, Box<dyn std::error::Error + Send + Sync>>(addrs)
        })
    }
}

/// Resolve `host`, failing if any address is loopback, private or link local.
pub async fn resolve_public(host: &str) -> Result<Vec<SocketAddr>, LoadError> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| LoadError::Network(format!("resolving {host}: {e}")))?
        .collect();
    if addrs.is_empty() {
        return Err(LoadError::Network(format!("{host} has no addresses")));
    }
    if let Some(addr) = addrs.iter().find(|a| is_private_ip(a.ip())) {
        tracing::warn!(host, ip = %addr.ip(), "host resolves to a private address");
        return Err(LoadError::BlockedHost(host.to_string()));
    }
    Ok(addrs)
}

/// Scheme and host policy for a download target.
pub fn check_url(url: &Url, allow_private: bool) -> Result<(), LoadError> {
    match url.scheme() {
        "http" | "https" => {}
        other => return Err(LoadError::UnsupportedScheme(other.to_string())),
    }
    let host = url
        .host_str()
        .ok_or_else(|| LoadError::InvalidUrl("missing host".into()))?;
    if allow_private {
        return Ok(());
    }

    let bare = host.trim_start_matches('[').trim_end_matches(']');
    let blocked = match bare.parse::<IpAddr>() {
        Ok(ip) => is_private_ip(ip),
        Err(_) => {
            let name = bare.trim_end_matches('.').to_ascii_lowercase();
            name == "localhost" || name.ends_with(".localhost") || name == "localhost.localdomain"
        }
    };
    if blocked {
        return Err(LoadError::BlockedHost(host.to_string()));
    }
    Ok(())
}

fn is_private_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => is_private_v4(v4),
        IpAddr::V6(v6) => {
            if let Some(mapped) = v6.to_ipv4_mapped() {
                return is_private_v4(mapped);
            }
            is_private_v6(v6)
        }
    }
}

fn is_private_v4(ip: Ipv4Addr) -> bool {
    let [a, b, ..] = ip.octets();
    ip.is_loopback()
        || ip.is_private()
        || ip.is_link_local()
        || ip.is_unspecified()
        || ip.is_broadcast()
        // Carrier-grade NAT 100.64.0.0/10
        || (a == 100 && (64..128).contains(&b))
}

fn is_private_v6(ip: Ipv6Addr) -> bool {
    let first = ip.segments()[0];
    ip.is_loopback()
        || ip.is_unspecified()
        // Unique local fc00::/7
        || (first & 0xfe00) == 0xfc00
        // Link local fe80::/10
        || (first & 0xffc0) == 0xfe80
}
