// Transport manager - one shared HTTP client, swapped when proxy settings change

use parking_lot::RwLock;
use reqwest::{Client, Method, RequestBuilder, Url};
use std::time::Duration;

use crate::config::ProxyConfig;
use crate::error::TransportError;

/// Effectively "no client-enforced timeout"; callers bound their own calls.
const DEFAULT_CLIENT_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ProxyKind {
    Http,
    Socks5,
}

impl ProxyKind {
    fn parse(raw: &str) -> Result<Self, TransportError> {
        match raw.trim().to_lowercase().as_str() {
            "" | "http" => Ok(ProxyKind::Http),
            "socks5" => Ok(ProxyKind::Socks5),
            other => Err(TransportError::UnsupportedProxyType(other.to_string())),
        }
    }

    fn schemes(&self) -> &'static [&'static str] {
        match self {
            ProxyKind::Http => &["http", "https"],
            ProxyKind::Socks5 => &["socks5", "socks5h"],
        }
    }
}

struct TransportState {
    config: ProxyConfig,
    client: Client,
}

/// Owns the process-wide HTTP client.
///
/// `reqwest::Client` is a handle over a shared connection pool, so handing out
/// clones is cheap and requests already in flight keep the transport they
/// started on after a swap.
pub struct TransportManager {
    state: RwLock<TransportState>,
}

impl TransportManager {
    pub fn new(config: &ProxyConfig) -> Result<Self, TransportError> {
        let client = build_client(config)?;
        Ok(Self {
            state: RwLock::new(TransportState {
                config: config.clone(),
                client,
            }),
        })
    }

    /// Rebuild and swap the client. Returns `false` when `config` equals the
    /// current settings and nothing was rebuilt. On error the previous client
    /// stays in place; there is no silent fallback to a direct connection.
    pub fn configure(&self, config: &ProxyConfig) -> Result<bool, TransportError> {
        if self.state.read().config == *config {
            return Ok(false);
        }

        let client = build_client(config)?;

        let mut state = self.state.write();
        state.config = config.clone();
        state.client = client;
        drop(state);

        if config.use_proxy {
            tracing::info!(
                "Transport rebuilt with {} proxy {}",
                config.proxy_type,
                config.proxy_address
            );
        } else {
            tracing::info!("Transport rebuilt with direct connection");
        }
        Ok(true)
    }

    pub fn client(&self) -> Client {
        self.state.read().client.clone()
    }

    /// A view of the current transport that applies `timeout` to every request.
    pub fn client_with_timeout(&self, timeout: Duration) -> TimedClient {
        TimedClient {
            client: self.client(),
            timeout,
        }
    }

    pub fn current_config(&self) -> ProxyConfig {
        self.state.read().config.clone()
    }
}

/// Shares the manager's connection pool; the timeout is applied per request.
#[derive(Clone)]
pub struct TimedClient {
    client: Client,
    timeout: Duration,
}

impl TimedClient {
    pub fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client.request(method, url).timeout(self.timeout)
    }

    pub fn post(&self, url: &str) -> RequestBuilder {
        self.request(Method::POST, url)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn build_client(config: &ProxyConfig) -> Result<Client, TransportError> {
    let mut builder = Client::builder()
        .timeout(DEFAULT_CLIENT_TIMEOUT)
        .connect_timeout(CONNECT_TIMEOUT);

    if let Some(proxy) = build_proxy(config)? {
        builder = builder.proxy(proxy);
    } else {
        builder = builder.no_proxy();
    }

    Ok(builder.build()?)
}

/// Validate the configured proxy and turn it into a `reqwest::Proxy`.
///
/// SOCKS5 dials run inside reqwest's async connector, so a request timeout or a
/// dropped request future aborts the handshake and discards a late connection.
fn build_proxy(config: &ProxyConfig) -> Result<Option<reqwest::Proxy>, TransportError> {
    if !config.use_proxy {
        return Ok(None);
    }

    let kind = ProxyKind::parse(&config.proxy_type)?;
    let url = normalize_proxy_url(&config.proxy_address, kind)?;
    let proxy = reqwest::Proxy::all(url.as_str())
        .map_err(|e| TransportError::InvalidProxyAddress(format!("{}: {}", config.proxy_address, e)))?;
    Ok(Some(proxy))
}

fn normalize_proxy_url(address: &str, kind: ProxyKind) -> Result<Url, TransportError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(TransportError::InvalidProxyAddress(
            "proxy enabled but address is empty".to_string(),
        ));
    }

    let candidate = if address.contains("://") {
        address.to_string()
    } else {
        format!("{}://{}", kind.schemes()[0], address)
    };

    let url = Url::parse(&candidate)
        .map_err(|e| TransportError::InvalidProxyAddress(format!("{}: {}", address, e)))?;

    if !kind.schemes().contains(&url.scheme()) {
        return Err(TransportError::InvalidProxyAddress(format!(
            "{}: scheme {} does not match proxy type",
            address,
            url.scheme()
        )));
    }
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(TransportError::InvalidProxyAddress(format!("{}: missing host", address)));
    }
    if url.port_or_known_default().is_none() {
        return Err(TransportError::InvalidProxyAddress(format!("{}: missing port", address)));
    }

    Ok(url)
}
