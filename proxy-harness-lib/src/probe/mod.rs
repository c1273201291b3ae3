//! Single-shot protocol probes against the proxy
//!
//! Probes never retry and never follow redirects: a refused connection, a 503
//! or a 301 is usually the thing a scenario is asserting on.

mod http;
mod ws;

pub use self::http::{http_get, https_get};
pub use ws::{ws_connect, wss_connect, WsConnection};

use ::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use std::borrow::Cow;
use std::io::ErrorKind;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use crate::error::ProbeError;

/// Default upper bound for a single probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Where probes connect: the proxy's externally reachable address and a mapped port
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeTarget {
    pub address: IpAddr,
    pub port: u16,
}

impl ProbeTarget {
    pub fn new(address: IpAddr, port: u16) -> Self {
        Self { address, port }
    }

    pub fn localhost(port: u16) -> Self {
        Self { address: IpAddr::V4(Ipv4Addr::LOCALHOST), port }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }
}

/// What to ask for: Host header, path (with optional query) and credentials
#[derive(Debug, Clone)]
pub struct ProbeRequest {
    pub host: String,
    pub path: String,
    pub basic_auth: Option<(String, String)>,
    pub headers: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ProbeRequest {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            path: "/".to_string(),
            basic_auth: None,
            headers: Vec::new(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn basic_auth(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.basic_auth = Some((user.into(), password.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Host header value without an explicit `:port`, IPv6 brackets removed
    pub fn hostname(&self) -> &str {
        split_host_port(&self.host).0
    }

    /// Whether the Host names an IP literal rather than a DNS name
    pub fn host_is_ip(&self) -> bool {
        self.hostname().parse::<IpAddr>().is_ok()
    }

    pub(crate) fn validate(&self) -> Result<(), ProbeError> {
        let (name, port) = split_host_port(&self.host);
        if name.is_empty() || self.host.contains(['/', ' ', '@']) {
            return Err(ProbeError::InvalidRequest(format!("invalid host {:?}", self.host)));
        }
        if let Some(port) = port {
            port.parse::<u16>().map_err(|_| {
                ProbeError::InvalidRequest(format!("invalid port in host {:?}", self.host))
            })?;
        }
        if !self.path.starts_with('/') {
            return Err(ProbeError::InvalidRequest(format!(
                "path must start with '/': {:?}",
                self.path
            )));
        }
        Ok(())
    }

    /// URL addressing the target directly; the Host header is sent separately
    pub(crate) fn url(&self, scheme: &str, target: &ProbeTarget) -> String {
        format!("{scheme}://{}{}", target.socket_addr(), self.path)
    }
}

/// Split `host[:port]` or `[v6][:port]`; a bare IPv6 literal has no port
fn split_host_port(value: &str) -> (&str, Option<&str>) {
    if let Some(rest) = value.strip_prefix('[') {
        return match rest.split_once(']') {
            Some((ip, tail)) => (ip, tail.strip_prefix(':')),
            None => (value, None),
        };
    }
    match value.split_once(':') {
        Some((name, port)) if !port.contains(':') => (name, Some(port)),
        _ => (value, None),
    }
}

/// Captured HTTP response
#[derive(Debug, Clone)]
pub struct ProbeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProbeResponse {
    /// First value of header `name`, if it is valid UTF-8
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn location(&self) -> Option<&str> {
        self.header("location")
    }

    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}

/// Map an I/O failure during connect or handshake onto the probe taxonomy
pub(crate) fn classify_io(target: &str, err: std::io::Error) -> ProbeError {
    if err.kind() == ErrorKind::ConnectionRefused {
        return ProbeError::ConnectionRefused(target.to_string());
    }
    if err.kind() == ErrorKind::TimedOut {
        return ProbeError::Timeout(target.to_string());
    }
    if is_tls_failure(&err) {
        return ProbeError::Tls { target: target.to_string(), reason: err.to_string() };
    }
    ProbeError::Io(err)
}

pub(crate) fn is_tls_failure(err: &std::io::Error) -> bool {
    err.get_ref()
        .is_some_and(|inner| inner.downcast_ref::<tokio_rustls::rustls::Error>().is_some())
}
