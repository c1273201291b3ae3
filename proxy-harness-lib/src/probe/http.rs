use http::header::HOST;
use std::error::Error as _;
use tracing::debug;

use super::{ProbeRequest, ProbeResponse, ProbeTarget};
use crate::error::ProbeError;

/// Plain HTTP GET with the given Host header; redirects are returned, not followed
pub async fn http_get(
    target: &ProbeTarget,
    request: &ProbeRequest,
) -> Result<ProbeResponse, ProbeError> {
    get("http", target, request).await
}

/// HTTPS GET with SNI and Host set to `request.host`
///
/// Certificate validation is disabled: the proxy serves self-signed material.
pub async fn https_get(
    target: &ProbeTarget,
    request: &ProbeRequest,
) -> Result<ProbeResponse, ProbeError> {
    get("https", target, request).await
}

async fn get(
    scheme: &str,
    target: &ProbeTarget,
    request: &ProbeRequest,
) -> Result<ProbeResponse, ProbeError> {
    request.validate()?;

    // Plain HTTP and IP-literal hosts connect to the target by address. For a
    // named HTTPS host the URL carries the name so it goes out as SNI, and
    // `resolve` pins that name to the target.
    let mut builder = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .timeout(request.timeout)
        .no_proxy()
        .http1_only();
    let url = if scheme == "https" && !request.host_is_ip() {
        builder = builder.resolve(request.hostname(), target.socket_addr());
        format!("https://{}:{}{}", request.hostname(), target.port, request.path)
    } else {
        request.url(scheme, target)
    };
    if scheme == "https" {
        builder = builder.danger_accept_invalid_certs(true);
    }
    let client = builder
        .build()
        .map_err(|e| ProbeError::Http(format!("Failed to create HTTP client: {e}")))?;

    let mut req = client.get(&url).header(HOST, request.host.as_str());
    for (name, value) in &request.headers {
        req = req.header(name.as_str(), value.as_str());
    }
    if let Some((user, password)) = &request.basic_auth {
        req = req.basic_auth(user, Some(password));
    }

    let response = req.send().await.map_err(|e| classify(&url, e))?;
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.map_err(|e| classify(&url, e))?;

    debug!(%url, status = status.as_u16(), body_len = body.len(), "probe completed");
    Ok(ProbeResponse { status, headers, body })
}

fn classify(url: &str, err: reqwest::Error) -> ProbeError {
    if err.is_timeout() {
        return ProbeError::Timeout(url.to_string());
    }

    let mut source = err.source();
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionRefused {
                return ProbeError::ConnectionRefused(url.to_string());
            }
            if super::is_tls_failure(io) {
                return ProbeError::Tls { target: url.to_string(), reason: io.to_string() };
            }
        }
        if let Some(tls) = cause.downcast_ref::<tokio_rustls::rustls::Error>() {
            return ProbeError::Tls { target: url.to_string(), reason: tls.to_string() };
        }
        source = cause.source();
    }

    ProbeError::Http(format!("request to {url} failed: {err}"))
}
