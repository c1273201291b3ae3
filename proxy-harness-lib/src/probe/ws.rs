use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use http::header::{CONTENT_LENGTH, HOST};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use rustls_pki_types::ServerName;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{client_async, WebSocketStream};
use tracing::debug;

use super::{classify_io, ProbeRequest, ProbeTarget};
use crate::error::ProbeError;
use crate::tls::insecure_client_config;

/// Byte stream a WebSocket session runs over, plain or TLS
pub trait ProbeStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProbeStream for T {}

/// Upper bound on the body kept from a rejected upgrade
const MAX_REJECTION_BODY: usize = 64 * 1024;

/// Stream handle that stays usable after the handshake drops its copy
///
/// A rejected upgrade consumes the stream tungstenite was given; the clone
/// kept here is used to read the rest of the rejection body.
#[derive(Clone)]
struct SharedStream(Arc<Mutex<Box<dyn ProbeStream>>>);

impl SharedStream {
    fn new(stream: Box<dyn ProbeStream>) -> Self {
        Self(Arc::new(Mutex::new(stream)))
    }

    fn with<T>(
        &self,
        f: impl FnOnce(Pin<&mut Box<dyn ProbeStream>>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        match self.0.lock() {
            Ok(mut inner) => f(Pin::new(&mut *inner)),
            Err(_) => Poll::Ready(Err(io::Error::other("probe stream lock poisoned"))),
        }
    }
}

impl AsyncRead for SharedStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.with(|inner| inner.poll_read(cx, buf))
    }
}

impl AsyncWrite for SharedStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.with(|inner| inner.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.with(|inner| inner.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.with(|inner| inner.poll_shutdown(cx))
    }
}

/// An upgraded WebSocket session through the proxy
pub struct WsConnection {
    stream: WebSocketStream<SharedStream>,
    url: String,
    status: StatusCode,
}

impl std::fmt::Debug for WsConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsConnection")
            .field("url", &self.url)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

impl WsConnection {
    /// Status of the upgrade response, normally 101
    pub fn handshake_status(&self) -> StatusCode {
        self.status
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub async fn send_text(&mut self, text: impl Into<String>) -> Result<(), ProbeError> {
        self.stream.send(Message::Text(text.into().into())).await?;
        Ok(())
    }

    pub async fn send_binary(&mut self, data: impl Into<Bytes>) -> Result<(), ProbeError> {
        self.stream.send(Message::Binary(data.into())).await?;
        Ok(())
    }

    /// Next data frame as text; control frames are skipped
    ///
    /// A close frame or end of stream surfaces as `ConnectionClosed`.
    pub async fn recv_text(&mut self, wait: Duration) -> Result<String, ProbeError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let next = tokio::time::timeout_at(deadline, self.stream.next())
                .await
                .map_err(|_| ProbeError::Timeout(self.url.clone()))?;
            match next {
                Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
                Some(Ok(Message::Binary(data))) => {
                    return Ok(String::from_utf8_lossy(&data).into_owned())
                }
                Some(Ok(Message::Close(_))) | None => {
                    return Err(ProbeError::WebSocket(WsError::ConnectionClosed))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    /// Receive until a text frame containing `needle` arrives
    ///
    /// Echo servers may greet before echoing, so callers asserting on an echo
    /// use this rather than the first frame.
    pub async fn recv_until(&mut self, needle: &str, wait: Duration) -> Result<String, ProbeError> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let text = self.recv_text(remaining).await?;
            if text.contains(needle) {
                return Ok(text);
            }
            debug!(url = %self.url, frame = %text, "skipping frame");
        }
    }

    /// Send a close frame; later sends on this connection fail
    ///
    /// Closing an already closed or closing connection is a no-op.
    pub async fn close(&mut self) -> Result<(), ProbeError> {
        match self.stream.close(None).await {
            Ok(())
            | Err(WsError::ConnectionClosed)
            | Err(WsError::AlreadyClosed)
            | Err(WsError::Protocol(ProtocolError::SendAfterClosing)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Open a WebSocket session over plain TCP
pub async fn ws_connect(
    target: &ProbeTarget,
    request: &ProbeRequest,
) -> Result<WsConnection, ProbeError> {
    connect(false, target, request).await
}

/// Open a WebSocket session over TLS with SNI set to `request.host`
pub async fn wss_connect(
    target: &ProbeTarget,
    request: &ProbeRequest,
) -> Result<WsConnection, ProbeError> {
    connect(true, target, request).await
}

async fn connect(
    secure: bool,
    target: &ProbeTarget,
    request: &ProbeRequest,
) -> Result<WsConnection, ProbeError> {
    request.validate()?;
    let url = request.url(if secure { "wss" } else { "ws" }, target);

    let mut upgrade = url.as_str().into_client_request()?;
    let host = HeaderValue::from_str(&request.host)
        .map_err(|e| ProbeError::InvalidRequest(format!("invalid host header: {e}")))?;
    upgrade.headers_mut().insert(HOST, host);
    for (name, value) in &request.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProbeError::InvalidRequest(format!("invalid header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProbeError::InvalidRequest(format!("invalid header value: {e}")))?;
        upgrade.headers_mut().insert(name, value);
    }

    let tcp = timeout(request.timeout, TcpStream::connect(target.socket_addr()))
        .await
        .map_err(|_| ProbeError::Timeout(url.clone()))?
        .map_err(|e| classify_io(&url, e))?;

    let stream: Box<dyn ProbeStream> = if secure {
        let config = insecure_client_config(&["http/1.1"])
            .map_err(|e| ProbeError::Tls { target: url.clone(), reason: e.to_string() })?;
        let server_name = ServerName::try_from(request.hostname().to_string())
            .map_err(|e| ProbeError::InvalidRequest(format!("invalid SNI name: {e}")))?;
        let tls = timeout(request.timeout, TlsConnector::from(config).connect(server_name, tcp))
            .await
            .map_err(|_| ProbeError::Timeout(url.clone()))?
            .map_err(|e| ProbeError::Tls { target: url.clone(), reason: e.to_string() })?;
        Box::new(tls)
    } else {
        Box::new(tcp)
    };

    let mut stream = SharedStream::new(stream);
    let handshake = timeout(request.timeout, client_async(upgrade, stream.clone()))
        .await
        .map_err(|_| ProbeError::Timeout(url.clone()))?;

    match handshake {
        Ok((stream, response)) => {
            debug!(%url, status = response.status().as_u16(), "WebSocket upgraded");
            Ok(WsConnection { stream, url, status: response.status() })
        }
        Err(WsError::Http(response)) => {
            let headers = response.headers().clone();
            let buffered = response.body().clone().unwrap_or_default();
            let body = read_rejection_body(&mut stream, &headers, buffered, request.timeout).await;
            debug!(
                %url,
                status = response.status().as_u16(),
                body_len = body.len(),
                "WebSocket upgrade rejected"
            );
            Err(ProbeError::HandshakeRejected {
                status: response.status(),
                headers,
                body: Bytes::from(body),
            })
        }
        Err(WsError::Io(e)) => Err(classify_io(&url, e)),
        Err(e) => Err(e.into()),
    }
}

/// Complete a rejection body from what the handshake already buffered
///
/// Reads up to `Content-Length`, or to end of stream when absent, giving up
/// quietly at `wait`: a partial body is still a useful diagnostic.
async fn read_rejection_body(
    stream: &mut SharedStream,
    headers: &HeaderMap,
    mut body: Vec<u8>,
    wait: Duration,
) -> Vec<u8> {
    let expected = headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(|len| len.min(MAX_REJECTION_BODY));
    let limit = expected.unwrap_or(MAX_REJECTION_BODY);
    let deadline = tokio::time::Instant::now() + wait;
    let mut chunk = [0u8; 4096];

    while body.len() < limit {
        match tokio::time::timeout_at(deadline, stream.read(&mut chunk)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => body.extend_from_slice(&chunk[..n]),
        }
    }
    body.truncate(limit);
    body
}
