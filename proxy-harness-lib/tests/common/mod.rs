//! Shared fixtures for harness tests that run without a container daemon
#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use proxy_harness_lib::config::HarnessConfig;
use proxy_harness_lib::error::RuntimeError;
use proxy_harness_lib::runtime::{ContainerRuntime, ContainerSpec, ContainerState};
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Config with short timeouts, scratch trees under `scratch_root`
pub fn fast_config(scratch_root: &Path) -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.scratch_root = Some(scratch_root.to_path_buf());
    config.proxy.image = "proxy-under-test:latest".to_string();
    config.timeouts.startup_secs = 2;
    config.timeouts.backend_ready_secs = 1;
    config.timeouts.attempt_ms = 100;
    config.timeouts.poll_ms = 20;
    config.timeouts.settle_ms = 0;
    config.timeouts.convergence_ms = 10;
    config.timeouts.convergence_timeout_secs = 1;
    config
}

/// Number of entries directly under `dir`
pub fn entries(dir: &Path) -> usize {
    std::fs::read_dir(dir).map(|d| d.count()).unwrap_or(0)
}

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub exit_code: Option<i64>,
}

#[derive(Debug, Clone, Default)]
pub struct FakeState {
    pub calls: Vec<String>,
    pub networks: HashMap<String, HashMap<String, String>>,
    pub containers: HashMap<String, FakeContainer>,
    pub removed_containers: Vec<String>,
    pub removed_networks: Vec<String>,
    next_id: u64,
}

/// Recording in-memory container runtime
///
/// Containers attached to a network get address 127.0.0.1 there, and every
/// published port maps to the port set with `publish_to`, so readiness
/// checks can be pointed at local listeners.
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    failing: Mutex<HashSet<String>>,
    crashing_images: Mutex<HashSet<String>>,
    unaddressed_images: Mutex<HashSet<String>>,
    host_port: Mutex<Option<u16>>,
    logs: Mutex<String>,
}

fn label_matches(labels: &HashMap<String, String>, filter: &str) -> bool {
    match filter.split_once('=') {
        Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
        None => labels.contains_key(filter),
    }
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every call of `op` fail
    pub fn fail(&self, op: &str) {
        self.failing.lock().unwrap().insert(op.to_string());
    }

    /// Containers of `image` exit with code 1 as soon as they start
    pub fn crash_image(&self, image: &str) {
        self.crashing_images.lock().unwrap().insert(image.to_string());
    }

    /// Containers of `image` run but never get an address on their network
    pub fn withhold_address(&self, image: &str) {
        self.unaddressed_images.lock().unwrap().insert(image.to_string());
    }

    pub fn publish_to(&self, port: u16) {
        *self.host_port.lock().unwrap() = Some(port);
    }

    pub fn set_logs(&self, logs: &str) {
        *self.logs.lock().unwrap() = logs.to_string();
    }

    pub fn snapshot(&self) -> FakeState {
        self.state.lock().unwrap().clone()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Simulate a resource left behind by an earlier, killed run
    pub fn add_orphan(&self, network: &str, container: &str, labels: HashMap<String, String>) {
        let mut state = self.state.lock().unwrap();
        state.networks.insert(network.to_string(), labels.clone());
        state.containers.insert(
            container.to_string(),
            FakeContainer {
                id: container.to_string(),
                spec: ContainerSpec {
                    name: container.to_string(),
                    labels,
                    network: Some(network.to_string()),
                    ..Default::default()
                },
                running: true,
                exit_code: None,
            },
        );
    }

    fn record(&self, op: &str, subject: &str) -> Result<(), RuntimeError> {
        self.state.lock().unwrap().calls.push(format!("{op} {subject}"));
        if self.failing.lock().unwrap().contains(op) {
            return Err(RuntimeError::Other(format!("{op} failed (injected)")));
        }
        Ok(())
    }

    fn crashes(&self, image: &str) -> bool {
        self.crashing_images.lock().unwrap().contains(image)
    }

    fn with_container<T>(
        &self,
        id: &str,
        f: impl FnOnce(&mut FakeContainer) -> T,
    ) -> Result<T, RuntimeError> {
        let mut state = self.state.lock().unwrap();
        state
            .containers
            .get_mut(id)
            .map(f)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn ping(&self) -> Result<(), RuntimeError> {
        self.record("ping", "")
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record("ensure_image", image)
    }

    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<(), RuntimeError> {
        self.record("create_network", name)?;
        self.state.lock().unwrap().networks.insert(name.to_string(), labels.clone());
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> Result<(), RuntimeError> {
        self.record("remove_network", name)?;
        let mut state = self.state.lock().unwrap();
        if !state.networks.contains_key(name) {
            return Err(RuntimeError::NotFound(name.to_string()));
        }
        let attached = state
            .containers
            .values()
            .any(|c| c.spec.network.as_deref() == Some(name));
        if attached {
            return Err(RuntimeError::Other(format!("network {name} has active endpoints")));
        }
        state.networks.remove(name);
        state.removed_networks.push(name.to_string());
        Ok(())
    }

    async fn run_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record("run_container", &spec.name)?;
        let crashes = self.crashes(&spec.image);
        let mut state = self.state.lock().unwrap();
        state.next_id += 1;
        let id = format!("fake-{}", state.next_id);
        state.containers.insert(
            id.clone(),
            FakeContainer {
                id: id.clone(),
                spec: spec.clone(),
                running: !crashes,
                exit_code: crashes.then_some(1),
            },
        );
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("start_container", id)?;
        let crashes = self.with_container(id, |c| c.spec.image.clone()).map(|i| self.crashes(&i))?;
        self.with_container(id, |c| {
            c.running = !crashes;
            c.exit_code = crashes.then_some(1);
        })
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.record("stop_container", id)?;
        self.with_container(id, |c| {
            c.running = false;
            c.exit_code = Some(0);
        })
    }

    async fn restart_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("restart_container", id)?;
        self.with_container(id, |c| {
            c.running = true;
            c.exit_code = None;
        })
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record("remove_container", id)?;
        let mut state = self.state.lock().unwrap();
        let removed =
            state.containers.remove(id).ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        state.removed_containers.push(removed.spec.name);
        Ok(())
    }

    async fn inspect(&self, id: &str) -> Result<ContainerState, RuntimeError> {
        self.record("inspect", id)?;
        let host_port = *self.host_port.lock().unwrap();
        let unaddressed = self.unaddressed_images.lock().unwrap().clone();
        self.with_container(id, |c| ContainerState {
            running: c.running,
            exit_code: c.exit_code,
            networks: c
                .spec
                .network
                .iter()
                .filter(|_| !unaddressed.contains(&c.spec.image))
                .map(|n| (n.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST)))
                .collect(),
            published_ports: c
                .spec
                .published_ports
                .iter()
                .filter_map(|p| host_port.map(|h| (*p, h)))
                .collect(),
        })
    }

    async fn logs(&self, id: &str, _tail: Option<usize>) -> Result<String, RuntimeError> {
        self.record("logs", id)?;
        self.with_container(id, |_| ())?;
        Ok(self.logs.lock().unwrap().clone())
    }

    async fn list_containers(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        self.record("list_containers", label)?;
        let state = self.state.lock().unwrap();
        let mut ids: Vec<String> = state
            .containers
            .values()
            .filter(|c| label_matches(&c.spec.labels, label))
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn list_networks(&self, label: &str) -> Result<Vec<String>, RuntimeError> {
        self.record("list_networks", label)?;
        let state = self.state.lock().unwrap();
        let mut names: Vec<String> = state
            .networks
            .iter()
            .filter(|(_, labels)| label_matches(labels, label))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }
}

/// A bound listener; connects succeed while it is alive
pub async fn open_port() -> Result<(TcpListener, u16), BoxError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let port = listener.local_addr()?.port();
    Ok((listener, port))
}

/// A port nothing listens on
pub async fn closed_port() -> Result<u16, BoxError> {
    let (listener, port) = open_port().await?;
    drop(listener);
    Ok(port)
}

/// Canned HTTP/1.1 response with `Connection: close`
pub fn http_response(status_line: &str, headers: &[(&str, &str)], body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status_line}\r\n");
    for (name, value) in headers {
        out.push_str(&format!("{name}: {value}\r\n"));
    }
    out.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n{body}", body.len()));
    out
}

/// Server answering every request with the same canned response
pub struct HttpFixture {
    pub port: u16,
    /// Request heads as received
    pub requests: Arc<Mutex<Vec<String>>>,
    /// SNI of each TLS connection
    pub server_names: Arc<Mutex<Vec<Option<String>>>>,
}

impl HttpFixture {
    pub fn last_request(&self) -> String {
        self.requests.lock().unwrap().last().cloned().unwrap_or_default()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

async fn read_head<S: AsyncRead + Unpin>(stream: &mut S) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") && buf.len() < 16 * 1024 {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

async fn answer<S: AsyncRead + AsyncWrite + Unpin>(
    mut stream: S,
    response: &str,
    requests: &Mutex<Vec<String>>,
) {
    if let Ok(head) = read_head(&mut stream).await {
        requests.lock().unwrap().push(head);
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }
}

pub async fn spawn_http_fixture(response: String) -> Result<HttpFixture, BoxError> {
    spawn_fixture(response, None).await
}

pub async fn spawn_https_fixture(
    response: String,
    tls: Arc<ServerConfig>,
) -> Result<HttpFixture, BoxError> {
    spawn_fixture(response, Some(TlsAcceptor::from(tls))).await
}

async fn spawn_fixture(
    response: String,
    acceptor: Option<TlsAcceptor>,
) -> Result<HttpFixture, BoxError> {
    let (listener, port) = open_port().await?;
    let requests = Arc::new(Mutex::new(Vec::new()));
    let server_names = Arc::new(Mutex::new(Vec::new()));
    let (reqs, names) = (requests.clone(), server_names.clone());
    let response = Arc::new(response);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (reqs, names, response, acceptor) =
                (reqs.clone(), names.clone(), response.clone(), acceptor.clone());
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(stream).await {
                            let sni = tls.get_ref().1.server_name().map(str::to_string);
                            names.lock().unwrap().push(sni);
                            answer(tls, &response, &reqs).await;
                        }
                    }
                    None => answer(stream, &response, &reqs).await,
                }
            });
        }
    });

    Ok(HttpFixture { port, requests, server_names })
}

/// Server writing its response in `parts`, pausing `gap` after each write
pub async fn spawn_segmented_fixture(
    parts: Vec<String>,
    gap: Duration,
) -> Result<HttpFixture, BoxError> {
    let (listener, port) = open_port().await?;
    let requests = Arc::new(Mutex::new(Vec::new()));
    let reqs = requests.clone();
    let parts = Arc::new(parts);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let (reqs, parts) = (reqs.clone(), parts.clone());
            tokio::spawn(async move {
                let Ok(head) = read_head(&mut stream).await else {
                    return;
                };
                reqs.lock().unwrap().push(head);
                for part in parts.iter() {
                    if stream.write_all(part.as_bytes()).await.is_err() {
                        return;
                    }
                    let _ = stream.flush().await;
                    tokio::time::sleep(gap).await;
                }
                let _ = stream.shutdown().await;
            });
        }
    });

    Ok(HttpFixture { port, requests, server_names: Arc::new(Mutex::new(Vec::new())) })
}

/// Split a canned response into its head and body
pub fn split_head_body(response: &str) -> (String, String) {
    match response.find("\r\n\r\n") {
        Some(end) => (response[..end + 4].to_string(), response[end + 4..].to_string()),
        None => (response.to_string(), String::new()),
    }
}

/// Self-signed server config for `hostname`, advertising http/1.1
pub fn tls_server_config(hostname: &str) -> Result<Arc<ServerConfig>, BoxError> {
    let rcgen::CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec![hostname.to_string()])?;
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
    let provider = Arc::new(tokio_rustls::rustls::crypto::aws_lc_rs::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(vec![cert.der().clone()], key)?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

/// WebSocket echo server recording the Host header of each upgrade
pub struct WsFixture {
    pub port: u16,
    pub hosts: Arc<Mutex<Vec<String>>>,
}

async fn echo<S: AsyncRead + AsyncWrite + Unpin>(stream: S, hosts: Arc<Mutex<Vec<String>>>) {
    let callback = move |req: &Request, resp: Response| {
        let host = req
            .headers()
            .get("host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        hosts.lock().unwrap().push(host);
        Ok::<_, ErrorResponse>(resp)
    };
    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    while let Some(Ok(msg)) = ws.next().await {
        if msg.is_text() || msg.is_binary() {
            if ws.send(msg).await.is_err() {
                break;
            }
        } else if msg.is_close() {
            break;
        }
    }
}

pub async fn spawn_ws_echo(tls: Option<Arc<ServerConfig>>) -> Result<WsFixture, BoxError> {
    let (listener, port) = open_port().await?;
    let hosts = Arc::new(Mutex::new(Vec::new()));
    let recorded = hosts.clone();
    let acceptor = tls.map(TlsAcceptor::from);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let (hosts, acceptor) = (recorded.clone(), acceptor.clone());
            tokio::spawn(async move {
                match acceptor {
                    Some(acceptor) => {
                        if let Ok(tls) = acceptor.accept(stream).await {
                            echo(tls, hosts).await;
                        }
                    }
                    None => echo(stream, hosts).await,
                }
            });
        }
    });

    Ok(WsFixture { port, hosts })
}
