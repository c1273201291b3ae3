#![forbid(unsafe_code)]

pub mod assertions;
pub mod backend;
pub mod config;
pub mod declare;
pub mod environment;
pub mod error;
pub mod probe;
pub mod runtime;
pub mod sync;
pub mod telemetry;
pub mod tls;

pub use assertions::{
    contains, equals, header_contains, status_is, AssertionFailure, AssertionReport,
    SoftAssertions,
};
pub use backend::{Backend, BackendSpec, BackendState};
pub use config::{load_from_path, HarnessConfig};
pub use declare::{BackendEnv, BasicAuth, FullRedirect, Scheme, VirtualHost};
pub use environment::{
    provision, sweep_orphans, with_environment, CleanupReport, Environment, EnvironmentState,
};
pub use error::{HarnessError, Result};
pub use probe::{
    http_get, https_get, ws_connect, wss_connect, ProbeRequest, ProbeResponse, ProbeTarget,
    WsConnection,
};
pub use runtime::{ContainerRuntime, DockerRuntime};
pub use sync::{await_convergence, await_log_line, await_reachable, eventually, RetryPolicy};
pub use telemetry::init_tracing;
pub use tls::{issue, CertificateRecord};
