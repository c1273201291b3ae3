mod loader;
mod types;

pub use loader::{
    load_from_path, validate_config, BACKEND_IMAGE_ENV, CONFIG_PATH_ENV, PROXY_IMAGE_ENV,
};
pub use types::{
    BackendConfig, HarnessConfig, LoggingConfig, MountConfig, ProxyConfig, TimeoutConfig,
};
