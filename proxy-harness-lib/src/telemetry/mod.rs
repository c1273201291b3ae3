use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Registry;

use crate::config::LoggingConfig;

/// Initialize the global tracing subscriber
///
/// `RUST_LOG` overrides the configured level. Container-runtime and HTTP client
/// internals are capped at `warn` unless `RUST_LOG` says otherwise.
///
/// Returns `false` when a subscriber was already installed (e.g. by an earlier
/// test in the same binary); that is not an error.
pub fn init_tracing(logging: &LoggingConfig) -> bool {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "{},bollard=warn,hyper=warn,hyper_util=warn,reqwest=warn,tungstenite=warn",
            logging.level
        ))
    });
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(logging.show_target)
        .with_test_writer();

    Registry::default().with(env_filter).with(fmt_layer).try_init().is_ok()
}
