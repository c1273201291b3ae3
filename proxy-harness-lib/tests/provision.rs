mod common;

use common::{closed_port, entries, fast_config, open_port, BoxError, FakeRuntime};
use proxy_harness_lib::environment::{Environment, EnvironmentState};
use proxy_harness_lib::error::{GenerationError, ProvisioningError, ReadinessError};
use proxy_harness_lib::provision;
use proxy_harness_lib::runtime::{LABEL_ENVIRONMENT, LABEL_ROLE};

#[tokio::test]
async fn provisions_network_proxy_and_scratch_tree() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let (_listener, port) = open_port().await?;
    let runtime = FakeRuntime::new();
    runtime.publish_to(port);

    let mut config = fast_config(scratch.path());
    config.proxy.env.insert("DEFAULT_HOST".to_string(), "fallback.test".to_string());
    let env = Environment::provision(runtime.clone(), &config).await?;

    assert_eq!(env.state(), EnvironmentState::Ready);
    assert_eq!(env.network(), env.id());
    assert_eq!(env.http_port(), port);
    assert_eq!(env.https_port(), port);
    assert_eq!(env.http_target().socket_addr().to_string(), format!("127.0.0.1:{port}"));
    assert_eq!(env.proxy().name, format!("{}-proxy", env.id()));

    assert_eq!(
        runtime.calls(),
        vec![
            format!("create_network {}", env.id()),
            "ensure_image proxy-under-test:latest".to_string(),
            format!("run_container {}-proxy", env.id()),
            format!("inspect {}", env.proxy().id),
        ]
    );

    let state = runtime.snapshot();
    assert_eq!(
        state.networks[env.id()].get(LABEL_ENVIRONMENT).map(String::as_str),
        Some(env.id())
    );
    let proxy = &state.containers[&env.proxy().id].spec;
    assert_eq!(proxy.network.as_deref(), Some(env.id()));
    assert_eq!(proxy.published_ports, vec![80, 443]);
    assert_eq!(proxy.labels.get(LABEL_ROLE).map(String::as_str), Some("proxy"));
    assert!(proxy.env.contains(&"DEFAULT_HOST=fallback.test".to_string()));
    assert_eq!(proxy.binds.len(), 4);
    assert!(proxy.binds[1].starts_with(&env.tls_dir().display().to_string()));

    assert!(env.paths().root.starts_with(scratch.path()));
    assert!(env.tls_dir().join("certs").is_dir());
    assert!(env.paths().includes.is_dir());
    assert!(env.challenge_dir().is_dir());
    assert!(env.config_dir().join("default.conf").is_file());

    let report = env.release().await;
    assert!(report.is_clean(), "{report:?}");
    Ok(())
}

#[tokio::test]
async fn provision_shorthand_overrides_image() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let (_listener, port) = open_port().await?;
    let runtime = FakeRuntime::new();
    runtime.publish_to(port);

    let env = provision(runtime.clone(), "other/proxy:2", &fast_config(scratch.path())).await?;
    assert_eq!(env.config().proxy.image, "other/proxy:2");
    assert!(runtime.calls().contains(&"ensure_image other/proxy:2".to_string()));
    env.release().await;
    Ok(())
}

#[tokio::test]
async fn environments_are_isolated() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let (_listener, port) = open_port().await?;
    let runtime = FakeRuntime::new();
    runtime.publish_to(port);
    let config = fast_config(scratch.path());

    let (a, b) = tokio::try_join!(
        Environment::provision(runtime.clone(), &config),
        Environment::provision(runtime.clone(), &config),
    )?;
    assert_ne!(a.id(), b.id());
    assert_ne!(a.paths().root, b.paths().root);
    assert_eq!(runtime.snapshot().networks.len(), 2);

    a.issue_certificate("shared.example.com")?;
    assert!(!b.tls_dir().join("certs/shared.example.com.crt").exists());

    a.release().await;
    assert_eq!(runtime.snapshot().networks.len(), 1);
    assert!(b.paths().root.exists());
    b.release().await;
    Ok(())
}

#[tokio::test]
async fn certificates_are_issued_once_per_hostname() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let (_listener, port) = open_port().await?;
    let runtime = FakeRuntime::new();
    runtime.publish_to(port);
    let env = Environment::provision(runtime.clone(), &fast_config(scratch.path())).await?;

    let record = env.issue_certificate("secure.example.com")?;
    assert!(record.cert_path.starts_with(env.tls_dir()));
    env.issue_certificate("*.apps.example.com")?;

    match env.issue_certificate("secure.example.com") {
        Err(GenerationError::AlreadyIssued { path, .. }) => assert_eq!(path, record.cert_path),
        other => panic!("expected AlreadyIssued, got {other:?}"),
    }
    assert_eq!(env.issued_hostnames(), vec!["*.apps.example.com", "secure.example.com"]);

    env.release().await;
    assert!(!record.cert_path.exists());
    Ok(())
}

#[tokio::test]
async fn failed_container_start_releases_network_and_scratch() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    runtime.fail("run_container");

    let result = Environment::provision(runtime.clone(), &fast_config(scratch.path())).await;
    assert!(matches!(result, Err(ProvisioningError::ProxyStart { .. })), "{result:?}");

    let state = runtime.snapshot();
    assert!(state.networks.is_empty());
    assert_eq!(state.removed_networks.len(), 1);
    assert_eq!(entries(scratch.path()), 0);
    Ok(())
}

#[tokio::test]
async fn failed_network_creation_is_reported() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    runtime.fail("create_network");

    let result = Environment::provision(runtime.clone(), &fast_config(scratch.path())).await;
    assert!(matches!(result, Err(ProvisioningError::Network { .. })), "{result:?}");
    assert!(!runtime.calls().iter().any(|c| c.starts_with("run_container")));
    assert_eq!(entries(scratch.path()), 0);
    Ok(())
}

#[tokio::test]
async fn crashing_proxy_reports_exit_and_log_tail() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    let config = fast_config(scratch.path());
    runtime.crash_image(&config.proxy.image);
    runtime.set_logs("nginx: [emerg] unknown directive \"bogus\"\n");

    match Environment::provision(runtime.clone(), &config).await {
        Err(ProvisioningError::ProxyExited { exit_code, log_tail, .. }) => {
            assert_eq!(exit_code, Some(1));
            assert!(log_tail.contains("unknown directive"));
        }
        other => panic!("expected ProxyExited, got {other:?}"),
    }

    let state = runtime.snapshot();
    assert!(state.containers.is_empty());
    assert!(state.networks.is_empty());
    assert_eq!(entries(scratch.path()), 0);
    Ok(())
}

#[tokio::test]
async fn crash_during_log_wait_reports_exit() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    let mut config = fast_config(scratch.path());
    config.proxy.readiness_log_line = Some("Watching docker events".to_string());
    runtime.crash_image(&config.proxy.image);
    runtime.set_logs("fatal: cannot read docker socket\n");

    let result = Environment::provision(runtime.clone(), &config).await;
    assert!(matches!(result, Err(ProvisioningError::ProxyExited { .. })), "{result:?}");
    Ok(())
}

#[tokio::test]
async fn waits_for_readiness_log_line() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let (_listener, port) = open_port().await?;
    let runtime = FakeRuntime::new();
    runtime.publish_to(port);
    runtime.set_logs("forego | starting\ndockergen | Watching docker events\n");

    let mut config = fast_config(scratch.path());
    config.proxy.readiness_log_line = Some("Watching docker events".to_string());
    let env = Environment::provision(runtime.clone(), &config).await?;

    assert!(runtime.calls().iter().any(|c| c == &format!("logs {}", env.proxy().id)));
    assert!(env.proxy_logs(Some(10)).await?.contains("Watching docker events"));
    env.release().await;
    Ok(())
}

#[tokio::test]
async fn unpublished_port_is_reported() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();

    let result = Environment::provision(runtime.clone(), &fast_config(scratch.path())).await;
    assert!(
        matches!(result, Err(ProvisioningError::PortNotPublished { port: 80, .. })),
        "{result:?}"
    );
    assert!(runtime.snapshot().containers.is_empty());
    Ok(())
}

#[tokio::test]
async fn unreachable_proxy_times_out_and_cleans_up() -> Result<(), BoxError> {
    let scratch = tempfile::tempdir()?;
    let runtime = FakeRuntime::new();
    runtime.publish_to(closed_port().await?);

    let mut config = fast_config(scratch.path());
    config.timeouts.startup_secs = 1;
    let result = Environment::provision(runtime.clone(), &config).await;
    assert!(
        matches!(
            result,
            Err(ProvisioningError::Readiness(ReadinessError::ReadinessTimeout { .. }))
        ),
        "{result:?}"
    );

    let state = runtime.snapshot();
    assert!(state.containers.is_empty());
    assert!(state.networks.is_empty());
    assert_eq!(entries(scratch.path()), 0);
    Ok(())
}
