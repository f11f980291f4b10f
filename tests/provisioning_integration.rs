//! Integration tests for Python runtime provisioning.

mod common;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use agent_host::core::python::{
    Phase, ProvisionEvent, ProvisionTimeouts, Provisioner, ProvisionerSettings,
};

use common::{CountingRunner, exited, ok, python_behavior, timed_out};

fn settings() -> ProvisionerSettings {
    ProvisionerSettings {
        system_python: Some(PathBuf::from("/usr/bin/python3")),
        ..ProvisionerSettings::default()
    }
}

fn drain(events: &mut tokio::sync::broadcast::Receiver<ProvisionEvent>) -> Vec<ProvisionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

#[tokio::test]
async fn concurrent_callers_share_one_provisioning() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::with_delay(
        Duration::from_millis(100),
        python_behavior("Python 3.12.1", |_| true),
    );
    let provisioner = Provisioner::with_runner(settings(), runner.clone());

    let statuses = futures::future::join_all(
        (0..5).map(|_| provisioner.ensure_ready(source.path())),
    )
    .await;

    let venv_builds = runner
        .labels()
        .iter()
        .filter(|label| *label == "venv-create")
        .count();
    assert_eq!(venv_builds, 1);

    for status in &statuses {
        assert!(status.ready, "{:?}", status.error);
        assert!(Arc::ptr_eq(status, &statuses[0]));
    }
    assert!(statuses[0].virtual_env_present);
    assert!(!statuses[0].using_bundled_packages);
    assert_eq!(provisioner.phase(), Phase::Ready);
}

#[tokio::test]
async fn ready_status_is_cached_for_same_source() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::new(python_behavior("Python 3.12.1", |_| true));
    let provisioner = Provisioner::with_runner(settings(), runner.clone());

    let first = provisioner.ensure_ready(source.path()).await;
    assert!(first.ready);
    let calls = runner.calls();

    let second = provisioner.ensure_ready(source.path()).await;
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(runner.calls(), calls);
    assert!(Arc::ptr_eq(&provisioner.status(), &first));
}

#[tokio::test]
async fn different_source_provisions_again() {
    let first_source = tempfile::tempdir().unwrap();
    let second_source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::new(python_behavior("Python 3.12.1", |_| true));
    let provisioner = Provisioner::with_runner(settings(), runner.clone());

    let first = provisioner.ensure_ready(first_source.path()).await;
    let second = provisioner.ensure_ready(second_source.path()).await;

    assert!(first.ready && second.ready);
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.interpreter_path, second.interpreter_path);
    assert_eq!(
        runner
            .labels()
            .iter()
            .filter(|label| *label == "venv-create")
            .count(),
        2
    );
}

#[tokio::test]
async fn existing_venv_is_not_rebuilt() {
    let source = tempfile::tempdir().unwrap();
    common::make_venv(&source.path().join(".venv"));
    let runner = CountingRunner::new(python_behavior("Python 3.12.1", |_| true));
    let provisioner = Provisioner::with_runner(settings(), runner.clone());

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(status.ready);
    assert!(!runner.labels().contains(&"venv-create".to_string()));
    assert!(
        status
            .package_path
            .as_ref()
            .unwrap()
            .ends_with("site-packages")
    );
}

#[tokio::test]
async fn venv_timeout_fails_without_retry() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::new(|spec| match spec.label.as_str() {
        "venv-create" => timed_out(),
        _ => ok(),
    });
    let provisioner = Provisioner::with_runner(settings(), runner.clone());
    let mut events = provisioner.subscribe();

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(!status.ready);
    assert!(!status.dependencies_installed);
    assert!(status.error.as_deref().unwrap().contains("timed out after 120s"));
    assert_eq!(provisioner.phase(), Phase::Failed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.calls(), 1);

    let events = drain(&mut events);
    assert_eq!(
        events.last(),
        Some(&ProvisionEvent::Failed(status.error.clone().unwrap()))
    );
    assert!(
        events[..events.len() - 1]
            .iter()
            .all(|event| matches!(event, ProvisionEvent::Status(_)))
    );

    // Failed is retriable by the caller
    let retried = provisioner.ensure_ready(source.path()).await;
    assert!(!retried.ready);
    assert_eq!(runner.calls(), 2);
}

#[tokio::test]
async fn venv_creation_failure_is_reported() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::new(|spec| match spec.label.as_str() {
        "venv-create" => exited(1, "", "Error: ensurepip is not available"),
        _ => ok(),
    });
    let provisioner = Provisioner::with_runner(settings(), runner);

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(!status.ready);
    assert!(!status.virtual_env_present);
    assert_eq!(
        status.error.as_deref(),
        Some("failed to create virtual environment: Error: ensurepip is not available")
    );
}

#[tokio::test]
async fn missing_manifest_fails_before_install() {
    let source = tempfile::tempdir().unwrap();
    common::make_venv(&source.path().join(".venv"));
    let runner = CountingRunner::new(python_behavior("Python 3.12.1", |_| false));
    let provisioner = Provisioner::with_runner(settings(), runner.clone());

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(!status.ready);
    assert!(status.virtual_env_present);
    assert!(
        status
            .error
            .as_deref()
            .unwrap()
            .starts_with("dependency manifest not found")
    );
    assert!(!runner.labels().iter().any(|label| label.starts_with("pip")));
}

#[tokio::test]
async fn missing_packages_are_installed_from_manifest() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("requirements.txt"), "claude-agent-sdk\n").unwrap();
    let runner = CountingRunner::new(python_behavior("Python 3.12.1", |_| false));
    let provisioner = Provisioner::with_runner(settings(), runner.clone());

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(status.ready, "{:?}", status.error);
    assert!(status.dependencies_installed);
    assert_eq!(
        runner.labels(),
        ["venv-create", "dependency-check", "pip-bootstrap", "pip-install"]
    );

    let install = runner.specs().pop().unwrap();
    assert_eq!(install.args[..4], ["-m", "pip", "install", "-r"]);
    assert!(install.args[4].ends_with("requirements.txt"));
    assert!(!install.env.contains_key("PYTHONHOME"));
    assert_eq!(install.env.get("PYTHONNOUSERSITE").map(String::as_str), Some("1"));
}

#[tokio::test]
async fn install_failure_is_reported() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("requirements.txt"), "claude-agent-sdk\n").unwrap();
    let behavior = python_behavior("Python 3.12.1", |_| false);
    let runner = CountingRunner::new(move |spec| match spec.label.as_str() {
        "pip-install" => exited(1, "", "ERROR: No matching distribution found"),
        _ => behavior(spec),
    });
    let provisioner = Provisioner::with_runner(settings(), runner);

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(!status.ready);
    assert_eq!(
        status.error.as_deref(),
        Some("failed to install dependencies: ERROR: No matching distribution found")
    );
}

#[tokio::test]
async fn memory_packages_checked_from_python_3_12() {
    let source = tempfile::tempdir().unwrap();
    std::fs::write(source.path().join("requirements.txt"), "graphiti-core\n").unwrap();
    let runner = CountingRunner::new(python_behavior("Python 3.12.4", |script| {
        !script.contains("graphiti_core")
    }));
    let provisioner = Provisioner::with_runner(settings(), runner.clone());

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(status.ready);
    assert!(runner.labels().contains(&"pip-install".to_string()));
}

#[tokio::test]
async fn memory_packages_skipped_before_python_3_12() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::new(python_behavior("Python 3.11.9", |script| {
        !script.contains("graphiti_core")
    }));
    let provisioner = Provisioner::with_runner(settings(), runner.clone());

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(status.ready);
    assert!(!runner.labels().contains(&"pip-install".to_string()));
}

#[tokio::test]
async fn status_events_precede_ready() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::new(python_behavior("Python 3.12.1", |_| true));
    let provisioner = Provisioner::with_runner(settings(), runner);
    let mut events = provisioner.subscribe();

    let status = provisioner.ensure_ready(source.path()).await;
    assert!(status.ready);

    let events = drain(&mut events);
    assert_eq!(events.first(), Some(&ProvisionEvent::Status("Creating Python virtual environment".to_string())));
    assert_eq!(events.last(), Some(&ProvisionEvent::Ready));
    assert_eq!(
        events
            .iter()
            .filter(|event| matches!(event, ProvisionEvent::Ready | ProvisionEvent::Failed(_)))
            .count(),
        1
    );
}

#[tokio::test]
async fn python_env_exports_package_path_once_ready() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::new(python_behavior("Python 3.12.1", |_| true));
    let provisioner = Provisioner::with_runner(settings(), runner);

    assert!(!provisioner.python_layer().contains_key("PYTHONPATH"));
    let status = provisioner.ensure_ready(source.path()).await;

    let layer = provisioner.python_layer();
    assert_eq!(
        layer.get("PYTHONPATH").map(PathBuf::from),
        status.package_path
    );
}

#[tokio::test]
async fn provisioning_uses_configured_timeouts() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::new(python_behavior("Python 3.12.1", |_| true));
    let timeouts = ProvisionTimeouts {
        venv_create: Duration::from_secs(7),
        dependency_check: Duration::from_secs(3),
        ..ProvisionTimeouts::default()
    };
    let provisioner = Provisioner::with_runner(
        ProvisionerSettings {
            timeouts,
            ..settings()
        },
        runner.clone(),
    );

    provisioner.ensure_ready(source.path()).await;

    for spec in runner.specs() {
        let expected = if spec.label == "venv-create" {
            Duration::from_secs(7)
        } else {
            Duration::from_secs(3)
        };
        assert_eq!(spec.timeout, expected, "{}", spec.label);
    }
}

#[tokio::test]
async fn provisioning_finishes_after_caller_gives_up() {
    let source = tempfile::tempdir().unwrap();
    let runner = CountingRunner::with_delay(
        Duration::from_millis(150),
        python_behavior("Python 3.12.1", |_| true),
    );
    let provisioner = Provisioner::with_runner(settings(), runner);
    let mut events = provisioner.subscribe();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(50), provisioner.ensure_ready(source.path()))
            .await;
    assert!(abandoned.is_err());
    assert_eq!(provisioner.phase(), Phase::Initializing);

    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(provisioner.phase(), Phase::Ready);
    assert!(provisioner.status().ready);
    assert_eq!(drain(&mut events).last(), Some(&ProvisionEvent::Ready));

    // A later caller gets the cached result
    let status = provisioner.ensure_ready(source.path()).await;
    assert!(Arc::ptr_eq(&status, &provisioner.status()));
}

#[tokio::test]
async fn other_source_does_not_inherit_package_path() {
    let first_source = tempfile::tempdir().unwrap();
    let second_source = tempfile::tempdir().unwrap();
    let second_venv = second_source.path().join(".venv");
    let behavior = python_behavior("Python 3.12.1", |_| true);
    let runner = CountingRunner::with_delay(Duration::from_millis(100), move |spec| {
        let into_second = spec
            .args
            .last()
            .is_some_and(|dir| std::path::Path::new(dir) == second_venv);
        if spec.label == "venv-create" && into_second {
            exited(1, "", "No space left on device")
        } else {
            behavior(spec)
        }
    });
    let provisioner = Provisioner::with_runner(settings(), runner);

    let first = provisioner.ensure_ready(first_source.path()).await;
    assert!(first.ready);
    assert!(provisioner.python_layer().contains_key("PYTHONPATH"));

    let pending = {
        let provisioner = provisioner.clone();
        let source = second_source.path().to_path_buf();
        tokio::spawn(async move { provisioner.ensure_ready(&source).await })
    };
    while provisioner.phase() != Phase::Initializing {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(!provisioner.python_layer().contains_key("PYTHONPATH"));

    let second = pending.await.unwrap();
    assert!(!second.ready);
    assert_eq!(second.package_path, None);
    assert_eq!(second.interpreter_path, None);
    assert!(!provisioner.python_layer().contains_key("PYTHONPATH"));
}

#[cfg(unix)]
#[tokio::test]
async fn abandoned_venv_build_still_times_out() {
    use std::os::unix::fs::PermissionsExt;

    let source = tempfile::tempdir().unwrap();
    let tools = tempfile::tempdir().unwrap();
    let python = tools.path().join("python3");
    std::fs::write(&python, "#!/bin/sh\necho $$ > \"$0.pid\"\nexec sleep 5\n").unwrap();
    std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();

    let provisioner = Provisioner::new(ProvisionerSettings {
        system_python: Some(python.clone()),
        timeouts: ProvisionTimeouts {
            venv_create: Duration::from_millis(300),
            ..ProvisionTimeouts::default()
        },
        ..ProvisionerSettings::default()
    });
    let mut events = provisioner.subscribe();

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), provisioner.ensure_ready(source.path()))
            .await;
    assert!(abandoned.is_err());

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(provisioner.phase(), Phase::Failed);
    let status = provisioner.status();
    assert!(status.error.as_deref().unwrap().contains("timed out"));
    assert_eq!(
        drain(&mut events).last(),
        Some(&ProvisionEvent::Failed(status.error.clone().unwrap()))
    );

    let pid = std::fs::read_to_string(tools.path().join("python3.pid")).unwrap();
    let pid = pid.trim();
    if cfg!(target_os = "linux") {
        assert!(!std::path::Path::new("/proc").join(pid).exists(), "venv build {pid} still running");
    }
}
