//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use agent_host::core::process::{CommandRunner, ProcessOutput, ProcessSpec, Termination};
use agent_host::core::python::layout;

type Behavior = dyn Fn(&ProcessSpec) -> ProcessOutput + Send + Sync;

/// Runner that never starts a process. Counts and records every call and
/// answers from `behavior` after `delay`.
pub struct CountingRunner {
    calls: AtomicUsize,
    specs: Mutex<Vec<ProcessSpec>>,
    delay: Duration,
    behavior: Box<Behavior>,
}

impl CountingRunner {
    pub fn new<F>(behavior: F) -> Arc<Self>
    where
        F: Fn(&ProcessSpec) -> ProcessOutput + Send + Sync + 'static,
    {
        Self::with_delay(Duration::ZERO, behavior)
    }

    pub fn with_delay<F>(delay: Duration, behavior: F) -> Arc<Self>
    where
        F: Fn(&ProcessSpec) -> ProcessOutput + Send + Sync + 'static,
    {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
            delay,
            behavior: Box::new(behavior),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn labels(&self) -> Vec<String> {
        self.specs.lock().iter().map(|s| s.label.clone()).collect()
    }

    pub fn specs(&self) -> Vec<ProcessSpec> {
        self.specs.lock().clone()
    }
}

#[async_trait]
impl CommandRunner for CountingRunner {
    async fn run(&self, spec: ProcessSpec) -> ProcessOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().push(spec.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.behavior)(&spec)
    }

    fn kill_all(&self) -> usize {
        0
    }

    fn live_count(&self) -> usize {
        0
    }
}

pub fn exited(code: i32, stdout: &str, stderr: &str) -> ProcessOutput {
    ProcessOutput {
        termination: Termination::Exited,
        exit_code: Some(code),
        stdout: stdout.to_string(),
        stderr: stderr.to_string(),
        error: None,
        duration: Duration::from_millis(1),
    }
}

pub fn ok() -> ProcessOutput {
    exited(0, "", "")
}

pub fn timed_out() -> ProcessOutput {
    ProcessOutput {
        termination: Termination::TimedOut,
        exit_code: None,
        stdout: String::new(),
        stderr: String::new(),
        error: None,
        duration: Duration::from_secs(120),
    }
}

/// Lay out a virtual environment the way `python -m venv` would.
pub fn make_venv(dir: &Path) {
    let interpreter = layout::venv_interpreter(dir);
    std::fs::create_dir_all(interpreter.parent().unwrap()).unwrap();
    std::fs::write(&interpreter, "").unwrap();
    let site = if cfg!(windows) {
        dir.join("Lib").join("site-packages")
    } else {
        dir.join("lib").join("python3.12").join("site-packages")
    };
    std::fs::create_dir_all(site).unwrap();
}

/// Fake interpreter: builds the venv on request, reports `version`, and
/// answers import checks with `imports_ok`.
pub fn python_behavior(
    version: &'static str,
    imports_ok: impl Fn(&str) -> bool + Send + Sync + 'static,
) -> impl Fn(&ProcessSpec) -> ProcessOutput + Send + Sync + 'static {
    move |spec: &ProcessSpec| match spec.label.as_str() {
        "venv-create" => {
            let dir = spec.args.last().unwrap();
            make_venv(Path::new(dir));
            ok()
        }
        "version-check" => exited(0, version, ""),
        "dependency-check" => {
            let script = spec.args.get(1).map(String::as_str).unwrap_or_default();
            if imports_ok(script) {
                ok()
            } else {
                exited(1, "", "ModuleNotFoundError: No module named 'claude_agent_sdk'")
            }
        }
        _ => ok(),
    }
}
