//! On-disk layout of bundled runtimes and virtual environments

use std::path::{Path, PathBuf};

/// Interpreter inside a virtual environment.
#[must_use]
pub fn venv_interpreter(venv_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts").join("python.exe")
    } else {
        venv_dir.join("bin").join("python")
    }
}

/// Interpreter inside an extracted distribution runtime.
#[must_use]
pub fn bundled_interpreter(python_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        python_dir.join("python.exe")
    } else {
        python_dir.join("bin").join("python3")
    }
}

/// Interpreter names tried when looking for a system Python.
#[must_use]
pub const fn system_interpreter_names() -> &'static [&'static str] {
    if cfg!(windows) {
        &["python", "py", "python3"]
    } else {
        &["python3", "python"]
    }
}

/// Locate `site-packages` inside a virtual environment.
///
/// On POSIX the `pythonX.Y` directory is discovered by listing `lib/`, since
/// the venv interpreter version may differ from the system one.
#[must_use]
pub fn venv_site_packages(venv_dir: &Path) -> Option<PathBuf> {
    if cfg!(windows) {
        let site = venv_dir.join("Lib").join("site-packages");
        return site.is_dir().then_some(site);
    }

    let lib = venv_dir.join("lib");
    std::fs::read_dir(&lib)
        .ok()?
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let name = entry.file_name();
            let version = name.to_str()?.strip_prefix("python")?;
            let site = entry.path().join("site-packages");
            site.is_dir().then(|| (parse_version(version), site))
        })
        .max_by_key(|(version, _)| *version)
        .map(|(_, site)| site)
}

/// A pre-extracted interpreter plus its package directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundledRuntime {
    pub interpreter: PathBuf,
    pub site_packages: PathBuf,
}

/// Detect a usable bundled runtime under `root`.
///
/// Expects `root/python` and `root/python-site-packages`. The package
/// directory is accepted when it carries `marker`, or failing that when
/// every package in `required` is present.
#[must_use]
pub fn detect_bundled(root: &Path, marker: &str, required: &[String]) -> Option<BundledRuntime> {
    let interpreter = bundled_interpreter(&root.join("python"));
    let site_packages = root.join("python-site-packages");

    if !interpreter.is_file() || !site_packages.is_dir() {
        tracing::debug!(root = %root.display(), "no bundled runtime");
        return None;
    }

    let has_marker = site_packages.join(marker).exists();
    let has_packages =
        !required.is_empty() && required.iter().all(|pkg| site_packages.join(pkg).is_dir());

    if has_marker || has_packages {
        Some(BundledRuntime {
            interpreter,
            site_packages,
        })
    } else {
        tracing::warn!(
            site_packages = %site_packages.display(),
            "bundled packages incomplete: no marker and required packages missing"
        );
        None
    }
}

/// Parse `Python 3.12.1` style output into `(major, minor)`.
#[must_use]
pub fn parse_version(output: &str) -> Option<(u32, u32)> {
    let version = output
        .split_whitespace()
        .find(|word| word.starts_with(|c: char| c.is_ascii_digit()))?;
    let mut parts = version.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts
        .next()?
        .chars()
        .take_while(char::is_ascii_digit)
        .collect::<String>()
        .parse()
        .ok()?;
    Some((major, minor))
}
