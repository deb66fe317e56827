use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::Result;
use isohost_contracts::{BOOTSTRAP_BIN_NAME, ENV_BOOTSTRAP_BIN};

/// Finds the installed bootstrap: an explicit path, then `ISOHOST_BOOTSTRAP_BIN`, then a
/// sibling of the current executable, then `PATH`.
pub(crate) fn resolve_bootstrap_bin(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
        anyhow::bail!("bootstrap executable is missing or not executable: {}", path.display());
    }

    if let Some(raw) = std::env::var_os(ENV_BOOTSTRAP_BIN) {
        let Some(path) = resolve_executable(&raw) else {
            anyhow::bail!(
                "missing bootstrap executable {:?} (set by {ENV_BOOTSTRAP_BIN})",
                raw
            );
        };
        return Ok(path);
    }

    let sibling = resolve_sibling(BOOTSTRAP_BIN_NAME);
    if let Some(path) = sibling.filter(|p| is_executable(p)) {
        return Ok(path);
    }

    let Some(path) = resolve_executable(&OsString::from(BOOTSTRAP_BIN_NAME)) else {
        anyhow::bail!(
            "missing bootstrap executable {BOOTSTRAP_BIN_NAME:?} (expected next to the current executable or in PATH; set {ENV_BOOTSTRAP_BIN} to override)"
        );
    };
    Ok(path)
}

fn resolve_sibling(name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let dir = exe.parent()?;

    let sibling = dir.join(name);
    if sibling.is_file() {
        return Some(sibling);
    }
    // Test binaries live in target/<profile>/deps; the bins one level up.
    if dir.file_name().and_then(|n| n.to_str()) == Some("deps") {
        let sibling = dir.parent()?.join(name);
        if sibling.is_file() {
            return Some(sibling);
        }
    }
    None
}

fn resolve_executable(bin: &OsString) -> Option<PathBuf> {
    let bin_path = PathBuf::from(bin);
    if bin_path.components().count() > 1 {
        return is_executable(&bin_path).then_some(bin_path);
    }

    let path_env = std::env::var_os("PATH")?;
    std::env::split_paths(&path_env)
        .map(|dir| dir.join(&bin_path))
        .find(|cand| is_executable(cand))
}

pub(crate) fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt as _;

    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_missing_path_fails_fast() {
        let err = resolve_bootstrap_bin(Some(Path::new("/definitely/not/here/isohost-bootstrap")))
            .unwrap_err();
        assert!(err.to_string().contains("missing or not executable"), "{err}");
    }

    #[test]
    fn explicit_path_must_be_executable() {
        let dir = tempfile::tempdir().unwrap();
        let plain = dir.path().join("plain");
        std::fs::write(&plain, b"#!/bin/sh\n").unwrap();
        assert!(!is_executable(&plain));
        assert!(resolve_bootstrap_bin(Some(&plain)).is_err());

        use std::os::unix::fs::PermissionsExt as _;
        std::fs::set_permissions(&plain, std::fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(resolve_bootstrap_bin(Some(&plain)).unwrap(), plain);
    }
}
