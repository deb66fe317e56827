use std::io;
use std::os::unix::ffi::OsStrExt as _;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use isohost_contracts::{
    BOOTSTRAP_BIN_NAME, BOOTSTRAP_CONFIG_SUFFIX, CHANNEL_SOCKET_FILE, ENV_ARTIFACT_DIR,
    HOST_RECORD_FILE, HOST_RECORD_SCHEMA_VERSION, SHADOW_DIR_NAME,
};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::BootstrapConfig;
use crate::sys::{hard_kill_pid_and_group, pid_alive};
use crate::{ChannelName, HostError};

pub fn default_artifact_root() -> PathBuf {
    match std::env::var_os(ENV_ARTIFACT_DIR) {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => std::env::temp_dir().join("isohost"),
    }
}

/// Ownership marker written into each artifact directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub schema_version: String,
    pub channel_name: String,
    pub owner_pid: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_pid: Option<u32>,
    /// Set when the socket lives outside the artifact directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
    pub created_unix_ms: u64,
}

/// Where the channel socket of a host under `root` can be bound. Prefers the artifact
/// directory; falls back to `<temp>/<channel>.sock` when that path is too long for
/// `sun_path`.
pub(crate) fn socket_path_for(root: &Path, channel: &ChannelName) -> Result<PathBuf, HostError> {
    pick_socket_path(root, &std::env::temp_dir(), channel)
}

fn pick_socket_path(root: &Path, fallback_dir: &Path, channel: &ChannelName) -> Result<PathBuf, HostError> {
    let local = root.join(channel.as_str()).join(CHANNEL_SOCKET_FILE);
    if socket_path_fits(&local) {
        return Ok(local);
    }
    let fallback = fallback_dir.join(format!("{channel}.sock"));
    if socket_path_fits(&fallback) {
        debug!(
            "socket path {} is too long; using {}",
            local.display(),
            fallback.display()
        );
        return Ok(fallback);
    }
    Err(HostError::Validation(format!(
        "no usable channel socket path: {} and {} both exceed the {}-byte unix socket path limit",
        local.display(),
        fallback.display(),
        sun_path_capacity() - 1
    )))
}

fn sun_path_capacity() -> usize {
    // SAFETY: sockaddr_un is plain old data; all-zero is a valid value.
    let addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    addr.sun_path.len()
}

fn socket_path_fits(path: &Path) -> bool {
    path.as_os_str().as_bytes().len() < sun_path_capacity()
}

/// The private directory of one process host: copied bootstrap, generated config, host
/// record, channel socket. Named after the channel, so it is unique per host.
#[derive(Debug)]
pub(crate) struct ArtifactProfile {
    dir: PathBuf,
    bootstrap: PathBuf,
    socket: PathBuf,
}

impl ArtifactProfile {
    pub(crate) fn create(root: &Path, channel: &ChannelName, bootstrap_src: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)
            .with_context(|| format!("create artifact root: {}", root.display()))?;
        let dir = root.join(channel.as_str());
        std::fs::create_dir(&dir)
            .with_context(|| format!("create host artifact dir: {}", dir.display()))?;

        let profile = ArtifactProfile {
            bootstrap: dir.join(BOOTSTRAP_BIN_NAME),
            socket: dir.join(CHANNEL_SOCKET_FILE),
            dir,
        };
        if let Err(err) = std::fs::copy(bootstrap_src, &profile.bootstrap) {
            let _ = profile.remove();
            return Err(err).with_context(|| {
                format!(
                    "copy bootstrap {} -> {}",
                    bootstrap_src.display(),
                    profile.bootstrap.display()
                )
            });
        }
        Ok(profile)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    pub(crate) fn bootstrap(&self) -> &Path {
        &self.bootstrap
    }

    /// Binds the channel somewhere other than the artifact directory.
    pub(crate) fn with_socket_path(mut self, socket: PathBuf) -> Self {
        self.socket = socket;
        self
    }

    pub(crate) fn socket_path(&self) -> &Path {
        &self.socket
    }

    /// The socket path when it lives outside the artifact directory.
    pub(crate) fn external_socket(&self) -> Option<&Path> {
        (!self.socket.starts_with(&self.dir)).then_some(self.socket.as_path())
    }

    pub(crate) fn shadow_dir(&self) -> PathBuf {
        self.dir.join(SHADOW_DIR_NAME)
    }

    pub(crate) fn config_path(&self) -> PathBuf {
        let mut name = self.bootstrap.as_os_str().to_os_string();
        name.push(BOOTSTRAP_CONFIG_SUFFIX);
        PathBuf::from(name)
    }

    pub(crate) fn write_config(&self, config: &BootstrapConfig) -> Result<()> {
        write_json(&self.config_path(), config)
    }

    pub(crate) fn write_record(&self, record: &HostRecord) -> Result<()> {
        write_json(&self.dir.join(HOST_RECORD_FILE), record)
    }

    pub(crate) fn remove(&self) -> io::Result<()> {
        if let Some(socket) = self.external_socket() {
            remove_if_exists(std::fs::remove_file(socket))?;
        }
        remove_if_exists(std::fs::remove_dir_all(&self.dir))
    }
}

fn remove_if_exists(res: io::Result<()>) -> io::Result<()> {
    match res {
        Err(err) if err.kind() != io::ErrorKind::NotFound => Err(err),
        _ => Ok(()),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).context("encode JSON")?;
    bytes.push(b'\n');
    std::fs::write(path, &bytes).with_context(|| format!("write {}", path.display()))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub removed: usize,
    pub killed: usize,
}

/// Removes artifact directories left behind by supervisors that no longer exist, killing
/// their bootstraps if still running. Directories without a readable record are skipped.
pub fn sweep_stale_artifacts(root: &Path) -> SweepReport {
    let mut report = SweepReport::default();
    let Ok(entries) = std::fs::read_dir(root) else {
        return report;
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let Ok(bytes) = std::fs::read(path.join(HOST_RECORD_FILE)) else {
            continue;
        };
        let Ok(record) = serde_json::from_slice::<HostRecord>(&bytes) else {
            continue;
        };
        if record.schema_version != HOST_RECORD_SCHEMA_VERSION || pid_alive(record.owner_pid) {
            continue;
        }

        if let Some(child) = record.child_pid.filter(|pid| pid_alive(*pid)) {
            hard_kill_pid_and_group(child);
            report.killed += 1;
        }
        if let Some(socket) = record.socket_path.filter(|s| !s.starts_with(&path)) {
            let _ = std::fs::remove_file(socket);
        }
        if std::fs::remove_dir_all(&path).is_ok() {
            debug!("swept stale host artifacts {}", path.display());
            report.removed += 1;
        }
    }
    report
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Arc;

    use super::*;
    use crate::sys::now_unix_ms;

    fn fake_bootstrap(dir: &Path) -> PathBuf {
        let p = dir.join("src-bootstrap");
        std::fs::write(&p, b"#!/bin/sh\nexit 0\n").unwrap();
        p
    }

    #[test]
    fn create_copies_bootstrap_and_remove_deletes_everything() {
        let root = tempfile::tempdir().unwrap();
        let src = fake_bootstrap(root.path());
        let channel = ChannelName::generate();

        let profile = ArtifactProfile::create(&root.path().join("hosts"), &channel, &src).unwrap();
        assert_eq!(profile.dir(), root.path().join("hosts").join(channel.as_str()));
        assert!(profile.bootstrap().is_file());
        assert!(profile
            .config_path()
            .to_string_lossy()
            .ends_with("isohost-bootstrap.config.json"));

        profile.remove().unwrap();
        assert!(!profile.dir().exists());
        profile.remove().unwrap();
    }

    #[test]
    fn failed_copy_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let channel = ChannelName::generate();
        let err = ArtifactProfile::create(root.path(), &channel, &root.path().join("missing"))
            .unwrap_err();
        assert!(format!("{err:#}").contains("copy bootstrap"));
        assert!(!root.path().join(channel.as_str()).exists());
    }

    #[test]
    fn concurrent_creations_get_distinct_directories() {
        let root = Arc::new(tempfile::tempdir().unwrap());
        let src = Arc::new(fake_bootstrap(root.path()));
        let handles: Vec<_> = (0..128)
            .map(|_| {
                let root = Arc::clone(&root);
                let src = Arc::clone(&src);
                std::thread::spawn(move || {
                    let channel = ChannelName::generate();
                    let p = ArtifactProfile::create(&root.path().join("hosts"), &channel, &src)
                        .unwrap();
                    p.dir().to_path_buf()
                })
            })
            .collect();
        let dirs: BTreeSet<PathBuf> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(dirs.len(), 128);
    }

    #[test]
    fn sweep_removes_only_orphaned_dirs() {
        let root = tempfile::tempdir().unwrap();
        let src = fake_bootstrap(root.path());
        let hosts = root.path().join("hosts");

        let live = ArtifactProfile::create(&hosts, &ChannelName::generate(), &src).unwrap();
        live.write_record(&HostRecord {
            schema_version: HOST_RECORD_SCHEMA_VERSION.to_string(),
            channel_name: "live".to_string(),
            owner_pid: std::process::id(),
            child_pid: None,
            socket_path: None,
            created_unix_ms: now_unix_ms(),
        })
        .unwrap();

        let orphan = ArtifactProfile::create(&hosts, &ChannelName::generate(), &src).unwrap();
        let stray_socket = root.path().join("orphan.sock");
        std::fs::write(&stray_socket, b"").unwrap();
        orphan
            .write_record(&HostRecord {
                schema_version: HOST_RECORD_SCHEMA_VERSION.to_string(),
                channel_name: "orphan".to_string(),
                owner_pid: u32::MAX,
                child_pid: None,
                socket_path: Some(stray_socket.clone()),
                created_unix_ms: 0,
            })
            .unwrap();

        let unmarked = ArtifactProfile::create(&hosts, &ChannelName::generate(), &src).unwrap();

        let report = sweep_stale_artifacts(&hosts);
        assert_eq!(report, SweepReport { removed: 1, killed: 0 });
        assert!(live.dir().exists());
        assert!(!orphan.dir().exists());
        assert!(!stray_socket.exists());
        assert!(unmarked.dir().exists());
    }

    #[test]
    fn socket_stays_in_short_artifact_dirs() {
        let root = Path::new("/tmp/isohost");
        let channel = ChannelName::parse("isohost-0123456789abcdef").unwrap();
        assert_eq!(
            pick_socket_path(root, Path::new("/tmp"), &channel).unwrap(),
            root.join("isohost-0123456789abcdef").join(CHANNEL_SOCKET_FILE)
        );
    }

    #[test]
    fn long_artifact_roots_fall_back_to_a_short_socket_path() {
        let root = PathBuf::from("/tmp").join("a".repeat(120));
        let channel = ChannelName::parse("isohost-0123456789abcdef").unwrap();
        assert_eq!(
            pick_socket_path(&root, Path::new("/tmp"), &channel).unwrap(),
            PathBuf::from("/tmp/isohost-0123456789abcdef.sock")
        );

        let err = pick_socket_path(&root, &root, &channel).unwrap_err();
        assert!(matches!(err, HostError::Validation(_)), "{err}");
    }

    #[test]
    fn remove_deletes_an_external_socket() {
        let root = tempfile::tempdir().unwrap();
        let src = fake_bootstrap(root.path());
        let socket = root.path().join("elsewhere.sock");
        std::fs::write(&socket, b"").unwrap();

        let profile = ArtifactProfile::create(&root.path().join("hosts"), &ChannelName::generate(), &src)
            .unwrap()
            .with_socket_path(socket.clone());
        assert_eq!(profile.external_socket(), Some(socket.as_path()));
        profile.remove().unwrap();
        assert!(!socket.exists());
        assert!(!profile.dir().exists());
    }
}
