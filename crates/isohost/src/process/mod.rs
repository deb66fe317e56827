//! Process hosts: each host is a copy of the bootstrap executable running in its own
//! process group, reached over a Unix-domain socket in its artifact directory.

mod discover;
mod profile;
mod reaper;
mod task;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use isohost_contracts::{HOST_RECORD_SCHEMA_VERSION, IPC_FLAG};
use log::{debug, warn};

use crate::channel::IpcTransport;
use crate::client::{Host, HostClient, HostFactory, Teardown};
use crate::config::{BootstrapConfig, CanonicalConfig, HostTimeouts};
use crate::error::Diagnostics;
use crate::sys::now_unix_ms;
use crate::{HostError, ServiceError};

pub use profile::{default_artifact_root, sweep_stale_artifacts, HostRecord, SweepReport};

use profile::{socket_path_for, ArtifactProfile};
use task::ProcessTask;

const CONSOLE_SETTLE: Duration = Duration::from_millis(500);

/// Creates [`ProcessHost`]s from a canonical configuration.
#[derive(Debug, Clone)]
pub struct ProcessHostFactory {
    bootstrap_bin: Option<PathBuf>,
    artifact_root: PathBuf,
    timeouts: HostTimeouts,
}

impl Default for ProcessHostFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessHostFactory {
    /// Factory-managed timeouts and the default artifact root; nothing read from the
    /// environment beyond `ISOHOST_ARTIFACT_DIR`.
    pub fn new() -> Self {
        Self {
            bootstrap_bin: None,
            artifact_root: default_artifact_root(),
            timeouts: HostTimeouts::factory_managed(),
        }
    }

    /// Like [`ProcessHostFactory::new`], with `ISOHOST_*_MS` overrides applied and stale
    /// artifact directories swept.
    pub fn from_env() -> Result<Self, HostError> {
        let factory = Self {
            timeouts: HostTimeouts::factory_managed().with_env_overrides()?,
            ..Self::new()
        };
        let report = sweep_stale_artifacts(&factory.artifact_root);
        if report.removed > 0 {
            debug!(
                "swept {} stale host artifact dirs under {}",
                report.removed,
                factory.artifact_root.display()
            );
        }
        Ok(factory)
    }

    pub fn with_bootstrap_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.bootstrap_bin = Some(path.into());
        self
    }

    pub fn with_artifact_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.artifact_root = root.into();
        self
    }

    pub fn with_timeouts(mut self, timeouts: HostTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn artifact_root(&self) -> &Path {
        &self.artifact_root
    }

    fn launch(&self, config: &CanonicalConfig, profile: ArtifactProfile) -> Result<ProcessHost, HostError> {
        let name = config.channel_name().clone();
        let socket_path = profile.socket_path().to_path_buf();
        let shadow_dir = config.shadow_copy().then(|| profile.shadow_dir());
        let bootstrap_config = BootstrapConfig::from_canonical(
            config,
            &socket_path,
            shadow_dir.as_deref(),
            self.timeouts.watchdog,
            Some(std::process::id()),
        );
        profile
            .write_config(&bootstrap_config)
            .map_err(|e| HostError::creation("write bootstrap configuration", e))?;

        let args = vec![format!("--{IPC_FLAG}={name}")];
        let mut task = ProcessTask::spawn(
            name.as_str(),
            profile.bootstrap(),
            &args,
            config.working_dir(),
            config.properties(),
        )
        .map_err(|e| HostError::creation("launch bootstrap process", e))?;

        let record = HostRecord {
            schema_version: HOST_RECORD_SCHEMA_VERSION.to_string(),
            channel_name: name.to_string(),
            owner_pid: std::process::id(),
            child_pid: Some(task.pid()),
            socket_path: profile.external_socket().map(Path::to_path_buf),
            created_unix_ms: now_unix_ms(),
        };
        if let Err(err) = profile.write_record(&record) {
            abort_and_collect(&mut task, self.timeouts.join_after_abort);
            return Err(HostError::creation("write host record", err));
        }

        let transport = Arc::new(IpcTransport::new(
            socket_path,
            self.timeouts.ping,
            self.timeouts.call,
        ));
        if let Err(failure) = wait_until_ready(&mut task, &transport, &self.timeouts) {
            let diagnostics = abort_and_collect(&mut task, self.timeouts.join_after_abort);
            return Err(match failure {
                ReadyFailure::Exited(cause) => HostError::Creation {
                    message: format!("host process {name} exited before it became ready"),
                    diagnostics,
                    source: Some(Box::new(cause)),
                },
                ReadyFailure::TimedOut => HostError::StartupTimeout {
                    timeout: self.timeouts.startup,
                    diagnostics,
                },
            });
        }
        debug!("host {name} ready after startup (pid {})", task.pid());

        let pid = task.pid();
        let artifact_dir = profile.dir().to_path_buf();
        let task = Arc::new(Mutex::new(task));
        let teardown = ProcessTeardown {
            task: Arc::clone(&task),
            profile,
            join_before_abort: self.timeouts.join_before_abort,
            join_after_abort: self.timeouts.join_after_abort,
        };
        let client = HostClient::new(
            name,
            transport,
            self.timeouts.heartbeat_interval,
            Some(Box::new(teardown)),
        )?;

        Ok(ProcessHost {
            client,
            pid,
            artifact_dir,
            task,
        })
    }
}

impl HostFactory for ProcessHostFactory {
    type Host = ProcessHost;

    fn create_host_from(&self, config: CanonicalConfig) -> Result<ProcessHost, HostError> {
        let bootstrap = discover::resolve_bootstrap_bin(self.bootstrap_bin.as_deref())
            .map_err(|e| HostError::creation("bootstrap executable not found", e))?;
        let socket = socket_path_for(&self.artifact_root, config.channel_name())?;
        let profile = ArtifactProfile::create(&self.artifact_root, config.channel_name(), &bootstrap)
            .map_err(|e| HostError::creation("prepare host artifacts", e))?
            .with_socket_path(socket.clone());
        let dir = profile.dir().to_path_buf();

        // On success the profile moves into the host's teardown.
        self.launch(&config, profile).map_err(|err| {
            if !socket.starts_with(&dir) {
                let _ = std::fs::remove_file(&socket);
            }
            if let Err(rm) = std::fs::remove_dir_all(&dir) {
                if rm.kind() != std::io::ErrorKind::NotFound {
                    warn!("failed to remove artifacts of failed host {}: {rm}", dir.display());
                }
            }
            err
        })
    }
}

/// A host running in a separate bootstrap process.
pub struct ProcessHost {
    client: HostClient,
    pid: u32,
    artifact_dir: PathBuf,
    task: Arc<Mutex<ProcessTask>>,
}

impl ProcessHost {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    pub fn is_running(&self) -> bool {
        lock_task(&self.task).is_running()
    }

    /// Console output and exit status observed so far.
    pub fn diagnostics(&self) -> Diagnostics {
        lock_task(&self.task).diagnostics()
    }
}

impl Host for ProcessHost {
    fn client(&self) -> &HostClient {
        &self.client
    }
}

struct ProcessTeardown {
    task: Arc<Mutex<ProcessTask>>,
    profile: ArtifactProfile,
    join_before_abort: Duration,
    join_after_abort: Duration,
}

impl Teardown for ProcessTeardown {
    fn teardown(self: Box<Self>) {
        {
            let mut task = lock_task(&self.task);
            if !task.join(self.join_before_abort) {
                debug!(
                    "host pid {} still running after {:?}; killing",
                    task.pid(),
                    self.join_before_abort
                );
                task.abort();
                if !task.join(self.join_after_abort) {
                    warn!(
                        "host pid {} survived forced termination for {:?}; handing to reaper",
                        task.pid(),
                        self.join_after_abort
                    );
                    task.release_to_reaper();
                }
            }
            task.settle_console(CONSOLE_SETTLE);
        }
        if let Err(err) = self.profile.remove() {
            warn!(
                "failed to delete host artifacts {}: {err}",
                self.profile.dir().display()
            );
        }
    }
}

enum ReadyFailure {
    Exited(ServiceError),
    TimedOut,
}

/// Pings until the host answers. A dead process fails immediately; otherwise retries every
/// poll interval until the startup timeout.
fn wait_until_ready(
    task: &mut ProcessTask,
    transport: &IpcTransport,
    timeouts: &HostTimeouts,
) -> Result<(), ReadyFailure> {
    let deadline = Instant::now() + timeouts.startup;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(ReadyFailure::TimedOut);
        }
        let attempt = timeouts.ping.min(deadline - now);
        let err = match transport.ping_within(attempt) {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };
        if !task.is_running() {
            return Err(ReadyFailure::Exited(err));
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(ReadyFailure::TimedOut);
        }
        thread::sleep(timeouts.poll_interval.min(deadline - now));
    }
}

fn abort_and_collect(task: &mut ProcessTask, join_after_abort: Duration) -> Diagnostics {
    task.abort();
    if !task.join(join_after_abort) {
        task.release_to_reaper();
    }
    task.settle_console(CONSOLE_SETTLE);
    task.diagnostics()
}

fn lock_task(task: &Mutex<ProcessTask>) -> MutexGuard<'_, ProcessTask> {
    task.lock().unwrap_or_else(|e| e.into_inner())
}
