//! In-process isolation boundaries: each host is a dedicated worker thread with its own
//! service, context, resolution policy and (optionally) shadow-copy directory.

use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, warn};
use serde_json::Value;

use crate::client::{Host, HostClient, HostFactory, Teardown};
use crate::config::{CanonicalConfig, HostTimeouts};
use crate::resolve::{ConfigResolver, DependencyResolver, ResolutionBridge, ShadowStore};
use crate::service::{HostService, LocalHostService, ServiceCall};
use crate::workload::{ContextInfo, EventSink, HostEvent, WorkloadRegistry};
use crate::{HostError, ServiceError};

const WORKER_JOIN_TICK: Duration = Duration::from_millis(5);

/// Creates [`BoundaryHost`]s that run the given workload registry.
#[derive(Clone)]
pub struct BoundaryHostFactory {
    registry: WorkloadRegistry,
    bridge: Option<Arc<dyn ResolutionBridge>>,
    timeouts: HostTimeouts,
    switch_working_dir: bool,
}

impl BoundaryHostFactory {
    pub fn new(registry: WorkloadRegistry) -> Self {
        Self {
            registry,
            bridge: None,
            timeouts: HostTimeouts::factory_managed(),
            switch_working_dir: false,
        }
    }

    /// Dependencies the boundary cannot find itself are asked of `bridge`.
    pub fn with_bridge(mut self, bridge: Arc<dyn ResolutionBridge>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn with_timeouts(mut self, timeouts: HostTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Switches the process working directory to the host's while it lives. The
    /// directory is process-wide, so only one such boundary should exist at a time.
    pub fn switch_working_dir(mut self, enabled: bool) -> Self {
        self.switch_working_dir = enabled;
        self
    }
}

impl HostFactory for BoundaryHostFactory {
    type Host = BoundaryHost;

    fn create_host_from(&self, config: CanonicalConfig) -> Result<BoundaryHost, HostError> {
        let name = config.channel_name().clone();

        let shadow = if config.shadow_copy() {
            let store = ShadowStore::temp().map_err(|e| HostError::creation("create shadow copy dir", e))?;
            Some(Arc::new(store))
        } else {
            None
        };
        let resolver: Arc<dyn DependencyResolver> = Arc::new(
            ConfigResolver::new(config.application_base_dir(), config.dependencies().to_vec())
                .with_bridge(self.bridge.clone())
                .with_shadow(shadow.clone()),
        );

        let service = LocalHostService::start(
            self.registry.clone(),
            ContextInfo::from_canonical(&config),
            resolver,
            Some(self.timeouts.watchdog),
        )
        .map_err(|e| HostError::creation("start boundary watchdog", e))?;

        let mut cleanup = BoundaryTeardown {
            service: service.clone(),
            jobs: Arc::new(Mutex::new(None)),
            worker: None,
            join_timeout: self.timeouts.join_before_abort,
            previous_dir: None,
            shadow,
        };

        if self.switch_working_dir {
            match switch_dir(config.working_dir()) {
                Ok(prev) => cleanup.previous_dir = Some(prev),
                Err(err) => {
                    Box::new(cleanup).teardown();
                    return Err(err);
                }
            }
        }

        let (tx, rx) = mpsc::channel::<Job>();
        let worker_service = service.clone();
        let worker = thread::Builder::new()
            .name(format!("isohost-boundary-{name}"))
            .spawn(move || worker_loop(worker_service, rx));
        match worker {
            Ok(handle) => {
                cleanup.worker = Some(handle);
                *lock_jobs(&cleanup.jobs) = Some(tx);
            }
            Err(err) => {
                Box::new(cleanup).teardown();
                return Err(HostError::creation("spawn boundary worker thread", err));
            }
        }

        let transport = Arc::new(BoundaryTransport {
            service: service.clone(),
            jobs: Arc::clone(&cleanup.jobs),
            call_timeout: self.timeouts.call,
        });
        let client = HostClient::new(
            name,
            transport,
            self.timeouts.heartbeat_interval,
            Some(Box::new(cleanup)),
        )?;
        debug!("boundary host {} ready", client.channel_name());

        Ok(BoundaryHost {
            client,
            service,
            working_dir: config.working_dir().to_path_buf(),
        })
    }
}

/// A host running on a dedicated thread of the current process.
pub struct BoundaryHost {
    client: HostClient,
    service: LocalHostService,
    working_dir: PathBuf,
}

impl BoundaryHost {
    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// True if the boundary disposed itself because heartbeats stopped.
    pub fn watchdog_expired(&self) -> bool {
        self.service.watchdog_expired()
    }
}

impl Host for BoundaryHost {
    fn client(&self) -> &HostClient {
        &self.client
    }
}

enum WorkerMsg {
    Event(HostEvent),
    Reply(Result<Value, ServiceError>),
}

struct Job {
    call: ServiceCall,
    out: mpsc::Sender<WorkerMsg>,
}

fn worker_loop(service: LocalHostService, jobs: mpsc::Receiver<Job>) {
    for Job { call, out } in jobs {
        let events = out.clone();
        let mut sink = move |event: HostEvent| {
            let _ = events.send(WorkerMsg::Event(event));
        };
        let result = service.call(call, &mut sink);
        let _ = out.send(WorkerMsg::Reply(result));
    }
}

/// Supervisor side of a boundary. Pings and dispose go straight to the service so a busy
/// worker never delays them.
struct BoundaryTransport {
    service: LocalHostService,
    jobs: Arc<Mutex<Option<mpsc::Sender<Job>>>>,
    call_timeout: Option<Duration>,
}

impl HostService for BoundaryTransport {
    fn call(&self, call: ServiceCall, events: &mut dyn EventSink) -> Result<Value, ServiceError> {
        if matches!(call, ServiceCall::Ping | ServiceCall::Dispose) {
            return self.service.call(call, events);
        }

        let op = call.op_name();
        let (out_tx, out_rx) = mpsc::channel();
        {
            let jobs = lock_jobs(&self.jobs);
            let Some(tx) = jobs.as_ref() else {
                return Err(ServiceError::channel(op, "boundary worker has stopped"));
            };
            tx.send(Job { call, out: out_tx })
                .map_err(|_| ServiceError::channel(op, "boundary worker has stopped"))?;
        }

        let deadline = self.call_timeout.map(|t| Instant::now() + t);
        loop {
            let msg = match deadline {
                Some(deadline) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    match out_rx.recv_timeout(left) {
                        Ok(msg) => msg,
                        Err(mpsc::RecvTimeoutError::Timeout) => {
                            return Err(ServiceError::channel(op, "timed out waiting for boundary worker"))
                        }
                        Err(mpsc::RecvTimeoutError::Disconnected) => {
                            return Err(ServiceError::channel(op, "boundary worker dropped the call"))
                        }
                    }
                }
                None => out_rx
                    .recv()
                    .map_err(|_| ServiceError::channel(op, "boundary worker dropped the call"))?,
            };
            match msg {
                WorkerMsg::Event(event) => events.emit(event),
                WorkerMsg::Reply(result) => return result,
            }
        }
    }
}

struct BoundaryTeardown {
    service: LocalHostService,
    jobs: Arc<Mutex<Option<mpsc::Sender<Job>>>>,
    worker: Option<JoinHandle<()>>,
    join_timeout: Duration,
    previous_dir: Option<PathBuf>,
    shadow: Option<Arc<ShadowStore>>,
}

impl Teardown for BoundaryTeardown {
    fn teardown(self: Box<Self>) {
        let mut this = *self;
        let _ = this.service.dispose();
        lock_jobs(&this.jobs).take();

        if let Some(worker) = this.worker.take() {
            let deadline = Instant::now() + this.join_timeout;
            while !worker.is_finished() && Instant::now() < deadline {
                thread::sleep(WORKER_JOIN_TICK);
            }
            if worker.is_finished() {
                if worker.join().is_err() {
                    warn!("boundary worker thread panicked");
                }
            } else {
                warn!(
                    "boundary worker still busy after {:?}; detaching it",
                    this.join_timeout
                );
            }
        }

        if let Some(prev) = this.previous_dir.take() {
            if let Err(err) = std::env::set_current_dir(&prev) {
                warn!(
                    "failed to restore working directory {}: {err}",
                    prev.display()
                );
            }
        }
        if let Some(shadow) = this.shadow.take() {
            if let Err(err) = shadow.close() {
                warn!("failed to remove shadow copies: {err}");
            }
        }
    }
}

fn switch_dir(dir: &Path) -> Result<PathBuf, HostError> {
    let prev = std::env::current_dir()
        .map_err(|e| HostError::creation("read current working directory", e))?;
    std::env::set_current_dir(dir).map_err(|e| {
        HostError::creation(format!("switch working directory to {}", dir.display()), e)
    })?;
    Ok(prev)
}

fn lock_jobs(
    jobs: &Mutex<Option<mpsc::Sender<Job>>>,
) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Job>>> {
    jobs.lock().unwrap_or_else(|e| e.into_inner())
}
