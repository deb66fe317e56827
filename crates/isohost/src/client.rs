use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, warn};
use serde_json::Value;

use crate::config::{CanonicalConfig, HostConfig};
use crate::heartbeat::Heartbeat;
use crate::service::{HostService, ObjectRef};
use crate::workload::{EventSink, NullSink, RuntimeSetup};
use crate::{ChannelName, HostError, ServiceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostState {
    Created,
    Ready,
    Busy,
    Disposing,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Created,
    Ready,
    Disposing,
    Disposed,
}

/// Releases what a host owns outside its service: a process, artifacts, a worker thread.
pub trait Teardown: Send {
    fn teardown(self: Box<Self>);
}

struct ClientState {
    phase: Phase,
    busy: usize,
    heartbeat: Option<Heartbeat>,
}

/// Supervisor-side handle on a host service.
///
/// Owns the heartbeat timer and the host's [`Teardown`]. Every operation fails with
/// [`HostError::Disposed`] once [`HostClient::dispose`] has started; concurrent disposers
/// block until the first one finishes.
pub struct HostClient {
    name: ChannelName,
    service: Arc<dyn HostService>,
    state: Mutex<ClientState>,
    cond: Condvar,
    teardown: Mutex<Option<Box<dyn Teardown>>>,
}

struct CallGuard<'a> {
    client: &'a HostClient,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        let mut st = self.client.lock_state();
        st.busy = st.busy.saturating_sub(1);
        self.client.cond.notify_all();
    }
}

impl HostClient {
    /// Wraps `service`; starts the heartbeat when an interval is given. On failure the
    /// service is disposed and `teardown` runs before the error is returned.
    pub fn new(
        name: ChannelName,
        service: Arc<dyn HostService>,
        heartbeat_interval: Option<Duration>,
        teardown: Option<Box<dyn Teardown>>,
    ) -> Result<Self, HostError> {
        let client = HostClient {
            name,
            service,
            state: Mutex::new(ClientState {
                phase: Phase::Created,
                busy: 0,
                heartbeat: None,
            }),
            cond: Condvar::new(),
            teardown: Mutex::new(teardown),
        };

        if let Some(interval) = heartbeat_interval {
            let service = Arc::clone(&client.service);
            match Heartbeat::start(client.name.as_str(), interval, move || {
                service.ping().map_err(HostError::from)
            }) {
                Ok(hb) => client.lock_state().heartbeat = Some(hb),
                Err(err) => {
                    client.dispose();
                    return Err(HostError::creation("start heartbeat timer", err));
                }
            }
        }

        client.lock_state().phase = Phase::Ready;
        debug!("host {} ready", client.name);
        Ok(client)
    }

    pub fn channel_name(&self) -> &ChannelName {
        &self.name
    }

    pub fn state(&self) -> HostState {
        let st = self.lock_state();
        match st.phase {
            Phase::Created => HostState::Created,
            Phase::Ready if st.busy > 0 => HostState::Busy,
            Phase::Ready => HostState::Ready,
            Phase::Disposing => HostState::Disposing,
            Phase::Disposed => HostState::Disposed,
        }
    }

    pub fn is_disposed(&self) -> bool {
        matches!(self.lock_state().phase, Phase::Disposing | Phase::Disposed)
    }

    pub fn ping(&self) -> Result<(), HostError> {
        self.run(|svc| svc.ping())
    }

    pub fn create_instance(&self, module: &str, type_name: &str) -> Result<ObjectRef, HostError> {
        self.run(|svc| svc.create_instance(module, type_name))
    }

    pub fn invoke_method(&self, object: ObjectRef, method: &str, args: Value) -> Result<Value, HostError> {
        self.run(|svc| svc.invoke_method(object, method, args, &mut NullSink))
    }

    pub fn invoke_method_with_events(
        &self,
        object: ObjectRef,
        method: &str,
        args: Value,
        events: &mut dyn EventSink,
    ) -> Result<Value, HostError> {
        self.run(|svc| svc.invoke_method(object, method, args, events))
    }

    pub fn release_instance(&self, object: ObjectRef) -> Result<(), HostError> {
        self.run(|svc| svc.release_instance(object))
    }

    pub fn invoke_callback(&self, name: &str, args: Value) -> Result<Value, HostError> {
        self.run(|svc| svc.invoke_callback(name, args, &mut NullSink))
    }

    pub fn invoke_callback_with_events(
        &self,
        name: &str,
        args: Value,
        events: &mut dyn EventSink,
    ) -> Result<Value, HostError> {
        self.run(|svc| svc.invoke_callback(name, args, events))
    }

    pub fn initialize_workload_runtime(&self, setup: RuntimeSetup) -> Result<(), HostError> {
        self.run(|svc| svc.initialize_workload_runtime(setup))
    }

    pub fn shutdown_workload_runtime(&self) -> Result<(), HostError> {
        self.run(|svc| svc.shutdown_workload_runtime())
    }

    /// Idempotent. Stops the heartbeat, asks the service to dispose (tolerating a severed
    /// channel), then runs the teardown.
    pub fn dispose(&self) {
        let heartbeat = {
            let mut st = self.lock_state();
            loop {
                match st.phase {
                    Phase::Disposed => return,
                    Phase::Disposing => {
                        st = self
                            .cond
                            .wait(st)
                            .unwrap_or_else(|e| e.into_inner());
                    }
                    Phase::Created | Phase::Ready => break,
                }
            }
            st.phase = Phase::Disposing;
            st.heartbeat.take()
        };
        debug!("host {} disposing", self.name);

        if let Some(mut hb) = heartbeat {
            hb.stop();
        }

        match self.service.dispose() {
            Ok(()) => {}
            Err(ServiceError::Channel(msg)) => {
                debug!("host {} channel already severed during dispose: {msg}", self.name)
            }
            Err(ServiceError::Disposed) => {}
            Err(err) => warn!("host {} dispose call failed: {err}", self.name),
        }

        let teardown = self
            .teardown
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(teardown) = teardown {
            teardown.teardown();
        }

        let mut st = self.lock_state();
        st.phase = Phase::Disposed;
        self.cond.notify_all();
        debug!("host {} disposed", self.name);
    }

    fn run<T>(
        &self,
        f: impl FnOnce(&dyn HostService) -> Result<T, ServiceError>,
    ) -> Result<T, HostError> {
        let _guard = self.begin()?;
        match f(self.service.as_ref()) {
            Ok(v) => Ok(v),
            Err(_) if self.is_disposed() => Err(HostError::Disposed),
            Err(err) => Err(HostError::from(err)),
        }
    }

    fn begin(&self) -> Result<CallGuard<'_>, HostError> {
        let mut st = self.lock_state();
        if !matches!(st.phase, Phase::Ready) {
            return Err(HostError::Disposed);
        }
        st.busy += 1;
        Ok(CallGuard { client: self })
    }

    fn lock_state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for HostClient {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A live isolated context. All operations delegate to the host's [`HostClient`].
pub trait Host: Send + Sync {
    fn client(&self) -> &HostClient;

    fn channel_name(&self) -> &ChannelName {
        self.client().channel_name()
    }

    fn state(&self) -> HostState {
        self.client().state()
    }

    fn ping(&self) -> Result<(), HostError> {
        self.client().ping()
    }

    fn create_instance(&self, module: &str, type_name: &str) -> Result<ObjectRef, HostError> {
        self.client().create_instance(module, type_name)
    }

    fn invoke_method(&self, object: ObjectRef, method: &str, args: Value) -> Result<Value, HostError> {
        self.client().invoke_method(object, method, args)
    }

    fn release_instance(&self, object: ObjectRef) -> Result<(), HostError> {
        self.client().release_instance(object)
    }

    fn invoke_callback(&self, name: &str, args: Value) -> Result<Value, HostError> {
        self.client().invoke_callback(name, args)
    }

    fn invoke_callback_with_events(
        &self,
        name: &str,
        args: Value,
        events: &mut dyn EventSink,
    ) -> Result<Value, HostError> {
        self.client().invoke_callback_with_events(name, args, events)
    }

    fn initialize_workload_runtime(&self, setup: RuntimeSetup) -> Result<(), HostError> {
        self.client().initialize_workload_runtime(setup)
    }

    fn shutdown_workload_runtime(&self) -> Result<(), HostError> {
        self.client().shutdown_workload_runtime()
    }

    fn dispose(&self) {
        self.client().dispose()
    }
}

/// Builds hosts. [`HostFactory::create_host`] canonicalizes against the current directory
/// before anything is created.
pub trait HostFactory {
    type Host: Host;

    fn create_host(&self, config: &HostConfig) -> Result<Self::Host, HostError> {
        let base = std::env::current_dir().map_err(|e| {
            HostError::Validation(format!("cannot determine current directory: {e}"))
        })?;
        let config = config.canonicalize_against(&base)?;
        self.create_host_from(config)
    }

    fn create_host_from(&self, config: CanonicalConfig) -> Result<Self::Host, HostError>;
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use serde_json::json;

    use super::*;
    use crate::resolve::NoResolver;
    use crate::service::{LocalHostService, ServiceCall};
    use crate::workload::{ContextInfo, WorkloadRegistry};

    struct CountingTeardown(Arc<AtomicUsize>);

    impl Teardown for CountingTeardown {
        fn teardown(self: Box<Self>) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn local_service() -> LocalHostService {
        let mut reg = WorkloadRegistry::new();
        reg.register_callback("echo", |_, args| Ok(args))
            .register_callback("sleep", |_, args| {
                thread::sleep(Duration::from_millis(args.as_u64().unwrap_or(0)));
                Ok(Value::Null)
            });
        let info = ContextInfo {
            channel_name: "isohost-client".to_string(),
            application_base_dir: PathBuf::from("/"),
            working_dir: PathBuf::from("/"),
            sections: json!({}),
            properties: Default::default(),
        };
        LocalHostService::start(reg, info, Arc::new(NoResolver), None).unwrap()
    }

    fn client(teardowns: &Arc<AtomicUsize>) -> HostClient {
        HostClient::new(
            ChannelName::parse("isohost-client").unwrap(),
            Arc::new(local_service()),
            Some(Duration::from_millis(10)),
            Some(Box::new(CountingTeardown(Arc::clone(teardowns)))),
        )
        .unwrap()
    }

    #[test]
    fn dispose_is_idempotent_and_runs_teardown_once() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let c = client(&teardowns);
        assert_eq!(c.state(), HostState::Ready);
        c.ping().unwrap();
        c.dispose();
        c.dispose();
        assert_eq!(c.state(), HostState::Disposed);
        drop(c);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn operations_after_dispose_fail_with_disposed() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let c = client(&teardowns);
        c.dispose();
        assert!(matches!(c.ping(), Err(HostError::Disposed)));
        assert!(matches!(
            c.invoke_callback("echo", json!(1)),
            Err(HostError::Disposed)
        ));
        assert!(matches!(
            c.create_instance("m", "T"),
            Err(HostError::Disposed)
        ));
        assert!(matches!(
            c.initialize_workload_runtime(RuntimeSetup::default()),
            Err(HostError::Disposed)
        ));
    }

    #[test]
    fn concurrent_dispose_with_pending_call() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let c = Arc::new(client(&teardowns));

        let caller = {
            let c = Arc::clone(&c);
            thread::spawn(move || c.invoke_callback("sleep", json!(200)))
        };
        thread::sleep(Duration::from_millis(50));
        assert_eq!(c.state(), HostState::Busy);

        let disposers: Vec<_> = (0..4)
            .map(|_| {
                let c = Arc::clone(&c);
                thread::spawn(move || c.dispose())
            })
            .collect();
        for d in disposers {
            d.join().unwrap();
        }
        assert_eq!(c.state(), HostState::Disposed);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);

        // The in-flight call either finished first or observes the disposal.
        match caller.join().unwrap() {
            Ok(_) | Err(HostError::Disposed) => {}
            Err(other) => panic!("unexpected {other}"),
        }
    }

    #[test]
    fn service_failures_keep_their_kind() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let c = client(&teardowns);
        let err = c.invoke_callback("missing", json!(null)).unwrap_err();
        assert!(matches!(
            err,
            HostError::Workload(ServiceError::UnknownCallback(_))
        ));
    }

    struct Severed;

    impl HostService for Severed {
        fn call(&self, call: ServiceCall, _: &mut dyn EventSink) -> Result<Value, ServiceError> {
            Err(ServiceError::channel(call.op_name(), "connection refused"))
        }
    }

    #[test]
    fn channel_failures_map_to_channel_and_dispose_tolerates_them() {
        let teardowns = Arc::new(AtomicUsize::new(0));
        let c = HostClient::new(
            ChannelName::parse("isohost-severed").unwrap(),
            Arc::new(Severed),
            Some(Duration::from_millis(5)),
            Some(Box::new(CountingTeardown(Arc::clone(&teardowns)))),
        )
        .unwrap();
        thread::sleep(Duration::from_millis(30));
        assert!(matches!(c.ping(), Err(HostError::Channel { .. })));
        c.dispose();
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }
}
