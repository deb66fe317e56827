use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, Weak};
use std::time::Duration;

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::resolve::DependencyResolver;
use crate::watchdog::Watchdog;
use crate::workload::{
    ContextInfo, EventSink, HostContext, HostedObject, NullSink, RuntimeSetup, WorkloadRegistry,
    WorkloadRuntime,
};
use crate::ServiceError;

/// Reference to an object created inside a context by `CreateInstance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(u64);

impl ObjectRef {
    pub fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServiceCall {
    Ping,
    CreateInstance {
        module: String,
        type_name: String,
    },
    InvokeMethod {
        object: ObjectRef,
        method: String,
        #[serde(default)]
        args: Value,
    },
    ReleaseInstance {
        object: ObjectRef,
    },
    InvokeCallback {
        name: String,
        #[serde(default)]
        args: Value,
    },
    InitializeWorkloadRuntime {
        #[serde(default)]
        setup: RuntimeSetup,
    },
    ShutdownWorkloadRuntime,
    Dispose,
}

impl ServiceCall {
    pub fn op_name(&self) -> &'static str {
        match self {
            ServiceCall::Ping => "ping",
            ServiceCall::CreateInstance { .. } => "create_instance",
            ServiceCall::InvokeMethod { .. } => "invoke_method",
            ServiceCall::ReleaseInstance { .. } => "release_instance",
            ServiceCall::InvokeCallback { .. } => "invoke_callback",
            ServiceCall::InitializeWorkloadRuntime { .. } => "initialize_workload_runtime",
            ServiceCall::ShutdownWorkloadRuntime => "shutdown_workload_runtime",
            ServiceCall::Dispose => "dispose",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ServiceReply {
    Ok {
        #[serde(default)]
        value: Value,
    },
    Err {
        error: ServiceError,
    },
}

impl From<Result<Value, ServiceError>> for ServiceReply {
    fn from(r: Result<Value, ServiceError>) -> Self {
        match r {
            Ok(value) => ServiceReply::Ok { value },
            Err(error) => ServiceReply::Err { error },
        }
    }
}

impl ServiceReply {
    pub fn into_result(self) -> Result<Value, ServiceError> {
        match self {
            ServiceReply::Ok { value } => Ok(value),
            ServiceReply::Err { error } => Err(error),
        }
    }
}

/// The contract an isolated context exposes to its supervisor.
///
/// Implementors provide [`HostService::call`]; the typed operations are built on it, so a
/// local service, a socket transport and a boundary proxy all share one surface.
pub trait HostService: Send + Sync {
    fn call(&self, call: ServiceCall, events: &mut dyn EventSink) -> Result<Value, ServiceError>;

    fn ping(&self) -> Result<(), ServiceError> {
        self.call(ServiceCall::Ping, &mut NullSink).map(|_| ())
    }

    fn create_instance(&self, module: &str, type_name: &str) -> Result<ObjectRef, ServiceError> {
        let value = self.call(
            ServiceCall::CreateInstance {
                module: module.to_string(),
                type_name: type_name.to_string(),
            },
            &mut NullSink,
        )?;
        serde_json::from_value(value).map_err(|e| ServiceError::channel("decode object reference", e))
    }

    fn invoke_method(
        &self,
        object: ObjectRef,
        method: &str,
        args: Value,
        events: &mut dyn EventSink,
    ) -> Result<Value, ServiceError> {
        self.call(
            ServiceCall::InvokeMethod {
                object,
                method: method.to_string(),
                args,
            },
            events,
        )
    }

    fn release_instance(&self, object: ObjectRef) -> Result<(), ServiceError> {
        self.call(ServiceCall::ReleaseInstance { object }, &mut NullSink)
            .map(|_| ())
    }

    fn invoke_callback(
        &self,
        name: &str,
        args: Value,
        events: &mut dyn EventSink,
    ) -> Result<Value, ServiceError> {
        self.call(
            ServiceCall::InvokeCallback {
                name: name.to_string(),
                args,
            },
            events,
        )
    }

    fn initialize_workload_runtime(&self, setup: RuntimeSetup) -> Result<(), ServiceError> {
        self.call(ServiceCall::InitializeWorkloadRuntime { setup }, &mut NullSink)
            .map(|_| ())
    }

    fn shutdown_workload_runtime(&self) -> Result<(), ServiceError> {
        self.call(ServiceCall::ShutdownWorkloadRuntime, &mut NullSink)
            .map(|_| ())
    }

    fn dispose(&self) -> Result<(), ServiceError> {
        self.call(ServiceCall::Dispose, &mut NullSink).map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisposeReason {
    Requested,
    WatchdogExpired,
    OwnerLost,
}

type DisposeHook = Box<dyn FnOnce(DisposeReason) + Send>;

/// The in-context implementation of [`HostService`].
#[derive(Clone)]
pub struct LocalHostService {
    inner: Arc<Inner>,
}

struct Inner {
    registry: WorkloadRegistry,
    resolver: Arc<dyn DependencyResolver>,
    state: Mutex<ServiceState>,
    watchdog: OnceLock<Watchdog>,
    disposed: AtomicBool,
    reason: Mutex<Option<DisposeReason>>,
    on_dispose: Mutex<Option<DisposeHook>>,
}

struct ServiceState {
    info: ContextInfo,
    runtime: Option<WorkloadRuntime>,
    objects: BTreeMap<u64, Box<dyn HostedObject>>,
    next_object: u64,
    released: bool,
}

impl ServiceState {
    fn release_all(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.objects.clear();
        if self.runtime.take().is_some() {
            debug!("workload runtime shut down with context {}", self.info.channel_name);
        }
    }
}

impl LocalHostService {
    /// Creates the service and, when `watchdog` is set, arms the expiry timer.
    pub fn start(
        registry: WorkloadRegistry,
        info: ContextInfo,
        resolver: Arc<dyn DependencyResolver>,
        watchdog: Option<Duration>,
    ) -> std::io::Result<Self> {
        let inner = Arc::new(Inner {
            registry,
            resolver,
            state: Mutex::new(ServiceState {
                info,
                runtime: None,
                objects: BTreeMap::new(),
                next_object: 1,
                released: false,
            }),
            watchdog: OnceLock::new(),
            disposed: AtomicBool::new(false),
            reason: Mutex::new(None),
            on_dispose: Mutex::new(None),
        });

        if let Some(timeout) = watchdog {
            let weak: Weak<Inner> = Arc::downgrade(&inner);
            let wd = Watchdog::start(timeout, move || {
                if let Some(inner) = weak.upgrade() {
                    warn!("no ping within {timeout:?}; host context disposing itself");
                    inner.dispose_because(DisposeReason::WatchdogExpired);
                }
            })?;
            let _ = inner.watchdog.set(wd);
        }

        Ok(LocalHostService { inner })
    }

    /// Registers a hook that runs once after disposal. Runs immediately if already disposed.
    pub fn set_on_dispose<F>(&self, hook: F)
    where
        F: FnOnce(DisposeReason) + Send + 'static,
    {
        if self.inner.disposed.load(Ordering::SeqCst) {
            hook(self.disposal_reason().unwrap_or(DisposeReason::Requested));
            return;
        }
        *lock(&self.inner.on_dispose) = Some(Box::new(hook));
        // Disposal may have raced with registration.
        if self.inner.disposed.load(Ordering::SeqCst) {
            if let Some(hook) = lock(&self.inner.on_dispose).take() {
                hook(self.disposal_reason().unwrap_or(DisposeReason::Requested));
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn disposal_reason(&self) -> Option<DisposeReason> {
        *lock(&self.inner.reason)
    }

    /// True when the context disposed itself because pings stopped arriving.
    pub fn watchdog_expired(&self) -> bool {
        self.inner
            .watchdog
            .get()
            .is_some_and(|wd| wd.has_expired())
    }

    pub fn dispose_because(&self, reason: DisposeReason) {
        self.inner.dispose_because(reason);
    }
}

impl Inner {
    fn dispose_because(&self, reason: DisposeReason) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        *lock(&self.reason) = Some(reason);
        debug!("host service disposing ({reason:?})");

        if let Some(wd) = self.watchdog.get() {
            wd.stop();
        }

        // A call still running keeps the lock; it releases the state on its way out.
        match self.state.try_lock() {
            Ok(mut st) => st.release_all(),
            Err(std::sync::TryLockError::Poisoned(e)) => e.into_inner().release_all(),
            Err(std::sync::TryLockError::WouldBlock) => {}
        }

        let hook = lock(&self.on_dispose).take();
        if let Some(hook) = hook {
            hook(reason);
        }
    }

    fn dispatch(
        &self,
        st: &mut ServiceState,
        call: ServiceCall,
        events: &mut dyn EventSink,
    ) -> Result<Value, ServiceError> {
        let ServiceState {
            info,
            runtime,
            objects,
            next_object,
            ..
        } = st;
        let mut ctx = HostContext::new(info, runtime, self.resolver.as_ref(), events);

        match call {
            ServiceCall::Ping | ServiceCall::Dispose => Ok(Value::Null),
            ServiceCall::CreateInstance { module, type_name } => {
                let ctor = self.registry.constructor(&module, &type_name).ok_or_else(|| {
                    ServiceError::UnknownType {
                        module: module.clone(),
                        type_name: type_name.clone(),
                    }
                })?;
                let obj = ctor(&mut ctx).map_err(ServiceError::Failed)?;
                let id = *next_object;
                *next_object += 1;
                objects.insert(id, obj);
                Ok(Value::from(id))
            }
            ServiceCall::InvokeMethod {
                object,
                method,
                args,
            } => {
                let obj = objects
                    .get_mut(&object.id())
                    .ok_or(ServiceError::UnknownObject(object.id()))?;
                obj.invoke(&mut ctx, &method, args)
                    .map_err(ServiceError::Failed)
            }
            ServiceCall::ReleaseInstance { object } => objects
                .remove(&object.id())
                .map(|_| Value::Null)
                .ok_or(ServiceError::UnknownObject(object.id())),
            ServiceCall::InvokeCallback { name, args } => {
                let cb = self
                    .registry
                    .callback(&name)
                    .ok_or_else(|| ServiceError::UnknownCallback(name.clone()))?;
                cb(&mut ctx, args).map_err(ServiceError::Failed)
            }
            ServiceCall::InitializeWorkloadRuntime { setup } => {
                let slot = ctx.runtime_slot();
                if slot.is_some() {
                    return Err(ServiceError::RuntimeAlreadyInitialized);
                }
                *slot = Some(WorkloadRuntime::new(setup));
                Ok(Value::Null)
            }
            ServiceCall::ShutdownWorkloadRuntime => {
                ctx.runtime_slot().take();
                Ok(Value::Null)
            }
        }
    }
}

impl HostService for LocalHostService {
    fn call(&self, call: ServiceCall, events: &mut dyn EventSink) -> Result<Value, ServiceError> {
        let inner = &self.inner;
        if inner.disposed.load(Ordering::SeqCst) {
            return Err(ServiceError::Disposed);
        }
        match call {
            ServiceCall::Ping => {
                if let Some(wd) = inner.watchdog.get() {
                    wd.ping();
                }
                return Ok(Value::Null);
            }
            ServiceCall::Dispose => {
                inner.dispose_because(DisposeReason::Requested);
                return Ok(Value::Null);
            }
            _ => {}
        }

        let op = call.op_name();
        let mut st = lock(&inner.state);
        if st.released {
            return Err(ServiceError::Disposed);
        }
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| inner.dispatch(&mut st, call, events)));
        let result = match outcome {
            Ok(r) => r,
            Err(payload) => {
                let msg = panic_message(payload.as_ref());
                warn!("workload panicked during {op}: {msg}");
                Err(ServiceError::Panicked(msg))
            }
        };
        if inner.disposed.load(Ordering::SeqCst) {
            st.release_all();
        }
        result
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::mpsc;

    use serde_json::json;

    use super::*;
    use crate::resolve::NoResolver;
    use crate::workload::HostEvent;

    fn info() -> ContextInfo {
        ContextInfo {
            channel_name: "isohost-svc".to_string(),
            application_base_dir: PathBuf::from("/app"),
            working_dir: PathBuf::from("/app"),
            sections: json!({}),
            properties: Default::default(),
        }
    }

    struct Counter(i64);

    impl HostedObject for Counter {
        fn invoke(&mut self, ctx: &mut HostContext<'_>, method: &str, args: Value) -> Result<Value, String> {
            match method {
                "add" => {
                    self.0 += args.as_i64().unwrap_or(1);
                    ctx.emit("counter.changed", json!(self.0));
                    Ok(json!(self.0))
                }
                "get" => Ok(json!(self.0)),
                other => Err(format!("no method {other}")),
            }
        }
    }

    fn registry() -> WorkloadRegistry {
        let mut reg = WorkloadRegistry::new();
        reg.register_callback("echo", |_, args| Ok(args))
            .register_callback("fail", |_, _| Err("workload said no".to_string()))
            .register_callback("panic", |_, _| panic!("boom"))
            .register_callback("runtime", |ctx, _| {
                Ok(json!(ctx.runtime().and_then(|r| r.setup().label.clone())))
            })
            .register_type("demo", "Counter", |_| Ok(Box::new(Counter(0))));
        reg
    }

    fn service(watchdog: Option<Duration>) -> LocalHostService {
        LocalHostService::start(registry(), info(), Arc::new(NoResolver), watchdog).unwrap()
    }

    #[test]
    fn callbacks_objects_and_events() {
        let svc = service(None);
        svc.ping().unwrap();
        assert_eq!(
            svc.invoke_callback("echo", json!({"a": 1}), &mut NullSink).unwrap(),
            json!({"a": 1})
        );
        assert_eq!(
            svc.invoke_callback("missing", json!(null), &mut NullSink),
            Err(ServiceError::UnknownCallback("missing".to_string()))
        );
        assert_eq!(
            svc.invoke_callback("fail", json!(null), &mut NullSink),
            Err(ServiceError::Failed("workload said no".to_string()))
        );

        let obj = svc.create_instance("demo", "Counter").unwrap();
        let mut seen: Vec<HostEvent> = Vec::new();
        let mut sink = |e: HostEvent| seen.push(e);
        svc.invoke_method(obj, "add", json!(5), &mut sink).unwrap();
        assert_eq!(svc.invoke_method(obj, "get", json!(null), &mut NullSink).unwrap(), json!(5));
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].kind, "counter.changed");

        svc.release_instance(obj).unwrap();
        assert_eq!(
            svc.release_instance(obj),
            Err(ServiceError::UnknownObject(obj.id()))
        );
        assert!(matches!(
            svc.create_instance("demo", "Nope"),
            Err(ServiceError::UnknownType { .. })
        ));
    }

    #[test]
    fn panics_are_contained_and_service_stays_usable() {
        let svc = service(None);
        match svc.invoke_callback("panic", json!(null), &mut NullSink) {
            Err(ServiceError::Panicked(msg)) => assert!(msg.contains("boom"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        svc.invoke_callback("echo", json!(1), &mut NullSink).unwrap();
    }

    #[test]
    fn runtime_init_and_shutdown_pair() {
        let svc = service(None);
        svc.shutdown_workload_runtime().unwrap();
        svc.initialize_workload_runtime(RuntimeSetup {
            label: Some("suite".to_string()),
            ..RuntimeSetup::default()
        })
        .unwrap();
        assert_eq!(
            svc.initialize_workload_runtime(RuntimeSetup::default()),
            Err(ServiceError::RuntimeAlreadyInitialized)
        );
        assert_eq!(
            svc.invoke_callback("runtime", json!(null), &mut NullSink).unwrap(),
            json!("suite")
        );
        svc.shutdown_workload_runtime().unwrap();
        assert_eq!(
            svc.invoke_callback("runtime", json!(null), &mut NullSink).unwrap(),
            json!(null)
        );
    }

    #[test]
    fn dispose_is_idempotent_and_rejects_later_calls() {
        let svc = service(None);
        let (tx, rx) = mpsc::channel();
        svc.set_on_dispose(move |reason| {
            let _ = tx.send(reason);
        });
        svc.dispose().unwrap();
        svc.dispose_because(DisposeReason::Requested);
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), DisposeReason::Requested);
        assert!(rx.try_recv().is_err());
        assert_eq!(svc.ping(), Err(ServiceError::Disposed));
        assert_eq!(svc.dispose(), Err(ServiceError::Disposed));
        assert!(!svc.watchdog_expired());
    }

    #[test]
    fn watchdog_disposes_unpinged_service() {
        let svc = service(Some(Duration::from_millis(100)));
        let (tx, rx) = mpsc::channel();
        svc.set_on_dispose(move |reason| {
            let _ = tx.send(reason);
        });
        assert_eq!(
            rx.recv_timeout(Duration::from_secs(5)).unwrap(),
            DisposeReason::WatchdogExpired
        );
        assert!(svc.watchdog_expired());
        assert!(svc.is_disposed());
        assert_eq!(svc.disposal_reason(), Some(DisposeReason::WatchdogExpired));
        assert_eq!(svc.ping(), Err(ServiceError::Disposed));
    }

    #[test]
    fn pinged_service_survives_its_watchdog_timeout() {
        let svc = service(Some(Duration::from_millis(150)));
        for _ in 0..8 {
            std::thread::sleep(Duration::from_millis(40));
            svc.ping().unwrap();
        }
        assert!(!svc.is_disposed());
        svc.dispose().unwrap();
        assert!(!svc.watchdog_expired());
        assert_eq!(svc.disposal_reason(), Some(DisposeReason::Requested));
    }

    #[test]
    fn wire_shapes_are_stable() {
        let call = ServiceCall::InvokeCallback {
            name: "echo".to_string(),
            args: json!([1]),
        };
        assert_eq!(
            serde_json::to_value(&call).unwrap(),
            json!({"op": "invoke_callback", "name": "echo", "args": [1]})
        );
        let reply = ServiceReply::from(Err(ServiceError::Disposed));
        assert_eq!(
            serde_json::to_value(&reply).unwrap(),
            json!({"status": "err", "error": {"kind": "disposed"}})
        );
    }
}
