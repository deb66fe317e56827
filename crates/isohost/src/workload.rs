//! What runs inside an isolated context: registered callbacks, instantiable types, the
//! explicit [`HostContext`] they receive, and the events they emit back to the supervisor.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::config::{BootstrapConfig, CanonicalConfig};
use crate::resolve::{DependencyResolver, ResolvedDependency};

/// A notification emitted by workload code, delivered to the caller's [`EventSink`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEvent {
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl HostEvent {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

pub trait EventSink: Send {
    fn emit(&mut self, event: HostEvent);
}

impl<F> EventSink for F
where
    F: FnMut(HostEvent) + Send,
{
    fn emit(&mut self, event: HostEvent) {
        self(event)
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&mut self, _event: HostEvent) {}
}

/// Read-only snapshot of the configuration a context was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextInfo {
    pub channel_name: String,
    pub application_base_dir: PathBuf,
    pub working_dir: PathBuf,
    pub sections: Value,
    pub properties: BTreeMap<String, String>,
}

impl ContextInfo {
    pub fn from_canonical(config: &CanonicalConfig) -> Self {
        Self {
            channel_name: config.channel_name().to_string(),
            application_base_dir: config.application_base_dir().to_path_buf(),
            working_dir: config.working_dir().to_path_buf(),
            sections: config.sections().clone(),
            properties: config.properties().clone(),
        }
    }

    pub fn from_bootstrap(config: &BootstrapConfig) -> Self {
        Self {
            channel_name: config.channel_name.clone(),
            application_base_dir: config.application_base_dir.clone(),
            working_dir: config.working_dir.clone(),
            sections: config.sections.clone(),
            properties: config.properties.clone(),
        }
    }
}

/// Settings passed to `InitializeWorkloadRuntime`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeSetup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

/// Per-context workload runtime. Exists between Init and Shutdown.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadRuntime {
    setup: RuntimeSetup,
    values: Map<String, Value>,
}

impl WorkloadRuntime {
    pub(crate) fn new(setup: RuntimeSetup) -> Self {
        Self {
            setup,
            values: Map::new(),
        }
    }

    pub fn setup(&self) -> &RuntimeSetup {
        &self.setup
    }

    pub fn option(&self, key: &str) -> Option<&str> {
        self.setup.options.get(key).map(String::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.values.insert(key.into(), value)
    }
}

/// What a callback or hosted object sees of its context during one call.
pub struct HostContext<'a> {
    info: &'a ContextInfo,
    runtime: &'a mut Option<WorkloadRuntime>,
    resolver: &'a dyn DependencyResolver,
    events: &'a mut dyn EventSink,
}

impl<'a> HostContext<'a> {
    pub(crate) fn new(
        info: &'a ContextInfo,
        runtime: &'a mut Option<WorkloadRuntime>,
        resolver: &'a dyn DependencyResolver,
        events: &'a mut dyn EventSink,
    ) -> Self {
        Self {
            info,
            runtime,
            resolver,
            events,
        }
    }

    pub fn channel_name(&self) -> &str {
        &self.info.channel_name
    }

    pub fn application_base_dir(&self) -> &Path {
        &self.info.application_base_dir
    }

    pub fn working_dir(&self) -> &Path {
        &self.info.working_dir
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.info.properties.get(key).map(String::as_str)
    }

    /// Looks up a merged configuration node by dotted path (`"runtime.gc"`).
    pub fn section(&self, path: &str) -> Option<&Value> {
        let mut node = &self.info.sections;
        for seg in path.split('.') {
            node = node.as_object()?.get(seg)?;
        }
        Some(node)
    }

    pub fn runtime(&self) -> Option<&WorkloadRuntime> {
        self.runtime.as_ref()
    }

    pub fn runtime_mut(&mut self) -> Option<&mut WorkloadRuntime> {
        self.runtime.as_mut()
    }

    pub(crate) fn runtime_slot(&mut self) -> &mut Option<WorkloadRuntime> {
        &mut *self.runtime
    }

    pub fn emit(&mut self, kind: impl Into<String>, payload: Value) {
        self.events.emit(HostEvent::new(kind, payload));
    }

    pub fn resolve_dependency(&self, name: &str) -> Result<Option<ResolvedDependency>, String> {
        self.resolver.resolve(name)
    }
}

/// An instance created inside the context and addressed from outside by an object reference.
pub trait HostedObject: Send {
    fn invoke(&mut self, ctx: &mut HostContext<'_>, method: &str, args: Value)
        -> Result<Value, String>;
}

pub type Callback = Arc<dyn Fn(&mut HostContext<'_>, Value) -> Result<Value, String> + Send + Sync>;
pub type Constructor =
    Arc<dyn Fn(&mut HostContext<'_>) -> Result<Box<dyn HostedObject>, String> + Send + Sync>;

/// Workload entry points known to a context.
#[derive(Clone, Default)]
pub struct WorkloadRegistry {
    callbacks: BTreeMap<String, Callback>,
    types: BTreeMap<(String, String), Constructor>,
}

impl WorkloadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_callback<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&mut HostContext<'_>, Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.callbacks.insert(name.into(), Arc::new(f));
        self
    }

    pub fn register_type<F>(
        &mut self,
        module: impl Into<String>,
        type_name: impl Into<String>,
        ctor: F,
    ) -> &mut Self
    where
        F: Fn(&mut HostContext<'_>) -> Result<Box<dyn HostedObject>, String>
            + Send
            + Sync
            + 'static,
    {
        self.types
            .insert((module.into(), type_name.into()), Arc::new(ctor));
        self
    }

    pub fn callback(&self, name: &str) -> Option<&Callback> {
        self.callbacks.get(name)
    }

    pub fn constructor(&self, module: &str, type_name: &str) -> Option<&Constructor> {
        self.types.get(&(module.to_string(), type_name.to_string()))
    }

    pub fn callback_names(&self) -> impl Iterator<Item = &str> {
        self.callbacks.keys().map(String::as_str)
    }
}

impl fmt::Debug for WorkloadRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkloadRegistry")
            .field("callbacks", &self.callbacks.keys().collect::<Vec<_>>())
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}
