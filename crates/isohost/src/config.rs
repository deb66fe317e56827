use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use isohost_contracts::{
    BOOTSTRAP_CONFIG_SCHEMA_VERSION, CHANNEL_SOCKET_FILE, ENV_HEARTBEAT_INTERVAL_MS,
    ENV_JOIN_AFTER_ABORT_MS, ENV_JOIN_BEFORE_ABORT_MS, ENV_POLL_INTERVAL_MS,
    ENV_STARTUP_TIMEOUT_MS, ENV_WATCHDOG_TIMEOUT_MS,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{ChannelName, HostError};

pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_JOIN_BEFORE_ABORT: Duration = Duration::from_secs(60);
pub const DEFAULT_JOIN_AFTER_ABORT: Duration = Duration::from_secs(15);
pub const FACTORY_JOIN_BEFORE_ABORT: Duration = Duration::from_secs(10);
pub const FACTORY_JOIN_AFTER_ABORT: Duration = Duration::from_secs(5);

/// One runtime-configuration fragment: a dotted section path and the attributes set on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigFragment {
    pub section: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl ConfigFragment {
    pub fn new(section: impl Into<String>) -> Self {
        Self {
            section: section.into(),
            attributes: BTreeMap::new(),
        }
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingRedirect {
    pub old_version_range: String,
    pub new_version: String,
}

/// A file providing a dependency, optionally only for one version of it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodeBase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub path: PathBuf,
}

/// Where a named dependency of the workload lives, and which versions it is redirected to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyBinding {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub code_bases: Vec<CodeBase>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub redirects: Vec<BindingRedirect>,
}

impl DependencyBinding {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            code_bases: Vec::new(),
            redirects: Vec::new(),
        }
    }

    /// A code base used whatever version is requested.
    pub fn with_code_base(mut self, path: impl Into<PathBuf>) -> Self {
        self.code_bases.push(CodeBase {
            version: None,
            path: path.into(),
        });
        self
    }

    pub fn with_versioned_code_base(
        mut self,
        version: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Self {
        self.code_bases.push(CodeBase {
            version: Some(version.into()),
            path: path.into(),
        });
        self
    }

    pub fn with_redirect(
        mut self,
        old_version_range: impl Into<String>,
        new_version: impl Into<String>,
    ) -> Self {
        self.redirects.push(BindingRedirect {
            old_version_range: old_version_range.into(),
            new_version: new_version.into(),
        });
        self
    }

    /// The version lookups are redirected to; the last declared redirect wins.
    pub fn redirected_version(&self) -> Option<&str> {
        self.redirects.last().map(|r| r.new_version.as_str())
    }

    /// The code base for `version`: an exact version match first, then an unversioned one.
    pub fn code_base_for(&self, version: Option<&str>) -> Option<&Path> {
        let exact = version.and_then(|v| {
            self.code_bases
                .iter()
                .rev()
                .find(|c| c.version.as_deref() == Some(v))
        });
        exact
            .or_else(|| self.code_bases.iter().rev().find(|c| c.version.is_none()))
            .map(|c| c.path.as_path())
    }
}

/// Describes how an isolated context is constructed. Factories never use it directly:
/// they canonicalize it into a [`CanonicalConfig`] first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    pub application_base_dir: Option<PathBuf>,
    pub working_dir: Option<PathBuf>,
    pub shadow_copy: bool,
    pub channel_name: Option<String>,
    pub fragments: Vec<ConfigFragment>,
    pub dependencies: Vec<DependencyBinding>,
    pub properties: BTreeMap<String, String>,
}

impl HostConfig {
    pub fn new(application_base_dir: impl Into<PathBuf>) -> Self {
        Self {
            application_base_dir: Some(application_base_dir.into()),
            ..Self::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_shadow_copy(mut self, enabled: bool) -> Self {
        self.shadow_copy = enabled;
        self
    }

    pub fn with_channel_name(mut self, name: impl Into<String>) -> Self {
        self.channel_name = Some(name.into());
        self
    }

    pub fn add_fragment(&mut self, fragment: ConfigFragment) -> &mut Self {
        self.fragments.push(fragment);
        self
    }

    pub fn add_dependency(&mut self, dependency: DependencyBinding) -> &mut Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Fragments merged by section: first-seen section order, later attributes win.
    pub fn merged_fragments(&self) -> Vec<ConfigFragment> {
        let mut order: Vec<String> = Vec::new();
        let mut by_section: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for fragment in &self.fragments {
            let attrs = by_section.entry(fragment.section.clone()).or_insert_with(|| {
                order.push(fragment.section.clone());
                BTreeMap::new()
            });
            for (k, v) in &fragment.attributes {
                attrs.insert(k.clone(), v.clone());
            }
        }
        order
            .into_iter()
            .map(|section| {
                let attributes = by_section.remove(&section).unwrap_or_default();
                ConfigFragment {
                    section,
                    attributes,
                }
            })
            .collect()
    }

    /// Renders the merged fragments as nested JSON objects keyed by section path.
    pub fn merged_document(&self) -> Result<Value, HostError> {
        let mut doc = Map::new();
        for fragment in self.merged_fragments() {
            validate_section_path(&fragment.section)?;
            merge_fragment_into(&mut doc, &fragment)?;
        }
        Ok(Value::Object(doc))
    }

    /// Deep-copies the configuration, resolving relative paths against `base`.
    pub fn canonicalize_against(&self, base: &Path) -> Result<CanonicalConfig, HostError> {
        if !base.is_absolute() {
            return Err(HostError::Validation(format!(
                "caller base directory must be absolute: {}",
                base.display()
            )));
        }

        let app = self.application_base_dir.as_deref().ok_or_else(|| {
            HostError::Validation("application base directory is not set".to_string())
        })?;
        let application_base_dir = absolutize(base, app)?;
        let working_dir = match self.working_dir.as_deref() {
            Some(dir) => absolutize(base, dir)?,
            None => application_base_dir.clone(),
        };

        if !application_base_dir.is_dir() {
            return Err(HostError::Validation(format!(
                "application base directory does not exist: {}",
                application_base_dir.display()
            )));
        }
        if !working_dir.is_dir() {
            return Err(HostError::Validation(format!(
                "working directory does not exist: {}",
                working_dir.display()
            )));
        }

        let channel_name = match self.channel_name.as_deref() {
            Some(raw) => ChannelName::parse(raw)?,
            None => ChannelName::generate(),
        };

        let sections = self.merged_document()?;
        let dependencies = canonical_dependencies(base, &self.dependencies)?;

        Ok(CanonicalConfig {
            application_base_dir,
            working_dir,
            shadow_copy: self.shadow_copy,
            channel_name,
            sections,
            dependencies,
            properties: self.properties.clone(),
        })
    }
}

/// A validated configuration: absolute paths, a channel name, merged sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalConfig {
    application_base_dir: PathBuf,
    working_dir: PathBuf,
    shadow_copy: bool,
    channel_name: ChannelName,
    sections: Value,
    dependencies: Vec<DependencyBinding>,
    properties: BTreeMap<String, String>,
}

impl CanonicalConfig {
    pub fn application_base_dir(&self) -> &Path {
        &self.application_base_dir
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    pub fn shadow_copy(&self) -> bool {
        self.shadow_copy
    }

    pub fn channel_name(&self) -> &ChannelName {
        &self.channel_name
    }

    pub fn sections(&self) -> &Value {
        &self.sections
    }

    pub fn dependencies(&self) -> &[DependencyBinding] {
        &self.dependencies
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }
}

/// The generated configuration artifact written beside the copied bootstrap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootstrapConfig {
    pub schema_version: String,
    pub channel_name: String,
    pub socket_path: PathBuf,
    pub application_base_dir: PathBuf,
    pub working_dir: PathBuf,
    pub shadow_copy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shadow_dir: Option<PathBuf>,
    pub watchdog_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_pid: Option<u32>,
    #[serde(default)]
    pub sections: Value,
    #[serde(default)]
    pub dependencies: Vec<DependencyBinding>,
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl BootstrapConfig {
    pub fn from_canonical(
        config: &CanonicalConfig,
        socket_path: &Path,
        shadow_dir: Option<&Path>,
        watchdog_timeout: Duration,
        owner_pid: Option<u32>,
    ) -> Self {
        Self {
            schema_version: BOOTSTRAP_CONFIG_SCHEMA_VERSION.to_string(),
            channel_name: config.channel_name.to_string(),
            socket_path: socket_path.to_path_buf(),
            application_base_dir: config.application_base_dir.clone(),
            working_dir: config.working_dir.clone(),
            shadow_copy: config.shadow_copy,
            shadow_dir: shadow_dir.map(Path::to_path_buf),
            watchdog_timeout_ms: duration_to_ms(watchdog_timeout),
            owner_pid,
            sections: config.sections.clone(),
            dependencies: config.dependencies.clone(),
            properties: config.properties.clone(),
        }
    }

    /// Used when a bootstrap is started without a configuration artifact beside it.
    pub fn defaults_for(channel_name: &ChannelName, exe_dir: &Path) -> Self {
        Self {
            schema_version: BOOTSTRAP_CONFIG_SCHEMA_VERSION.to_string(),
            channel_name: channel_name.to_string(),
            socket_path: exe_dir.join(CHANNEL_SOCKET_FILE),
            application_base_dir: exe_dir.to_path_buf(),
            working_dir: exe_dir.to_path_buf(),
            shadow_copy: false,
            shadow_dir: None,
            watchdog_timeout_ms: duration_to_ms(DEFAULT_WATCHDOG_TIMEOUT),
            owner_pid: None,
            sections: Value::Object(Map::new()),
            dependencies: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms.max(1))
    }
}

/// Every wait in the hosting lifecycle, in one place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostTimeouts {
    pub startup: Duration,
    pub poll_interval: Duration,
    pub heartbeat_interval: Option<Duration>,
    pub ping: Duration,
    pub watchdog: Duration,
    pub join_before_abort: Duration,
    pub join_after_abort: Duration,
    pub call: Option<Duration>,
}

impl Default for HostTimeouts {
    fn default() -> Self {
        Self {
            startup: DEFAULT_STARTUP_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            heartbeat_interval: Some(DEFAULT_HEARTBEAT_INTERVAL),
            ping: DEFAULT_PING_TIMEOUT,
            watchdog: DEFAULT_WATCHDOG_TIMEOUT,
            join_before_abort: DEFAULT_JOIN_BEFORE_ABORT,
            join_after_abort: DEFAULT_JOIN_AFTER_ABORT,
            call: None,
        }
    }
}

impl HostTimeouts {
    /// Shorter teardown joins used by factory-managed hosts.
    pub fn factory_managed() -> Self {
        Self {
            join_before_abort: FACTORY_JOIN_BEFORE_ABORT,
            join_after_abort: FACTORY_JOIN_AFTER_ABORT,
            ..Self::default()
        }
    }

    pub fn from_env() -> Result<Self, HostError> {
        Self::default().with_env_overrides()
    }

    /// Overlays the `ISOHOST_*_MS` environment variables on top of `self`.
    pub fn with_env_overrides(mut self) -> Result<Self, HostError> {
        if let Some(d) = read_ms_env(ENV_STARTUP_TIMEOUT_MS)? {
            self.startup = d;
        }
        if let Some(d) = read_ms_env(ENV_POLL_INTERVAL_MS)? {
            self.poll_interval = d;
        }
        if let Some(d) = read_ms_env(ENV_HEARTBEAT_INTERVAL_MS)? {
            self.heartbeat_interval = if d.is_zero() { None } else { Some(d) };
        }
        if let Some(d) = read_ms_env(ENV_WATCHDOG_TIMEOUT_MS)? {
            self.watchdog = d;
        }
        if let Some(d) = read_ms_env(ENV_JOIN_BEFORE_ABORT_MS)? {
            self.join_before_abort = d;
        }
        if let Some(d) = read_ms_env(ENV_JOIN_AFTER_ABORT_MS)? {
            self.join_after_abort = d;
        }
        Ok(self)
    }

    pub fn with_startup(mut self, d: Duration) -> Self {
        self.startup = d;
        self
    }

    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn with_heartbeat_interval(mut self, d: Option<Duration>) -> Self {
        self.heartbeat_interval = d;
        self
    }

    pub fn with_ping(mut self, d: Duration) -> Self {
        self.ping = d;
        self
    }

    pub fn with_watchdog(mut self, d: Duration) -> Self {
        self.watchdog = d;
        self
    }

    pub fn with_joins(mut self, before_abort: Duration, after_abort: Duration) -> Self {
        self.join_before_abort = before_abort;
        self.join_after_abort = after_abort;
        self
    }

    pub fn with_call(mut self, d: Option<Duration>) -> Self {
        self.call = d;
        self
    }
}

fn read_ms_env(name: &str) -> Result<Option<Duration>, HostError> {
    match std::env::var(name) {
        Ok(raw) => parse_ms_env(name, &raw).map(Some),
        Err(_) => Ok(None),
    }
}

fn parse_ms_env(name: &str, raw: &str) -> Result<Duration, HostError> {
    raw.trim().parse::<u64>().map(Duration::from_millis).map_err(|_| {
        HostError::Validation(format!(
            "invalid environment variable {name}={raw:?} (expected milliseconds as an unsigned integer)"
        ))
    })
}

pub(crate) fn duration_to_ms(d: Duration) -> u64 {
    d.as_millis().try_into().unwrap_or(u64::MAX)
}

fn canonical_dependencies(
    base: &Path,
    deps: &[DependencyBinding],
) -> Result<Vec<DependencyBinding>, HostError> {
    // (name, version) -> absolute code base, across every binding of the name.
    let mut seen: BTreeMap<(&str, Option<&str>), PathBuf> = BTreeMap::new();
    let mut out = Vec::with_capacity(deps.len());
    for dep in deps {
        if dep.name.trim().is_empty() {
            return Err(HostError::Validation(
                "dependency binding has an empty name".to_string(),
            ));
        }
        let mut code_bases = Vec::with_capacity(dep.code_bases.len());
        for cb in &dep.code_bases {
            let path = absolutize(base, &cb.path)?;
            let key = (dep.name.as_str(), cb.version.as_deref());
            match seen.get(&key) {
                Some(prev) if *prev != path => {
                    let which = match &cb.version {
                        Some(v) => format!("version {v}"),
                        None => "all versions".to_string(),
                    };
                    return Err(HostError::Validation(format!(
                        "dependency {:?} is bound to two different code bases for {which}",
                        dep.name
                    )));
                }
                Some(_) => {}
                None => {
                    seen.insert(key, path.clone());
                }
            }
            code_bases.push(CodeBase {
                version: cb.version.clone(),
                path,
            });
        }
        out.push(DependencyBinding {
            name: dep.name.clone(),
            code_bases,
            redirects: dep.redirects.clone(),
        });
    }
    Ok(out)
}

fn validate_section_path(section: &str) -> Result<(), HostError> {
    if section.is_empty() {
        return Err(HostError::Validation(
            "config fragment has an empty section path".to_string(),
        ));
    }
    for seg in section.split('.') {
        if seg.is_empty() {
            return Err(HostError::Validation(format!(
                "config section {section:?} has an empty segment"
            )));
        }
        if !seg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(HostError::Validation(format!(
                "config section {section:?} contains an invalid segment {seg:?}"
            )));
        }
    }
    Ok(())
}

fn merge_fragment_into(doc: &mut Map<String, Value>, fragment: &ConfigFragment) -> Result<(), HostError> {
    let collision = |key: &str| {
        HostError::Validation(format!(
            "config section {:?} collides with attribute {key:?}",
            fragment.section
        ))
    };

    let mut node = doc;
    for seg in fragment.section.split('.') {
        let entry = node
            .entry(seg.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        node = match entry {
            Value::Object(map) => map,
            _ => return Err(collision(seg)),
        };
    }
    for (key, value) in &fragment.attributes {
        if key.is_empty() {
            return Err(HostError::Validation(format!(
                "config section {:?} has an empty attribute name",
                fragment.section
            )));
        }
        if matches!(node.get(key), Some(Value::Object(_))) {
            return Err(collision(key));
        }
        node.insert(key.clone(), Value::String(value.clone()));
    }
    Ok(())
}

fn absolutize(base: &Path, p: &Path) -> Result<PathBuf, HostError> {
    if p.as_os_str().is_empty() {
        return Err(HostError::Validation("path is empty".to_string()));
    }
    if p.is_absolute() {
        normalize_abs_path(p)
    } else {
        normalize_abs_path(&base.join(p))
    }
}

pub(crate) fn normalize_abs_path(p: &Path) -> Result<PathBuf, HostError> {
    if !p.is_absolute() {
        return Err(HostError::Validation(format!(
            "expected absolute path, got {}",
            p.display()
        )));
    }

    let mut out = PathBuf::new();
    for comp in p.components() {
        match comp {
            Component::Prefix(prefix) => out.push(prefix.as_os_str()),
            Component::RootDir => out.push(Component::RootDir.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if out.parent().is_some() {
                    out.pop();
                }
            }
            Component::Normal(c) => out.push(c),
        }
    }
    Ok(out)
}
