use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::DependencyBinding;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedDependency {
    pub name: String,
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// Context-side dependency lookup. `Ok(None)` means "not found", `Err` means lookup failed.
pub trait DependencyResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Option<ResolvedDependency>, String>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoResolver;

impl DependencyResolver for NoResolver {
    fn resolve(&self, _name: &str) -> Result<Option<ResolvedDependency>, String> {
        Ok(None)
    }
}

/// The narrow object an in-process boundary uses to ask its creator for a dependency.
pub trait ResolutionBridge: Send + Sync {
    fn resolve(&self, name: &str) -> Option<PathBuf>;
}

impl<F> ResolutionBridge for F
where
    F: Fn(&str) -> Option<PathBuf> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self(name)
    }
}

/// Creator-side bridge that searches a fixed list of directories.
#[derive(Debug, Clone, Default)]
pub struct DirectoryBridge {
    search_dirs: Vec<PathBuf>,
}

impl DirectoryBridge {
    pub fn new(search_dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            search_dirs: search_dirs.into_iter().collect(),
        }
    }
}

impl ResolutionBridge for DirectoryBridge {
    fn resolve(&self, name: &str) -> Option<PathBuf> {
        self.search_dirs.iter().find_map(|dir| find_in_dir(dir, name))
    }
}

fn candidate_file_names(name: &str) -> Vec<String> {
    let mut out = vec![name.to_string()];
    let lib = format!(
        "{}{name}{}",
        std::env::consts::DLL_PREFIX,
        std::env::consts::DLL_SUFFIX
    );
    if lib != name {
        out.push(lib);
    }
    out
}

fn find_in_dir(dir: &Path, name: &str) -> Option<PathBuf> {
    if name.is_empty() || name.contains(['/', '\\']) || name == "." || name == ".." {
        return None;
    }
    candidate_file_names(name)
        .into_iter()
        .map(|f| dir.join(f))
        .find(|p| p.is_file())
}

/// Private copies of resolved files, so originals are never held open by the workload.
pub struct ShadowStore {
    dir: Mutex<ShadowDir>,
    copies: Mutex<BTreeMap<PathBuf, PathBuf>>,
}

enum ShadowDir {
    Owned(tempfile::TempDir),
    At(PathBuf),
    Closed,
}

impl ShadowStore {
    pub fn temp() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("isohost-shadow-")
            .tempdir()
            .context("create shadow copy dir")?;
        Ok(Self::with_dir(ShadowDir::Owned(dir)))
    }

    /// Uses an existing directory that its owner removes.
    pub fn at(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("create shadow copy dir: {}", dir.display()))?;
        Ok(Self::with_dir(ShadowDir::At(dir)))
    }

    fn with_dir(dir: ShadowDir) -> Self {
        Self {
            dir: Mutex::new(dir),
            copies: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn shadow(&self, original: &Path) -> Result<PathBuf> {
        let mut copies = self.copies.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(copy) = copies.get(original) {
            return Ok(copy.clone());
        }

        let root = match &*self.dir.lock().unwrap_or_else(|e| e.into_inner()) {
            ShadowDir::Owned(t) => t.path().to_path_buf(),
            ShadowDir::At(p) => p.clone(),
            ShadowDir::Closed => anyhow::bail!("shadow copy store is closed"),
        };
        let slot = root.join(copies.len().to_string());
        std::fs::create_dir_all(&slot)
            .with_context(|| format!("create shadow slot: {}", slot.display()))?;
        let file_name = original
            .file_name()
            .with_context(|| format!("shadow copy source has no file name: {}", original.display()))?;
        let copy = slot.join(file_name);
        std::fs::copy(original, &copy).with_context(|| {
            format!(
                "shadow copy {} -> {}",
                original.display(),
                copy.display()
            )
        })?;
        debug!("shadow-copied {} to {}", original.display(), copy.display());
        copies.insert(original.to_path_buf(), copy.clone());
        Ok(copy)
    }

    /// Deletes an owned temp directory. Later `shadow` calls fail.
    pub fn close(&self) -> std::io::Result<()> {
        let prev = std::mem::replace(
            &mut *self.dir.lock().unwrap_or_else(|e| e.into_inner()),
            ShadowDir::Closed,
        );
        match prev {
            ShadowDir::Owned(t) => t.close(),
            ShadowDir::At(_) | ShadowDir::Closed => Ok(()),
        }
    }
}

/// Resolves from configured bindings, then the application base directory, then the bridge.
pub struct ConfigResolver {
    application_base_dir: PathBuf,
    bindings: Vec<DependencyBinding>,
    bridge: Option<Arc<dyn ResolutionBridge>>,
    shadow: Option<Arc<ShadowStore>>,
}

impl ConfigResolver {
    pub fn new(application_base_dir: impl Into<PathBuf>, bindings: Vec<DependencyBinding>) -> Self {
        Self {
            application_base_dir: application_base_dir.into(),
            bindings,
            bridge: None,
            shadow: None,
        }
    }

    pub fn with_bridge(mut self, bridge: Option<Arc<dyn ResolutionBridge>>) -> Self {
        self.bridge = bridge;
        self
    }

    pub fn with_shadow(mut self, shadow: Option<Arc<ShadowStore>>) -> Self {
        self.shadow = shadow;
        self
    }

    fn locate(&self, name: &str) -> Option<(PathBuf, Option<String>)> {
        let binding = self.bindings.iter().rev().find(|b| b.name == name);
        let version = binding.and_then(|b| b.redirected_version()).map(str::to_string);
        if let Some(path) = binding.and_then(|b| b.code_base_for(version.as_deref())) {
            if path.is_file() {
                return Some((path.to_path_buf(), version));
            }
        }
        if let Some(path) = find_in_dir(&self.application_base_dir, name) {
            return Some((path, version));
        }
        let bridge = self.bridge.as_ref()?;
        let path = bridge.resolve(name)?;
        Some((path, version))
    }
}

impl DependencyResolver for ConfigResolver {
    fn resolve(&self, name: &str) -> Result<Option<ResolvedDependency>, String> {
        let Some((path, version)) = self.locate(name) else {
            return Ok(None);
        };
        let path = match &self.shadow {
            Some(store) => store.shadow(&path).map_err(|e| format!("{e:#}"))?,
            None => path,
        };
        Ok(Some(ResolvedDependency {
            name: name.to_string(),
            path,
            version,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_temp_dir(prefix: &str) -> PathBuf {
        let base = std::env::temp_dir();
        let pid = std::process::id();
        for n in 0..10_000u32 {
            let p = base.join(format!("isohost-resolve-{prefix}-{pid}-{n}"));
            if std::fs::create_dir(&p).is_ok() {
                return p;
            }
        }
        panic!("failed to create temp dir under {}", base.display());
    }

    #[test]
    fn bindings_win_over_base_dir_and_carry_redirect_version() {
        let base = make_temp_dir("bindings");
        let pinned = base.join("pinned");
        std::fs::create_dir_all(&pinned).unwrap();
        std::fs::write(base.join("fixture"), b"base").unwrap();
        std::fs::write(pinned.join("fixture"), b"pinned").unwrap();

        let resolver = ConfigResolver::new(
            &base,
            vec![DependencyBinding::new("fixture")
                .with_code_base(pinned.join("fixture"))
                .with_redirect("1.0-1.9", "2.0")],
        );
        let got = resolver.resolve("fixture").unwrap().unwrap();
        assert_eq!(got.path, pinned.join("fixture"));
        assert_eq!(got.version.as_deref(), Some("2.0"));
        assert!(resolver.resolve("missing").unwrap().is_none());
        assert!(resolver.resolve("../fixture").unwrap().is_none());

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn redirected_version_selects_its_code_base() {
        let base = make_temp_dir("versions");
        for v in ["v1", "v2"] {
            std::fs::create_dir_all(base.join(v)).unwrap();
            std::fs::write(base.join(v).join("fixture"), v).unwrap();
        }

        let binding = DependencyBinding::new("fixture")
            .with_code_base(base.join("v1/fixture"))
            .with_versioned_code_base("2.0", base.join("v2/fixture"));
        let unredirected = ConfigResolver::new(&base, vec![binding.clone()]);
        let got = unredirected.resolve("fixture").unwrap().unwrap();
        assert_eq!(got.path, base.join("v1/fixture"));
        assert_eq!(got.version, None);

        let redirected =
            ConfigResolver::new(&base, vec![binding.with_redirect("1.0-1.9", "2.0")]);
        let got = redirected.resolve("fixture").unwrap().unwrap();
        assert_eq!(got.path, base.join("v2/fixture"));
        assert_eq!(got.version.as_deref(), Some("2.0"));

        let _ = std::fs::remove_dir_all(&base);
    }

    #[test]
    fn falls_back_to_the_bridge() {
        let base = make_temp_dir("bridge-app");
        let creator = make_temp_dir("bridge-creator");
        std::fs::write(creator.join("helper"), b"x").unwrap();

        let bridge: Arc<dyn ResolutionBridge> = Arc::new(DirectoryBridge::new([creator.clone()]));
        let resolver = ConfigResolver::new(&base, Vec::new()).with_bridge(Some(bridge));
        let got = resolver.resolve("helper").unwrap().unwrap();
        assert_eq!(got.path, creator.join("helper"));

        let _ = std::fs::remove_dir_all(&base);
        let _ = std::fs::remove_dir_all(&creator);
    }

    #[test]
    fn shadow_copies_are_private_and_removed_on_close() {
        let base = make_temp_dir("shadow");
        std::fs::write(base.join("fixture"), b"payload").unwrap();

        let store = Arc::new(ShadowStore::temp().unwrap());
        let resolver =
            ConfigResolver::new(&base, Vec::new()).with_shadow(Some(Arc::clone(&store)));
        let first = resolver.resolve("fixture").unwrap().unwrap();
        let second = resolver.resolve("fixture").unwrap().unwrap();
        assert_ne!(first.path, base.join("fixture"));
        assert_eq!(first.path, second.path);
        assert_eq!(std::fs::read(&first.path).unwrap(), b"payload");

        store.close().unwrap();
        assert!(!first.path.exists());
        assert!(base.join("fixture").is_file());
        let _ = std::fs::remove_dir_all(&base);
    }
}
