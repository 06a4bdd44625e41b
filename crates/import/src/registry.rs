use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};

use crate::error::ConfigError;
use crate::format::CompiledFormat;

/// Immutable set of compiled formats. Reloads replace the whole snapshot.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    formats: BTreeMap<String, Arc<CompiledFormat>>,
}

impl RegistrySnapshot {
    pub fn from_formats(formats: impl IntoIterator<Item = CompiledFormat>) -> Result<Self, ConfigError> {
        let mut map = BTreeMap::new();
        for format in formats {
            let id = format.id().to_string();
            if map.insert(id.clone(), Arc::new(format)).is_some() {
                return Err(ConfigError::DuplicateInstitution(id));
            }
        }
        Ok(Self { formats: map })
    }

    /// Compiles every `*.toml` file in `dir`. Any invalid file fails the whole load.
    pub fn load_dir(dir: &Path) -> Result<Self, ConfigError> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| is_descriptor(p))
            .collect();
        paths.sort();

        let mut formats = Vec::with_capacity(paths.len());
        for path in paths {
            let compiled = std::fs::read_to_string(&path)
                .map_err(ConfigError::from)
                .and_then(|content| CompiledFormat::from_toml(&content))
                .map_err(|e| ConfigError::InFile { path: path.clone(), source: Box::new(e) })?;
            formats.push(compiled);
        }
        Self::from_formats(formats)
    }

    pub fn get(&self, id: &str) -> Option<Arc<CompiledFormat>> {
        self.formats.get(id).cloned()
    }

    /// First format (by institution id) whose filename patterns match.
    pub fn detect(&self, filename: &str) -> Option<Arc<CompiledFormat>> {
        self.formats.values().find(|f| f.matches_filename(filename)).cloned()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.formats.keys().map(String::as_str)
    }

    pub fn formats(&self) -> impl Iterator<Item = &Arc<CompiledFormat>> {
        self.formats.values()
    }

    pub fn len(&self) -> usize {
        self.formats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.formats.is_empty()
    }
}

fn is_descriptor(path: &Path) -> bool {
    path.is_file() && path.extension().is_some_and(|e| e.eq_ignore_ascii_case("toml"))
}

/// Hot-reloadable registry over a descriptor directory.
pub struct FormatRegistry {
    dir: PathBuf,
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl FormatRegistry {
    /// Loads `dir`. Fails fast on any invalid descriptor.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let dir = dir.into();
        let snapshot = RegistrySnapshot::load_dir(&dir)?;
        info!("Loaded {} institution formats from {}", snapshot.len(), dir.display());
        Ok(Self { dir, current: RwLock::new(Arc::new(snapshot)) })
    }

    /// Registry over an already-compiled snapshot. `dir` is only used by reloads.
    pub fn with_snapshot(dir: impl Into<PathBuf>, snapshot: RegistrySnapshot) -> Self {
        Self { dir: dir.into(), current: RwLock::new(Arc::new(snapshot)) }
    }

    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Re-reads the directory. On error the previous snapshot stays active.
    pub fn reload(&self) -> Result<usize, ConfigError> {
        let snapshot = RegistrySnapshot::load_dir(&self.dir)?;
        let count = snapshot.len();
        match self.current.write() {
            Ok(mut guard) => *guard = Arc::new(snapshot),
            Err(poisoned) => *poisoned.into_inner() = Arc::new(snapshot),
        }
        Ok(count)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reloads whenever a descriptor file in the directory changes.
    /// The returned watcher must be kept alive for reloading to continue.
    pub fn watch(self: &Arc<Self>) -> notify::Result<impl notify::Watcher> {
        use notify::{EventKind, RecursiveMode, Watcher};

        let registry = Arc::clone(self);
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            let Ok(ev) = event else { return };
            if !matches!(ev.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                return;
            }
            if !ev.paths.iter().any(|p| p.extension().is_some_and(|e| e.eq_ignore_ascii_case("toml"))) {
                return;
            }
            match registry.reload() {
                Ok(count) => info!("Reloaded {count} institution formats"),
                Err(e) => warn!("Format reload failed, keeping previous formats: {e}"),
            }
        })?;

        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;
        Ok(watcher)
    }
}
