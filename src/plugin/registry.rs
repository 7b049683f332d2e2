//! Plugin registry: discovers manifests, instantiates drivers, resolves
//! assignment targets.
//!
//! # Search Path Priority
//!
//! Search paths are scanned in the order they were added and files within a
//! directory in file-name order. The first plugin registered under a name
//! wins; later duplicates are skipped with a warning. Registration order is
//! also the order in which discovery scans try plugins.
//!
//! # Example
//!
//! ```rust,ignore
//! let mut registry = PluginRegistry::new();
//! registry.add_search_path("/etc/pinscan/plugins");
//! registry.add_search_path("plugins");
//!
//! for err in registry.scan().await {
//!     eprintln!("Warning: {}", err);
//! }
//! for handle in registry.auto_detectable() {
//!     println!("Auto-detect: {}", handle.name());
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::error::{EngineError, EngineResult, PluginLoadError};
use crate::plugin::builtin::{BuiltinDriver, DriverDefaults};
use crate::plugin::descriptor::{validate_manifest, PluginDescriptor, PluginManifest, I2C_TARGET};
use crate::plugin::SensorPlugin;

/// A loaded plugin: immutable descriptor plus its driver
#[derive(Clone)]
pub struct PluginHandle {
    pub descriptor: Arc<PluginDescriptor>,
    pub plugin: Arc<dyn SensorPlugin>,
    /// Manifest it came from (`None` for programmatic registration)
    pub source: Option<PathBuf>,
}

impl PluginHandle {
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

impl std::fmt::Debug for PluginHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginHandle")
            .field("descriptor", &self.descriptor)
            .field("source", &self.source)
            .finish()
    }
}

/// What a user assignment points at
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssignmentTarget {
    /// A loaded plugin, optionally bound by role
    Plugin { name: String, role: Option<String> },
    /// Generic I2C device tag
    I2c,
}

impl std::fmt::Display for AssignmentTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AssignmentTarget::Plugin { name, role: Some(role) } => write!(f, "{}:{}", name, role),
            AssignmentTarget::Plugin { name, role: None } => write!(f, "{}", name),
            AssignmentTarget::I2c => write!(f, "{}", I2C_TARGET),
        }
    }
}

/// Registry of loaded sensor plugins
///
/// Performs no hardware access.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<PluginHandle>,
    search_paths: Vec<PathBuf>,
    defaults: DriverDefaults,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose drivers are built with `defaults`
    pub fn with_defaults(defaults: DriverDefaults) -> Self {
        Self {
            defaults,
            ..Self::default()
        }
    }

    /// Adds a manifest directory. Earlier paths have higher priority.
    pub fn add_search_path<P: Into<PathBuf>>(&mut self, path: P) {
        self.search_paths.push(path.into());
    }

    /// Scans every search path and loads the manifests found.
    ///
    /// Returns the manifests that failed to load; valid manifests are loaded
    /// regardless.
    pub async fn scan(&mut self) -> Vec<PluginLoadError> {
        let mut errors = Vec::new();
        let paths = self.search_paths.clone();
        for path in paths {
            errors.extend(self.scan_directory(&path).await);
        }
        errors
    }

    /// Loads all manifests from one directory.
    pub async fn load(&mut self, dir: impl AsRef<Path>) -> Vec<PluginLoadError> {
        self.scan_directory(dir.as_ref()).await
    }

    async fn scan_directory(&mut self, path: &Path) -> Vec<PluginLoadError> {
        let mut errors = Vec::new();

        if !path.exists() {
            tracing::debug!("Plugin path does not exist: {}", path.display());
            return errors;
        }

        if !path.is_dir() {
            errors.push(PluginLoadError::new(path, "Not a directory"));
            return errors;
        }

        let mut entries = match tokio::fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) => {
                errors.push(PluginLoadError::new(
                    path,
                    format!("Failed to read directory: {}", e),
                ));
                return errors;
            }
        };

        let mut manifests = Vec::new();
        while let Ok(Some(entry)) = entries.next_entry().await {
            let entry_path = entry.path();
            let is_manifest = entry_path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml");
            if is_manifest && entry_path.is_file() {
                manifests.push(entry_path);
            }
        }
        manifests.sort();

        for manifest in manifests {
            if let Err(e) = self.load_manifest(&manifest).await {
                tracing::warn!("Skipping plugin manifest {}", e);
                errors.push(e);
            }
        }

        errors
    }

    async fn load_manifest(&mut self, path: &Path) -> Result<(), PluginLoadError> {
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| PluginLoadError::new(path, format!("Failed to read file: {}", e)))?;

        let manifest: PluginManifest = serde_yaml::from_str(&content)
            .map_err(|e| PluginLoadError::new(path, format!("Failed to parse YAML: {}", e)))?;

        let validation_errors = validate_manifest(&manifest);
        if !validation_errors.is_empty() {
            return Err(PluginLoadError {
                file_path: path.to_path_buf(),
                message: format!(
                    "Validation failed with {} error(s)",
                    validation_errors.len()
                ),
                validation_errors,
            });
        }

        let driver: BuiltinDriver = manifest
            .driver
            .parse()
            .map_err(|e: String| PluginLoadError::new(path, e))?;
        let descriptor = PluginDescriptor::from(&manifest);

        if let Some(existing) = self.get(&descriptor.name) {
            tracing::warn!(
                "Skipping plugin '{}' from {} (already loaded from {})",
                descriptor.name,
                path.display(),
                existing
                    .source
                    .as_deref()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "code".to_string())
            );
            return Ok(());
        }

        let plugin = driver.instantiate(&descriptor.name, &manifest.options, &self.defaults);
        tracing::info!(
            plugin = %descriptor.name,
            %driver,
            auto_detect = descriptor.auto_detectable,
            "Loaded plugin ({})",
            path.display()
        );
        self.plugins.push(PluginHandle {
            descriptor: Arc::new(descriptor),
            plugin,
            source: Some(path.to_path_buf()),
        });
        Ok(())
    }

    /// Registers a plugin built in code.
    ///
    /// # Errors
    /// `DuplicatePlugin` if the name is taken.
    pub fn register(
        &mut self,
        descriptor: PluginDescriptor,
        plugin: Arc<dyn SensorPlugin>,
    ) -> EngineResult<()> {
        if self.get(&descriptor.name).is_some() {
            return Err(EngineError::DuplicatePlugin(descriptor.name));
        }
        tracing::debug!(plugin = %descriptor.name, "Registered plugin");
        self.plugins.push(PluginHandle {
            descriptor: Arc::new(descriptor),
            plugin,
            source: None,
        });
        Ok(())
    }

    /// All plugins in registration order
    pub fn handles(&self) -> &[PluginHandle] {
        &self.plugins
    }

    pub fn get(&self, name: &str) -> Option<&PluginHandle> {
        self.plugins.iter().find(|h| h.name() == name)
    }

    /// Plugins a discovery scan may try, in registration order
    pub fn auto_detectable(&self) -> impl Iterator<Item = &PluginHandle> {
        self.plugins.iter().filter(|h| h.descriptor.auto_detectable)
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|h| h.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Assignment menu: plugin names sorted, one `Name:Role` entry per role,
    /// and a trailing generic `I2C` entry.
    pub fn options(&self) -> Vec<String> {
        let mut handles: Vec<_> = self.plugins.iter().collect();
        handles.sort_by(|a, b| a.name().cmp(b.name()));

        let mut options = Vec::new();
        for handle in handles {
            if handle.descriptor.pin_roles.is_empty() {
                options.push(handle.name().to_string());
            } else {
                for role in &handle.descriptor.pin_roles {
                    options.push(format!("{}:{}", handle.name(), role));
                }
            }
        }
        options.push(I2C_TARGET.to_string());
        options
    }

    /// Validates an assignment target (`Name`, `Name:Role` or `I2C`).
    ///
    /// A bare name is accepted for plugins with at most one role; a
    /// single-role plugin is bound to that role.
    pub fn resolve_target(&self, target: &str) -> EngineResult<AssignmentTarget> {
        let target = target.trim();
        if target.eq_ignore_ascii_case(I2C_TARGET) {
            return Ok(AssignmentTarget::I2c);
        }

        let (name, role) = match target.split_once(':') {
            Some((name, role)) => (name.trim(), Some(role.trim())),
            None => (target, None),
        };

        let handle = self
            .get(name)
            .ok_or_else(|| EngineError::InvalidAssignment(format!("unknown plugin '{}'", name)))?;
        let roles = &handle.descriptor.pin_roles;

        let role = match role {
            Some(role) if handle.descriptor.has_role(role) => Some(role.to_string()),
            Some(role) => {
                return Err(EngineError::InvalidAssignment(format!(
                    "plugin '{}' has no role '{}'",
                    name, role
                )))
            }
            None if roles.len() > 1 => {
                return Err(EngineError::InvalidAssignment(format!(
                    "plugin '{}' needs a role: one of {}",
                    name,
                    roles.join(", ")
                )))
            }
            None => roles.first().cloned(),
        };

        Ok(AssignmentTarget::Plugin {
            name: handle.name().to_string(),
            role,
        })
    }
}
