//! Filesystem layout helpers and atomic write operations
//!
//! Manages the .seqctl/ directory: the runtime configuration file and the
//! project configurations the compiler binds tag names from.

use anyhow::{Context, Result, bail};
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use super::RuntimeConfig;
use crate::tags::ProjectConfig;

/// Storage manager for runtime persistence
#[derive(Debug, Clone)]
pub struct Storage {
    root: PathBuf,
}

impl Storage {
    /// Create a new storage manager
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the config file path
    pub fn config_path(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Get the project configuration directory
    pub fn projects_dir(&self) -> PathBuf {
        self.root.join("projects")
    }

    /// Write data atomically to a file
    ///
    /// Creates a temporary file, writes the data, syncs, then renames
    pub fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = File::create(&temp_path)
            .with_context(|| format!("Failed to create temp file: {:?}", temp_path))?;
        file.write_all(data).context("Failed to write data")?;
        file.sync_all().context("Failed to sync file")?;
        drop(file);

        fs::rename(&temp_path, path)
            .with_context(|| format!("Failed to rename {:?} to {:?}", temp_path, path))?;

        if let Some(parent) = path.parent() {
            let dir = OpenOptions::new()
                .read(true)
                .open(parent)
                .with_context(|| format!("Failed to open directory: {:?}", parent))?;
            dir.sync_all().context("Failed to sync directory")?;
        }

        Ok(())
    }

    /// Read a file
    pub fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).with_context(|| format!("Failed to read file: {:?}", path))
    }

    /// Create a directory and all parent directories
    pub fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .with_context(|| format!("Failed to create directory: {:?}", path))
    }
}

/// Initialize storage directories
pub fn init_storage(root: &Path) -> Result<()> {
    let storage = Storage::new(root.to_path_buf());
    storage.create_dir_all(root)?;
    storage.create_dir_all(&storage.projects_dir())?;
    Ok(())
}

/// Write runtime configuration
pub fn write_config(config: &RuntimeConfig) -> Result<()> {
    let storage = Storage::new(config.root.clone());
    let json = serde_json::to_vec_pretty(config).context("Failed to serialize config")?;
    storage.write_atomic(&storage.config_path(), &json)
}

/// Load runtime configuration
pub fn load_config(root: &Path) -> Result<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    let data = storage.read_file(&storage.config_path())?;
    let config: RuntimeConfig =
        serde_json::from_slice(&data).context("Failed to deserialize config")?;
    Ok(config)
}

/// Load the configuration under `root`, falling back to defaults rooted there
/// when no file exists yet.
pub fn load_or_default(root: &Path) -> Result<RuntimeConfig> {
    let storage = Storage::new(root.to_path_buf());
    if !storage.config_path().exists() {
        return Ok(RuntimeConfig {
            root: root.to_path_buf(),
            ..RuntimeConfig::default()
        });
    }
    load_config(root)
}

/// Project configurations stored as `<root>/projects/<id>.json`.
#[derive(Debug, Clone)]
pub struct ProjectStore {
    storage: Storage,
}

impl ProjectStore {
    /// Store rooted at the runtime directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            storage: Storage::new(root.into()),
        }
    }

    fn path(&self, id: &str) -> Result<PathBuf> {
        let valid = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
        if !valid {
            bail!("invalid project id: {:?}", id);
        }
        Ok(self.storage.projects_dir().join(format!("{}.json", id)))
    }

    /// Project configuration, or `None` when the project has none.
    pub fn load(&self, id: &str) -> Result<Option<ProjectConfig>> {
        let path = self.path(id)?;
        match fs::read(&path) {
            Ok(data) => {
                let config = serde_json::from_slice(&data)
                    .with_context(|| format!("Failed to parse project {:?}", path))?;
                Ok(Some(config))
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err).with_context(|| format!("Failed to read project {:?}", path)),
        }
    }

    /// Persist a project configuration.
    pub fn save(&self, id: &str, config: &ProjectConfig) -> Result<()> {
        let path = self.path(id)?;
        self.storage.create_dir_all(&self.storage.projects_dir())?;
        let json = serde_json::to_vec_pretty(config).context("Failed to serialize project")?;
        self.storage.write_atomic(&path, &json)
    }

    /// Ids of stored projects, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let dir = self.storage.projects_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut ids = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("Failed to read {:?}", dir))? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tags::{ActuatorConfig, ActuatorKind, ComponentConfig};
    use tempfile::TempDir;

    #[test]
    fn test_init_storage() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join(".seqctl");
        init_storage(&root).unwrap();
        assert!(root.join("projects").exists());
    }

    #[test]
    fn test_write_and_read_config() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().to_path_buf();
        init_storage(&root).unwrap();

        let config = RuntimeConfig {
            root: root.clone(),
            poll_interval_ms: 25,
            sensor_timeout_ms: Some(5000),
            ..RuntimeConfig::default()
        };
        write_config(&config).unwrap();
        let loaded = load_config(&root).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn missing_config_falls_back_to_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load_or_default(temp.path()).unwrap();
        assert_eq!(config.root, temp.path());
        assert_eq!(config.endpoint_port, 4840);
    }

    #[test]
    fn test_atomic_write() {
        let temp = TempDir::new().unwrap();
        let storage = Storage::new(temp.path().to_path_buf());
        let test_file = temp.path().join("test.dat");
        storage.write_atomic(&test_file, b"A+,A-").unwrap();
        assert_eq!(storage.read_file(&test_file).unwrap(), b"A+,A-");
        assert!(!temp.path().join("test.tmp").exists());
    }

    #[test]
    fn project_store_round_trips_and_lists() {
        let temp = TempDir::new().unwrap();
        let store = ProjectStore::new(temp.path());
        assert!(store.load("line-1").unwrap().is_none());
        assert!(store.list().unwrap().is_empty());

        let project = ProjectConfig {
            name: "line-1".to_string(),
            components: vec![ComponentConfig::Actuator(ActuatorConfig {
                label: "A".to_string(),
                kind: ActuatorKind::DoubleActing,
                extension_tag: "Q_A_Out".to_string(),
                retraction_tag: Some("Q_A_In".to_string()),
                extended_sensor_tag: "I_A_Out".to_string(),
                retracted_sensor_tag: "I_A_In".to_string(),
            })],
        };
        store.save("line-1", &project).unwrap();
        assert_eq!(store.load("line-1").unwrap(), Some(project));
        assert_eq!(store.list().unwrap(), vec!["line-1".to_string()]);
    }

    #[test]
    fn project_ids_cannot_escape_the_store() {
        let temp = TempDir::new().unwrap();
        let store = ProjectStore::new(temp.path());
        assert!(store.load("../config").is_err());
        assert!(store.load("").is_err());
    }
}
