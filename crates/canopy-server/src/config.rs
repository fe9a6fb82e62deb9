use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use canopy_types::Hash;

use crate::error::{ServerError, ServerResult};

/// Daemon configuration, loaded from TOML.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding the lock file, the local store database, and the
    /// management socket. Required.
    pub state_dir: PathBuf,
    /// Name comparison policy applied to every mount.
    #[serde(default = "default_case_sensitive")]
    pub case_sensitive: bool,
    /// Journal ring capacity; the journal default applies when unset.
    #[serde(default)]
    pub journal_ring_capacity: Option<usize>,
    /// Mount points to project at startup.
    #[serde(default)]
    pub mounts: Vec<MountEntry>,
}

fn default_case_sensitive() -> bool {
    true
}

/// One configured mount point.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MountEntry {
    /// Where the kernel exposes the tree.
    pub path: PathBuf,
    /// Hex hash of the source root tree.
    pub root_hash: String,
}

impl MountEntry {
    pub fn root_hash(&self) -> ServerResult<Hash> {
        Hash::from_hex(&self.root_hash).map_err(|e| {
            ServerError::Config(format!(
                "mount {}: bad root_hash: {e}",
                self.path.display()
            ))
        })
    }
}

impl DaemonConfig {
    /// Read and validate a TOML config file.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        let config: DaemonConfig = toml::from_str(&text)
            .map_err(|e| ServerError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.state_dir.as_os_str().is_empty() {
            return Err(ServerError::Config("state_dir is required".into()));
        }
        for mount in &self.mounts {
            mount.root_hash()?;
        }
        Ok(())
    }

    /// Path of the single-instance lock file.
    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("lock")
    }

    /// Path of the management socket.
    pub fn socket_path(&self) -> PathBuf {
        self.state_dir.join("socket")
    }

    /// Path of the local store database.
    pub fn local_store_path(&self) -> PathBuf {
        self.state_dir.join("local_store.db")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses() {
        let config: DaemonConfig = toml::from_str("state_dir = \"/var/lib/canopy\"").unwrap();
        assert!(config.case_sensitive);
        assert!(config.mounts.is_empty());
        assert!(config.journal_ring_capacity.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn full_config_parses() {
        let text = r#"
            state_dir = "/var/lib/canopy"
            case_sensitive = false
            journal_ring_capacity = 5000

            [[mounts]]
            path = "/mnt/repo"
            root_hash = "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        "#;
        let config: DaemonConfig = toml::from_str(text).unwrap();
        config.validate().unwrap();
        assert!(!config.case_sensitive);
        assert_eq!(config.journal_ring_capacity, Some(5000));
        assert_eq!(config.mounts.len(), 1);
        assert_eq!(
            config.mounts[0].root_hash().unwrap().to_hex(),
            "4b825dc642cb6eb9a060e54bf8d69288fbee4904"
        );
    }

    #[test]
    fn bad_root_hash_fails_validation() {
        let text = r#"
            state_dir = "/var/lib/canopy"
            [[mounts]]
            path = "/mnt/repo"
            root_hash = "nothex"
        "#;
        let config: DaemonConfig = toml::from_str(text).unwrap();
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn missing_state_dir_fails() {
        let config = DaemonConfig {
            state_dir: PathBuf::new(),
            case_sensitive: true,
            journal_ring_capacity: None,
            mounts: vec![],
        };
        assert!(matches!(config.validate(), Err(ServerError::Config(_))));
    }

    #[test]
    fn derived_paths_live_under_state_dir() {
        let config: DaemonConfig = toml::from_str("state_dir = \"/tmp/canopy\"").unwrap();
        assert_eq!(config.lock_path(), PathBuf::from("/tmp/canopy/lock"));
        assert_eq!(config.socket_path(), PathBuf::from("/tmp/canopy/socket"));
        assert_eq!(
            config.local_store_path(),
            PathBuf::from("/tmp/canopy/local_store.db")
        );
    }

    #[test]
    fn load_reports_missing_file_as_config_error() {
        let err = DaemonConfig::load(Path::new("/nonexistent/canopy.toml")).unwrap_err();
        assert!(matches!(err, ServerError::Config(_)));
    }
}
