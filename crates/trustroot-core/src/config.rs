use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use trustroot_protocol::DEFAULT_MAX_BLOB_BYTES;

pub const STATE_DIR_ENV: &str = "TRUSTROOT_STATE_DIR";
pub const MAX_BLOB_BYTES_ENV: &str = "TRUSTROOT_MAX_BLOB_BYTES";
pub const MIGRATION_MARKER_ENV: &str = "TRUSTROOT_MIGRATION_MARKER";

const DEFAULT_STATE_DIR: &str = "/var/lib/devicesettings";
const MIGRATION_MARKER_FILE: &str = ".preserve_on_migration";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub state_dir: PathBuf,
    pub owner_key_file: String,
    pub device_policy_file: String,
    pub component_policy_prefix: String,
    /// `None` means `<state_dir>/.preserve_on_migration`.
    pub migration_marker_path: Option<PathBuf>,
    pub max_blob_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from(DEFAULT_STATE_DIR),
            owner_key_file: "owner.key".to_string(),
            device_policy_file: "policy".to_string(),
            component_policy_prefix: "policy_".to_string(),
            migration_marker_path: None,
            max_blob_bytes: DEFAULT_MAX_BLOB_BYTES,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct EngineConfigFile {
    state_dir: Option<PathBuf>,
    owner_key_file: Option<String>,
    device_policy_file: Option<String>,
    component_policy_prefix: Option<String>,
    migration_marker_path: Option<PathBuf>,
    max_blob_bytes: Option<usize>,
}

impl EngineConfig {
    pub fn with_state_dir(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
            ..Self::default()
        }
    }

    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = std::env::var(STATE_DIR_ENV) {
            cfg.state_dir = PathBuf::from(dir);
        }
        match std::env::var(MAX_BLOB_BYTES_ENV).map(|v| v.parse::<usize>()) {
            Ok(Ok(max)) if max > 0 => cfg.max_blob_bytes = max,
            Ok(_) => {
                tracing::warn!(env = MAX_BLOB_BYTES_ENV, "ignoring invalid blob size limit")
            }
            Err(_) => {}
        }
        if let Ok(path) = std::env::var(MIGRATION_MARKER_ENV) {
            cfg.migration_marker_path = Some(PathBuf::from(path));
        }
        cfg
    }

    /// Overlays the fields present in a JSON config file.
    pub fn load_file(mut self, path: impl AsRef<Path>) -> Result<Self, Box<dyn std::error::Error>> {
        let payload = fs::read(path)?;
        let file: EngineConfigFile = serde_json::from_slice(&payload)?;
        if let Some(v) = file.state_dir {
            self.state_dir = v;
        }
        if let Some(v) = file.owner_key_file {
            self.owner_key_file = v;
        }
        if let Some(v) = file.device_policy_file {
            self.device_policy_file = v;
        }
        if let Some(v) = file.component_policy_prefix {
            self.component_policy_prefix = v;
        }
        if let Some(v) = file.migration_marker_path {
            self.migration_marker_path = Some(v);
        }
        if let Some(v) = file.max_blob_bytes {
            if v == 0 {
                return Err("max_blob_bytes must be positive".into());
            }
            self.max_blob_bytes = v;
        }
        Ok(self)
    }

    pub fn owner_key_path(&self) -> PathBuf {
        self.state_dir.join(&self.owner_key_file)
    }

    pub fn migration_marker_path(&self) -> PathBuf {
        self.migration_marker_path
            .clone()
            .unwrap_or_else(|| self.state_dir.join(MIGRATION_MARKER_FILE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_overlays_only_present_fields() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, br#"{"state_dir":"/tmp/state","max_blob_bytes":4096}"#)
            .expect("write");
        let cfg = EngineConfig::default().load_file(&path).expect("load");
        assert_eq!(cfg.state_dir, PathBuf::from("/tmp/state"));
        assert_eq!(cfg.max_blob_bytes, 4096);
        assert_eq!(cfg.owner_key_file, "owner.key");
        assert_eq!(
            cfg.migration_marker_path(),
            PathBuf::from("/tmp/state/.preserve_on_migration")
        );
    }

    #[test]
    fn unknown_config_fields_rejected() {
        let dir = tempfile::tempdir().expect("tmp");
        let path = dir.path().join("engine.json");
        std::fs::write(&path, br#"{"stat_dir":"/tmp"}"#).expect("write");
        assert!(EngineConfig::default().load_file(&path).is_err());
    }
}
