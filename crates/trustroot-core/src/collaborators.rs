//! Interfaces to the platform pieces this engine decides for but does not
//! own, plus JSON/file-backed implementations used by the CLI and tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::durable::write_file_atomic_durable;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SinkError {
    #[error("sink i/o failed: {0}")]
    Io(String),
    #[error("sink rejected update: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMode {
    Enterprise,
    Consumer,
}

/// Lockbox-style install attributes. Until locked, the enrollment state of
/// the device is undetermined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallAttributesState {
    pub locked: bool,
    pub mode: Option<DeviceMode>,
}

impl InstallAttributesState {
    pub fn is_enterprise(&self) -> bool {
        self.locked && self.mode == Some(DeviceMode::Enterprise)
    }
}

pub trait InstallAttributes: Send {
    fn read(&self) -> InstallAttributesState;
}

pub trait FirmwareInfo: Send {
    /// Main firmware type as reported by the platform, if readable.
    fn firmware_type(&self) -> Option<String>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VpdUpdate {
    pub key: String,
    pub value: String,
}

pub trait VpdWriter: Send + Sync {
    fn write(&self, updates: &[VpdUpdate]) -> Result<(), SinkError>;
}

/// NVRAM-backed integer system properties.
pub trait SystemProperties: Send + Sync {
    fn get_int(&self, name: &str) -> Option<i64>;
    fn set_int(&self, name: &str, value: i64) -> Result<(), SinkError>;
}

pub trait MigrationMarker: Send + Sync {
    fn exists(&self) -> bool;
    fn remove(&self) -> Result<(), SinkError>;
}

fn read_json_map<V: for<'de> Deserialize<'de>>(path: &Path) -> Result<BTreeMap<String, V>, SinkError> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| SinkError::Io(e.to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
        Err(e) => Err(SinkError::Io(e.to_string())),
    }
}

fn write_json_map<V: Serialize>(path: &Path, map: &BTreeMap<String, V>) -> Result<(), SinkError> {
    let bytes = serde_json::to_vec_pretty(map).map_err(|e| SinkError::Io(e.to_string()))?;
    write_file_atomic_durable(path, &bytes).map_err(|e| SinkError::Io(e.to_string()))
}

/// Install attributes read from a JSON file; a missing file reads as
/// unlocked.
#[derive(Debug, Clone)]
pub struct JsonInstallAttributes {
    path: PathBuf,
}

impl JsonInstallAttributes {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl InstallAttributes for JsonInstallAttributes {
    fn read(&self) -> InstallAttributesState {
        let Ok(bytes) = std::fs::read(&self.path) else {
            return InstallAttributesState::default();
        };
        serde_json::from_slice(&bytes).unwrap_or_else(|err| {
            tracing::warn!(path = %self.path.display(), error = %err, "install attributes unreadable; treating as unlocked");
            InstallAttributesState::default()
        })
    }
}

#[derive(Debug, Clone)]
pub struct FileFirmwareInfo {
    path: PathBuf,
}

impl FileFirmwareInfo {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl FirmwareInfo for FileFirmwareInfo {
    fn firmware_type(&self) -> Option<String> {
        std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
    }
}

#[derive(Debug, Default)]
pub struct FixedFirmwareInfo(pub Option<String>);

impl FirmwareInfo for FixedFirmwareInfo {
    fn firmware_type(&self) -> Option<String> {
        self.0.clone()
    }
}

/// VPD cells kept in a JSON object.
#[derive(Debug)]
pub struct JsonVpdStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonVpdStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn read_all(&self) -> Result<BTreeMap<String, String>, SinkError> {
        read_json_map(&self.path)
    }
}

impl VpdWriter for JsonVpdStore {
    fn write(&self, updates: &[VpdUpdate]) -> Result<(), SinkError> {
        let _guard = self.lock.lock();
        let mut cells: BTreeMap<String, String> = read_json_map(&self.path)?;
        for update in updates {
            cells.insert(update.key.clone(), update.value.clone());
        }
        write_json_map(&self.path, &cells)
    }
}

#[derive(Debug)]
pub struct JsonSystemProperties {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonSystemProperties {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }
}

impl SystemProperties for JsonSystemProperties {
    fn get_int(&self, name: &str) -> Option<i64> {
        let _guard = self.lock.lock();
        read_json_map::<i64>(&self.path).ok()?.get(name).copied()
    }

    fn set_int(&self, name: &str, value: i64) -> Result<(), SinkError> {
        let _guard = self.lock.lock();
        let mut cells: BTreeMap<String, i64> = read_json_map(&self.path)?;
        cells.insert(name.to_string(), value);
        write_json_map(&self.path, &cells)
    }
}

#[derive(Debug, Clone)]
pub struct FileMigrationMarker {
    path: PathBuf,
}

impl FileMigrationMarker {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl MigrationMarker for FileMigrationMarker {
    fn exists(&self) -> bool {
        self.path.exists()
    }

    fn remove(&self) -> Result<(), SinkError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SinkError::Io(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vpd_store_merges_updates() {
        let dir = tempfile::tempdir().expect("tmp");
        let vpd = JsonVpdStore::new(dir.path().join("vpd.json"));
        vpd.write(&[VpdUpdate { key: "a".into(), value: "1".into() }]).expect("write");
        vpd.write(&[VpdUpdate { key: "b".into(), value: "0".into() }]).expect("write");
        let cells = vpd.read_all().expect("read");
        assert_eq!(cells.get("a").map(String::as_str), Some("1"));
        assert_eq!(cells.get("b").map(String::as_str), Some("0"));
    }

    #[test]
    fn missing_install_attributes_are_unlocked() {
        let dir = tempfile::tempdir().expect("tmp");
        let attrs = JsonInstallAttributes::new(dir.path().join("install_attributes.json"));
        assert_eq!(attrs.read(), InstallAttributesState::default());
        std::fs::write(
            dir.path().join("install_attributes.json"),
            br#"{"locked":true,"mode":"enterprise"}"#,
        )
        .expect("write");
        assert!(attrs.read().is_enterprise());
    }

    #[test]
    fn system_properties_round_trip() {
        let dir = tempfile::tempdir().expect("tmp");
        let props = JsonSystemProperties::new(dir.path().join("nvram.json"));
        assert_eq!(props.get_int("block_devmode"), None);
        props.set_int("block_devmode", 1).expect("set");
        assert_eq!(props.get_int("block_devmode"), Some(1));
    }
}
