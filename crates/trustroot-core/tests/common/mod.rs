#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use ed25519_dalek::{Signer, SigningKey};
use prost::Message;
use tempfile::TempDir;
use trustroot_core::collaborators::{
    FileFirmwareInfo, FileMigrationMarker, JsonInstallAttributes, JsonSystemProperties,
    JsonVpdStore,
};
use trustroot_core::{DeviceCollaborators, EngineConfig, PolicyEngine};
use trustroot_protocol::{
    encode_signed_envelope, NewKey, PolicyData, SignatureAlgorithm, SignedEnvelope,
    DEVICE_POLICY_TYPE,
};

pub fn signing_key(seed: u8) -> SigningKey {
    SigningKey::from_bytes(&[seed; 32])
}

pub fn public_key(key: &SigningKey) -> Vec<u8> {
    key.verifying_key().to_bytes().to_vec()
}

pub fn sign(key: &SigningKey, message: &[u8], algorithm: SignatureAlgorithm) -> Vec<u8> {
    key.sign(&algorithm.signed_message(message)).to_bytes().to_vec()
}

pub fn payload(policy_type: &str, value: &[u8]) -> Vec<u8> {
    PolicyData {
        policy_type: Some(policy_type.to_string()),
        policy_value: Some(value.to_vec()),
        timestamp_ms: Some(1_700_000_000_000),
        ..Default::default()
    }
    .encode_to_vec()
}

pub fn device_payload(settings_json: &str) -> Vec<u8> {
    payload(DEVICE_POLICY_TYPE, settings_json.as_bytes())
}

pub fn blob(signer: &SigningKey, payload: &[u8], new_key: Option<NewKey>) -> Vec<u8> {
    encode_signed_envelope(&SignedEnvelope {
        payload: payload.to_vec(),
        payload_signature: sign(signer, payload, SignatureAlgorithm::Ed25519),
        new_key,
        algorithm: None,
    })
}

/// New key offered without a rotation signature.
pub fn offered(next: &SigningKey) -> Option<NewKey> {
    Some(NewKey {
        key: public_key(next),
        signature: None,
    })
}

/// New key signed by `current`.
pub fn rotation(current: &SigningKey, next: &SigningKey) -> Option<NewKey> {
    let key = public_key(next);
    let signature = sign(current, &key, SignatureAlgorithm::Ed25519);
    Some(NewKey {
        key,
        signature: Some(signature),
    })
}

/// A device backed by JSON files in a temporary directory.
pub struct TestDevice {
    pub dir: TempDir,
    pub config: EngineConfig,
    pub vpd: Arc<JsonVpdStore>,
    pub nvram: Arc<JsonSystemProperties>,
}

impl TestDevice {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tmp");
        let config = EngineConfig::with_state_dir(dir.path().join("state"));
        let vpd = Arc::new(JsonVpdStore::new(dir.path().join("vpd.json")));
        let nvram = Arc::new(JsonSystemProperties::new(dir.path().join("nvram.json")));
        Self {
            dir,
            config,
            vpd,
            nvram,
        }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn collaborators(&self) -> DeviceCollaborators {
        DeviceCollaborators {
            install_attributes: Box::new(JsonInstallAttributes::new(
                self.path("install_attributes.json"),
            )),
            firmware: Box::new(FileFirmwareInfo::new(self.path("firmware_type"))),
            vpd: self.vpd.clone(),
            system_properties: self.nvram.clone(),
            migration_marker: Arc::new(FileMigrationMarker::new(
                self.config.migration_marker_path(),
            )),
        }
    }

    pub fn lock_install_attributes(&self, mode: &str) {
        std::fs::write(
            self.path("install_attributes.json"),
            format!(r#"{{"locked":true,"mode":"{mode}"}}"#),
        )
        .expect("write install attributes");
    }

    pub fn set_firmware(&self, firmware: &str) {
        std::fs::write(self.path("firmware_type"), firmware).expect("write firmware");
    }

    pub fn open(&self) -> PolicyEngine {
        PolicyEngine::open(&self.config, self.collaborators())
    }

    pub fn state_file(&self, name: &str) -> PathBuf {
        self.config.state_dir.join(name)
    }
}
