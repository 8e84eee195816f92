// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

#![no_main]

use std::sync::Arc;

use libfuzzer_sys::fuzz_target;
use trustroot_core::collaborators::{
    FileMigrationMarker, FixedFirmwareInfo, JsonInstallAttributes, JsonSystemProperties,
    JsonVpdStore,
};
use trustroot_core::{DeviceCollaborators, EngineConfig, PolicyEngine};
use trustroot_protocol::SignatureAlgorithm;

// Without an owner key no command can validate, however it is framed.
fuzz_target!(|data: &[u8]| {
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let config = EngineConfig::with_state_dir(dir.path());
    let collaborators = DeviceCollaborators {
        install_attributes: Box::new(JsonInstallAttributes::new(dir.path().join("attrs.json"))),
        firmware: Box::new(FixedFirmwareInfo(None)),
        vpd: Arc::new(JsonVpdStore::new(dir.path().join("vpd.json"))),
        system_properties: Arc::new(JsonSystemProperties::new(dir.path().join("nvram.json"))),
        migration_marker: Arc::new(FileMigrationMarker::new(config.migration_marker_path())),
    };
    let mut engine = PolicyEngine::open(&config, collaborators);
    for algorithm in [SignatureAlgorithm::Ed25519, SignatureAlgorithm::Ed25519Sha256] {
        assert!(!engine.validate_remote_wipe_command(data, algorithm));
    }
});
