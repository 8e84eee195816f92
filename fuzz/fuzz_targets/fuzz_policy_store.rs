// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use trustroot_core::owner_key::OwnerKey;
use trustroot_core::policy_service::PolicyService;
use trustroot_core::{EngineConfig, PolicyNamespace, SignatureCheck, StoreFlags};

// Untrusted blobs against a fresh device: nothing may ever be accepted
// without a key offer, and a rejected blob never leaves policy behind.
fuzz_target!(|data: &[u8]| {
    let Some((&flag_bits, blob)) = data.split_first() else {
        return;
    };
    let Ok(dir) = tempfile::tempdir() else {
        return;
    };
    let config = EngineConfig::with_state_dir(dir.path());
    let mut service = PolicyService::new(&config, OwnerKey::new(config.owner_key_path()));
    let mut flags = StoreFlags::NONE;
    for flag in [StoreFlags::ROTATE, StoreFlags::INSTALL_NEW, StoreFlags::CLOBBER] {
        if flag_bits & flag.bits() != 0 {
            flags = flags | flag;
        }
    }
    let device = PolicyNamespace::device();
    let attempt = service.store(&device, blob, flags, SignatureCheck::Enabled);
    if attempt.key_write.is_none() {
        assert!(!attempt.accepted());
        assert!(!service.owner_key().is_populated());
    }
    if !attempt.accepted() {
        assert!(service.retrieve(&device).is_none());
    }
});
