mod common;

use std::sync::Arc;

use common::{blob, device_payload, offered, signing_key, TestDevice};
use trustroot_core::collaborators::{
    FileMigrationMarker, FixedFirmwareInfo, JsonInstallAttributes, SinkError, SystemProperties,
    VpdUpdate, VpdWriter,
};
use trustroot_core::device_policy::SystemSettingsPlan;
use trustroot_core::{
    policy_allows_user, DeviceCollaborators, PolicyEngine, PolicyError, PolicyNamespace,
    SignatureCheck, SkipReason, StoreFlags,
};

fn store_device(engine: &mut PolicyEngine, settings: &str, flags: StoreFlags) -> Result<(), PolicyError> {
    let k = signing_key(1);
    let new_key = flags.contains(StoreFlags::INSTALL_NEW).then(|| offered(&k)).flatten();
    engine
        .store(&PolicyNamespace::device(), &blob(&k, &device_payload(settings), new_key), flags, SignatureCheck::Enabled)
        .complete()
}

fn vpd_cell(dev: &TestDevice, key: &str) -> Option<String> {
    dev.vpd.read_all().expect("vpd").get(key).cloned()
}

#[test]
fn device_store_pushes_flags() {
    let dev = TestDevice::new();
    dev.lock_install_attributes("enterprise");
    let mut engine = dev.open();
    store_device(&mut engine, r#"{"block_devmode":true}"#, StoreFlags::INSTALL_NEW).expect("store");

    assert_eq!(vpd_cell(&dev, "block_devmode").as_deref(), Some("1"));
    assert_eq!(vpd_cell(&dev, "check_enrollment").as_deref(), Some("1"));
    assert_eq!(dev.nvram.get_int("block_devmode"), Some(1));
    assert_eq!(dev.nvram.get_int("nvram_cleared"), Some(0));

    store_device(&mut engine, r#"{"block_devmode":false}"#, StoreFlags::NONE).expect("store");
    assert_eq!(vpd_cell(&dev, "block_devmode").as_deref(), Some("0"));
    assert_eq!(dev.nvram.get_int("block_devmode"), Some(0));
}

#[test]
fn consumer_device_clears_enrollment_check() {
    let dev = TestDevice::new();
    dev.lock_install_attributes("consumer");
    let mut engine = dev.open();
    store_device(&mut engine, "{}", StoreFlags::INSTALL_NEW).expect("store");
    assert_eq!(vpd_cell(&dev, "check_enrollment").as_deref(), Some("0"));
    assert_eq!(vpd_cell(&dev, "block_devmode").as_deref(), Some("0"));
}

#[test]
fn unlocked_install_attributes_leave_enrollment_check_alone() {
    let dev = TestDevice::new();
    let mut engine = dev.open();
    store_device(&mut engine, "{}", StoreFlags::INSTALL_NEW).expect("store");
    assert_eq!(vpd_cell(&dev, "check_enrollment"), None);
    assert_eq!(vpd_cell(&dev, "block_devmode").as_deref(), Some("0"));
}

#[test]
fn non_chrome_firmware_skips_flags() {
    let dev = TestDevice::new();
    dev.set_firmware("nonchrome\n");
    let mut engine = dev.open();
    assert!(!engine.may_update_system_settings());
    store_device(&mut engine, r#"{"block_devmode":true}"#, StoreFlags::INSTALL_NEW).expect("store");
    assert!(!dev.path("vpd.json").exists());
    assert!(matches!(
        engine.update_system_settings(),
        SystemSettingsPlan::Skipped(SkipReason::NonChromeFirmware)
    ));
}

#[test]
fn no_owner_key_skips_flags() {
    let dev = TestDevice::new();
    let engine = dev.open();
    assert!(matches!(
        engine.update_system_settings(),
        SystemSettingsPlan::Skipped(SkipReason::NoOwnerKey)
    ));
}

#[test]
fn migration_marker_removed_unless_preserved() {
    let dev = TestDevice::new();
    dev.lock_install_attributes("enterprise");
    let marker = dev.config.migration_marker_path();
    std::fs::create_dir_all(&dev.config.state_dir).expect("mkdir");

    std::fs::write(&marker, b"").expect("marker");
    let mut engine = dev.open();
    store_device(&mut engine, r#"{"allow_preserve_device_state":true}"#, StoreFlags::INSTALL_NEW).expect("store");
    assert!(marker.exists());

    store_device(&mut engine, "{}", StoreFlags::NONE).expect("store");
    assert!(!marker.exists());
}

#[test]
fn settings_follow_the_latest_device_store() {
    let dev = TestDevice::new();
    let mut engine = dev.open();
    store_device(&mut engine, r#"{"user_whitelist":["a@example.com"]}"#, StoreFlags::INSTALL_NEW).expect("store");
    assert!(policy_allows_user(engine.device_settings(), "a@example.com"));
    assert!(!policy_allows_user(engine.device_settings(), "b@example.com"));

    let rejected = {
        let k2 = signing_key(2);
        engine
            .store(&PolicyNamespace::device(), &blob(&k2, &device_payload("{}"), None), StoreFlags::NONE, SignatureCheck::Enabled)
            .accepted()
    };
    assert!(rejected.is_err());
    assert!(!policy_allows_user(engine.device_settings(), "b@example.com"));

    store_device(&mut engine, r#"{"user_allowlist":[]}"#, StoreFlags::NONE).expect("store");
    assert!(policy_allows_user(engine.device_settings(), "b@example.com"));

    drop(engine);
    let reopened = dev.open();
    assert_eq!(reopened.device_settings().user_allowlist, Some(Vec::new()));
}

struct BrokenVpd;

impl VpdWriter for BrokenVpd {
    fn write(&self, _updates: &[VpdUpdate]) -> Result<(), SinkError> {
        Err(SinkError::Rejected("vpd is read-only".to_string()))
    }
}

#[test]
fn vpd_failure_fails_completion_but_keeps_policy() {
    let dev = TestDevice::new();
    let collaborators = DeviceCollaborators {
        install_attributes: Box::new(JsonInstallAttributes::new(dev.path("install_attributes.json"))),
        firmware: Box::new(FixedFirmwareInfo(None)),
        vpd: Arc::new(BrokenVpd),
        system_properties: dev.nvram.clone(),
        migration_marker: Arc::new(FileMigrationMarker::new(dev.config.migration_marker_path())),
    };
    let mut engine = PolicyEngine::open(&dev.config, collaborators);
    let err = store_device(&mut engine, r#"{"block_devmode":true}"#, StoreFlags::INSTALL_NEW)
        .expect_err("vpd push fails");
    assert_eq!(err.code(), "PERSISTENCE_FAILED");

    // Policy and key are still in memory and on disk.
    assert!(engine.retrieve(&PolicyNamespace::device()).is_some());
    assert!(engine.device_settings().block_devmode());
    assert!(dev.state_file("policy").exists());
    assert!(dev.state_file("owner.key").exists());
    // NVRAM is independent of the VPD push.
    assert_eq!(dev.nvram.get_int("block_devmode"), Some(1));

    store_device(&mut engine, "{}", StoreFlags::NONE).expect_err("still failing vpd");
    assert!(!engine.device_settings().block_devmode());
}
