//! Device namespace specifics: the typed settings view, the security flags
//! derived from it, remote-wipe validation and ownership checks.
//!
//! The synchronizer holds no reference to the policy store or the owner
//! key; callers lend both for the duration of each call.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use trustroot_protocol::{
    decode_policy_data, decode_remote_command, decode_signed_data, ManagementMode, PolicyData,
    RemoteCommandType, SignatureAlgorithm, REMOTE_COMMAND_POLICY_TYPE,
};

use crate::collaborators::{
    FirmwareInfo, InstallAttributes, InstallAttributesState, MigrationMarker, SystemProperties,
    VpdUpdate, VpdWriter,
};
use crate::error::{PolicyError, PolicyResult};
use crate::owner_key::OwnerKey;
use crate::policy_store::StoredPolicy;
use crate::settings::DeviceSettings;

/// Firmware type reported by devices not running Chrome OS firmware.
pub const NON_CHROME_FIRMWARE: &str = "nonchrome";

pub const VPD_BLOCK_DEVMODE: &str = "block_devmode";
pub const VPD_CHECK_ENROLLMENT: &str = "check_enrollment";
pub const NVRAM_BLOCK_DEVMODE: &str = "block_devmode";
pub const NVRAM_CLEARED: &str = "nvram_cleared";

pub struct DeviceCollaborators {
    pub install_attributes: Box<dyn InstallAttributes>,
    pub firmware: Box<dyn FirmwareInfo>,
    pub vpd: Arc<dyn VpdWriter>,
    pub system_properties: Arc<dyn SystemProperties>,
    pub migration_marker: Arc<dyn MigrationMarker>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NonChromeFirmware,
    NoOwnerKey,
}

/// Startup consistency between the stored key and the stored device policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    NoPolicy,
    Consistent,
    KeyMissingWithPolicy,
    PolicyUnverifiable,
}

impl DeviceState {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoPolicy => "no_policy",
            Self::Consistent => "consistent",
            Self::KeyMissingWithPolicy => "key_missing_with_policy",
            Self::PolicyUnverifiable => "policy_unverifiable",
        }
    }
}

/// Generations handed to flag jobs, and the newest one pushed so far.
///
/// Jobs may run on several blocking tasks at once. The lock orders their
/// writes, and a job planned before the last one pushed is dropped so the
/// VPD and NVRAM always end at the newest settings.
#[derive(Debug, Default)]
pub struct FlagSequence {
    planned: AtomicU64,
    last_pushed: Mutex<u64>,
}

impl FlagSequence {
    fn next(&self) -> u64 {
        self.planned.fetch_add(1, Ordering::Relaxed) + 1
    }
}

/// Flag writes derived from one settings snapshot, runnable off the
/// validation path.
pub struct SystemSettingsJob {
    pub block_devmode: bool,
    /// `None` while the install attributes are unlocked.
    pub check_enrollment: Option<bool>,
    pub remove_migration_marker: bool,
    generation: u64,
    sequence: Arc<FlagSequence>,
    vpd: Arc<dyn VpdWriter>,
    system_properties: Arc<dyn SystemProperties>,
    migration_marker: Arc<dyn MigrationMarker>,
}

pub enum SystemSettingsPlan {
    Skipped(SkipReason),
    Apply(SystemSettingsJob),
}

fn flag(value: bool) -> String {
    let text = if value { "1" } else { "0" };
    text.to_string()
}

impl SystemSettingsJob {
    pub fn vpd_updates(&self) -> Vec<VpdUpdate> {
        let mut updates = vec![VpdUpdate {
            key: VPD_BLOCK_DEVMODE.to_string(),
            value: flag(self.block_devmode),
        }];
        if let Some(check) = self.check_enrollment {
            updates.push(VpdUpdate {
                key: VPD_CHECK_ENROLLMENT.to_string(),
                value: flag(check),
            });
        }
        updates
    }

    fn sync_nvram(&self) -> PolicyResult<()> {
        let props = &self.system_properties;
        let desired = i64::from(self.block_devmode);
        let current = props.get_int(NVRAM_BLOCK_DEVMODE);
        let cleared = props.get_int(NVRAM_CLEARED).unwrap_or(0);
        if current == Some(desired) && cleared == 0 {
            return Ok(());
        }
        let to_err = |e: crate::collaborators::SinkError| PolicyError::PersistenceFailed(e.to_string());
        props.set_int(NVRAM_CLEARED, 0).map_err(to_err)?;
        props.set_int(NVRAM_BLOCK_DEVMODE, desired).map_err(to_err)?;
        tracing::info!(event = "nvram_synced", block_devmode = desired, "updated nvram security cells");
        Ok(())
    }

    /// Blocking. Failures leave the in-memory settings alone. Returns
    /// `Ok(())` without writing when a newer job already pushed its flags.
    pub fn run(&self) -> PolicyResult<()> {
        let mut last = self.sequence.last_pushed.lock();
        if self.generation < *last {
            tracing::info!(event = "system_settings_superseded", generation = self.generation, latest = *last, "newer device flags already pushed");
            return Ok(());
        }
        let result = self.push();
        *last = self.generation;
        result
    }

    fn push(&self) -> PolicyResult<()> {
        let nvram = self.sync_nvram();
        if let Err(err) = &nvram {
            tracing::error!(event = "nvram_sync_failed", error = %err, "failed to update nvram security cells");
        }
        let updates = self.vpd_updates();
        let vpd = self.vpd.write(&updates).map_err(|e| {
            tracing::error!(event = "vpd_update_failed", error = %e, "failed to push vpd flags");
            PolicyError::PersistenceFailed(e.to_string())
        });
        if vpd.is_ok() {
            tracing::info!(event = "vpd_updated", block_devmode = self.block_devmode, check_enrollment = ?self.check_enrollment, "pushed vpd flags");
        }
        if self.remove_migration_marker && self.migration_marker.exists() {
            match self.migration_marker.remove() {
                Ok(()) => tracing::info!(event = "migration_marker_removed", "removed migration preserve marker"),
                Err(err) => tracing::warn!(event = "migration_marker_remove_failed", error = %err, "could not remove migration preserve marker"),
            }
        }
        nvram.and(vpd)
    }
}

pub struct DevicePolicySync {
    collaborators: DeviceCollaborators,
    settings: DeviceSettings,
    flag_sequence: Arc<FlagSequence>,
}

impl DevicePolicySync {
    pub fn new(collaborators: DeviceCollaborators) -> Self {
        Self {
            collaborators,
            settings: DeviceSettings::default(),
            flag_sequence: Arc::default(),
        }
    }

    /// Recomputes the cached settings from the stored device policy.
    pub fn refresh_settings(&mut self, device_policy: Option<&StoredPolicy>) {
        self.settings = DeviceSettings::from_policy_value(
            device_policy.and_then(|p| p.payload().policy_value.as_deref()),
        );
    }

    pub fn settings(&self) -> &DeviceSettings {
        &self.settings
    }

    pub fn install_attributes(&self) -> InstallAttributesState {
        self.collaborators.install_attributes.read()
    }

    pub fn may_update_system_settings(&self) -> bool {
        self.collaborators.firmware.firmware_type().as_deref() != Some(NON_CHROME_FIRMWARE)
    }

    pub fn plan_system_settings(&self, owner_key: &OwnerKey) -> SystemSettingsPlan {
        if !self.may_update_system_settings() {
            return SystemSettingsPlan::Skipped(SkipReason::NonChromeFirmware);
        }
        if !owner_key.is_populated() {
            return SystemSettingsPlan::Skipped(SkipReason::NoOwnerKey);
        }
        let attrs = self.install_attributes();
        let check_enrollment = attrs.locked.then(|| attrs.is_enterprise());
        let remove_migration_marker =
            attrs.locked && self.settings.allow_preserve_device_state != Some(true);
        SystemSettingsPlan::Apply(SystemSettingsJob {
            block_devmode: self.settings.block_devmode(),
            check_enrollment,
            remove_migration_marker,
            generation: self.flag_sequence.next(),
            sequence: Arc::clone(&self.flag_sequence),
            vpd: Arc::clone(&self.collaborators.vpd),
            system_properties: Arc::clone(&self.collaborators.system_properties),
            migration_marker: Arc::clone(&self.collaborators.migration_marker),
        })
    }

    /// Accepts only a correctly signed powerwash command addressed to this
    /// device or to any device. Checks run in order and stop at the first
    /// failure.
    pub fn validate_remote_wipe_command(
        &self,
        owner_key: &OwnerKey,
        device_policy: Option<&StoredPolicy>,
        signed_bytes: &[u8],
        algorithm: SignatureAlgorithm,
        max_bytes: usize,
    ) -> bool {
        match check_remote_wipe(owner_key, device_policy, signed_bytes, algorithm, max_bytes) {
            Ok(()) => {
                tracing::info!(event = "remote_wipe_accepted", "validated remote powerwash command");
                true
            }
            Err(reason) => {
                tracing::warn!(event = "remote_wipe_rejected", reason, "rejected remote wipe command");
                false
            }
        }
    }

    pub fn check_device_state(
        &self,
        owner_key: &OwnerKey,
        device_policy: Option<&StoredPolicy>,
    ) -> DeviceState {
        let Some(policy) = device_policy else {
            return DeviceState::NoPolicy;
        };
        if !owner_key.is_populated() {
            return DeviceState::KeyMissingWithPolicy;
        }
        let envelope = policy.envelope();
        if owner_key.verify(
            &envelope.payload,
            &envelope.payload_signature,
            envelope.signature_algorithm(),
        ) {
            DeviceState::Consistent
        } else {
            DeviceState::PolicyUnverifiable
        }
    }
}

fn check_remote_wipe(
    owner_key: &OwnerKey,
    device_policy: Option<&StoredPolicy>,
    signed_bytes: &[u8],
    algorithm: SignatureAlgorithm,
    max_bytes: usize,
) -> Result<(), &'static str> {
    let signed = decode_signed_data(signed_bytes, max_bytes).map_err(|_| "undecodable signed data")?;
    if signed.algorithm.is_some_and(|embedded| embedded != algorithm) {
        return Err("signature algorithm mismatch");
    }
    if !owner_key.verify(&signed.data, &signed.signature, algorithm) {
        return Err("bad signature");
    }
    let data = decode_policy_data(&signed.data).map_err(|_| "undecodable policy data")?;
    if data.policy_type.as_deref() != Some(REMOTE_COMMAND_POLICY_TYPE) {
        return Err("wrong policy type");
    }
    let command_bytes = data.policy_value.as_deref().ok_or("missing command")?;
    let command = decode_remote_command(command_bytes).map_err(|_| "undecodable command")?;
    if command.command_type != Some(RemoteCommandType::DeviceRemotePowerwash as i32) {
        return Err("command is not a powerwash");
    }
    let target = command.target_device_id.as_deref().unwrap_or_default();
    if target.is_empty() {
        return Ok(());
    }
    let stored_id = device_policy.and_then(|p| p.payload().device_id.as_deref());
    if stored_id != Some(target) {
        return Err("device id mismatch");
    }
    Ok(())
}

/// Whether `candidate_email` owns the device described by `policy`.
///
/// Enterprise-managed devices have no single human owner.
pub fn given_user_is_owner(policy: &PolicyData, candidate_email: &str) -> bool {
    if policy.known_management_mode() == Some(ManagementMode::EnterpriseManaged) {
        return false;
    }
    policy.username.as_deref() == Some(candidate_email)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(username: Option<&str>, token: Option<&str>, mode: Option<ManagementMode>) -> PolicyData {
        PolicyData {
            username: username.map(str::to_string),
            request_token: token.map(str::to_string),
            management_mode: mode.map(|m| m as i32),
            ..Default::default()
        }
    }

    #[test]
    fn owner_matches_username() {
        assert!(given_user_is_owner(&data(Some("a@b"), None, None), "a@b"));
        assert!(given_user_is_owner(
            &data(Some("a@b"), None, Some(ManagementMode::LocalOwner)),
            "a@b"
        ));
        assert!(!given_user_is_owner(&data(Some("a@b"), None, None), "c@d"));
    }

    #[test]
    fn enterprise_devices_have_no_owner() {
        assert!(!given_user_is_owner(
            &data(Some("a@b"), None, Some(ManagementMode::EnterpriseManaged)),
            "a@b"
        ));
    }

    #[test]
    fn request_token_alone_confers_no_ownership() {
        assert!(!given_user_is_owner(&data(None, Some("token"), None), "a@b"));
        assert!(!given_user_is_owner(&data(None, Some("token"), None), ""));
    }

    fn job(
        dir: &std::path::Path,
        block_devmode: bool,
        sequence: &Arc<FlagSequence>,
    ) -> SystemSettingsJob {
        use crate::collaborators::{FileMigrationMarker, JsonSystemProperties, JsonVpdStore};

        SystemSettingsJob {
            block_devmode,
            check_enrollment: None,
            remove_migration_marker: false,
            generation: sequence.next(),
            sequence: Arc::clone(sequence),
            vpd: Arc::new(JsonVpdStore::new(dir.join("vpd.json"))),
            system_properties: Arc::new(JsonSystemProperties::new(dir.join("nvram.json"))),
            migration_marker: Arc::new(FileMigrationMarker::new(dir.join("marker"))),
        }
    }

    #[test]
    fn vpd_updates_omit_enrollment_when_undetermined() {
        let dir = tempfile::tempdir().expect("tmp");
        let job = job(dir.path(), true, &Arc::default());
        assert_eq!(
            job.vpd_updates(),
            vec![VpdUpdate {
                key: VPD_BLOCK_DEVMODE.to_string(),
                value: "1".to_string()
            }]
        );
    }

    #[test]
    fn nvram_cleared_forces_rewrite() {
        use crate::collaborators::JsonSystemProperties;

        let dir = tempfile::tempdir().expect("tmp");
        let props = JsonSystemProperties::new(dir.path().join("nvram.json"));
        props.set_int(NVRAM_BLOCK_DEVMODE, 0).expect("seed");
        props.set_int(NVRAM_CLEARED, 1).expect("seed");
        job(dir.path(), false, &Arc::default()).run().expect("run");
        assert_eq!(props.get_int(NVRAM_CLEARED), Some(0));
        assert_eq!(props.get_int(NVRAM_BLOCK_DEVMODE), Some(0));
    }

    #[test]
    fn older_flag_job_is_dropped_after_newer_one_ran() {
        use crate::collaborators::{JsonSystemProperties, JsonVpdStore};

        let dir = tempfile::tempdir().expect("tmp");
        let sequence = Arc::new(FlagSequence::default());
        let unblock = job(dir.path(), false, &sequence);
        let block = job(dir.path(), true, &sequence);
        block.run().expect("newer");
        unblock.run().expect("stale job is not an error");

        let vpd = JsonVpdStore::new(dir.path().join("vpd.json")).read_all().expect("vpd");
        assert_eq!(vpd.get(VPD_BLOCK_DEVMODE).map(String::as_str), Some("1"));
        let props = JsonSystemProperties::new(dir.path().join("nvram.json"));
        assert_eq!(props.get_int(NVRAM_BLOCK_DEVMODE), Some(1));
    }
}
