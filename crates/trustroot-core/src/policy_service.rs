//! Namespace-agnostic Store / Retrieve / Persist with the owner-key
//! lifecycle rules applied on every store.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::BitOr;
use std::path::PathBuf;

use trustroot_protocol::{decode_policy_data, decode_signed_envelope, SignedEnvelope};

use crate::config::EngineConfig;
use crate::error::{PolicyError, PolicyResult};
use crate::namespace::{PolicyDomain, PolicyNamespace};
use crate::owner_key::{key_fingerprint, KeySnapshot, OwnerKey};
use crate::policy_store::{PolicySnapshot, PolicyStore, StoredPolicy};

/// Key-lifecycle permissions for a single store call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct StoreFlags(u8);

impl StoreFlags {
    pub const NONE: Self = Self(0);
    pub const ROTATE: Self = Self(1);
    pub const INSTALL_NEW: Self = Self(1 << 1);
    pub const CLOBBER: Self = Self(1 << 2);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for StoreFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignatureCheck {
    #[default]
    Enabled,
    /// Only for managed deployments that deliver unsigned component policy.
    Disabled,
}

/// Result of the synchronous half of a store.
///
/// A key mutation stands even when the payload is rejected afterwards, so
/// `key_write` can be present next to a failed `policy_write`.
#[derive(Debug)]
pub struct StoreAttempt {
    pub namespace: PolicyNamespace,
    pub key_write: Option<KeySnapshot>,
    pub policy_write: PolicyResult<PolicySnapshot>,
}

impl StoreAttempt {
    pub fn accepted(&self) -> bool {
        self.policy_write.is_ok()
    }

    /// Runs the durable writes. Reports the validation error if there was
    /// one, otherwise the first persistence error.
    pub fn commit(&self) -> PolicyResult<()> {
        let key_result = self.key_write.as_ref().map_or(Ok(()), KeySnapshot::commit);
        let snapshot = self.policy_write.as_ref().map_err(Clone::clone)?;
        let policy_result = snapshot.commit();
        key_result.and(policy_result)
    }
}

pub struct PolicyService {
    owner_key: OwnerKey,
    stores: BTreeMap<PolicyNamespace, PolicyStore>,
    state_dir: PathBuf,
    device_policy_file: String,
    component_prefix: String,
    max_blob_bytes: usize,
}

impl PolicyService {
    pub fn new(config: &EngineConfig, owner_key: OwnerKey) -> Self {
        Self {
            owner_key,
            stores: BTreeMap::new(),
            state_dir: config.state_dir.clone(),
            device_policy_file: config.device_policy_file.clone(),
            component_prefix: config.component_policy_prefix.clone(),
            max_blob_bytes: config.max_blob_bytes,
        }
    }

    pub fn owner_key(&self) -> &OwnerKey {
        &self.owner_key
    }

    pub fn max_blob_bytes(&self) -> usize {
        self.max_blob_bytes
    }

    fn store_for(&mut self, namespace: &PolicyNamespace) -> &mut PolicyStore {
        let path = namespace.file_path(&self.state_dir, &self.device_policy_file, &self.component_prefix);
        let max_blob_bytes = self.max_blob_bytes;
        self.stores
            .entry(namespace.clone())
            .or_insert_with(|| PolicyStore::new(namespace.clone(), path, max_blob_bytes))
    }

    /// Current policy of `namespace`, loading it on first touch.
    pub fn policy(&mut self, namespace: &PolicyNamespace) -> Option<&StoredPolicy> {
        self.store_for(namespace).get()
    }

    pub fn device_policy(&mut self) -> Option<&StoredPolicy> {
        self.policy(&PolicyNamespace::device())
    }

    /// Owner key and device policy together, for checks that need both.
    pub fn device_view(&mut self) -> (&OwnerKey, Option<&StoredPolicy>) {
        let device = PolicyNamespace::device();
        let path = device.file_path(&self.state_dir, &self.device_policy_file, &self.component_prefix);
        let max_blob_bytes = self.max_blob_bytes;
        let store = self
            .stores
            .entry(device.clone())
            .or_insert_with(|| PolicyStore::new(device, path, max_blob_bytes));
        (&self.owner_key, store.get())
    }

    pub fn store(
        &mut self,
        namespace: &PolicyNamespace,
        blob: &[u8],
        flags: StoreFlags,
        signature_check: SignatureCheck,
    ) -> StoreAttempt {
        let mut key_write = None;
        let policy_write = self.validate_and_set(namespace, blob, flags, signature_check, &mut key_write);
        match &policy_write {
            Ok(_) => tracing::info!(event = "policy_stored", namespace = %namespace, flags = flags.bits(), "accepted policy"),
            Err(err) => tracing::warn!(event = "policy_store_rejected", namespace = %namespace, code = err.code(), error = %err, key_changed = key_write.is_some(), "rejected policy"),
        }
        StoreAttempt {
            namespace: namespace.clone(),
            key_write,
            policy_write,
        }
    }

    fn validate_and_set(
        &mut self,
        namespace: &PolicyNamespace,
        blob: &[u8],
        flags: StoreFlags,
        signature_check: SignatureCheck,
        key_write: &mut Option<KeySnapshot>,
    ) -> PolicyResult<PolicySnapshot> {
        let envelope = decode_signed_envelope(blob, self.max_blob_bytes)?;

        if signature_check == SignatureCheck::Disabled {
            if namespace.is_device() {
                return Err(PolicyError::StateConflict(
                    "device policy always requires a signature check".to_string(),
                ));
            }
            if envelope.new_key.is_some() || !flags.is_empty() {
                return Err(PolicyError::KeyInstallNotPermitted(
                    "key changes need a signature check".to_string(),
                ));
            }
            return self.set_validated(namespace, envelope);
        }

        if let Some(new_key) = &envelope.new_key {
            if !self.owner_key.equals(&new_key.key) {
                if !namespace.is_device() {
                    return Err(PolicyError::KeyInstallNotPermitted(
                        "only device policy may change the owner key".to_string(),
                    ));
                }
                let populated = self.owner_key.is_populated();
                if !populated && flags.contains(StoreFlags::INSTALL_NEW) {
                    self.owner_key.populate_from_buffer(&new_key.key)?;
                } else if flags.contains(StoreFlags::CLOBBER) {
                    self.owner_key.clobber_compromised_key(&new_key.key)?;
                } else if let (true, true, Some(signature)) = (
                    populated,
                    flags.contains(StoreFlags::ROTATE),
                    new_key.signature.as_deref(),
                ) {
                    self.owner_key
                        .rotate(&new_key.key, signature, envelope.signature_algorithm())?;
                } else {
                    tracing::warn!(event = "key_install_not_permitted", namespace = %namespace, offered = %key_fingerprint(&new_key.key), flags = flags.bits(), "new owner key offered without permission");
                    return Err(PolicyError::KeyInstallNotPermitted(format!(
                        "flags {:#x} do not permit installing a new key while the key is {}",
                        flags.bits(),
                        if populated { "populated" } else { "missing" }
                    )));
                }
                *key_write = Some(self.owner_key.snapshot()?);
            }
        }

        if !self.owner_key.is_populated() {
            return Err(PolicyError::SignatureVerificationFailed);
        }
        if !self.owner_key.verify(
            &envelope.payload,
            &envelope.payload_signature,
            envelope.signature_algorithm(),
        ) {
            return Err(PolicyError::SignatureVerificationFailed);
        }
        self.set_validated(namespace, envelope)
    }

    fn set_validated(
        &mut self,
        namespace: &PolicyNamespace,
        envelope: SignedEnvelope,
    ) -> PolicyResult<PolicySnapshot> {
        let data = decode_policy_data(&envelope.payload)?;
        let expected = namespace.domain().accepted_policy_type();
        let policy_type = data.policy_type.as_deref().unwrap_or_default();
        if policy_type != expected {
            return Err(PolicyError::PolicyTypeRejected {
                namespace: namespace.to_string(),
                policy_type: policy_type.to_string(),
            });
        }
        let store = self.store_for(namespace);
        store.set(StoredPolicy::new(envelope, data));
        Ok(store.snapshot())
    }

    /// Re-encodes the cached envelope. Never touches the owner key.
    pub fn retrieve(&mut self, namespace: &PolicyNamespace) -> Option<Vec<u8>> {
        self.policy(namespace).map(StoredPolicy::encode)
    }

    pub fn persist_policy(&mut self, namespace: &PolicyNamespace) -> PolicySnapshot {
        self.store_for(namespace).snapshot()
    }

    pub fn persist_key(&mut self) -> PolicyResult<KeySnapshot> {
        self.owner_key.snapshot()
    }

    /// Drops unsigned component policy.
    pub fn delete(
        &mut self,
        namespace: &PolicyNamespace,
        signature_check: SignatureCheck,
    ) -> PolicyResult<PolicySnapshot> {
        if namespace.is_device() {
            return Err(PolicyError::StateConflict(
                "device policy cannot be deleted".to_string(),
            ));
        }
        if signature_check != SignatureCheck::Disabled {
            return Err(PolicyError::StateConflict(
                "only unsigned component policy may be deleted".to_string(),
            ));
        }
        let store = self.store_for(namespace);
        store.clear();
        tracing::info!(event = "policy_deleted", namespace = %namespace, "deleted component policy");
        Ok(store.snapshot())
    }

    /// Component ids with stored policy in `domain`, sorted.
    pub fn list_component_ids(&mut self, domain: PolicyDomain) -> PolicyResult<Vec<String>> {
        if domain == PolicyDomain::Chrome {
            return Ok(Vec::new());
        }
        let mut ids = BTreeSet::new();
        match std::fs::read_dir(&self.state_dir) {
            Ok(entries) => {
                for entry in entries.flatten() {
                    let Ok(name) = entry.file_name().into_string() else {
                        continue;
                    };
                    if let Some(id) =
                        PolicyNamespace::component_from_file_name(domain, &name, &self.component_prefix)
                    {
                        ids.insert(id);
                    }
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(PolicyError::PersistenceFailed(format!(
                    "list {} failed: {err}",
                    self.state_dir.display()
                )))
            }
        }
        // In-memory state wins over what has reached disk so far.
        for (namespace, store) in self.stores.iter_mut() {
            if namespace.domain() != domain {
                continue;
            }
            if store.get().is_some() {
                ids.insert(namespace.component_id().to_string());
            } else {
                ids.remove(namespace.component_id());
            }
        }
        Ok(ids.into_iter().collect())
    }
}
