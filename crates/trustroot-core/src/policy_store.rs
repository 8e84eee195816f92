use std::path::{Path, PathBuf};
use std::sync::Arc;

use trustroot_protocol::{
    decode_policy_data, decode_signed_envelope, encode_signed_envelope, PolicyData,
    SignedEnvelope,
};

use crate::durable::{DurableSlot, SlotContents};
use crate::error::{PolicyError, PolicyResult};
use crate::namespace::PolicyNamespace;

/// A validated envelope together with its parsed payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPolicy {
    envelope: SignedEnvelope,
    data: PolicyData,
}

impl StoredPolicy {
    pub fn new(envelope: SignedEnvelope, data: PolicyData) -> Self {
        Self { envelope, data }
    }

    pub fn from_envelope(envelope: SignedEnvelope) -> PolicyResult<Self> {
        let data = decode_policy_data(&envelope.payload)?;
        Ok(Self { envelope, data })
    }

    pub fn envelope(&self) -> &SignedEnvelope {
        &self.envelope
    }

    pub fn payload(&self) -> &PolicyData {
        &self.data
    }

    pub fn encode(&self) -> Vec<u8> {
        encode_signed_envelope(&self.envelope)
    }
}

/// Cache of one namespace's policy, backed by one file.
///
/// Nothing is read until the first access, so namespaces that are never
/// touched cost no I/O.
#[derive(Debug)]
pub struct PolicyStore {
    namespace: PolicyNamespace,
    slot: Arc<DurableSlot>,
    max_blob_bytes: usize,
    loaded: bool,
    current: Option<StoredPolicy>,
    generation: u64,
}

impl PolicyStore {
    pub fn new(namespace: PolicyNamespace, path: PathBuf, max_blob_bytes: usize) -> Self {
        Self {
            namespace,
            slot: Arc::new(DurableSlot::new(path)),
            max_blob_bytes,
            loaded: false,
            current: None,
            generation: 0,
        }
    }

    pub fn namespace(&self) -> &PolicyNamespace {
        &self.namespace
    }

    pub fn path(&self) -> &Path {
        self.slot.path()
    }

    /// Idempotent. A missing or corrupt file leaves the store empty.
    pub fn ensure_loaded_or_created(&mut self) {
        if self.loaded {
            return;
        }
        self.loaded = true;
        let bytes = match std::fs::read(self.path()) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(namespace = %self.namespace, "no stored policy; starting empty");
                return;
            }
            Err(err) => {
                tracing::warn!(event = "policy_unreadable", namespace = %self.namespace, error = %err, "policy file unreadable; starting empty");
                return;
            }
        };
        let loaded = decode_signed_envelope(&bytes, self.max_blob_bytes)
            .map_err(PolicyError::from)
            .and_then(StoredPolicy::from_envelope);
        match loaded {
            Ok(policy) => self.current = Some(policy),
            Err(err) => {
                tracing::warn!(event = "policy_corrupt", namespace = %self.namespace, error = %err, "ignoring corrupt policy file");
            }
        }
    }

    pub fn get(&mut self) -> Option<&StoredPolicy> {
        self.ensure_loaded_or_created();
        self.current.as_ref()
    }

    /// In-memory replace. Only the validation pipeline calls this.
    pub fn set(&mut self, policy: StoredPolicy) {
        self.loaded = true;
        self.current = Some(policy);
    }

    pub fn clear(&mut self) {
        self.loaded = true;
        self.current = None;
    }

    /// Captures the cached value for a later durable write. An empty store
    /// snapshots as "no file".
    pub fn snapshot(&mut self) -> PolicySnapshot {
        self.ensure_loaded_or_created();
        self.generation += 1;
        let contents = match &self.current {
            Some(policy) => SlotContents::Bytes(policy.encode()),
            None => SlotContents::Absent,
        };
        PolicySnapshot {
            namespace: self.namespace.clone(),
            slot: Arc::clone(&self.slot),
            generation: self.generation,
            contents,
        }
    }

    /// Pure overwrite of the file with the cached value.
    pub fn persist(&mut self) -> PolicyResult<()> {
        self.snapshot().commit()
    }
}

#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    namespace: PolicyNamespace,
    slot: Arc<DurableSlot>,
    generation: u64,
    contents: SlotContents,
}

impl PolicySnapshot {
    pub fn namespace(&self) -> &PolicyNamespace {
        &self.namespace
    }

    pub fn commit(&self) -> PolicyResult<()> {
        match self.slot.commit(self.generation, &self.contents) {
            Ok(true) => {
                tracing::debug!(namespace = %self.namespace, generation = self.generation, "policy persisted");
                Ok(())
            }
            Ok(false) => {
                tracing::debug!(namespace = %self.namespace, generation = self.generation, "newer policy already persisted");
                Ok(())
            }
            Err(err) => {
                tracing::error!(event = "policy_persist_failed", namespace = %self.namespace, error = %err, "failed to persist policy");
                Err(err)
            }
        }
    }
}
