// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The engine and its single-writer task.
//!
//! [`PolicyEngine`] is fully synchronous: validation and in-memory updates
//! happen inside each call, and the durable writes come back as detached
//! jobs. [`spawn_engine`] moves the engine into one tokio task so every
//! request, and in particular every owner-key mutation, is applied one at a
//! time. The detached jobs run on the blocking pool without holding the
//! engine, so a `retrieve` right after an accepted `store` already sees the
//! new policy while its write is still in flight.

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use trustroot_protocol::SignatureAlgorithm;

use crate::config::EngineConfig;
use crate::device_policy::{
    given_user_is_owner, DeviceCollaborators, DevicePolicySync, DeviceState, SkipReason,
    SystemSettingsJob, SystemSettingsPlan,
};
use crate::error::{PolicyError, PolicyResult};
use crate::namespace::{PolicyDomain, PolicyNamespace};
use crate::owner_key::{KeySnapshot, OwnerKey};
use crate::policy_service::{PolicyService, SignatureCheck, StoreAttempt, StoreFlags};
use crate::policy_store::PolicySnapshot;
use crate::settings::DeviceSettings;

const REQUEST_QUEUE_DEPTH: usize = 64;

/// Outcome of a flag synchronization that did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemSettingsOutcome {
    Applied,
    Skipped(SkipReason),
}

/// Everything a store still has to do after validation.
pub struct PendingStore {
    attempt: StoreAttempt,
    system_settings: Option<SystemSettingsJob>,
}

impl PendingStore {
    pub fn accepted(&self) -> PolicyResult<()> {
        self.attempt
            .policy_write
            .as_ref()
            .map(|_| ())
            .map_err(Clone::clone)
    }

    /// Blocking. Persists key and policy, then pushes device flags when the
    /// device policy changed.
    pub fn complete(&self) -> PolicyResult<()> {
        let persisted = self.attempt.commit();
        let flags = self
            .system_settings
            .as_ref()
            .map_or(Ok(()), SystemSettingsJob::run);
        persisted.and(flags)
    }
}

pub struct PolicyEngine {
    service: PolicyService,
    device: DevicePolicySync,
}

impl PolicyEngine {
    /// Loads the owner key and the device policy and reports their
    /// consistency. Component namespaces stay unloaded until touched.
    pub fn open(config: &EngineConfig, collaborators: DeviceCollaborators) -> Self {
        let mut owner_key = OwnerKey::new(config.owner_key_path());
        owner_key.populate_from_disk();
        let mut engine = Self {
            service: PolicyService::new(config, owner_key),
            device: DevicePolicySync::new(collaborators),
        };
        engine.refresh_device_settings();
        let state = engine.device_state();
        match state {
            DeviceState::NoPolicy | DeviceState::Consistent => {
                tracing::info!(event = "device_state", state = state.as_str(), owner_key = engine.service.owner_key().is_populated(), "policy engine opened")
            }
            DeviceState::KeyMissingWithPolicy | DeviceState::PolicyUnverifiable => {
                tracing::error!(event = "device_state", state = state.as_str(), "stored device policy does not match the owner key")
            }
        }
        engine
    }

    pub fn owner_key(&self) -> &OwnerKey {
        self.service.owner_key()
    }

    fn refresh_device_settings(&mut self) {
        let policy = self.service.device_policy();
        self.device.refresh_settings(policy);
    }

    pub fn device_state(&mut self) -> DeviceState {
        let (key, policy) = self.service.device_view();
        self.device.check_device_state(key, policy)
    }

    pub fn store(
        &mut self,
        namespace: &PolicyNamespace,
        blob: &[u8],
        flags: StoreFlags,
        signature_check: SignatureCheck,
    ) -> PendingStore {
        let attempt = self.service.store(namespace, blob, flags, signature_check);
        let mut system_settings = None;
        if attempt.accepted() && namespace.is_device() {
            self.refresh_device_settings();
            system_settings = match self.device.plan_system_settings(self.service.owner_key()) {
                SystemSettingsPlan::Apply(job) => Some(job),
                SystemSettingsPlan::Skipped(reason) => {
                    tracing::info!(event = "system_settings_skipped", reason = ?reason, "not updating device security flags");
                    None
                }
            };
        }
        PendingStore {
            attempt,
            system_settings,
        }
    }

    pub fn retrieve(&mut self, namespace: &PolicyNamespace) -> Option<Vec<u8>> {
        self.service.retrieve(namespace)
    }

    pub fn persist_policy(&mut self, namespace: &PolicyNamespace) -> PolicySnapshot {
        if namespace.is_device() {
            self.refresh_device_settings();
        }
        self.service.persist_policy(namespace)
    }

    pub fn persist_key(&mut self) -> PolicyResult<KeySnapshot> {
        self.service.persist_key()
    }

    pub fn delete(
        &mut self,
        namespace: &PolicyNamespace,
        signature_check: SignatureCheck,
    ) -> PolicyResult<PolicySnapshot> {
        self.service.delete(namespace, signature_check)
    }

    pub fn list_component_ids(&mut self, domain: PolicyDomain) -> PolicyResult<Vec<String>> {
        self.service.list_component_ids(domain)
    }

    pub fn device_settings(&self) -> &DeviceSettings {
        self.device.settings()
    }

    pub fn may_update_system_settings(&self) -> bool {
        self.device.may_update_system_settings()
    }

    pub fn update_system_settings(&self) -> SystemSettingsPlan {
        self.device.plan_system_settings(self.service.owner_key())
    }

    pub fn validate_remote_wipe_command(
        &mut self,
        signed_bytes: &[u8],
        algorithm: SignatureAlgorithm,
    ) -> bool {
        let max_bytes = self.service.max_blob_bytes();
        let (key, policy) = self.service.device_view();
        self.device
            .validate_remote_wipe_command(key, policy, signed_bytes, algorithm, max_bytes)
    }

    pub fn given_user_is_owner(&mut self, candidate_email: &str) -> bool {
        self.service
            .device_policy()
            .is_some_and(|policy| given_user_is_owner(policy.payload(), candidate_email))
    }
}

enum Request {
    Store {
        namespace: PolicyNamespace,
        blob: Vec<u8>,
        flags: StoreFlags,
        signature_check: SignatureCheck,
        reply: oneshot::Sender<PolicyResult<Completion>>,
    },
    Retrieve {
        namespace: PolicyNamespace,
        reply: oneshot::Sender<Option<Vec<u8>>>,
    },
    PersistPolicy {
        namespace: PolicyNamespace,
        reply: oneshot::Sender<Completion>,
    },
    PersistKey {
        reply: oneshot::Sender<PolicyResult<Completion>>,
    },
    Delete {
        namespace: PolicyNamespace,
        signature_check: SignatureCheck,
        reply: oneshot::Sender<PolicyResult<Completion>>,
    },
    ListComponentIds {
        domain: PolicyDomain,
        reply: oneshot::Sender<PolicyResult<Vec<String>>>,
    },
    DeviceSettings {
        reply: oneshot::Sender<DeviceSettings>,
    },
    DeviceState {
        reply: oneshot::Sender<DeviceState>,
    },
    UpdateSystemSettings {
        reply: oneshot::Sender<Completion<SystemSettingsOutcome>>,
    },
    ValidateRemoteWipe {
        signed_bytes: Vec<u8>,
        algorithm: SignatureAlgorithm,
        reply: oneshot::Sender<bool>,
    },
    GivenUserIsOwner {
        email: String,
        reply: oneshot::Sender<bool>,
    },
}

/// Resolves once the background work of an accepted request has been
/// attempted.
#[must_use = "dropping a completion discards the persistence result"]
pub struct Completion<T = ()>(oneshot::Receiver<PolicyResult<T>>);

impl<T> Completion<T> {
    pub async fn wait(self) -> PolicyResult<T> {
        self.0.await.unwrap_or(Err(PolicyError::EngineUnavailable))
    }
}

fn run_in_background<T, F>(job: F) -> Completion<T>
where
    T: Send + 'static,
    F: FnOnce() -> PolicyResult<T> + Send + 'static,
{
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        let result = tokio::task::spawn_blocking(job).await.unwrap_or_else(|err| {
            tracing::error!(error = %err, "background persistence task failed");
            Err(PolicyError::PersistenceFailed(
                "background task aborted".to_string(),
            ))
        });
        let _ = tx.send(result);
    });
    Completion(rx)
}

impl PolicyEngine {
    fn handle(&mut self, request: Request) {
        match request {
            Request::Store {
                namespace,
                blob,
                flags,
                signature_check,
                reply,
            } => {
                let pending = self.store(&namespace, &blob, flags, signature_check);
                let accepted = pending.accepted();
                let completion = run_in_background(move || pending.complete());
                let _ = reply.send(accepted.map(|()| completion));
            }
            Request::Retrieve { namespace, reply } => {
                let _ = reply.send(self.retrieve(&namespace));
            }
            Request::PersistPolicy { namespace, reply } => {
                let snapshot = self.persist_policy(&namespace);
                let _ = reply.send(run_in_background(move || snapshot.commit()));
            }
            Request::PersistKey { reply } => {
                let result = self
                    .persist_key()
                    .map(|snapshot| run_in_background(move || snapshot.commit()));
                let _ = reply.send(result);
            }
            Request::Delete {
                namespace,
                signature_check,
                reply,
            } => {
                let result = self
                    .delete(&namespace, signature_check)
                    .map(|snapshot| run_in_background(move || snapshot.commit()));
                let _ = reply.send(result);
            }
            Request::ListComponentIds { domain, reply } => {
                let _ = reply.send(self.list_component_ids(domain));
            }
            Request::DeviceSettings { reply } => {
                let _ = reply.send(self.device_settings().clone());
            }
            Request::DeviceState { reply } => {
                let _ = reply.send(self.device_state());
            }
            Request::UpdateSystemSettings { reply } => {
                let completion = match self.update_system_settings() {
                    SystemSettingsPlan::Apply(job) => {
                        run_in_background(move || job.run().map(|()| SystemSettingsOutcome::Applied))
                    }
                    SystemSettingsPlan::Skipped(reason) => {
                        let (tx, rx) = oneshot::channel();
                        let _ = tx.send(Ok(SystemSettingsOutcome::Skipped(reason)));
                        Completion(rx)
                    }
                };
                let _ = reply.send(completion);
            }
            Request::ValidateRemoteWipe {
                signed_bytes,
                algorithm,
                reply,
            } => {
                let _ = reply.send(self.validate_remote_wipe_command(&signed_bytes, algorithm));
            }
            Request::GivenUserIsOwner { email, reply } => {
                let _ = reply.send(self.given_user_is_owner(&email));
            }
        }
    }
}

/// Cheap, cloneable access to an engine running in its own task.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<Request>,
}

/// Moves `engine` into a dedicated task. The task ends once every handle
/// has been dropped.
pub fn spawn_engine(mut engine: PolicyEngine) -> (EngineHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel(REQUEST_QUEUE_DEPTH);
    let task = tokio::spawn(async move {
        while let Some(request) = rx.recv().await {
            engine.handle(request);
        }
        tracing::debug!("policy engine stopped");
    });
    (EngineHandle { tx }, task)
}

impl EngineHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> PolicyResult<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| PolicyError::EngineUnavailable)?;
        rx.await.map_err(|_| PolicyError::EngineUnavailable)
    }

    /// Resolves once the policy is validated and visible in memory; the
    /// returned [`Completion`] reports the persistence outcome.
    pub async fn store(
        &self,
        namespace: PolicyNamespace,
        blob: Vec<u8>,
        flags: StoreFlags,
        signature_check: SignatureCheck,
    ) -> PolicyResult<Completion> {
        self.call(|reply| Request::Store {
            namespace,
            blob,
            flags,
            signature_check,
            reply,
        })
        .await?
    }

    /// Validates, then waits for persistence.
    pub async fn store_and_wait(
        &self,
        namespace: PolicyNamespace,
        blob: Vec<u8>,
        flags: StoreFlags,
        signature_check: SignatureCheck,
    ) -> PolicyResult<()> {
        self.store(namespace, blob, flags, signature_check)
            .await?
            .wait()
            .await
    }

    pub async fn retrieve(&self, namespace: PolicyNamespace) -> PolicyResult<Option<Vec<u8>>> {
        self.call(|reply| Request::Retrieve { namespace, reply }).await
    }

    pub async fn persist_policy(&self, namespace: PolicyNamespace) -> PolicyResult<()> {
        self.call(|reply| Request::PersistPolicy { namespace, reply })
            .await?
            .wait()
            .await
    }

    pub async fn persist_key(&self) -> PolicyResult<()> {
        self.call(|reply| Request::PersistKey { reply })
            .await??
            .wait()
            .await
    }

    pub async fn delete(
        &self,
        namespace: PolicyNamespace,
        signature_check: SignatureCheck,
    ) -> PolicyResult<()> {
        self.call(|reply| Request::Delete {
            namespace,
            signature_check,
            reply,
        })
        .await??
        .wait()
        .await
    }

    pub async fn list_component_ids(&self, domain: PolicyDomain) -> PolicyResult<Vec<String>> {
        self.call(|reply| Request::ListComponentIds { domain, reply })
            .await?
    }

    pub async fn device_settings(&self) -> PolicyResult<DeviceSettings> {
        self.call(|reply| Request::DeviceSettings { reply }).await
    }

    pub async fn device_state(&self) -> PolicyResult<DeviceState> {
        self.call(|reply| Request::DeviceState { reply }).await
    }

    pub async fn update_system_settings(&self) -> PolicyResult<SystemSettingsOutcome> {
        self.call(|reply| Request::UpdateSystemSettings { reply })
            .await?
            .wait()
            .await
    }

    pub async fn validate_remote_wipe_command(
        &self,
        signed_bytes: Vec<u8>,
        algorithm: SignatureAlgorithm,
    ) -> PolicyResult<bool> {
        self.call(|reply| Request::ValidateRemoteWipe {
            signed_bytes,
            algorithm,
            reply,
        })
        .await
    }

    pub async fn given_user_is_owner(&self, email: impl Into<String>) -> PolicyResult<bool> {
        let email = email.into();
        self.call(|reply| Request::GivenUserIsOwner { email, reply })
            .await
    }
}
