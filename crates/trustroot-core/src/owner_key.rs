// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The device owner's public key and its lifecycle.
//!
//! `Missing -> Populated` happens exactly once through trust-on-first-use
//! ([`OwnerKey::populate_from_buffer`]) or a disk load. Afterwards the key
//! changes only through [`OwnerKey::rotate`], which needs a signature by the
//! current key over the new one, or [`OwnerKey::clobber_compromised_key`],
//! which is reserved for recovery flows authorized outside this engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use ed25519_dalek::{Signature, VerifyingKey};
use trustroot_protocol::{sha256, SignatureAlgorithm, PUBLIC_KEY_LEN, SIGNATURE_LEN};

use crate::durable::{DurableSlot, SlotContents};
use crate::error::{PolicyError, PolicyResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyState {
    Missing,
    Populated(VerifyingKey),
}

#[derive(Debug)]
pub struct OwnerKey {
    state: KeyState,
    slot: Arc<DurableSlot>,
    generation: u64,
}

/// Short, log-safe identifier for a public key.
pub fn key_fingerprint(key_bytes: &[u8]) -> String {
    hex::encode(&sha256(key_bytes)[..8])
}

fn parse_public_key(bytes: &[u8]) -> PolicyResult<VerifyingKey> {
    let raw: [u8; PUBLIC_KEY_LEN] = bytes.try_into().map_err(|_| {
        PolicyError::KeyInstallNotPermitted(format!(
            "public key must be {PUBLIC_KEY_LEN} bytes, got {}",
            bytes.len()
        ))
    })?;
    VerifyingKey::from_bytes(&raw).map_err(|_| {
        PolicyError::KeyInstallNotPermitted("not a valid ed25519 public key".to_string())
    })
}

fn verify_with(
    key: &VerifyingKey,
    message: &[u8],
    signature: &[u8],
    algorithm: SignatureAlgorithm,
) -> bool {
    let Ok(raw) = <[u8; SIGNATURE_LEN]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&raw);
    key.verify_strict(&algorithm.signed_message(message), &signature)
        .is_ok()
}

impl OwnerKey {
    pub fn new(path: PathBuf) -> Self {
        Self {
            state: KeyState::Missing,
            slot: Arc::new(DurableSlot::new(path)),
            generation: 0,
        }
    }

    pub fn path(&self) -> &Path {
        self.slot.path()
    }

    pub fn is_populated(&self) -> bool {
        matches!(self.state, KeyState::Populated(_))
    }

    pub fn public_key_bytes(&self) -> Option<[u8; PUBLIC_KEY_LEN]> {
        match &self.state {
            KeyState::Populated(key) => Some(key.to_bytes()),
            KeyState::Missing => None,
        }
    }

    pub fn equals(&self, candidate: &[u8]) -> bool {
        match &self.state {
            KeyState::Populated(key) => key.as_bytes().as_slice() == candidate,
            KeyState::Missing => false,
        }
    }

    /// Loads the persisted key. Absence or corruption leaves the key
    /// `Missing`; that is "no owner yet", not an error.
    pub fn populate_from_disk(&mut self) -> bool {
        if self.is_populated() {
            return true;
        }
        let text = match std::fs::read_to_string(self.path()) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path().display(), "no owner key on disk");
                return false;
            }
            Err(err) => {
                tracing::warn!(event = "owner_key_unreadable", path = %self.path().display(), error = %err, "owner key file unreadable");
                return false;
            }
        };
        let loaded = hex::decode(text.trim())
            .map_err(|_| PolicyError::KeyInstallNotPermitted("invalid key hex".to_string()))
            .and_then(|bytes| parse_public_key(&bytes));
        match loaded {
            Ok(key) => {
                tracing::info!(event = "owner_key_loaded", fingerprint = %key_fingerprint(key.as_bytes()), "loaded owner key");
                self.state = KeyState::Populated(key);
                true
            }
            Err(err) => {
                tracing::warn!(event = "owner_key_corrupt", path = %self.path().display(), error = %err, "ignoring corrupt owner key file");
                false
            }
        }
    }

    /// Trust-on-first-use install. Only legal while `Missing`.
    pub fn populate_from_buffer(&mut self, candidate: &[u8]) -> PolicyResult<()> {
        if self.is_populated() {
            return Err(PolicyError::StateConflict(
                "owner key already populated".to_string(),
            ));
        }
        let key = parse_public_key(candidate)?;
        tracing::info!(event = "owner_key_installed", fingerprint = %key_fingerprint(candidate), "installed first owner key");
        self.state = KeyState::Populated(key);
        Ok(())
    }

    /// Replaces the key after checking `signature` by the current key over
    /// `new_key`. On any failure the key is left untouched.
    pub fn rotate(
        &mut self,
        new_key: &[u8],
        signature: &[u8],
        algorithm: SignatureAlgorithm,
    ) -> PolicyResult<()> {
        let KeyState::Populated(current) = &self.state else {
            return Err(PolicyError::StateConflict(
                "no current owner key to rotate from".to_string(),
            ));
        };
        let next = parse_public_key(new_key)?;
        if !verify_with(current, new_key, signature, algorithm) {
            tracing::warn!(event = "owner_key_rotation_rejected", fingerprint = %key_fingerprint(new_key), "rotation signature does not verify under current key");
            return Err(PolicyError::SignatureVerificationFailed);
        }
        tracing::info!(
            event = "owner_key_rotated",
            from = %key_fingerprint(current.as_bytes()),
            to = %key_fingerprint(new_key),
            "rotated owner key"
        );
        self.state = KeyState::Populated(next);
        Ok(())
    }

    /// Unconditional overwrite for recovery flows.
    pub fn clobber_compromised_key(&mut self, new_key: &[u8]) -> PolicyResult<()> {
        let next = parse_public_key(new_key)?;
        tracing::warn!(event = "owner_key_clobbered", to = %key_fingerprint(new_key), "owner key clobbered; policy signed by the previous key is no longer verifiable");
        self.state = KeyState::Populated(next);
        Ok(())
    }

    /// `false` whenever the key is `Missing`.
    pub fn verify(&self, payload: &[u8], signature: &[u8], algorithm: SignatureAlgorithm) -> bool {
        match &self.state {
            KeyState::Populated(key) => verify_with(key, payload, signature, algorithm),
            KeyState::Missing => false,
        }
    }

    /// Captures the current key for a later durable write.
    pub fn snapshot(&mut self) -> PolicyResult<KeySnapshot> {
        let KeyState::Populated(key) = &self.state else {
            return Err(PolicyError::StateConflict(
                "no owner key to persist".to_string(),
            ));
        };
        self.generation += 1;
        Ok(KeySnapshot {
            slot: Arc::clone(&self.slot),
            generation: self.generation,
            contents: SlotContents::Bytes(hex::encode(key.as_bytes()).into_bytes()),
        })
    }

    pub fn persist(&mut self) -> PolicyResult<()> {
        self.snapshot()?.commit()
    }
}

/// A key write detached from the [`OwnerKey`], safe to run off the
/// validation path.
#[derive(Debug, Clone)]
pub struct KeySnapshot {
    slot: Arc<DurableSlot>,
    generation: u64,
    contents: SlotContents,
}

impl KeySnapshot {
    pub fn commit(&self) -> PolicyResult<()> {
        let result = self.slot.commit(self.generation, &self.contents).map(|_| ());
        if let Err(err) = &result {
            tracing::error!(event = "owner_key_persist_failed", path = %self.slot.path().display(), error = %err, "failed to persist owner key");
        }
        result
    }
}
