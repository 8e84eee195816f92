// Copyright [2026] [Joseph Verdicchio]
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]
#![forbid(unsafe_code)]

//! trustroot-protocol
//!
//! Wire messages exchanged with the device-policy trust root and the codec
//! for the signed envelope that carries them. Nothing in this crate
//! interprets the settings carried inside a policy payload.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_policy_data, decode_remote_command, decode_signed_data, decode_signed_envelope,
    encode_signed_data, encode_signed_envelope, CodecError, NewKey, SignedEnvelope, SignedPayload,
    DEFAULT_MAX_BLOB_BYTES,
};
pub use messages::{
    ManagementMode, PolicyData, PolicyEnvelope, RemoteCommand, RemoteCommandType,
    SignatureAlgorithm, SignedData,
};

/// Policy type accepted by the device namespace.
pub const DEVICE_POLICY_TYPE: &str = "google/chromeos/device";
/// Policy type accepted by per-extension namespaces.
pub const EXTENSION_POLICY_TYPE: &str = "google/chrome/extension";
/// Policy type accepted by sign-in screen extension namespaces.
pub const SIGNIN_EXTENSION_POLICY_TYPE: &str = "google/chrome/signinextension";
/// Policy type carried by signed remote commands.
pub const REMOTE_COMMAND_POLICY_TYPE: &str = "google/chromeos/remotecommand";

/// Length of a raw Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;
/// Length of a raw Ed25519 signature.
pub const SIGNATURE_LEN: usize = 64;

/// Returns `SHA256(payload)`.
///
/// This is the message actually signed under [`SignatureAlgorithm::Ed25519Sha256`].
#[must_use]
pub fn sha256(payload: &[u8]) -> [u8; 32] {
    use sha2::{Digest, Sha256};

    let digest = Sha256::digest(payload);
    let mut out = [0_u8; 32];
    out.copy_from_slice(&digest);
    out
}

impl SignatureAlgorithm {
    /// Bytes the signature is computed over for `message`.
    pub fn signed_message(self, message: &[u8]) -> Vec<u8> {
        match self {
            Self::Ed25519 => message.to_vec(),
            Self::Ed25519Sha256 => sha256(message).to_vec(),
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ed25519 => "ed25519",
            Self::Ed25519Sha256 => "ed25519-sha256",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_variant_signs_digest() {
        let msg = b"policy";
        assert_eq!(SignatureAlgorithm::Ed25519.signed_message(msg), msg.to_vec());
        assert_eq!(
            SignatureAlgorithm::Ed25519Sha256.signed_message(msg),
            sha256(msg).to_vec()
        );
    }
}
