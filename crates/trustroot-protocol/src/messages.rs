// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Protobuf messages, hand-derived with `prost`.
//!
//! Every scalar is declared `optional` so presence survives a decode and a
//! re-encode reproduces the input exactly.

use prost::Message;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum SignatureAlgorithm {
    Ed25519 = 0,
    Ed25519Sha256 = 1,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ManagementMode {
    LocalOwner = 0,
    EnterpriseManaged = 1,
    ConsumerManaged = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RemoteCommandType {
    EchoTest = -1,
    DeviceReboot = 0,
    DeviceScreenshot = 1,
    DeviceSetVolume = 2,
    DeviceStartCrdSession = 3,
    DeviceRemotePowerwash = 4,
    DeviceRefreshEnterpriseMachineCertificate = 5,
    DeviceWipeUsers = 6,
}

/// Outer signed container for a policy blob.
#[derive(Clone, PartialEq, Message)]
pub struct PolicyEnvelope {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub policy_data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub policy_data_signature: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "3")]
    pub new_public_key: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub new_public_key_signature: Option<Vec<u8>>,
    #[prost(enumeration = "SignatureAlgorithm", optional, tag = "5")]
    pub signature_algorithm: Option<i32>,
}

/// Policy metadata; `policy_value` is opaque, domain-specific settings.
#[derive(Clone, PartialEq, Message)]
pub struct PolicyData {
    #[prost(string, optional, tag = "1")]
    pub policy_type: Option<String>,
    #[prost(int64, optional, tag = "2")]
    pub timestamp_ms: Option<i64>,
    #[prost(string, optional, tag = "3")]
    pub request_token: Option<String>,
    #[prost(bytes = "vec", optional, tag = "4")]
    pub policy_value: Option<Vec<u8>>,
    #[prost(string, optional, tag = "6")]
    pub username: Option<String>,
    #[prost(string, optional, tag = "7")]
    pub device_id: Option<String>,
    #[prost(enumeration = "ManagementMode", optional, tag = "8")]
    pub management_mode: Option<i32>,
}

/// Minimal signed container without key-rotation fields.
#[derive(Clone, PartialEq, Message)]
pub struct SignedData {
    #[prost(bytes = "vec", optional, tag = "1")]
    pub data: Option<Vec<u8>>,
    #[prost(bytes = "vec", optional, tag = "2")]
    pub signature: Option<Vec<u8>>,
    #[prost(enumeration = "SignatureAlgorithm", optional, tag = "3")]
    pub signature_algorithm: Option<i32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RemoteCommand {
    #[prost(enumeration = "RemoteCommandType", optional, tag = "1")]
    pub command_type: Option<i32>,
    #[prost(int64, optional, tag = "2")]
    pub command_id: Option<i64>,
    #[prost(int64, optional, tag = "3")]
    pub age_of_command_ms: Option<i64>,
    #[prost(string, optional, tag = "4")]
    pub payload: Option<String>,
    #[prost(string, optional, tag = "5")]
    pub target_device_id: Option<String>,
}

impl PolicyData {
    /// Management mode when present and known.
    pub fn known_management_mode(&self) -> Option<ManagementMode> {
        self.management_mode
            .and_then(|raw| ManagementMode::try_from(raw).ok())
    }
}
