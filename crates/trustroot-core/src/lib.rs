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

//! trustroot-core
//!
//! Device trust-root policy engine:
//! - owner-key lifecycle (install, rotate, clobber) gated by store flags
//! - per-namespace signed policy stores with durable, ordered persistence
//! - device security-flag synchronization (VPD, NVRAM, migration marker)
//! - remote-wipe command validation and ownership checks
//!
//! [`engine::spawn_engine`] runs all of it behind a single writer.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

pub mod collaborators;
pub mod config;
pub mod device_policy;
pub mod durable;
pub mod engine;
pub mod error;
pub mod namespace;
pub mod owner_key;
pub mod policy_service;
pub mod policy_store;
pub mod settings;

pub use config::EngineConfig;
pub use device_policy::{DeviceCollaborators, DeviceState, SkipReason};
pub use engine::{spawn_engine, Completion, EngineHandle, PolicyEngine, SystemSettingsOutcome};
pub use error::{PolicyError, PolicyResult};
pub use namespace::{PolicyDomain, PolicyNamespace};
pub use owner_key::OwnerKey;
pub use policy_service::{SignatureCheck, StoreFlags};
pub use settings::{policy_allows_new_users, policy_allows_user, DeviceSettings};
