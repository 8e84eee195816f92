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

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use ed25519_dalek::{Signer, SigningKey};
use prost::Message;
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;
use trustroot_core::collaborators::{
    FileFirmwareInfo, FileMigrationMarker, JsonInstallAttributes, JsonSystemProperties,
    JsonVpdStore,
};
use trustroot_core::owner_key::{key_fingerprint, OwnerKey};
use trustroot_core::{
    spawn_engine, DeviceCollaborators, EngineConfig, EngineHandle, PolicyDomain, PolicyEngine,
    PolicyError, PolicyNamespace, SignatureCheck, SkipReason, StoreFlags, SystemSettingsOutcome,
};
use trustroot_protocol::{
    encode_signed_data, encode_signed_envelope, ManagementMode, NewKey, PolicyData,
    RemoteCommand, RemoteCommandType, SignatureAlgorithm, SignedEnvelope, SignedPayload,
    REMOTE_COMMAND_POLICY_TYPE,
};

#[derive(Parser)]
#[command(name = "trustrootctl")]
#[command(about = "Sign, store and inspect device trust-root policy")]
struct Cli {
    /// Overrides TRUSTROOT_STATE_DIR and the config file.
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,

    /// JSON file overlaid on the environment.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true, default_value = "info")]
    log: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Writes a fresh hex-encoded Ed25519 seed.
    Keygen {
        #[arg(long)]
        out: PathBuf,
    },
    SignPolicy {
        #[arg(long)]
        signing_key: PathBuf,
        #[arg(long)]
        namespace: PolicyNamespace,
        /// Settings document carried as the policy value.
        #[arg(long)]
        settings: Option<PathBuf>,
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        device_id: Option<String>,
        #[arg(long, value_enum)]
        management_mode: Option<ModeArg>,
        /// Offers the public key of this seed as the new owner key.
        #[arg(long)]
        new_key_from: Option<PathBuf>,
        /// Signs the offered key, making the blob a rotation.
        #[arg(long, requires = "new_key_from")]
        new_key_signer: Option<PathBuf>,
        #[arg(long, value_enum, default_value_t = AlgorithmArg::Ed25519)]
        algorithm: AlgorithmArg,
        #[arg(long)]
        out: PathBuf,
    },
    SignRemoteCommand {
        #[arg(long)]
        signing_key: PathBuf,
        #[arg(long, value_enum)]
        command: CommandArg,
        #[arg(long)]
        target_device_id: Option<String>,
        #[arg(long, default_value_t = 1)]
        command_id: i64,
        #[arg(long, value_enum, default_value_t = AlgorithmArg::Ed25519)]
        algorithm: AlgorithmArg,
        #[arg(long)]
        out: PathBuf,
    },
    Store {
        #[arg(long)]
        namespace: PolicyNamespace,
        #[arg(long)]
        blob: PathBuf,
        #[arg(long)]
        install_new: bool,
        #[arg(long)]
        rotate: bool,
        #[arg(long)]
        clobber: bool,
        #[arg(long)]
        no_signature_check: bool,
    },
    Retrieve {
        #[arg(long)]
        namespace: PolicyNamespace,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Removes unsigned component policy.
    Delete {
        #[arg(long)]
        namespace: PolicyNamespace,
        #[arg(long)]
        no_signature_check: bool,
    },
    List {
        #[arg(long)]
        domain: PolicyDomain,
    },
    ValidateWipe {
        #[arg(long)]
        command: PathBuf,
        #[arg(long, value_enum, default_value_t = AlgorithmArg::Ed25519)]
        algorithm: AlgorithmArg,
    },
    SyncFlags,
    IsOwner {
        #[arg(long)]
        email: String,
    },
    /// Reports owner key and device policy consistency.
    Check,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum AlgorithmArg {
    Ed25519,
    Ed25519Sha256,
}

impl From<AlgorithmArg> for SignatureAlgorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Ed25519 => Self::Ed25519,
            AlgorithmArg::Ed25519Sha256 => Self::Ed25519Sha256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    LocalOwner,
    Enterprise,
    Consumer,
}

impl From<ModeArg> for ManagementMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::LocalOwner => Self::LocalOwner,
            ModeArg::Enterprise => Self::EnterpriseManaged,
            ModeArg::Consumer => Self::ConsumerManaged,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CommandArg {
    EchoTest,
    Reboot,
    Screenshot,
    SetVolume,
    StartCrdSession,
    Powerwash,
    RefreshMachineCertificate,
    WipeUsers,
}

impl From<CommandArg> for RemoteCommandType {
    fn from(arg: CommandArg) -> Self {
        match arg {
            CommandArg::EchoTest => Self::EchoTest,
            CommandArg::Reboot => Self::DeviceReboot,
            CommandArg::Screenshot => Self::DeviceScreenshot,
            CommandArg::SetVolume => Self::DeviceSetVolume,
            CommandArg::StartCrdSession => Self::DeviceStartCrdSession,
            CommandArg::Powerwash => Self::DeviceRemotePowerwash,
            CommandArg::RefreshMachineCertificate => {
                Self::DeviceRefreshEnterpriseMachineCertificate
            }
            CommandArg::WipeUsers => Self::DeviceWipeUsers,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cli.log))
        .with_writer(std::io::stderr)
        .init();

    match run(cli).await {
        Ok(v) => println!("{v}"),
        Err(err) => {
            println!("{}", json!({"error": format!("{err:#}"), "code": error_code(&err)}));
            std::process::exit(1);
        }
    }
}

fn error_code(err: &anyhow::Error) -> &'static str {
    err.downcast_ref::<PolicyError>()
        .map_or("CLI_ERROR", |policy_err| policy_err.code())
}

async fn run(cli: Cli) -> anyhow::Result<Value> {
    match cli.cmd {
        Command::Keygen { out } => keygen(&out),
        Command::SignPolicy {
            signing_key,
            namespace,
            settings,
            username,
            device_id,
            management_mode,
            new_key_from,
            new_key_signer,
            algorithm,
            out,
        } => {
            let data = PolicyData {
                policy_type: Some(namespace.domain().accepted_policy_type().to_string()),
                timestamp_ms: Some(now_ms()),
                policy_value: settings
                    .map(|path| read_file(&path))
                    .transpose()?,
                username,
                device_id,
                management_mode: management_mode.map(|m| ManagementMode::from(m) as i32),
                ..Default::default()
            };
            let signer = read_seed(&signing_key)?;
            let algorithm = SignatureAlgorithm::from(algorithm);
            let new_key = match new_key_from {
                Some(path) => {
                    let key = read_seed(&path)?.verifying_key().to_bytes().to_vec();
                    let signature = new_key_signer
                        .map(|path| read_seed(&path).map(|s| sign(&s, &key, algorithm)))
                        .transpose()?;
                    Some(NewKey { key, signature })
                }
                None => None,
            };
            let payload = data.encode_to_vec();
            let envelope = SignedEnvelope {
                payload_signature: sign(&signer, &payload, algorithm),
                payload,
                new_key,
                algorithm: (algorithm != SignatureAlgorithm::Ed25519).then_some(algorithm),
            };
            let bytes = encode_signed_envelope(&envelope);
            write_file(&out, &bytes)?;
            Ok(json!({
                "namespace": namespace.to_string(),
                "bytes": bytes.len(),
                "signer": key_fingerprint(signer.verifying_key().as_bytes()),
                "offers_key": envelope.new_key.is_some(),
                "out": out.display().to_string(),
            }))
        }
        Command::SignRemoteCommand {
            signing_key,
            command,
            target_device_id,
            command_id,
            algorithm,
            out,
        } => {
            let command = RemoteCommand {
                command_type: Some(RemoteCommandType::from(command) as i32),
                command_id: Some(command_id),
                target_device_id,
                ..Default::default()
            };
            let data = PolicyData {
                policy_type: Some(REMOTE_COMMAND_POLICY_TYPE.to_string()),
                timestamp_ms: Some(now_ms()),
                policy_value: Some(command.encode_to_vec()),
                ..Default::default()
            }
            .encode_to_vec();
            let signer = read_seed(&signing_key)?;
            let algorithm = SignatureAlgorithm::from(algorithm);
            let bytes = encode_signed_data(&SignedPayload {
                signature: sign(&signer, &data, algorithm),
                data,
                algorithm: Some(algorithm),
            });
            write_file(&out, &bytes)?;
            Ok(json!({"bytes": bytes.len(), "out": out.display().to_string()}))
        }
        cmd => {
            let config = engine_config(cli.state_dir, cli.config)?;
            run_engine_command(cmd, &config).await
        }
    }
}

async fn run_engine_command(cmd: Command, config: &EngineConfig) -> anyhow::Result<Value> {
    let handle = open_engine(config);
    match cmd {
        Command::Store {
            namespace,
            blob,
            install_new,
            rotate,
            clobber,
            no_signature_check,
        } => {
            let mut flags = StoreFlags::NONE;
            for (set, flag) in [
                (install_new, StoreFlags::INSTALL_NEW),
                (rotate, StoreFlags::ROTATE),
                (clobber, StoreFlags::CLOBBER),
            ] {
                if set {
                    flags = flags | flag;
                }
            }
            let blob = read_file(&blob)?;
            handle
                .store_and_wait(namespace.clone(), blob, flags, signature_check(no_signature_check))
                .await?;
            Ok(json!({"namespace": namespace.to_string(), "stored": true}))
        }
        Command::Retrieve { namespace, out } => {
            let Some(bytes) = handle.retrieve(namespace.clone()).await? else {
                return Ok(json!({"namespace": namespace.to_string(), "found": false}));
            };
            if let Some(out) = &out {
                write_file(out, &bytes)?;
            }
            Ok(json!({
                "namespace": namespace.to_string(),
                "found": true,
                "bytes": bytes.len(),
                "blob_hex": out.is_none().then(|| hex::encode(&bytes)),
            }))
        }
        Command::Delete {
            namespace,
            no_signature_check,
        } => {
            handle
                .delete(namespace.clone(), signature_check(no_signature_check))
                .await?;
            Ok(json!({"namespace": namespace.to_string(), "deleted": true}))
        }
        Command::List { domain } => {
            let ids = handle.list_component_ids(domain).await?;
            Ok(json!({"domain": domain.as_str(), "component_ids": ids}))
        }
        Command::ValidateWipe { command, algorithm } => {
            let bytes = read_file(&command)?;
            let valid = handle
                .validate_remote_wipe_command(bytes, algorithm.into())
                .await?;
            Ok(json!({"valid": valid}))
        }
        Command::SyncFlags => {
            let outcome = handle.update_system_settings().await?;
            Ok(match outcome {
                SystemSettingsOutcome::Applied => json!({"outcome": "applied"}),
                SystemSettingsOutcome::Skipped(reason) => {
                    json!({"outcome": "skipped", "reason": skip_reason(reason)})
                }
            })
        }
        Command::IsOwner { email } => {
            let owner = handle.given_user_is_owner(email.clone()).await?;
            Ok(json!({"email": email, "owner": owner}))
        }
        Command::Check => {
            let state = handle.device_state().await?;
            let settings = handle.device_settings().await?;
            let mut key = OwnerKey::new(config.owner_key_path());
            key.populate_from_disk();
            Ok(json!({
                "state": state.as_str(),
                "owner_key": key.public_key_bytes().map(|bytes| key_fingerprint(&bytes)),
                "block_devmode": settings.block_devmode(),
                "allow_new_users": trustroot_core::policy_allows_new_users(&settings),
            }))
        }
        Command::Keygen { .. } | Command::SignPolicy { .. } | Command::SignRemoteCommand { .. } => {
            bail!("command does not use the engine")
        }
    }
}

fn engine_config(state_dir: Option<PathBuf>, config: Option<PathBuf>) -> anyhow::Result<EngineConfig> {
    let mut cfg = EngineConfig::from_env();
    if let Some(path) = config {
        cfg = cfg
            .load_file(&path)
            .map_err(|e| anyhow!("config {}: {e}", path.display()))?;
    }
    if let Some(dir) = state_dir {
        cfg.state_dir = dir;
    }
    Ok(cfg)
}

fn collaborators(config: &EngineConfig) -> DeviceCollaborators {
    let dir = &config.state_dir;
    DeviceCollaborators {
        install_attributes: Box::new(JsonInstallAttributes::new(dir.join("install_attributes.json"))),
        firmware: Box::new(FileFirmwareInfo::new(dir.join("firmware_type"))),
        vpd: Arc::new(JsonVpdStore::new(dir.join("vpd.json"))),
        system_properties: Arc::new(JsonSystemProperties::new(dir.join("nvram.json"))),
        migration_marker: Arc::new(FileMigrationMarker::new(config.migration_marker_path())),
    }
}

fn open_engine(config: &EngineConfig) -> EngineHandle {
    let engine = PolicyEngine::open(config, collaborators(config));
    let (handle, _task) = spawn_engine(engine);
    handle
}

fn signature_check(disabled: bool) -> SignatureCheck {
    if disabled {
        SignatureCheck::Disabled
    } else {
        SignatureCheck::Enabled
    }
}

fn skip_reason(reason: SkipReason) -> &'static str {
    match reason {
        SkipReason::NonChromeFirmware => "non_chrome_firmware",
        SkipReason::NoOwnerKey => "no_owner_key",
    }
}

fn keygen(out: &Path) -> anyhow::Result<Value> {
    let mut seed = [0_u8; 32];
    getrandom::getrandom(&mut seed).map_err(|e| anyhow!("random seed generation failed: {e}"))?;
    let signing_key = SigningKey::from_bytes(&seed);
    write_secret_seed(out, hex::encode(seed).as_bytes())?;
    let public = signing_key.verifying_key().to_bytes();
    Ok(json!({
        "public_key": hex::encode(public),
        "fingerprint": key_fingerprint(&public),
        "out": out.display().to_string(),
    }))
}

/// Refuses to replace an existing seed. On unix the file is owner-only.
fn write_secret_seed(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut f = options
        .open(path)
        .with_context(|| format!("create signing seed {}", path.display()))?;
    f.write_all(bytes)
        .and_then(|()| f.sync_all())
        .with_context(|| format!("write signing seed {}", path.display()))
}

fn read_seed(path: &Path) -> anyhow::Result<SigningKey> {
    let text = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let raw = hex::decode(text.trim()).with_context(|| format!("{} is not hex", path.display()))?;
    let seed: [u8; 32] = raw
        .try_into()
        .map_err(|_| anyhow!("{} must hold a 32-byte seed", path.display()))?;
    Ok(SigningKey::from_bytes(&seed))
}

fn sign(key: &SigningKey, message: &[u8], algorithm: SignatureAlgorithm) -> Vec<u8> {
    key.sign(&algorithm.signed_message(message)).to_bytes().to_vec()
}

fn read_file(path: &Path) -> anyhow::Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("read {}", path.display()))
}

fn write_file(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    fs::write(path, bytes).with_context(|| format!("write {}", path.display()))
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
}
