use thiserror::Error;
use trustroot_protocol::CodecError;

pub type PolicyResult<T> = Result<T, PolicyError>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PolicyError {
    #[error("malformed policy blob: {0}")]
    MalformedBlob(String),

    #[error("key install not permitted: {0}")]
    KeyInstallNotPermitted(String),

    #[error("signature verification failed")]
    SignatureVerificationFailed,

    #[error("persistence failed: {0}")]
    PersistenceFailed(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("policy type {policy_type:?} not accepted for namespace {namespace}")]
    PolicyTypeRejected {
        namespace: String,
        policy_type: String,
    },

    #[error("invalid namespace: {0}")]
    InvalidNamespace(String),

    #[error("policy engine unavailable")]
    EngineUnavailable,
}

impl PolicyError {
    /// Stable machine-readable code surfaced to callers.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::MalformedBlob(_) => "MALFORMED_BLOB",
            Self::KeyInstallNotPermitted(_) => "KEY_INSTALL_NOT_PERMITTED",
            Self::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            Self::PersistenceFailed(_) => "PERSISTENCE_FAILED",
            Self::StateConflict(_) => "STATE_CONFLICT",
            Self::PolicyTypeRejected { .. } => "POLICY_TYPE_REJECTED",
            Self::InvalidNamespace(_) => "INVALID_NAMESPACE",
            Self::EngineUnavailable => "ENGINE_UNAVAILABLE",
        }
    }
}

impl From<CodecError> for PolicyError {
    fn from(err: CodecError) -> Self {
        Self::MalformedBlob(err.to_string())
    }
}
