// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fail-closed codec for signed policy blobs.
//!
//! Decoding never returns a partial parse. A blob is accepted only if it is
//! the canonical encoding of its own contents, so `encode(decode(b)) == b`
//! for every accepted `b`.

use prost::Message;
use thiserror::Error;

use crate::messages::{PolicyData, PolicyEnvelope, RemoteCommand, SignatureAlgorithm, SignedData};

pub const DEFAULT_MAX_BLOB_BYTES: usize = 1024 * 1024;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("blob of {len} bytes exceeds limit of {max} bytes")]
    TooLarge { len: usize, max: usize },
    #[error("protobuf decode failed: {0}")]
    Decode(String),
    #[error("required field missing: {0}")]
    MissingField(&'static str),
    #[error("new key signature present without a new key")]
    DanglingKeySignature,
    #[error("unknown signature algorithm {0}")]
    UnknownAlgorithm(i32),
    #[error("non-canonical framing")]
    NonCanonical,
}

impl From<prost::DecodeError> for CodecError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Decode(err.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewKey {
    pub key: Vec<u8>,
    /// Signature by the outgoing key over `key`; only rotation needs it.
    pub signature: Option<Vec<u8>>,
}

/// Decoded outer container of a policy blob.
///
/// `payload_signature` covers `payload` exactly, never the envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedEnvelope {
    pub payload: Vec<u8>,
    pub payload_signature: Vec<u8>,
    pub new_key: Option<NewKey>,
    pub algorithm: Option<SignatureAlgorithm>,
}

impl SignedEnvelope {
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.algorithm.unwrap_or(SignatureAlgorithm::Ed25519)
    }
}

/// Decoded `SignedData` container used by remote commands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedPayload {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
    pub algorithm: Option<SignatureAlgorithm>,
}

impl SignedPayload {
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        self.algorithm.unwrap_or(SignatureAlgorithm::Ed25519)
    }
}

fn check_len(bytes: &[u8], max_bytes: usize) -> Result<(), CodecError> {
    if bytes.len() > max_bytes {
        return Err(CodecError::TooLarge {
            len: bytes.len(),
            max: max_bytes,
        });
    }
    Ok(())
}

fn parse_algorithm(raw: Option<i32>) -> Result<Option<SignatureAlgorithm>, CodecError> {
    raw.map(|value| {
        SignatureAlgorithm::try_from(value).map_err(|_| CodecError::UnknownAlgorithm(value))
    })
    .transpose()
}

pub fn decode_signed_envelope(
    bytes: &[u8],
    max_bytes: usize,
) -> Result<SignedEnvelope, CodecError> {
    check_len(bytes, max_bytes)?;
    let raw = PolicyEnvelope::decode(bytes)?;
    if raw.encode_to_vec() != bytes {
        return Err(CodecError::NonCanonical);
    }
    let algorithm = parse_algorithm(raw.signature_algorithm)?;
    let payload = raw
        .policy_data
        .ok_or(CodecError::MissingField("policy_data"))?;
    let payload_signature = raw
        .policy_data_signature
        .ok_or(CodecError::MissingField("policy_data_signature"))?;
    let new_key = match (raw.new_public_key, raw.new_public_key_signature) {
        (Some(key), signature) => Some(NewKey { key, signature }),
        (None, Some(_)) => return Err(CodecError::DanglingKeySignature),
        (None, None) => None,
    };
    Ok(SignedEnvelope {
        payload,
        payload_signature,
        new_key,
        algorithm,
    })
}

pub fn encode_signed_envelope(envelope: &SignedEnvelope) -> Vec<u8> {
    let (new_public_key, new_public_key_signature) = match &envelope.new_key {
        Some(new_key) => (Some(new_key.key.clone()), new_key.signature.clone()),
        None => (None, None),
    };
    PolicyEnvelope {
        policy_data: Some(envelope.payload.clone()),
        policy_data_signature: Some(envelope.payload_signature.clone()),
        new_public_key,
        new_public_key_signature,
        signature_algorithm: envelope.algorithm.map(|a| a as i32),
    }
    .encode_to_vec()
}

pub fn decode_signed_data(bytes: &[u8], max_bytes: usize) -> Result<SignedPayload, CodecError> {
    check_len(bytes, max_bytes)?;
    let raw = SignedData::decode(bytes)?;
    if raw.encode_to_vec() != bytes {
        return Err(CodecError::NonCanonical);
    }
    let algorithm = parse_algorithm(raw.signature_algorithm)?;
    Ok(SignedPayload {
        data: raw.data.ok_or(CodecError::MissingField("data"))?,
        signature: raw.signature.ok_or(CodecError::MissingField("signature"))?,
        algorithm,
    })
}

pub fn encode_signed_data(payload: &SignedPayload) -> Vec<u8> {
    SignedData {
        data: Some(payload.data.clone()),
        signature: Some(payload.signature.clone()),
        signature_algorithm: payload.algorithm.map(|a| a as i32),
    }
    .encode_to_vec()
}

/// Parses signed payload bytes. The signature already pins these bytes, so
/// no canonical-form check is applied here.
pub fn decode_policy_data(bytes: &[u8]) -> Result<PolicyData, CodecError> {
    Ok(PolicyData::decode(bytes)?)
}

pub fn decode_remote_command(bytes: &[u8]) -> Result<RemoteCommand, CodecError> {
    Ok(RemoteCommand::decode(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SignedEnvelope {
        SignedEnvelope {
            payload: b"payload".to_vec(),
            payload_signature: vec![7; 64],
            new_key: Some(NewKey {
                key: vec![1; 32],
                signature: None,
            }),
            algorithm: None,
        }
    }

    #[test]
    fn encoded_envelope_decodes_to_same_value() {
        let env = sample();
        let bytes = encode_signed_envelope(&env);
        let decoded = decode_signed_envelope(&bytes, DEFAULT_MAX_BLOB_BYTES).expect("decode");
        assert_eq!(decoded, env);
        assert_eq!(encode_signed_envelope(&decoded), bytes);
    }

    #[test]
    fn empty_input_is_missing_payload() {
        let err = decode_signed_envelope(&[], DEFAULT_MAX_BLOB_BYTES).expect_err("must fail");
        assert_eq!(err, CodecError::MissingField("policy_data"));
    }

    #[test]
    fn missing_signature_rejected() {
        let bytes = PolicyEnvelope {
            policy_data: Some(b"x".to_vec()),
            ..Default::default()
        }
        .encode_to_vec();
        let err = decode_signed_envelope(&bytes, DEFAULT_MAX_BLOB_BYTES).expect_err("must fail");
        assert_eq!(err, CodecError::MissingField("policy_data_signature"));
    }

    #[test]
    fn truncated_blob_rejected() {
        let bytes = encode_signed_envelope(&sample());
        let cut = &bytes[..bytes.len() - 3];
        assert!(decode_signed_envelope(cut, DEFAULT_MAX_BLOB_BYTES).is_err());
    }

    #[test]
    fn unknown_field_rejected_as_non_canonical() {
        let mut bytes = encode_signed_envelope(&sample());
        // field 15, varint 1
        bytes.extend_from_slice(&[0x78, 0x01]);
        let err = decode_signed_envelope(&bytes, DEFAULT_MAX_BLOB_BYTES).expect_err("must fail");
        assert_eq!(err, CodecError::NonCanonical);
    }

    #[test]
    fn key_signature_without_key_rejected() {
        let bytes = PolicyEnvelope {
            policy_data: Some(b"x".to_vec()),
            policy_data_signature: Some(vec![0; 64]),
            new_public_key_signature: Some(vec![0; 64]),
            ..Default::default()
        }
        .encode_to_vec();
        let err = decode_signed_envelope(&bytes, DEFAULT_MAX_BLOB_BYTES).expect_err("must fail");
        assert_eq!(err, CodecError::DanglingKeySignature);
    }

    #[test]
    fn unknown_algorithm_rejected() {
        let bytes = PolicyEnvelope {
            policy_data: Some(b"x".to_vec()),
            policy_data_signature: Some(vec![0; 64]),
            signature_algorithm: Some(9),
            ..Default::default()
        }
        .encode_to_vec();
        let err = decode_signed_envelope(&bytes, DEFAULT_MAX_BLOB_BYTES).expect_err("must fail");
        assert_eq!(err, CodecError::UnknownAlgorithm(9));
    }

    #[test]
    fn oversized_blob_rejected_before_parse() {
        let err = decode_signed_envelope(&[0u8; 16], 8).expect_err("must fail");
        assert_eq!(err, CodecError::TooLarge { len: 16, max: 8 });
    }

    #[test]
    fn signed_data_requires_signature() {
        let bytes = SignedData {
            data: Some(b"cmd".to_vec()),
            ..Default::default()
        }
        .encode_to_vec();
        let err = decode_signed_data(&bytes, DEFAULT_MAX_BLOB_BYTES).expect_err("must fail");
        assert_eq!(err, CodecError::MissingField("signature"));
    }
}
