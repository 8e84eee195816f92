// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

#![no_main]

use libfuzzer_sys::fuzz_target;
use trustroot_protocol::{
    decode_signed_data, decode_signed_envelope, encode_signed_data, encode_signed_envelope,
    DEFAULT_MAX_BLOB_BYTES,
};

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = decode_signed_envelope(data, DEFAULT_MAX_BLOB_BYTES) {
        assert_eq!(encode_signed_envelope(&envelope), data);
    }
    if let Ok(signed) = decode_signed_data(data, DEFAULT_MAX_BLOB_BYTES) {
        assert_eq!(encode_signed_data(&signed), data);
    }
    if !data.is_empty() {
        assert!(decode_signed_envelope(data, data.len() - 1).is_err());
    }
});
