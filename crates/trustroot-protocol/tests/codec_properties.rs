use proptest::prelude::*;
use trustroot_protocol::{
    decode_signed_data, decode_signed_envelope, encode_signed_data, encode_signed_envelope,
    NewKey, SignatureAlgorithm, SignedEnvelope, SignedPayload, DEFAULT_MAX_BLOB_BYTES,
};

fn algorithm() -> impl Strategy<Value = Option<SignatureAlgorithm>> {
    prop_oneof![
        Just(None),
        Just(Some(SignatureAlgorithm::Ed25519)),
        Just(Some(SignatureAlgorithm::Ed25519Sha256)),
    ]
}

fn envelope() -> impl Strategy<Value = SignedEnvelope> {
    (
        proptest::collection::vec(any::<u8>(), 0..256),
        proptest::collection::vec(any::<u8>(), 0..96),
        proptest::option::of((
            proptest::collection::vec(any::<u8>(), 0..48),
            proptest::option::of(proptest::collection::vec(any::<u8>(), 0..96)),
        )),
        algorithm(),
    )
        .prop_map(|(payload, payload_signature, new_key, algorithm)| SignedEnvelope {
            payload,
            payload_signature,
            new_key: new_key.map(|(key, signature)| NewKey { key, signature }),
            algorithm,
        })
}

proptest! {
    #[test]
    fn envelope_survives_encode_decode(env in envelope()) {
        let bytes = encode_signed_envelope(&env);
        let decoded = decode_signed_envelope(&bytes, DEFAULT_MAX_BLOB_BYTES).expect("decode");
        prop_assert_eq!(&decoded, &env);
        prop_assert_eq!(encode_signed_envelope(&decoded), bytes);
    }

    #[test]
    fn accepted_arbitrary_bytes_reencode_identically(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
        if let Ok(env) = decode_signed_envelope(&bytes, DEFAULT_MAX_BLOB_BYTES) {
            prop_assert_eq!(encode_signed_envelope(&env), bytes);
        }
    }

    #[test]
    fn signed_data_survives_encode_decode(
        data in proptest::collection::vec(any::<u8>(), 0..128),
        signature in proptest::collection::vec(any::<u8>(), 0..96),
        algorithm in algorithm(),
    ) {
        let payload = SignedPayload { data, signature, algorithm };
        let bytes = encode_signed_data(&payload);
        let decoded = decode_signed_data(&bytes, DEFAULT_MAX_BLOB_BYTES).expect("decode");
        prop_assert_eq!(decoded, payload);
    }
}
