// tests/property/decoder_test.rs
//
// The WAL decoder's failure discipline (§ WAL decoder): any tag byte it
// doesn't recognize yields `Unsupported`, and any truncated or otherwise
// malformed payload yields a `PlaneError`, never a panic — regardless of
// what garbage bytes a misbehaving or out-of-sync primary sends.

use perimeterd::core::wal::decode_message;
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig { cases: 256, ..ProptestConfig::default() })]

    #[test]
    fn arbitrary_bytes_never_panic_the_decoder(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
        // decode_message must resolve to either Ok or Err; reaching this
        // line at all (rather than unwinding) is the property under test.
        let _ = decode_message(&bytes);
    }

    #[test]
    fn truncating_a_well_formed_begin_message_is_always_malformed_not_ok(cut in 0usize..21) {
        let mut buf = vec![b'B'];
        buf.extend_from_slice(&42u64.to_be_bytes());
        buf.extend_from_slice(&1000i64.to_be_bytes());
        buf.extend_from_slice(&7u32.to_be_bytes());
        let truncated = &buf[..cut];
        prop_assert!(decode_message(truncated).is_err());
    }

    #[test]
    fn unrecognized_tag_bytes_are_always_unsupported_not_an_error(tag in any::<u8>(), rest in prop::collection::vec(any::<u8>(), 0..16)) {
        // Tag bytes that collide with a real message kind are exempt: this
        // property only claims "unrecognized tags are Unsupported", not
        // that no byte sequence with a recognized tag byte can be malformed.
        const KNOWN_TAGS: &[u8] = &[b'B', b'C', b'O', b'R', b'Y', b'I', b'U', b'D', b'T', b'M'];
        prop_assume!(!KNOWN_TAGS.contains(&tag));

        let mut buf = vec![tag];
        buf.extend_from_slice(&rest);
        let msg = decode_message(&buf).expect("unrecognized tags never error");
        match msg {
            perimeterd::core::wal::WalMessage::Unsupported { tag: got_tag, raw } => {
                prop_assert_eq!(got_tag, tag);
                prop_assert_eq!(raw, buf);
            }
            other => prop_assert!(false, "expected Unsupported, got {other:?}"),
        }
    }
}
