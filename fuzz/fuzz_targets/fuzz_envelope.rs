//! Fuzz target for mutation envelope decoding.
//!
//! Arbitrary bytes off the wire must decode or fail cleanly, and anything
//! that decodes must survive re-encoding unchanged.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mutation_relay::envelope::MutationEnvelope;

fuzz_target!(|data: &[u8]| {
    if let Ok(envelope) = MutationEnvelope::decode(data) {
        let encoded = envelope.encode().expect("decoded envelope re-encodes");
        let again = MutationEnvelope::decode(&encoded).expect("re-encoded envelope decodes");
        assert_eq!(again, envelope);
    }
});
