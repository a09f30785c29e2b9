//! Fuzz target for stream ID comparison and pagination cursors.
//!
//! Comparison must never panic, must be antisymmetric, and the reclaim
//! cursor built by `next_stream_id` must always sort after its input.

#![no_main]

use libfuzzer_sys::fuzz_target;
use mutation_relay::broker::stream_id::{compare_stream_ids, entry_age_ms, next_stream_id};
use std::cmp::Ordering;

fuzz_target!(|data: (&str, &str)| {
    let (a, b) = data;

    let ab = compare_stream_ids(a, b);
    let ba = compare_stream_ids(b, a);
    assert_eq!(ab, ba.reverse());
    assert_eq!(compare_stream_ids(a, a), Ordering::Equal);

    if let Some(next) = next_stream_id(a) {
        assert_eq!(compare_stream_ids(a, &next), Ordering::Less);
    }

    let _ = entry_age_ms(a, u64::MAX);
    let _ = entry_age_ms(b, 0);
});
