#![allow(dead_code)]

use proptest::prelude::*;

/// Unit capacity together with permit requests that each fit within it
pub fn capacity_and_permits_strategy() -> impl Strategy<Value = (i32, Vec<i32>)> {
    (1i32..=5).prop_flat_map(|capacity| {
        (
            Just(capacity),
            prop::collection::vec(1i32..=capacity, 1..12),
        )
    })
}

/// Indices into a list of consumers, used to pick which one finishes next
pub fn finish_order_strategy() -> impl Strategy<Value = Vec<prop::sample::Index>> {
    prop::collection::vec(any::<prop::sample::Index>(), 0..12)
}
