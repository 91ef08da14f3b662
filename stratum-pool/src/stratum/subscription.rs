//! Subscription ids.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::codec::pack_u64_le;

const SUBSCRIPTION_PREFIX: &str = "deadbeefcafebabe";

/// Hands out `deadbeefcafebabe` followed by a little-endian counter.
#[derive(Debug, Default)]
pub struct SubscriptionCounter {
    count: AtomicU64,
}

impl SubscriptionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> String {
        // fetch_add wraps, so the counter rolls over to 0 after u64::MAX
        let n = self.count.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        format!("{}{}", SUBSCRIPTION_PREFIX, hex::encode(pack_u64_le(n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscription_ids() {
        let counter = SubscriptionCounter::new();
        assert_eq!(counter.next(), "deadbeefcafebabe0100000000000000");
        assert_eq!(counter.next(), "deadbeefcafebabe0200000000000000");
    }

    #[test]
    fn test_wraps_to_zero() {
        let counter = SubscriptionCounter {
            count: AtomicU64::new(u64::MAX - 1),
        };
        assert_eq!(counter.next(), "deadbeefcafebabeffffffffffffffff");
        assert_eq!(counter.next(), "deadbeefcafebabe0000000000000000");
    }
}
