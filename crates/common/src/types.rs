use std::fmt;

/// A cluster-wide logical timestamp issued by the timestamp service.
///
/// Encodes a physical millisecond clock in the high bits and a logical
/// counter in the low [`TxnTimestamp::LOGICAL_BITS`] bits, so timestamps are
/// strictly increasing across the cluster even within one millisecond. This
/// layer never derives or reuses timestamps; it only carries them.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TxnTimestamp(u64);

impl TxnTimestamp {
    pub const LOGICAL_BITS: u32 = 18;
    pub const MIN: TxnTimestamp = TxnTimestamp(0);

    pub fn from_parts(physical_ms: u64, logical: u64) -> Self {
        Self((physical_ms << Self::LOGICAL_BITS) | (logical & ((1 << Self::LOGICAL_BITS) - 1)))
    }

    pub fn physical_ms(&self) -> u64 {
        self.0 >> Self::LOGICAL_BITS
    }

    pub fn saturating_sub_physical_ms(&self, ms: u64) -> Self {
        Self::from_parts(self.physical_ms().saturating_sub(ms), 0)
    }
}

impl From<u64> for TxnTimestamp {
    fn from(ts: u64) -> Self {
        Self(ts)
    }
}

impl From<TxnTimestamp> for u64 {
    fn from(ts: TxnTimestamp) -> u64 {
        ts.0
    }
}

impl fmt::Display for TxnTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a backing cluster, issued by its placement service. Two store
/// handles with equal `ClusterId` must be the same object within a process.
#[cfg_attr(any(test, feature = "testing"), derive(proptest_derive::Arbitrary))]
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterId(pub u64);

impl fmt::Display for ClusterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cluster-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::TxnTimestamp;

    proptest! {
        #![proptest_config(
            ProptestConfig { failure_persistence: None, ..ProptestConfig::default() }
        )]

        #[test]
        fn test_parts_ordering(physical in 0u64..(1 << 40), logical in 0u64..(1 << 18)) {
            let ts = TxnTimestamp::from_parts(physical, logical);
            prop_assert_eq!(ts.physical_ms(), physical);
            // A later physical time always dominates any logical counter.
            prop_assert!(TxnTimestamp::from_parts(physical + 1, 0) > ts);
        }
    }
}
