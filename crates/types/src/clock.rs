//! Vector clocks for causal ordering of operations across devices.

use crate::DeviceId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Outcome of comparing two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// `self` is causally before the other clock.
    Before,
    /// `self` is causally after the other clock.
    After,
    /// Both clocks are identical.
    Equal,
    /// Neither clock dominates the other.
    Concurrent,
}

/// A per-device monotonic counter map.
///
/// `BTreeMap` keeps serialisation deterministic, which matters because clock
/// snapshots are persisted and embedded in operation metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock(pub BTreeMap<DeviceId, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter for a device, zero if the device has never been observed.
    pub fn get(&self, device: &str) -> u64 {
        self.0.get(device).copied().unwrap_or(0)
    }

    /// Bumps the counter for `device` and returns the post-bump value.
    pub fn bump(&mut self, device: &str) -> u64 {
        let counter = self.0.entry(device.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Folds another clock in, taking the per-device maximum.
    pub fn merge(&mut self, other: &VectorClock) {
        for (device, &counter) in &other.0 {
            let entry = self.0.entry(device.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
    }

    /// True iff `self` dominates `other`: every component is >= and at least
    /// one is strictly greater.
    pub fn dominates(&self, other: &VectorClock) -> bool {
        let mut strictly_greater = false;
        for (device, &theirs) in &other.0 {
            let ours = self.get(device);
            if ours < theirs {
                return false;
            }
            if ours > theirs {
                strictly_greater = true;
            }
        }
        if self
            .0
            .iter()
            .any(|(device, &ours)| ours > 0 && !other.0.contains_key(device))
        {
            strictly_greater = true;
        }
        strictly_greater
    }

    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let self_dominates = self.dominates(other);
        let other_dominates = other.dominates(self);
        match (self_dominates, other_dominates) {
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (false, false) if self == other => ClockOrdering::Equal,
            _ => ClockOrdering::Concurrent,
        }
    }

    /// Scalar sum of all counters. An approximation of causal weight used
    /// only as a deterministic tie-break between concurrent clocks.
    pub fn counter_sum(&self) -> u64 {
        self.0.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock(pairs: &[(&str, u64)]) -> VectorClock {
        VectorClock(
            pairs
                .iter()
                .map(|(d, c)| (d.to_string(), *c))
                .collect::<BTreeMap<_, _>>(),
        )
    }

    #[test]
    fn test_bump_is_monotonic() {
        let mut vc = VectorClock::new();
        assert_eq!(vc.bump("a"), 1);
        assert_eq!(vc.bump("a"), 2);
        assert_eq!(vc.get("a"), 2);
        assert_eq!(vc.get("b"), 0);
    }

    #[test]
    fn test_dominance() {
        let a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 1), ("b", 1)]);
        assert!(a.dominates(&b));
        assert!(!b.dominates(&a));
        assert_eq!(a.compare(&b), ClockOrdering::After);
        assert_eq!(b.compare(&a), ClockOrdering::Before);
    }

    #[test]
    fn test_concurrent_clocks() {
        let a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 1), ("b", 2)]);
        assert!(!a.dominates(&b));
        assert!(!b.dominates(&a));
        assert_eq!(a.compare(&b), ClockOrdering::Concurrent);
    }

    #[test]
    fn test_equal_clocks() {
        let a = clock(&[("a", 1)]);
        let b = clock(&[("a", 1)]);
        assert_eq!(a.compare(&b), ClockOrdering::Equal);
        assert!(!a.dominates(&b));
    }

    #[test]
    fn test_unknown_device_counts_as_zero() {
        let a = clock(&[("a", 1), ("c", 1)]);
        let b = clock(&[("a", 1)]);
        assert!(a.dominates(&b));
        assert_eq!(b.compare(&a), ClockOrdering::Before);
    }

    #[test]
    fn test_merge_takes_componentwise_max() {
        let mut a = clock(&[("a", 2), ("b", 1)]);
        let b = clock(&[("a", 1), ("b", 3), ("c", 4)]);
        a.merge(&b);
        assert_eq!(a, clock(&[("a", 2), ("b", 3), ("c", 4)]));
    }

    #[test]
    fn test_counter_sum() {
        assert_eq!(clock(&[("a", 2), ("b", 3)]).counter_sum(), 5);
        assert_eq!(VectorClock::new().counter_sum(), 0);
    }
}
