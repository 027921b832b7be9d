//! Aggregate Math
//!
//! Pure merge functions for the two statistical summaries stored by the
//! rollup tables:
//!
//! - [`HostAggregate`]: summary of one series over a time window
//!   (sum, sample count, min, max, deviation)
//! - [`ClusterAggregate`]: summary of one metric across hosts at one instant
//!   (sum, host count, min, max, deviation)
//!
//! Deviation is the population standard deviation. Merging converts each side
//! to its second central moment (`M2 = deviation² · n`), combines the moments
//! with Chan's pairwise update and converts back, so the merged deviation does
//! not depend on merge order beyond floating-point rounding.
//!
//! ```rust
//! use kuba_rollup::aggregation::math::{merge_host, HostAggregate};
//!
//! let a = HostAggregate::from_values(&[1.0, 2.0]);
//! let b = HostAggregate::from_values(&[3.0, 4.0]);
//! let all = HostAggregate::from_values(&[1.0, 2.0, 3.0, 4.0]);
//! let merged = merge_host(&a, &b);
//! assert_eq!(merged.count, 4);
//! assert!((merged.deviation - all.deviation).abs() < 1e-12);
//! ```

use serde::{Deserialize, Serialize};

// ============================================================================
// Shared moment arithmetic
// ============================================================================

/// Combine two (n, sum, deviation) triples into the merged deviation
fn combine_deviation(n_a: f64, sum_a: f64, dev_a: f64, n_b: f64, sum_b: f64, dev_b: f64) -> f64 {
    let n = n_a + n_b;
    if n_a == 0.0 {
        return dev_b;
    }
    if n_b == 0.0 {
        return dev_a;
    }

    let mean_a = sum_a / n_a;
    let mean_b = sum_b / n_b;
    let delta = mean_b - mean_a;

    let m2 = dev_a * dev_a * n_a + dev_b * dev_b * n_b + delta * delta * n_a * n_b / n;
    if m2 <= 0.0 {
        0.0
    } else {
        (m2 / n).sqrt()
    }
}

/// Population deviation of a slice
fn deviation_of(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let m2: f64 = values.iter().map(|v| (v - mean) * (v - mean)).sum();
    (m2 / n).sqrt()
}

// ============================================================================
// Host Aggregate
// ============================================================================

/// Summary of one series over one window
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HostAggregate {
    /// Sum of all samples
    pub sum: f64,
    /// Number of samples
    pub count: u64,
    /// Smallest sample
    pub min: f64,
    /// Largest sample
    pub max: f64,
    /// Population standard deviation of the samples
    pub deviation: f64,
}

impl HostAggregate {
    /// Merge identity: `merge_host(a, IDENTITY) == a`
    pub const IDENTITY: HostAggregate = HostAggregate {
        sum: 0.0,
        count: 0,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        deviation: 0.0,
    };

    /// Aggregate of a single sample
    pub fn from_value(value: f64) -> Self {
        Self {
            sum: value,
            count: 1,
            min: value,
            max: value,
            deviation: 0.0,
        }
    }

    /// Aggregate of a batch of samples
    pub fn from_values(values: &[f64]) -> Self {
        if values.is_empty() {
            return Self::IDENTITY;
        }
        Self {
            sum: values.iter().sum(),
            count: values.len() as u64,
            min: values.iter().copied().fold(f64::INFINITY, f64::min),
            max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            deviation: deviation_of(values),
        }
    }

    /// Mean sample value, 0 for an empty aggregate
    pub fn average(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// True for the merge identity
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Merge `other` into `self`
    pub fn merge(&mut self, other: &HostAggregate) {
        *self = merge_host(self, other);
    }
}

impl Default for HostAggregate {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Merge two host aggregates of the same series and window
pub fn merge_host(a: &HostAggregate, b: &HostAggregate) -> HostAggregate {
    HostAggregate {
        sum: a.sum + b.sum,
        count: a.count + b.count,
        min: a.min.min(b.min),
        max: a.max.max(b.max),
        deviation: combine_deviation(
            a.count as f64,
            a.sum,
            a.deviation,
            b.count as f64,
            b.sum,
            b.deviation,
        ),
    }
}

/// Fold any number of host aggregates
pub fn fold_host<'a, I>(items: I) -> HostAggregate
where
    I: IntoIterator<Item = &'a HostAggregate>,
{
    items
        .into_iter()
        .fold(HostAggregate::IDENTITY, |acc, item| merge_host(&acc, item))
}

// ============================================================================
// Cluster Aggregate
// ============================================================================

/// Summary of one metric across the hosts reporting it
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClusterAggregate {
    /// Sum of the per-host values
    pub sum: f64,
    /// Number of contributing hosts
    pub number_of_hosts: u32,
    /// Smallest per-host value
    pub min: f64,
    /// Largest per-host value
    pub max: f64,
    /// Population standard deviation across hosts
    pub deviation: f64,
}

impl ClusterAggregate {
    /// Merge identity: `merge_cluster(a, IDENTITY) == a`
    pub const IDENTITY: ClusterAggregate = ClusterAggregate {
        sum: 0.0,
        number_of_hosts: 0,
        min: f64::INFINITY,
        max: f64::NEG_INFINITY,
        deviation: 0.0,
    };

    /// Contribution of one host
    pub fn from_host_value(value: f64) -> Self {
        Self {
            sum: value,
            number_of_hosts: 1,
            min: value,
            max: value,
            deviation: 0.0,
        }
    }

    /// Mean per-host value
    pub fn average(&self) -> f64 {
        if self.number_of_hosts == 0 {
            0.0
        } else {
            self.sum / self.number_of_hosts as f64
        }
    }

    /// View this cross-host row as one sample of a time rollup
    ///
    /// Coarser cluster tables summarize cluster rows over time, so each
    /// cluster row counts as a single sample of its sum, keeping the
    /// cross-host extremes.
    pub fn as_time_sample(&self) -> HostAggregate {
        HostAggregate {
            sum: self.sum,
            count: 1,
            min: self.min,
            max: self.max,
            deviation: 0.0,
        }
    }
}

impl Default for ClusterAggregate {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Merge two cluster aggregates of the same metric and timestamp
pub fn merge_cluster(a: &ClusterAggregate, b: &ClusterAggregate) -> ClusterAggregate {
    ClusterAggregate {
        sum: a.sum + b.sum,
        number_of_hosts: a.number_of_hosts + b.number_of_hosts,
        min: a.min.min(b.min),
        max: a.max.max(b.max),
        deviation: combine_deviation(
            a.number_of_hosts as f64,
            a.sum,
            a.deviation,
            b.number_of_hosts as f64,
            b.sum,
            b.deviation,
        ),
    }
}

/// Fold any number of cluster aggregates
pub fn fold_cluster<'a, I>(items: I) -> ClusterAggregate
where
    I: IntoIterator<Item = &'a ClusterAggregate>,
{
    items
        .into_iter()
        .fold(ClusterAggregate::IDENTITY, |acc, item| {
            merge_cluster(&acc, item)
        })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const EPS: f64 = 1e-9;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() <= EPS * (1.0 + a.abs().max(b.abs()))
    }

    #[test]
    fn test_identity_host() {
        let a = HostAggregate::from_values(&[1.0, 5.0, 9.0]);
        assert_eq!(merge_host(&a, &HostAggregate::IDENTITY), a);
        assert_eq!(merge_host(&HostAggregate::IDENTITY, &a), a);
    }

    #[test]
    fn test_identity_cluster() {
        let a = merge_cluster(
            &ClusterAggregate::from_host_value(1.0),
            &ClusterAggregate::from_host_value(2.0),
        );
        assert_eq!(merge_cluster(&a, &ClusterAggregate::IDENTITY), a);
    }

    #[test]
    fn test_merge_matches_batch() {
        let values = [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0];
        let batch = HostAggregate::from_values(&values);
        assert!(close(batch.deviation, 2.0));

        let left = HostAggregate::from_values(&values[..3]);
        let right = HostAggregate::from_values(&values[3..]);
        let merged = merge_host(&left, &right);

        assert_eq!(merged.count, 8);
        assert!(close(merged.sum, 40.0));
        assert_eq!(merged.min, 2.0);
        assert_eq!(merged.max, 9.0);
        assert!(close(merged.deviation, 2.0));
        assert!(close(merged.average(), 5.0));
    }

    #[test]
    fn test_cluster_two_hosts() {
        let merged = merge_cluster(
            &ClusterAggregate::from_host_value(1.0),
            &ClusterAggregate::from_host_value(2.0),
        );
        assert_eq!(merged.number_of_hosts, 2);
        assert_eq!(merged.sum, 3.0);
        assert_eq!(merged.min, 1.0);
        assert_eq!(merged.max, 2.0);
        assert!(close(merged.deviation, 0.5));
    }

    #[test]
    fn test_empty_average() {
        assert_eq!(HostAggregate::IDENTITY.average(), 0.0);
        assert_eq!(ClusterAggregate::IDENTITY.average(), 0.0);
        assert!(HostAggregate::default().is_empty());
    }

    fn host_strategy() -> impl Strategy<Value = HostAggregate> {
        prop::collection::vec(-1.0e6f64..1.0e6, 1..8).prop_map(|v| HostAggregate::from_values(&v))
    }

    fn cluster_strategy() -> impl Strategy<Value = ClusterAggregate> {
        prop::collection::vec(-1.0e6f64..1.0e6, 1..8).prop_map(|v| {
            let parts: Vec<ClusterAggregate> =
                v.iter().map(|x| ClusterAggregate::from_host_value(*x)).collect();
            fold_cluster(&parts)
        })
    }

    proptest! {
        #[test]
        fn prop_host_fold_is_order_independent(
            mut items in prop::collection::vec(host_strategy(), 1..12),
            seed in any::<u64>(),
        ) {
            let forward = fold_host(&items);
            let len = items.len();
            items.rotate_left((seed as usize) % len);
            items.reverse();
            let shuffled = fold_host(&items);

            prop_assert_eq!(forward.count, shuffled.count);
            prop_assert_eq!(forward.min, shuffled.min);
            prop_assert_eq!(forward.max, shuffled.max);
            prop_assert!((forward.sum - shuffled.sum).abs() <= 1e-6 * (1.0 + forward.sum.abs()));
            prop_assert!((forward.deviation - shuffled.deviation).abs() <= 1e-6 * (1.0 + forward.deviation));
        }

        #[test]
        fn prop_host_merge_associative(a in host_strategy(), b in host_strategy(), c in host_strategy()) {
            let left = merge_host(&merge_host(&a, &b), &c);
            let right = merge_host(&a, &merge_host(&b, &c));
            prop_assert_eq!(left.count, right.count);
            prop_assert!((left.deviation - right.deviation).abs() <= 1e-6 * (1.0 + left.deviation));
        }

        #[test]
        fn prop_cluster_merge_commutative(a in cluster_strategy(), b in cluster_strategy()) {
            let ab = merge_cluster(&a, &b);
            let ba = merge_cluster(&b, &a);
            prop_assert_eq!(ab.number_of_hosts, ba.number_of_hosts);
            prop_assert_eq!(ab.min, ba.min);
            prop_assert_eq!(ab.max, ba.max);
            prop_assert!((ab.sum - ba.sum).abs() <= 1e-6 * (1.0 + ab.sum.abs()));
            prop_assert!((ab.deviation - ba.deviation).abs() <= 1e-6 * (1.0 + ab.deviation));
        }
    }
}
