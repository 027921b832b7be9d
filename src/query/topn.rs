//! In-memory Top-N ranking
//!
//! Mirrors the ranking subquery a Top-N [`Condition`](super::Condition)
//! renders, for stores that hand back rows instead of running SQL.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::aggregation::HostAggregate;
use crate::query::condition::{TopNFunction, TopNSpec};
use crate::types::RowKey;

/// Per-series ranking accumulator
#[derive(Debug, Clone, Copy)]
struct Rank {
    max: f64,
    min: f64,
    sum: f64,
    rows: u64,
}

impl Rank {
    fn new() -> Self {
        Self {
            max: f64::NEG_INFINITY,
            min: f64::INFINITY,
            sum: 0.0,
            rows: 0,
        }
    }

    fn add(&mut self, row: &HostAggregate) {
        self.max = self.max.max(row.max);
        self.min = self.min.min(row.min);
        self.sum += row.sum;
        self.rows += 1;
    }

    fn score(&self, function: TopNFunction) -> f64 {
        match function {
            TopNFunction::Max => self.max,
            TopNFunction::Min => self.min,
            TopNFunction::Sum => self.sum,
            TopNFunction::Avg => {
                if self.rows == 0 {
                    0.0
                } else {
                    self.sum / self.rows as f64
                }
            },
        }
    }
}

/// Rank the series in `rows` and keep the best `spec.n`
///
/// Scores descend for a top query and ascend for a bottom query; equal
/// scores are ordered by key so the result is deterministic.
pub fn rank_series(rows: &[(RowKey, HostAggregate)], spec: &TopNSpec) -> Vec<(RowKey, f64)> {
    let mut ranks: BTreeMap<RowKey, Rank> = BTreeMap::new();
    for (key, row) in rows {
        ranks.entry(*key).or_insert_with(Rank::new).add(row);
    }

    let mut scored: Vec<(RowKey, f64)> = ranks
        .into_iter()
        .map(|(key, rank)| (key, rank.score(spec.function)))
        .collect();

    scored.sort_by(|a, b| {
        let by_score = a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal);
        let by_score = if spec.bottom { by_score } else { by_score.reverse() };
        by_score.then_with(|| a.0.cmp(&b.0))
    });
    scored.truncate(spec.n);
    scored
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{HostKey, MetricKey, SeriesKey};

    fn key(host: u8) -> RowKey {
        RowKey::Series(SeriesKey::new(MetricKey([3; 16]), HostKey([0, 0, 0, host])))
    }

    fn rows() -> Vec<(RowKey, HostAggregate)> {
        vec![
            (key(1), HostAggregate::from_values(&[1.0, 9.0])),
            (key(1), HostAggregate::from_value(4.0)),
            (key(2), HostAggregate::from_values(&[2.0, 3.0])),
            (key(3), HostAggregate::from_value(9.0)),
            (key(4), HostAggregate::from_value(0.5)),
        ]
    }

    #[test]
    fn test_top_by_max_breaks_ties_by_key() {
        let ranked = rank_series(&rows(), &TopNSpec::top(2, TopNFunction::Max));
        assert_eq!(ranked, vec![(key(1), 9.0), (key(3), 9.0)]);
    }

    #[test]
    fn test_bottom_by_min() {
        let ranked = rank_series(&rows(), &TopNSpec::bottom(2, TopNFunction::Min));
        assert_eq!(ranked, vec![(key(4), 0.5), (key(1), 1.0)]);
    }

    #[test]
    fn test_sum_and_avg() {
        let sum = rank_series(&rows(), &TopNSpec::top(1, TopNFunction::Sum));
        assert_eq!(sum, vec![(key(1), 14.0)]);

        // key 1 averages 7.0 per row, key 3 averages 9.0
        let avg = rank_series(&rows(), &TopNSpec::top(1, TopNFunction::Avg));
        assert_eq!(avg, vec![(key(3), 9.0)]);
    }

    #[test]
    fn test_n_larger_than_series() {
        let ranked = rank_series(&rows(), &TopNSpec::top(10, TopNFunction::Max));
        assert_eq!(ranked.len(), 4);
        assert!(rank_series(&[], &TopNSpec::top(3, TopNFunction::Max)).is_empty());
    }
}
