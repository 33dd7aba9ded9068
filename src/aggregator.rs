use std::collections::HashMap;

use tracing::warn;

use crate::profile::Frame;

/// Bucket stacks into a histogram keyed by the frame sequence.
///
/// The key respects `Frame`'s equality, which compares file and line but
/// not function name. Input order does not matter; shuffling the
/// time-series yields the same histogram.
pub fn aggregate<'a>(stacks: impl Iterator<Item = &'a [Frame]>) -> HashMap<Vec<Frame>, u64> {
    let mut buckets: HashMap<Vec<Frame>, u64> = HashMap::new();
    for stack in stacks {
        if stack.is_empty() {
            // Idle samples are accounted separately and never reach the
            // histogram.
            warn!("empty stack handed to the aggregator, skipping");
            continue;
        }
        *buckets.entry(stack.to_vec()).or_insert(0) += 1;
    }
    buckets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(file: &str, function: &str, line: u64) -> Frame {
        Frame {
            file: file.into(),
            function: function.into(),
            line,
        }
    }

    #[test]
    fn counts_identical_stacks_together() {
        let a = vec![frame("a.py", "f", 1), frame("a.py", "<module>", 9)];
        let b = vec![frame("b.py", "g", 2)];
        let stacks = vec![a.clone(), b.clone(), a.clone(), a.clone()];

        let buckets = aggregate(stacks.iter().map(|s| s.as_slice()));

        assert_eq!(buckets.len(), 2);
        assert_eq!(buckets[&a], 3);
        assert_eq!(buckets[&b], 1);
    }

    #[test]
    fn aggregation_is_order_insensitive() {
        let a = vec![frame("a.py", "f", 1)];
        let b = vec![frame("b.py", "g", 2)];
        let c = vec![frame("c.py", "h", 3), frame("c.py", "<module>", 1)];

        let forward = vec![a.clone(), b.clone(), c.clone(), a.clone(), c.clone()];
        let shuffled = vec![c.clone(), a.clone(), c.clone(), b.clone(), a.clone()];

        assert_eq!(
            aggregate(forward.iter().map(|s| s.as_slice())),
            aggregate(shuffled.iter().map(|s| s.as_slice()))
        );
    }

    #[test]
    fn function_name_does_not_split_buckets() {
        let original = vec![frame("a.py", "spin", 3)];
        let renamed = vec![frame("a.py", "spin_v2", 3)];

        let buckets = aggregate([original.as_slice(), renamed.as_slice()].into_iter());

        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets.values().sum::<u64>(), 2);
    }

    #[test]
    fn empty_stacks_are_skipped() {
        let a = vec![frame("a.py", "f", 1)];
        let empty: Vec<Frame> = Vec::new();

        let buckets = aggregate([a.as_slice(), empty.as_slice()].into_iter());

        assert_eq!(buckets.len(), 1);
    }
}
