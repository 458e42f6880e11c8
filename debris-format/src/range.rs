//! Helpers for building interval maps out of untrusted range data.
//!
//! Dump and symbol files routinely contain overlapping or degenerate
//! ranges. [`RangeMap`] refuses overlapping entries, so collections built
//! from file data go through [`IntoRangeMapSafe`], which drops the
//! conflicting entry (keeping the one that sorts first) and logs what it
//! dropped.

use range_map::{Range, RangeMap};
use tracing::warn;

/// Builds a [`RangeMap`] from possibly-overlapping, possibly-absent ranges.
///
/// Entries with a `None` range are skipped (a zero-sized item has no valid
/// inclusive range). When two entries overlap, the one with the lower start
/// wins and the loser is logged; equal-value duplicates are merged quietly.
pub trait IntoRangeMapSafe<V>: IntoIterator<Item = (Option<Range<u64>>, V)> + Sized
where
    V: Clone + std::fmt::Debug + Eq,
{
    fn into_rangemap_safe(self) -> RangeMap<u64, V> {
        let mut input: Vec<_> = self
            .into_iter()
            .filter_map(|(range, val)| range.map(|range| (range, val)))
            .collect();
        input.sort_by_key(|&(range, _)| range);

        let mut output: Vec<(Range<u64>, V)> = Vec::with_capacity(input.len());
        for (range, val) in input {
            if let Some((last_range, last_val)) = output.last_mut() {
                if range.start <= last_range.end {
                    if &val == last_val {
                        last_range.end = std::cmp::max(last_range.end, range.end);
                    } else {
                        warn!(
                            "dropping range that overlaps existing entry: {:?} ({:?})",
                            range, val
                        );
                    }
                    continue;
                }
            }
            output.push((range, val));
        }
        output.into_iter().collect()
    }
}

impl<T, V> IntoRangeMapSafe<V> for T
where
    T: IntoIterator<Item = (Option<Range<u64>>, V)> + Sized,
    V: Clone + std::fmt::Debug + Eq,
{
}

/// Builds an inclusive range from a base and length, rejecting zero sizes
/// and address-space overflow.
pub fn checked_range(base: u64, size: u64) -> Option<Range<u64>> {
    if size == 0 {
        return None;
    }
    Some(Range::new(base, base.checked_add(size)?.checked_sub(1)?))
}
