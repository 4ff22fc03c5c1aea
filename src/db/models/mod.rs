use chrono::NaiveDateTime;

pub mod channel;
pub mod overlap;

use channel::ChannelSnapshot;
use overlap::OverlapRecord;

/// Everything a single collection cycle writes, applied all-or-nothing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleBatch {
    pub timestamp: NaiveDateTime,
    pub snapshots: Vec<ChannelSnapshot>,
    pub records: Vec<OverlapRecord>,
    /// Overlap records strictly older than this are pruned.
    pub prune_before: NaiveDateTime,
}

/// Row counts touched by a committed cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub upserted: u64,
    pub appended: u64,
    pub pruned: u64,
}

#[inline]
pub(crate) fn saturating_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}
