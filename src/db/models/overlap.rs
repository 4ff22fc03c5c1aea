use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::overlap::ChannelOverlap;
use crate::overlap::record::ChannelId;

/// One channel's overlap figures at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OverlapRecord {
    pub channel: ChannelId,
    pub timestamp: NaiveDateTime,
    /// `peer -> shared chatter count`
    #[sqlx(json)]
    pub shared: BTreeMap<ChannelId, i32>,
}

impl OverlapRecord {
    pub fn new(channel: ChannelId, overlap: &ChannelOverlap, timestamp: NaiveDateTime) -> Self {
        let shared = overlap
            .shared_counts
            .iter()
            .map(|(peer, count)| (peer.clone(), super::saturating_i32(*count)))
            .collect();

        Self {
            channel,
            timestamp,
            shared,
        }
    }
}
