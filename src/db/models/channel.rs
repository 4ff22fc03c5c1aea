use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::overlap::{ChannelOverlap, ChannelRecord};
use crate::overlap::record::ChannelId;

/// Base channel table model: the latest sample for a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub display_name: String,
    pub avatar: Option<String>,
    pub game: String,
    pub viewers: i32,
    pub chatters: i32,
    /// Number of other sampled channels sharing at least one chatter.
    pub shared: i32,
    pub last_update: NaiveDateTime,
}

impl ChannelSnapshot {
    pub fn new(record: &ChannelRecord, overlap: &ChannelOverlap, timestamp: NaiveDateTime) -> Self {
        Self {
            id: record.id.clone(),
            display_name: record.meta.display_name.clone(),
            avatar: record.meta.avatar.clone(),
            game: record.meta.game.clone(),
            viewers: super::saturating_i32(record.meta.viewers as usize),
            chatters: super::saturating_i32(record.meta.chatters as usize),
            shared: super::saturating_i32(overlap.total_distinct_overlap),
            last_update: timestamp,
        }
    }
}
