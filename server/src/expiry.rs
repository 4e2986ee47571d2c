//! Pure expiry rules. Every boundary is inclusive: `now == expires_at` is
//! expired, and `view_count == max_views` is exhausted.

use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};

use crate::paste::PasteRecord;

pub fn is_time_expired(record: &PasteRecord, now: DateTime<Utc>) -> bool {
    record.expires_at.map_or(false, |expires_at| now >= expires_at)
}

pub fn is_view_exhausted(record: &PasteRecord) -> bool {
    record
        .max_views
        .map_or(false, |max_views| record.view_count >= max_views)
}

/// Whether the record must be treated as absent at `now`.
pub fn is_expired(record: &PasteRecord, now: DateTime<Utc>) -> bool {
    is_time_expired(record, now) || is_view_exhausted(record)
}

pub fn remaining_views(record: &PasteRecord) -> Option<u32> {
    record
        .max_views
        .map(|max_views| max_views.saturating_sub(record.view_count))
}

/// TTL to hand to the backend so it can evict the record on its own. Rounds
/// up to whole seconds and never goes below one second.
pub fn backend_ttl(record: &PasteRecord, now: DateTime<Utc>) -> Option<StdDuration> {
    record.expires_at.map(|expires_at| {
        let millis = (expires_at - now).num_milliseconds();
        let secs = if millis <= 0 {
            1
        } else {
            // ceil without floats
            (millis + 999) / 1000
        };
        StdDuration::from_secs(u64::try_from(secs.max(1)).unwrap_or(1))
    })
}
