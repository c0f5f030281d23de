// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Multi-layer duplicate suppression.
//!
//! One record per publisher entity: the newest delivered clock plus a
//! bitmap of the `DEDUP_WINDOW` clocks below it. A sample carried by
//! several layers is delivered by whichever layer arrives first; the
//! other copies hit the bitmap and are dropped silently.
//!
//! ```text
//!            bit 63 ............................ bit 0
//!  seen:    [last-63]                           [last]
//! ```

use crate::config::DEDUP_WINDOW;
use std::collections::HashMap;

/// What to do with one incoming sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupVerdict {
    Deliver,
    /// Newer than expected: `missed` clocks were skipped.
    DeliverAfterGap { missed: u64 },
    /// Older than the newest delivered clock but never seen. The clock
    /// was counted as missed by an earlier gap and is taken back off.
    DeliverOutOfOrder,
    /// Already delivered through another layer.
    Duplicate,
    /// Out of order and configured to drop, or older than the window.
    Discard,
}

impl DedupVerdict {
    pub fn is_delivered(self) -> bool {
        matches!(
            self,
            Self::Deliver | Self::DeliverAfterGap { .. } | Self::DeliverOutOfOrder
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct DedupRecord {
    last: u64,
    seen: u64,
    drops: u64,
}

#[derive(Debug, Default)]
pub struct DedupTable {
    records: HashMap<u64, DedupRecord>,
    drop_out_of_order: bool,
}

impl DedupTable {
    pub fn new(drop_out_of_order: bool) -> Self {
        Self {
            records: HashMap::new(),
            drop_out_of_order,
        }
    }

    /// Classify `clock` from `publisher_id` and record it.
    pub fn check(&mut self, publisher_id: u64, clock: u64) -> DedupVerdict {
        let Some(rec) = self.records.get_mut(&publisher_id) else {
            self.records.insert(
                publisher_id,
                DedupRecord {
                    last: clock,
                    seen: 1,
                    drops: 0,
                },
            );
            return DedupVerdict::Deliver;
        };

        if clock == rec.last {
            return DedupVerdict::Duplicate;
        }

        if clock > rec.last {
            let shift = clock - rec.last;
            rec.seen = if shift >= DEDUP_WINDOW { 0 } else { rec.seen << shift };
            rec.seen |= 1;
            rec.last = clock;
            if shift == 1 {
                return DedupVerdict::Deliver;
            }
            let missed = shift - 1;
            rec.drops += missed;
            return DedupVerdict::DeliverAfterGap { missed };
        }

        let back = rec.last - clock;
        if back >= DEDUP_WINDOW {
            return DedupVerdict::Discard;
        }
        let bit = 1u64 << back;
        if rec.seen & bit != 0 {
            return DedupVerdict::Duplicate;
        }
        rec.seen |= bit;
        if self.drop_out_of_order {
            DedupVerdict::Discard
        } else {
            rec.drops = rec.drops.saturating_sub(1);
            DedupVerdict::DeliverOutOfOrder
        }
    }

    /// Forget a publisher (disconnect or expiry).
    pub fn remove(&mut self, publisher_id: u64) {
        self.records.remove(&publisher_id);
    }

    /// Clocks reported missing for one publisher.
    pub fn drops(&self, publisher_id: u64) -> u64 {
        self.records.get(&publisher_id).map_or(0, |r| r.drops)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
