use std::collections::VecDeque;

use crate::type_alias::*;

/// What a timer firing means for the owning slot or session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    /// Retransmission deadline of a request slot.
    Rto,
    /// Re-send a pending session-management connect request.
    ConnectRetry,
}

/// Entry in the timing wheel.
///
/// Entries are never cancelled. Each carries the arming generation of its
/// slot; a fired entry whose generation no longer matches is stale and gets
/// ignored, so re-arming implicitly cancels the previous timer.
#[derive(Debug, Clone, Copy)]
pub(crate) struct TimerEntry {
    pub sess_id: SessId,
    pub slot_idx: usize,
    pub gen: u32,
    pub kind: TimerKind,
    /// Expiration timestamp in microseconds.
    pub expires_at: u64,
}

/// A timing wheel: O(1) insertion, bucketed expiry.
///
/// Deadlines beyond the horizon go to the furthest bucket and re-insert on
/// drain until they genuinely expire.
pub(crate) struct TimingWheel {
    buckets: Vec<VecDeque<TimerEntry>>,
    /// Duration of one bucket in microseconds.
    bucket_us: u64,
    /// Bucket under the hand.
    cursor: usize,
    /// Timestamp the hand has advanced to.
    now_us: u64,
    /// Total coverage in microseconds.
    horizon_us: u64,
}

impl TimingWheel {
    pub fn new(num_buckets: usize, bucket_us: u64) -> Self {
        assert!(num_buckets > 1 && bucket_us > 0);
        Self {
            buckets: (0..num_buckets).map(|_| VecDeque::new()).collect(),
            bucket_us,
            cursor: 0,
            now_us: 0,
            horizon_us: num_buckets as u64 * bucket_us,
        }
    }

    /// 512 buckets of 100us: covers the RTO backoff ceiling with slack.
    pub fn for_rto_tracking() -> Self {
        Self::new(512, 100)
    }

    /// Insert a timer entry. Entries at or before the hand fire on the next
    /// advance.
    pub fn insert(&mut self, entry: TimerEntry) {
        let delta = entry.expires_at.saturating_sub(self.now_us);
        let ahead = if delta >= self.horizon_us {
            self.buckets.len() - 1
        } else {
            (delta / self.bucket_us) as usize
        };
        let bucket = (self.cursor + ahead) % self.buckets.len();
        self.buckets[bucket].push_back(entry);
    }

    /// Advance the hand towards `ts`, pushing expired entries into `out`.
    /// `out` is not cleared here. The hand moves in whole buckets; leftover
    /// time carries over to the next advance.
    pub fn advance_into(&mut self, ts: u64, out: &mut Vec<TimerEntry>) {
        if ts <= self.now_us {
            return;
        }

        let steps = (((ts - self.now_us) / self.bucket_us) as usize).min(self.buckets.len());
        for _ in 0..steps {
            // Drain the bucket under the hand; entries still in the future
            // ride another revolution.
            let n = self.buckets[self.cursor].len();
            for _ in 0..n {
                let entry = self.buckets[self.cursor].pop_front().unwrap();
                if entry.expires_at <= ts {
                    out.push(entry);
                } else {
                    self.buckets[self.cursor].push_back(entry);
                }
            }
            self.cursor = (self.cursor + 1) % self.buckets.len();
            self.now_us += self.bucket_us;
        }
    }

    /// Number of armed entries, stale ones included.
    #[cfg(test)]
    pub fn armed_count(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(slot_idx: usize, expires_at: u64) -> TimerEntry {
        TimerEntry {
            sess_id: 0,
            slot_idx,
            gen: 0,
            kind: TimerKind::Rto,
            expires_at,
        }
    }

    #[test]
    fn fires_in_window() {
        let mut wheel = TimingWheel::new(8, 100);
        wheel.insert(entry(1, 450));

        let mut out = Vec::new();
        wheel.advance_into(400, &mut out);
        assert!(out.is_empty());

        wheel.advance_into(500, &mut out);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].slot_idx, 1);
        assert_eq!(wheel.armed_count(), 0);
    }

    #[test]
    fn beyond_horizon_rides_again() {
        let mut wheel = TimingWheel::new(8, 100);
        wheel.insert(entry(2, 10_000));

        let mut out = Vec::new();
        wheel.advance_into(5_000, &mut out);
        assert!(out.is_empty());
        assert_eq!(wheel.armed_count(), 1);

        wheel.advance_into(10_050, &mut out);
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn multiple_deadlines() {
        let mut wheel = TimingWheel::new(16, 100);
        for i in 0..5 {
            wheel.insert(entry(i, 100 + i as u64 * 200));
        }

        let mut out = Vec::new();
        wheel.advance_into(600, &mut out);
        assert_eq!(out.len(), 3); // 100, 300, 500
        out.clear();
        wheel.advance_into(1_000, &mut out);
        assert_eq!(out.len(), 2); // 700, 900
    }
}
