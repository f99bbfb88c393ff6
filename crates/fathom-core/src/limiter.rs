//! Cross-connection token-bucket bandwidth allocator.
//!
//! Two independent buckets (download / upload). On each fixed tick every
//! registered item receives `limit × tick / item-count` tokens, capped at a
//! multi-tick burst ceiling; tokens refused by capped items are
//! redistributed to not-yet-saturated items on the same tick (iterative
//! water-filling). Registering mid-tick grants the new fair share minus any
//! shortfall already handed out this tick — the shortfall is carried as a
//! one-tick debt so a burst of (de)registrations can neither starve nor
//! over-grant the remaining items. A limit of zero disables throttling for
//! that channel entirely.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Allocation tick. All grants are quantised to this interval.
pub const TICK: Duration = Duration::from_millis(250);

/// An idle item may accumulate at most this many ticks worth of its share.
const BURST_TICKS: i64 = 4;

/// Throttled traffic class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Channel {
    Download,
    Upload,
}

/// Handle of one registered consumer on a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ItemId(u64);

#[derive(Debug, Default)]
struct Bucket {
    /// Bytes per second; 0 = unlimited.
    limit: u64,
    /// Available tokens per item. Negative values are carried debt.
    items: HashMap<u64, i64>,
    /// Tokens handed out since the last tick (distribution, not consumption).
    distributed: i64,
}

impl Bucket {
    fn per_tick(&self) -> i64 {
        (self.limit as i64).saturating_mul(TICK.as_millis() as i64) / 1000
    }

    fn fair_share(&self) -> i64 {
        if self.items.is_empty() {
            0
        } else {
            self.per_tick() / self.items.len() as i64
        }
    }

    fn register(&mut self, id: u64) {
        if self.limit == 0 {
            self.items.insert(id, 0);
            return;
        }
        // Immediate re-partition: the newcomer gets the newly computed
        // per-object share. Whatever this tick's budget can no longer
        // cover is charged back to the existing items as a one-tick debt,
        // keeping the total outstanding within the tick budget.
        let count = self.items.len() as i64 + 1;
        let share = self.per_tick() / count;
        let remaining = (self.per_tick() - self.distributed).max(0);
        let grant = share.min(remaining);
        let shortfall = share - grant;
        if shortfall > 0 && !self.items.is_empty() {
            let existing = self.items.len() as i64;
            let per_item = (shortfall + existing - 1) / existing;
            for tokens in self.items.values_mut() {
                *tokens -= per_item;
            }
        }
        self.items.insert(id, share);
        self.distributed += grant;
    }

    fn deregister(&mut self, id: u64) {
        if let Some(tokens) = self.items.remove(&id) {
            if tokens < 0 && !self.items.is_empty() {
                // Spread the departing item's debt so remaining items'
                // next shares absorb it.
                let per_item = tokens / self.items.len() as i64;
                for t in self.items.values_mut() {
                    *t += per_item;
                }
            }
        }
    }

    fn tick(&mut self) {
        self.distributed = 0;
        if self.limit == 0 || self.items.is_empty() {
            return;
        }
        let cap = self.fair_share() * BURST_TICKS;
        let mut pool = self.per_tick();

        // Iterative water-filling: equal share to every unsaturated item,
        // refused tokens go back to the pool for the next pass.
        while pool > 0 {
            let unsat: Vec<u64> = self
                .items
                .iter()
                .filter(|(_, t)| **t < cap)
                .map(|(id, _)| *id)
                .collect();
            if unsat.is_empty() {
                break;
            }
            let share = (pool / unsat.len() as i64).max(1);
            let mut granted_any = false;
            for id in unsat {
                if pool == 0 {
                    break;
                }
                if let Some(tokens) = self.items.get_mut(&id) {
                    let grant = share.min(cap - *tokens).min(pool);
                    if grant > 0 {
                        *tokens += grant;
                        pool -= grant;
                        self.distributed += grant;
                        granted_any = true;
                    }
                }
            }
            if !granted_any {
                break;
            }
        }
    }

    fn take(&mut self, id: u64, wanted: usize) -> usize {
        if self.limit == 0 {
            return wanted;
        }
        match self.items.get_mut(&id) {
            Some(tokens) => {
                let granted = (*tokens).clamp(0, wanted as i64);
                *tokens -= granted;
                granted as usize
            }
            None => 0,
        }
    }
}

/// The engine-wide bandwidth allocator. One instance per engine, handed to
/// each connection thread; all mutation goes through these methods.
#[derive(Debug, Default)]
pub struct SpeedLimiter {
    next_id: u64,
    download: Bucket,
    upload: Bucket,
}

impl SpeedLimiter {
    pub fn new(download_limit: u64, upload_limit: u64) -> Self {
        let mut limiter = Self::default();
        limiter.download.limit = download_limit;
        limiter.upload.limit = upload_limit;
        limiter
    }

    fn bucket(&mut self, channel: Channel) -> &mut Bucket {
        match channel {
            Channel::Download => &mut self.download,
            Channel::Upload => &mut self.upload,
        }
    }

    fn bucket_ref(&self, channel: Channel) -> &Bucket {
        match channel {
            Channel::Download => &self.download,
            Channel::Upload => &self.upload,
        }
    }

    pub fn set_limit(&mut self, channel: Channel, bytes_per_sec: u64) {
        self.bucket(channel).limit = bytes_per_sec;
    }

    pub fn limit(&self, channel: Channel) -> u64 {
        self.bucket_ref(channel).limit
    }

    /// Whether items on this channel run without throttling.
    pub fn is_unlimited(&self, channel: Channel) -> bool {
        self.bucket_ref(channel).limit == 0
    }

    /// Register a consumer; re-partitions the current tick immediately.
    pub fn register(&mut self, channel: Channel) -> ItemId {
        self.next_id += 1;
        let id = self.next_id;
        self.bucket(channel).register(id);
        ItemId(id)
    }

    /// Remove a consumer; its debt (if any) is absorbed by the remainder.
    pub fn deregister(&mut self, channel: Channel, id: ItemId) {
        self.bucket(channel).deregister(id.0);
    }

    /// Advance both channels by one tick, refilling per-item buckets.
    pub fn tick(&mut self) {
        self.download.tick();
        self.upload.tick();
    }

    /// Consume up to `wanted` tokens; returns the granted amount (equal to
    /// `wanted` on an unlimited channel, possibly 0 on a drained bucket).
    pub fn take(&mut self, channel: Channel, id: ItemId, wanted: usize) -> usize {
        self.bucket(channel).take(id.0, wanted)
    }

    /// Tokens currently available to an item (may be negative: debt).
    pub fn available(&self, channel: Channel, id: ItemId) -> i64 {
        self.bucket_ref(channel)
            .items
            .get(&id.0)
            .copied()
            .unwrap_or(0)
    }

    pub fn item_count(&self, channel: Channel) -> usize {
        self.bucket_ref(channel).items.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const L: u64 = 40_000; // bytes/sec
    const PER_TICK: i64 = (L as i64) / 4; // 250 ms tick

    #[test]
    fn no_over_grant_after_one_tick() {
        let mut lim = SpeedLimiter::new(L, 0);
        let ids: Vec<ItemId> = (0..7).map(|_| lim.register(Channel::Download)).collect();
        // Drain whatever registration handed out, then measure one tick.
        for id in &ids {
            lim.take(Channel::Download, *id, usize::MAX / 2);
        }
        lim.tick();
        let total: i64 = ids
            .iter()
            .map(|id| lim.available(Channel::Download, *id))
            .sum();
        assert!(total <= PER_TICK, "granted {} > per-tick {}", total, PER_TICK);
    }

    #[test]
    fn every_item_gets_a_share() {
        let mut lim = SpeedLimiter::new(L, 0);
        let ids: Vec<ItemId> = (0..8).map(|_| lim.register(Channel::Download)).collect();
        for id in &ids {
            lim.take(Channel::Download, *id, usize::MAX / 2);
        }
        lim.tick();
        for id in &ids {
            assert!(lim.available(Channel::Download, *id) > 0);
        }
    }

    #[test]
    fn burst_cap_redistributes() {
        let mut lim = SpeedLimiter::new(L, 0);
        let idle = lim.register(Channel::Download);
        let busy = lim.register(Channel::Download);
        // Let the idle item saturate at its burst ceiling.
        for _ in 0..BURST_TICKS + 2 {
            lim.tick();
            lim.take(Channel::Download, busy, usize::MAX / 2);
        }
        let cap = (PER_TICK / 2) * BURST_TICKS;
        assert_eq!(lim.available(Channel::Download, idle), cap);
        // The busy item received the idle item's refused tokens on the
        // saturated ticks.
        lim.tick();
        assert_eq!(lim.available(Channel::Download, busy), PER_TICK);
    }

    #[test]
    fn registration_does_not_mint_tokens_mid_tick() {
        let mut lim = SpeedLimiter::new(L, 0);
        let a = lim.register(Channel::Download);
        // a received the whole tick budget at registration; b's share must
        // be charged back to a rather than minted on top.
        let b = lim.register(Channel::Download);
        let total =
            lim.available(Channel::Download, a) + lim.available(Channel::Download, b);
        assert!(total <= PER_TICK, "minted {} > budget {}", total, PER_TICK);
        assert!(lim.available(Channel::Download, b) > 0);
    }

    #[test]
    fn uneven_shortfall_charge_back_stays_within_budget() {
        let mut lim = SpeedLimiter::new(L, 0);
        // Third registration: the shortfall does not divide evenly across
        // the two existing items; rounding must not mint tokens.
        let ids: Vec<ItemId> = (0..3).map(|_| lim.register(Channel::Download)).collect();
        let total: i64 = ids
            .iter()
            .map(|id| lim.available(Channel::Download, *id))
            .sum();
        assert!(total <= PER_TICK, "minted {} > budget {}", total, PER_TICK);
    }

    #[test]
    fn unlimited_channel_grants_everything() {
        let mut lim = SpeedLimiter::new(0, 0);
        let id = lim.register(Channel::Upload);
        assert!(lim.is_unlimited(Channel::Upload));
        assert_eq!(lim.take(Channel::Upload, id, 123_456), 123_456);
    }

    #[test]
    fn take_is_bounded_by_available() {
        let mut lim = SpeedLimiter::new(L, 0);
        let id = lim.register(Channel::Download);
        for _ in 0..2 {
            lim.take(Channel::Download, id, usize::MAX / 2);
            lim.tick();
        }
        let avail = lim.available(Channel::Download, id) as usize;
        assert_eq!(lim.take(Channel::Download, id, usize::MAX / 2), avail);
        assert_eq!(lim.take(Channel::Download, id, 100), 0);
    }

    #[test]
    fn deregister_spreads_debt() {
        let mut lim = SpeedLimiter::new(L, 0);
        let a = lim.register(Channel::Download);
        // a consumes its whole registration grant, then b registers: b's
        // share is charged to a, driving a into debt.
        lim.take(Channel::Download, a, usize::MAX / 2);
        let b = lim.register(Channel::Download);
        assert_eq!(lim.available(Channel::Download, a), -(PER_TICK / 2));
        assert_eq!(lim.available(Channel::Download, b), PER_TICK / 2);
        // a leaves; its debt lands on b.
        lim.deregister(Channel::Download, a);
        assert_eq!(lim.available(Channel::Download, b), 0);
        // The next tick makes b whole again.
        lim.tick();
        assert!(lim.available(Channel::Download, b) > 0);
    }
}
