//! Per-tier worker slots.
//!
//! The `SlotPool` enforces a fixed concurrency capacity for each tier. A slot
//! is held through a [`SlotHandle`]; dropping the handle gives the slot back
//! and wakes anyone waiting in [`SlotPool::acquire`]. The pool knows nothing
//! about tasks: callers that need to pick work atomically with taking a slot
//! pass a selection closure to [`SlotPool::try_acquire_with`].

use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::config::WorkerCapacity;
use crate::core::Tier;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct TierSlots {
    capacity: usize,
    in_use: usize,
}

#[derive(Debug)]
struct PoolInner {
    tiers: Mutex<[TierSlots; 3]>,
    released: Notify,
}

impl PoolInner {
    fn lock(&self) -> MutexGuard<'_, [TierSlots; 3]> {
        // Counters stay consistent even if a holder panicked.
        self.tiers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn release(&self, tier: Tier) {
        {
            let mut tiers = self.lock();
            let slots = &mut tiers[tier.index()];
            slots.in_use = slots.in_use.saturating_sub(1);
            debug!(tier = %tier, in_use = slots.in_use, capacity = slots.capacity, "slot released");
        }
        self.released.notify_waiters();
    }
}

/// Shared handle to the slot counters. Cloning shares the same pool.
#[derive(Debug, Clone)]
pub struct SlotPool {
    inner: Arc<PoolInner>,
}

/// One occupied slot. Released on drop.
#[derive(Debug)]
pub struct SlotHandle {
    pool: Arc<PoolInner>,
    tier: Tier,
}

impl SlotHandle {
    pub fn tier(&self) -> Tier {
        self.tier
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.pool.release(self.tier);
    }
}

impl SlotPool {
    pub fn new(capacity: &WorkerCapacity) -> Self {
        let mut tiers = [TierSlots::default(); 3];
        for tier in Tier::ALL {
            tiers[tier.index()].capacity = capacity.get(tier);
        }
        Self {
            inner: Arc::new(PoolInner {
                tiers: Mutex::new(tiers),
                released: Notify::new(),
            }),
        }
    }

    pub fn capacity(&self, tier: Tier) -> usize {
        self.inner.lock()[tier.index()].capacity
    }

    pub fn in_use(&self, tier: Tier) -> usize {
        self.inner.lock()[tier.index()].in_use
    }

    pub fn available(&self, tier: Tier) -> usize {
        let slots = self.inner.lock()[tier.index()];
        slots.capacity - slots.in_use
    }

    /// Take a slot if one is free.
    pub fn try_acquire(&self, tier: Tier) -> Option<SlotHandle> {
        self.try_acquire_with(tier, || Some(())).map(|(handle, ())| handle)
    }

    /// Take a slot and run `select` under the same lock.
    ///
    /// `select` only runs when a slot is free. If it returns `None` no slot
    /// is taken. This makes choosing a task and occupying its slot one step.
    pub fn try_acquire_with<T>(
        &self,
        tier: Tier,
        select: impl FnOnce() -> Option<T>,
    ) -> Option<(SlotHandle, T)> {
        let mut tiers = self.inner.lock();
        let slots = &mut tiers[tier.index()];
        if slots.in_use >= slots.capacity {
            return None;
        }
        let picked = select()?;
        slots.in_use += 1;
        debug!(tier = %tier, in_use = slots.in_use, capacity = slots.capacity, "slot acquired");
        Some((
            SlotHandle {
                pool: Arc::clone(&self.inner),
                tier,
            },
            picked,
        ))
    }

    /// Wait until a slot of `tier` is free and take it.
    ///
    /// Waits forever on a tier with zero capacity.
    pub async fn acquire(&self, tier: Tier) -> SlotHandle {
        loop {
            let notified = self.inner.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(handle) = self.try_acquire(tier) {
                return handle;
            }
            notified.await;
        }
    }
}
