#![allow(unsafe_code)]

//! Per-bucket stripe tables.
//!
//! Each bucket slot holds an immutable array of stripes behind an epoch
//! pointer. Structural changes (adding a stripe, dropping a drained
//! stripe, installing restored tails) replace the whole array with a
//! single compare-exchange; the replaced array is reclaimed once every
//! pinned reader has moved on. `Stripe` identity is stable across
//! replacements, so a reader holding a stripe keeps a meaningful tail
//! handle even after the array it came from is gone.
//!
//! `Stripe.tail` is written in place, and only while the write latch on
//! the page it previously named is held; that latch is what serializes
//! tail movement.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Atomic, Owned, Shared};
use rand::Rng;

use crate::error::{BrumeError, Result};
use crate::types::PageId;

pub struct Stripe {
    tail: AtomicU64,
}

impl Stripe {
    pub(crate) fn new(tail: PageId) -> Self {
        Self {
            tail: AtomicU64::new(tail.raw()),
        }
    }

    pub fn tail_id(&self) -> PageId {
        PageId::from_raw(self.tail.load(Ordering::Acquire))
    }

    fn set_tail_id(&self, id: PageId) {
        self.tail.store(id.raw(), Ordering::Release);
    }
}

struct Tails {
    stripes: Vec<Arc<Stripe>>,
}

pub(crate) struct StripeTable {
    slots: Box<[Atomic<Tails>]>,
}

impl StripeTable {
    pub fn new(buckets: usize) -> Self {
        Self {
            slots: (0..buckets).map(|_| Atomic::null()).collect(),
        }
    }

    pub fn len(&self, bucket: usize) -> usize {
        let guard = epoch::pin();
        let shared = self.slots[bucket].load(Ordering::Acquire, &guard);
        unsafe { shared.as_ref() }.map_or(0, |tails| tails.stripes.len())
    }

    /// One stripe picked uniformly at random, or `None` for an empty
    /// bucket.
    pub fn random_stripe(&self, bucket: usize) -> Option<Arc<Stripe>> {
        let guard = epoch::pin();
        let shared = self.slots[bucket].load(Ordering::Acquire, &guard);
        let tails = unsafe { shared.as_ref() }?;
        let len = tails.stripes.len();
        let idx = if len == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..len)
        };
        Some(Arc::clone(&tails.stripes[idx]))
    }

    /// Snapshot of the bucket's stripes, in array order.
    pub fn stripes(&self, bucket: usize) -> Vec<Arc<Stripe>> {
        let guard = epoch::pin();
        let shared = self.slots[bucket].load(Ordering::Acquire, &guard);
        unsafe { shared.as_ref() }.map_or_else(Vec::new, |tails| tails.stripes.clone())
    }

    /// Appends a stripe, retrying the compare-exchange until it lands.
    pub fn append(&self, bucket: usize, stripe: Arc<Stripe>) {
        let guard = epoch::pin();
        loop {
            let current = self.slots[bucket].load(Ordering::Acquire, &guard);
            let mut stripes = unsafe { current.as_ref() }
                .map_or_else(Vec::new, |tails| tails.stripes.clone());
            stripes.push(Arc::clone(&stripe));
            let next = Owned::new(Tails { stripes });
            match self.slots[bucket].compare_exchange(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            ) {
                Ok(_) => {
                    if !current.is_null() {
                        unsafe { guard.defer_destroy(current) };
                    }
                    return;
                }
                Err(_) => continue,
            }
        }
    }

    /// Installs restored tails into a bucket that must still be empty.
    pub fn install(&self, bucket: usize, tails: &[PageId]) -> Result<()> {
        if tails.is_empty() {
            return Ok(());
        }
        let guard = epoch::pin();
        let stripes = tails.iter().map(|&id| Arc::new(Stripe::new(id))).collect();
        self.slots[bucket]
            .compare_exchange(
                Shared::null(),
                Owned::new(Tails { stripes }),
                Ordering::AcqRel,
                Ordering::Acquire,
                &guard,
            )
            .map_err(|_| BrumeError::Corruption("bucket stripes already installed"))?;
        Ok(())
    }

    /// Moves the stripe whose tail is `old_tail` to `new_tail`, or
    /// removes the stripe entirely when `new_tail` is null. The caller
    /// must hold the write latch on the page `old_tail` names.
    pub fn update_tail(&self, bucket: usize, old_tail: PageId, new_tail: PageId) -> Result<()> {
        let guard = epoch::pin();
        let mut hint = None;
        loop {
            let current = self.slots[bucket].load(Ordering::Acquire, &guard);
            let tails = unsafe { current.as_ref() }
                .ok_or(BrumeError::Corruption("missing stripes for bucket"))?;
            let idx = find_tail_index(&tails.stripes, old_tail, hint)?;
            hint = Some(idx);

            if !new_tail.is_null() {
                tails.stripes[idx].set_tail_id(new_tail);
                return Ok(());
            }

            let swapped = if tails.stripes.len() == 1 {
                self.slots[bucket]
                    .compare_exchange(
                        current,
                        Shared::null(),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    )
                    .is_ok()
            } else {
                let mut stripes = tails.stripes.clone();
                stripes.remove(idx);
                self.slots[bucket]
                    .compare_exchange(
                        current,
                        Owned::new(Tails { stripes }),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                        &guard,
                    )
                    .is_ok()
            };
            if swapped {
                unsafe { guard.defer_destroy(current) };
                return Ok(());
            }
        }
    }
}

impl Drop for StripeTable {
    fn drop(&mut self) {
        let guard = unsafe { epoch::unprotected() };
        for slot in self.slots.iter() {
            let shared = slot.load(Ordering::Relaxed, guard);
            if !shared.is_null() {
                drop(unsafe { shared.into_owned() });
            }
        }
    }
}

fn find_tail_index(stripes: &[Arc<Stripe>], tail: PageId, hint: Option<usize>) -> Result<usize> {
    if let Some(idx) = hint {
        if idx < stripes.len() && stripes[idx].tail_id() == tail {
            return Ok(idx);
        }
    }
    stripes
        .iter()
        .position(|stripe| stripe.tail_id() == tail)
        .ok_or(BrumeError::Corruption("stripe tail not found"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageFlag;
    use std::thread;

    fn id(index: u64) -> PageId {
        PageId::new(PageFlag::Index, index)
    }

    #[test]
    fn append_and_remove_round_trip() {
        let table = StripeTable::new(2);
        assert_eq!(table.len(0), 0);
        table.append(0, Arc::new(Stripe::new(id(1))));
        table.append(0, Arc::new(Stripe::new(id(2))));
        assert_eq!(table.len(0), 2);
        assert_eq!(table.len(1), 0);

        table.update_tail(0, id(1), id(3)).unwrap();
        let tails: Vec<_> = table.stripes(0).iter().map(|s| s.tail_id()).collect();
        assert_eq!(tails, vec![id(3), id(2)]);

        table.update_tail(0, id(2), PageId::NULL).unwrap();
        assert_eq!(table.len(0), 1);
        table.update_tail(0, id(3), PageId::NULL).unwrap();
        assert_eq!(table.len(0), 0);
        assert!(table.random_stripe(0).is_none());
    }

    #[test]
    fn update_missing_tail_is_corruption() {
        let table = StripeTable::new(1);
        table.append(0, Arc::new(Stripe::new(id(1))));
        assert!(table.update_tail(0, id(9), id(2)).is_err());
    }

    #[test]
    fn install_requires_empty_bucket() {
        let table = StripeTable::new(1);
        table.install(0, &[id(1), id(2)]).unwrap();
        assert_eq!(table.len(0), 2);
        assert!(table.install(0, &[id(3)]).is_err());
    }

    #[test]
    fn concurrent_appends_all_land() {
        let table = Arc::new(StripeTable::new(1));
        let mut handles = Vec::new();
        for i in 0..8 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                table.append(0, Arc::new(Stripe::new(id(100 + i))));
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.len(0), 8);
    }
}
