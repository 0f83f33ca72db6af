//! In-memory page store with per-page read/write latching.
//!
//! Frames are keyed by page index, so a rotated id resolves to the same
//! frame as the generation it replaced; detecting that the generation
//! moved on is the caller's job, via the id embedded in the page header.
//! Pages are never deallocated here: retired pages are recycled through
//! id rotation and stay addressable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::{
    lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard},
    RawRwLock, RwLock,
};

use crate::error::{BrumeError, Result};
use crate::types::{PageFlag, PageId, ReuseBag};

pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Smallest layout that still fits one node payload slot and one meta
/// entry.
pub const MIN_PAGE_SIZE: usize = 56;

const POLICY_DEFAULT: u8 = 0;
const POLICY_FULL: u8 = 1;
const POLICY_DELTA: u8 = 2;

struct Frame {
    buf: Arc<RwLock<Box<[u8]>>>,
    dirty: AtomicBool,
    full_record_policy: AtomicU8,
}

impl Frame {
    fn new(page_size: usize) -> Self {
        Self {
            buf: Arc::new(RwLock::new(vec![0u8; page_size].into_boxed_slice())),
            dirty: AtomicBool::new(false),
            full_record_policy: AtomicU8::new(POLICY_DEFAULT),
        }
    }
}

/// A pinned handle to one page frame. Cheap to clone from the store;
/// dropping it unpins.
pub struct Page {
    id: PageId,
    frame: Arc<Frame>,
}

impl Page {
    /// The id this handle was opened with. May differ from the id
    /// embedded in the page once a concurrent recycle rotates the page.
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn get_for_read(&self) -> PageReadGuard {
        PageReadGuard {
            guard: self.frame.buf.read_arc(),
            id: self.id,
        }
    }

    pub fn get_for_write(&self) -> PageWriteGuard {
        PageWriteGuard {
            guard: self.frame.buf.write_arc(),
            frame: Arc::clone(&self.frame),
            id: self.id,
            dirty: false,
        }
    }

    pub fn try_get_for_write(&self) -> Option<PageWriteGuard> {
        let guard = self.frame.buf.try_write_arc()?;
        Some(PageWriteGuard {
            guard,
            frame: Arc::clone(&self.frame),
            id: self.id,
            dirty: false,
        })
    }

    pub fn is_dirty(&self) -> bool {
        self.frame.dirty.load(Ordering::Acquire)
    }
}

pub struct PageReadGuard {
    guard: ArcRwLockReadGuard<RawRwLock, Box<[u8]>>,
    id: PageId,
}

impl PageReadGuard {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.guard
    }
}

/// An exclusive page latch. Released on drop; the frame is marked dirty
/// only when [`PageWriteGuard::mark_dirty`] was called, so a mutation
/// abandoned before completion leaves the frame clean.
pub struct PageWriteGuard {
    guard: ArcRwLockWriteGuard<RawRwLock, Box<[u8]>>,
    frame: Arc<Frame>,
    id: PageId,
    dirty: bool,
}

impl PageWriteGuard {
    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn data(&self) -> &[u8] {
        &self.guard
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.guard
    }

    pub fn mark_dirty(&mut self) {
        self.dirty = true;
    }

    /// Overrides how the WAL layer records this page for the duration of
    /// the latch: `Some(true)` forces a full-page image (no deltas),
    /// `Some(false)` forces deltas, `None` restores the default. The
    /// override is cleared when the latch is released.
    pub fn set_full_record_policy(&mut self, policy: Option<bool>) {
        let value = match policy {
            None => POLICY_DEFAULT,
            Some(true) => POLICY_FULL,
            Some(false) => POLICY_DELTA,
        };
        self.frame.full_record_policy.store(value, Ordering::Release);
    }

    pub fn full_record_policy(&self) -> Option<bool> {
        match self.frame.full_record_policy.load(Ordering::Acquire) {
            POLICY_FULL => Some(true),
            POLICY_DELTA => Some(false),
            _ => None,
        }
    }
}

impl Drop for PageWriteGuard {
    fn drop(&mut self) {
        if self.dirty {
            self.frame.dirty.store(true, Ordering::Release);
        }
        self.frame
            .full_record_policy
            .store(POLICY_DEFAULT, Ordering::Release);
    }
}

/// The shared page store. Clones are handles to the same frames.
#[derive(Clone)]
pub struct PageMemory {
    inner: Arc<MemInner>,
}

struct MemInner {
    page_size: usize,
    frames: RwLock<HashMap<u64, Arc<Frame>>>,
    next_index: AtomicU64,
    fresh_allocations: AtomicU64,
}

impl PageMemory {
    pub fn new(page_size: usize) -> Result<Self> {
        if page_size < MIN_PAGE_SIZE {
            return Err(BrumeError::Invalid("page size below minimum"));
        }
        Ok(Self {
            inner: Arc::new(MemInner {
                page_size,
                frames: RwLock::new(HashMap::new()),
                next_index: AtomicU64::new(1),
                fresh_allocations: AtomicU64::new(0),
            }),
        })
    }

    pub fn page_size(&self) -> usize {
        self.inner.page_size
    }

    /// Allocates a page, preferring the bag: an id polled from the bag
    /// is returned verbatim, its frame already allocated.
    pub fn allocate_page(&self, bag: Option<&mut ReuseBag>, flag: PageFlag) -> Result<PageId> {
        if let Some(bag) = bag {
            if let Some(id) = bag.poll_free_page() {
                return Ok(id);
            }
        }
        self.allocate_page_no_reuse(flag)
    }

    /// Allocates a fresh zero-filled frame, bypassing any reuse path.
    pub fn allocate_page_no_reuse(&self, flag: PageFlag) -> Result<PageId> {
        let index = self.inner.next_index.fetch_add(1, Ordering::Relaxed);
        let frame = Arc::new(Frame::new(self.inner.page_size));
        self.inner.frames.write().insert(index, frame);
        self.inner.fresh_allocations.fetch_add(1, Ordering::Relaxed);
        Ok(PageId::new(flag, index))
    }

    pub fn page(&self, id: PageId) -> Result<Page> {
        let frame = self
            .inner
            .frames
            .read()
            .get(&id.index())
            .cloned()
            .ok_or(BrumeError::Corruption("unknown page id"))?;
        Ok(Page { id, frame })
    }

    /// Number of frames created since the store was opened. Bag-served
    /// allocations do not count.
    pub fn fresh_allocations(&self) -> u64 {
        self.inner.fresh_allocations.load(Ordering::Relaxed)
    }

    /// Visits every frame under a read latch, in ascending index order.
    /// This is the checkpoint-style full sweep: images observed here are
    /// latch-consistent per page, not across pages.
    pub fn for_each_page<F>(&self, mut f: F)
    where
        F: FnMut(u64, &[u8]),
    {
        let mut frames: Vec<(u64, Arc<Frame>)> = self
            .inner
            .frames
            .read()
            .iter()
            .map(|(&index, frame)| (index, Arc::clone(frame)))
            .collect();
        frames.sort_by_key(|(index, _)| *index);
        for (index, frame) in frames {
            let guard = frame.buf.read();
            f(index, &guard);
        }
    }
}
