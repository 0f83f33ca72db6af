//! Striped, doubly-linked lists of page ids, organized in buckets.
//!
//! Each bucket holds a set of parallel stripes; each stripe is a
//! doubly-linked chain of node pages whose payload is an array of page
//! ids. Insertions go to a stripe's tail under its write latch, picked
//! at random to spread contention; when the non-blocking latch keeps
//! failing the bucket grows another stripe instead of queueing. Removal
//! locates the owning node through the data page's back-pointer and
//! merges drained nodes out of the chain.
//!
//! Latch order for node pages is next, then current, then previous.
//! Every multi-page operation takes latches in that order; the fair
//! merge holds all three at once.

mod stripes;

pub use stripes::Stripe;

use std::collections::BTreeMap;
use std::sync::Arc;

use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::{BrumeError, Result};
use crate::page::{self, data, meta, node, IoVersions, T_LIST_META, T_LIST_NODE};
use crate::pagemem::{Page, PageMemory, PageWriteGuard};
use crate::types::{PageFlag, PageId, ReuseBag};
use crate::wal::{DeltaRecord, WalSink};

use self::stripes::StripeTable;

/// Tuning knobs for latch back-off and stripe growth.
#[derive(Clone, Debug)]
pub struct ListOptions {
    /// Non-blocking latch attempts before the list grows a stripe or
    /// falls back to a blocking latch.
    pub try_lock_attempts: u32,
    /// Hard cap on stripes per bucket.
    pub max_stripes_per_bucket: usize,
}

impl Default for ListOptions {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            try_lock_attempts: 10,
            max_stripes_per_bucket: 8.min(cpus * 2),
        }
    }
}

#[derive(Clone, Debug)]
pub struct ListConfig {
    pub cache_id: u32,
    /// Name used in logging only.
    pub name: String,
    pub buckets: usize,
    /// Head of the meta-page chain; null disables metadata persistence.
    pub meta_page_id: PageId,
    pub options: ListOptions,
}

impl ListConfig {
    pub fn new(cache_id: u32, name: impl Into<String>, buckets: usize, meta_page_id: PageId) -> Self {
        Self {
            cache_id,
            name: name.into(),
            buckets,
            meta_page_id,
            options: ListOptions::default(),
        }
    }
}

/// Capability injected by the owning engine: is `bucket` the reuse
/// bucket collecting fully-empty recyclable pages?
pub type ReuseBucketFn = Box<dyn Fn(usize) -> bool + Send + Sync>;

pub struct PageList {
    cache_id: u32,
    name: String,
    mem: PageMemory,
    wal: Option<Arc<dyn WalSink>>,
    meta_page_id: PageId,
    buckets: usize,
    table: StripeTable,
    opts: ListOptions,
    is_reuse_bucket: ReuseBucketFn,
    reuse_bucket_idx: Option<usize>,
    /// External recycle destination. When absent, merged-out node pages
    /// go to this list's own reuse bucket.
    reuse_list: Option<Arc<PageList>>,
}

impl PageList {
    pub fn new(
        mem: PageMemory,
        wal: Option<Arc<dyn WalSink>>,
        config: ListConfig,
        is_reuse_bucket: ReuseBucketFn,
        reuse_list: Option<Arc<PageList>>,
    ) -> Result<Self> {
        if config.buckets == 0 {
            return Err(BrumeError::Invalid("page list needs at least one bucket"));
        }
        if config.buckets - 1 > usize::from(u16::MAX) {
            return Err(BrumeError::Invalid("bucket index does not fit meta entries"));
        }
        let reuse_bucket_idx = (0..config.buckets).find(|&b| is_reuse_bucket(b));
        Ok(Self {
            cache_id: config.cache_id,
            name: config.name,
            mem,
            wal,
            meta_page_id: config.meta_page_id,
            buckets: config.buckets,
            table: StripeTable::new(config.buckets),
            opts: config.options,
            is_reuse_bucket,
            reuse_bucket_idx,
            reuse_list,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets
    }

    /// Tails currently published for a bucket, in stripe order.
    pub fn bucket_tails(&self, bucket: usize) -> Vec<PageId> {
        self.table
            .stripes(bucket)
            .iter()
            .map(|stripe| stripe.tail_id())
            .collect()
    }

    /// Initializes a new list (`init_new`) or restores the stripe tables
    /// from the persisted meta-page chain.
    pub fn init(&self, init_new: bool) -> Result<()> {
        if self.meta_page_id.is_null() {
            return Ok(());
        }
        if init_new {
            let page = self.mem.page(self.meta_page_id)?;
            let mut guard = page.get_for_write();
            meta::init_new_page(guard.data_mut(), self.meta_page_id);
            guard.mark_dirty();
            if self.delta_needed(&guard) {
                self.wal_log(DeltaRecord::InitNewPage {
                    cache_id: self.cache_id,
                    page_id: self.meta_page_id,
                    io_type: T_LIST_META,
                    io_version: meta::VERSION,
                    new_page_id: self.meta_page_id,
                })?;
            }
            return Ok(());
        }

        let mut buckets_data: BTreeMap<u16, Vec<PageId>> = BTreeMap::new();
        let mut next_page_id = self.meta_page_id;
        while !next_page_id.is_null() {
            let page = self.mem.page(next_page_id)?;
            let guard = page.get_for_read();
            page::check_io(guard.data(), T_LIST_META, meta::VERSION)?;
            meta::buckets_data(guard.data(), &mut buckets_data);
            let next = meta::next_meta_page_id(guard.data());
            if next == next_page_id {
                return Err(BrumeError::Corruption("meta page chain loop"));
            }
            next_page_id = next;
        }
        for (bucket, tails) in buckets_data {
            let bucket = usize::from(bucket);
            if bucket >= self.buckets {
                return Err(BrumeError::Corruption("restored bucket out of range"));
            }
            self.table.install(bucket, &tails)?;
            debug!(list = %self.name, bucket, stripes = tails.len(), "freelist.restore_bucket");
        }
        Ok(())
    }

    /// Persists every bucket's stripe tails into the meta-page chain,
    /// reusing the existing chain first and zeroing its unused tail.
    pub fn save_metadata(&self) -> Result<()> {
        if self.meta_page_id.is_null() {
            return Err(BrumeError::Invalid("page list has no meta page"));
        }
        let mut next_page_id = self.meta_page_id;
        let mut cur: Option<PageWriteGuard> = None;

        for bucket in 0..self.buckets {
            let tails: Vec<PageId> = self.bucket_tails(bucket);
            let mut tail_idx = 0;
            while tail_idx < tails.len() {
                let written = match cur.as_mut() {
                    Some(guard) => {
                        meta::add_tails(guard.data_mut(), bucket as u16, &tails, tail_idx)
                    }
                    None => 0,
                };
                if written == 0 {
                    if next_page_id.is_null() {
                        let new_id = self.mem.allocate_page_no_reuse(PageFlag::Index)?;
                        if let Some(mut guard) = cur.take() {
                            meta::set_next_meta_page_id(guard.data_mut(), new_id);
                            release_meta_page(&mut guard);
                        }
                        let page = self.mem.page(new_id)?;
                        let mut guard = page.get_for_write();
                        meta::init_new_page(guard.data_mut(), new_id);
                        next_page_id = meta::next_meta_page_id(guard.data());
                        cur = Some(guard);
                    } else {
                        if let Some(mut guard) = cur.take() {
                            release_meta_page(&mut guard);
                        }
                        let page = self.mem.page(next_page_id)?;
                        let mut guard = page.get_for_write();
                        page::check_io(guard.data(), T_LIST_META, meta::VERSION)?;
                        meta::reset_count(guard.data_mut());
                        next_page_id = meta::next_meta_page_id(guard.data());
                        cur = Some(guard);
                    }
                } else {
                    tail_idx += written;
                }
            }
        }
        if let Some(mut guard) = cur.take() {
            release_meta_page(&mut guard);
        }

        // Zero out whatever the previous save left beyond this one.
        while !next_page_id.is_null() {
            let page = self.mem.page(next_page_id)?;
            let mut guard = page.get_for_write();
            page::check_io(guard.data(), T_LIST_META, meta::VERSION)?;
            meta::reset_count(guard.data_mut());
            guard.mark_dirty();
            next_page_id = meta::next_meta_page_id(guard.data());
        }
        debug!(list = %self.name, "freelist.metadata_saved");
        Ok(())
    }

    /// Registers a data page under `bucket`. The caller holds the data
    /// page's write latch and the page carries at least one record; the
    /// reuse bucket additionally accepts only empty pages, which may be
    /// consumed as list nodes.
    pub fn put_data_page(&self, data_guard: &mut PageWriteGuard, bucket: usize) -> Result<()> {
        self.put(PutArg::Data(data_guard), bucket)
    }

    /// Deposits a bag of recyclable page ids under `bucket`, draining
    /// the bag. Ids that do not fit the tail are themselves promoted
    /// into new node pages, so the drain never allocates.
    pub fn put_reuse_bag(&self, bag: &mut ReuseBag, bucket: usize) -> Result<()> {
        self.put(PutArg::Bag(bag), bucket)
    }

    fn put(&self, mut arg: PutArg<'_>, bucket: usize) -> Result<()> {
        if bucket >= self.buckets {
            return Err(BrumeError::Invalid("bucket out of range"));
        }
        let mut lock_attempt = 0;
        loop {
            let stripe = self.page_for_put(bucket)?;
            let tail_id = stripe.tail_id();
            let tail = self.mem.page(tail_id)?;
            let attempt = lock_attempt;
            lock_attempt += 1;
            let Some(mut tail_guard) = self.write_lock_page(&tail, bucket, attempt)? else {
                continue;
            };
            if self.run_put_handler(&mut tail_guard, tail_id, &mut arg, bucket)? {
                tail_guard.mark_dirty();
                return Ok(());
            }
            // Recycled or split under us: drop the latch and retry.
        }
    }

    fn run_put_handler(
        &self,
        tail_guard: &mut PageWriteGuard,
        tail_id: PageId,
        arg: &mut PutArg<'_>,
        bucket: usize,
    ) -> Result<bool> {
        if page::page_id(tail_guard.data()) != tail_id {
            return Ok(false);
        }
        page::check_io(tail_guard.data(), T_LIST_NODE, node::VERSION)?;
        match arg {
            PutArg::Data(data_guard) => {
                self.put_data_page_handler(tail_guard, tail_id, data_guard, bucket)
            }
            PutArg::Bag(bag) => self.put_reuse_bag_handler(tail_guard, tail_id, bag, bucket),
        }
    }

    fn put_data_page_handler(
        &self,
        tail_guard: &mut PageWriteGuard,
        tail_id: PageId,
        data_guard: &mut PageWriteGuard,
        bucket: usize,
    ) -> Result<bool> {
        if !node::next_id(tail_guard.data()).is_null() {
            return Ok(false); // Split moved the tail on.
        }
        let data_page_id = data_guard.id();
        match node::add_page(tail_guard.data_mut(), data_page_id) {
            Some(_) => {
                if self.delta_needed(tail_guard) {
                    self.wal_log(DeltaRecord::ListAddPage {
                        cache_id: self.cache_id,
                        node_page_id: tail_id,
                        added_id: data_page_id,
                    })?;
                }
                self.set_back_pointer(data_guard, data_page_id, tail_id)?;
            }
            None => self.handle_node_full(tail_guard, tail_id, data_guard, bucket)?,
        }
        Ok(true)
    }

    fn set_back_pointer(
        &self,
        data_guard: &mut PageWriteGuard,
        data_page_id: PageId,
        node_id: PageId,
    ) -> Result<()> {
        data::set_free_list_page_id(data_guard.data_mut(), node_id);
        data_guard.mark_dirty();
        if self.delta_needed(data_guard) {
            self.wal_log(DeltaRecord::DataSetFreeListPage {
                cache_id: self.cache_id,
                data_page_id,
                free_list_page_id: node_id,
            })?;
        }
        Ok(())
    }

    fn handle_node_full(
        &self,
        tail_guard: &mut PageWriteGuard,
        tail_id: PageId,
        data_guard: &mut PageWriteGuard,
        bucket: usize,
    ) -> Result<()> {
        let data_page_id = data_guard.id();
        if (self.is_reuse_bucket)(bucket) {
            // Allocating a node page here would re-enter this list and
            // deadlock. The reuse bucket only ever receives empty data
            // pages, so the page being deposited becomes the node.
            if !data::is_empty(data_guard.data()) {
                return Err(BrumeError::Invalid(
                    "non-empty data page put into reuse bucket",
                ));
            }
            let new_id = data_page_id.with_flag(PageFlag::Index);
            setup_next_page(tail_guard.data_mut(), tail_id, data_guard.data_mut(), new_id);
            data_guard.mark_dirty();
            if self.delta_needed(tail_guard) {
                self.wal_log(DeltaRecord::ListSetNext {
                    cache_id: self.cache_id,
                    page_id: tail_id,
                    next_id: new_id,
                })?;
            }
            if self.delta_needed(data_guard) {
                self.wal_log(DeltaRecord::ListInitNewPage {
                    cache_id: self.cache_id,
                    page_id: new_id,
                    previous_id: tail_id,
                    add_data_page_id: PageId::NULL,
                })?;
            }
            self.table.update_tail(bucket, tail_id, new_id)?;
        } else {
            let next_id = self.allocate_node_page(true)?;
            let next = self.mem.page(next_id)?;
            let mut next_guard = next.get_for_write();
            setup_next_page(tail_guard.data_mut(), tail_id, next_guard.data_mut(), next_id);
            if self.delta_needed(tail_guard) {
                self.wal_log(DeltaRecord::ListSetNext {
                    cache_id: self.cache_id,
                    page_id: tail_id,
                    next_id,
                })?;
            }
            if node::add_page(next_guard.data_mut(), data_page_id).is_none() {
                return Err(BrumeError::Corruption("fresh node page rejected a page id"));
            }
            // The page is known new; a full image would be wasted.
            next_guard.set_full_record_policy(Some(false));
            if self.delta_needed(&next_guard) {
                self.wal_log(DeltaRecord::ListInitNewPage {
                    cache_id: self.cache_id,
                    page_id: next_id,
                    previous_id: tail_id,
                    add_data_page_id: data_page_id,
                })?;
            }
            self.set_back_pointer(data_guard, data_page_id, next_id)?;
            self.table.update_tail(bucket, tail_id, next_id)?;
            next_guard.mark_dirty();
        }
        Ok(())
    }

    fn put_reuse_bag_handler(
        &self,
        tail_guard: &mut PageWriteGuard,
        tail_id: PageId,
        bag: &mut ReuseBag,
        bucket: usize,
    ) -> Result<bool> {
        if !node::next_id(tail_guard.data()).is_null() {
            return Ok(false);
        }
        let mut locked: SmallVec<[PageWriteGuard; 2]> = SmallVec::new();
        let mut last_id = tail_id;
        let drained = self.drain_bag(tail_guard, bag, &mut locked, &mut last_id);
        if !locked.is_empty() {
            // The drain grew the chain; publish the new tail even when
            // the drain failed, the nodes are already linked in.
            self.table.update_tail(bucket, tail_id, last_id)?;
        }
        drained.map(|_| true)
    }

    fn drain_bag(
        &self,
        tail_guard: &mut PageWriteGuard,
        bag: &mut ReuseBag,
        locked: &mut SmallVec<[PageWriteGuard; 2]>,
        last_id: &mut PageId,
    ) -> Result<()> {
        while let Some(id) = bag.poll_free_page() {
            let added = {
                let cur: &mut PageWriteGuard = match locked.last_mut() {
                    Some(guard) => guard,
                    None => &mut *tail_guard,
                };
                if node::add_page(cur.data_mut(), id).is_some() {
                    cur.mark_dirty();
                    if self.delta_needed(cur) {
                        self.wal_log(DeltaRecord::ListAddPage {
                            cache_id: self.cache_id,
                            node_page_id: cur.id(),
                            added_id: id,
                        })?;
                    }
                    true
                } else {
                    false
                }
            };
            if added {
                continue;
            }
            // The node is full: the polled id itself becomes the next
            // node and the drain continues into it.
            let next = self.mem.page(id)?;
            let mut next_guard = next.get_for_write();
            {
                let cur: &mut PageWriteGuard = match locked.last_mut() {
                    Some(guard) => guard,
                    None => &mut *tail_guard,
                };
                setup_next_page(cur.data_mut(), *last_id, next_guard.data_mut(), id);
                cur.mark_dirty();
                if self.delta_needed(cur) {
                    self.wal_log(DeltaRecord::ListSetNext {
                        cache_id: self.cache_id,
                        page_id: *last_id,
                        next_id: id,
                    })?;
                }
            }
            next_guard.set_full_record_policy(Some(false));
            next_guard.mark_dirty();
            if self.delta_needed(&next_guard) {
                self.wal_log(DeltaRecord::ListInitNewPage {
                    cache_id: self.cache_id,
                    page_id: id,
                    previous_id: *last_id,
                    add_data_page_id: PageId::NULL,
                })?;
            }
            *last_id = id;
            locked.push(next_guard);
        }
        Ok(())
    }

    /// Takes one page id out of the bucket, or `None` when the bucket
    /// has nothing to give. A drained tail node is itself handed out:
    /// re-initialized through `init_io` (retyped to a data page) when
    /// given, otherwise recycled with a rotated id.
    pub fn take_empty_page(
        &self,
        bucket: usize,
        init_io: Option<IoVersions>,
    ) -> Result<Option<PageId>> {
        if bucket >= self.buckets {
            return Err(BrumeError::Invalid("bucket out of range"));
        }
        let mut lock_attempt = 0;
        loop {
            let Some(stripe) = self.table.random_stripe(bucket) else {
                return Ok(None);
            };
            let tail_id = stripe.tail_id();
            let tail = self.mem.page(tail_id)?;
            let attempt = lock_attempt;
            lock_attempt += 1;
            let Some(mut guard) = self.write_lock_page(&tail, bucket, attempt)? else {
                continue;
            };
            if page::page_id(guard.data()) != tail_id {
                continue; // Recycled under us.
            }
            page::check_io(guard.data(), T_LIST_NODE, node::VERSION)?;
            if !node::next_id(guard.data()).is_null() {
                continue; // Split moved the tail on.
            }
            if let Some(id) = node::take_any_page(guard.data_mut()) {
                guard.mark_dirty();
                if self.delta_needed(&guard) {
                    self.wal_log(DeltaRecord::ListRemovePage {
                        cache_id: self.cache_id,
                        node_page_id: tail_id,
                        removed_id: id,
                    })?;
                }
                return Ok(Some(id));
            }

            let prev_id = node::previous_id(guard.data());
            if prev_id.is_null() {
                // Head of the stripe. Dropping the stripe would churn
                // the meta chain; empty tails are legal, callers retry.
                return Ok(None);
            }

            // Unlink the empty tail and hand the node page itself out.
            // We hold the tail, so prev cannot be recycled: latch order
            // next → previous holds.
            {
                let prev = self.mem.page(prev_id)?;
                let mut prev_guard = prev.get_for_write();
                if !self.cut_tail(&mut prev_guard, prev_id, bucket)? {
                    return Err(BrumeError::Corruption("tail cut raced with a recycle"));
                }
            }
            let new_id = match init_io {
                Some(io) => {
                    let new_id = tail_id.with_flag(PageFlag::Data);
                    io.init_new_page(guard.data_mut(), new_id)?;
                    if self.delta_needed(&guard) {
                        self.wal_log(DeltaRecord::InitNewPage {
                            cache_id: self.cache_id,
                            page_id: tail_id,
                            io_type: io.io_type(),
                            io_version: io.latest(),
                            new_page_id: new_id,
                        })?;
                    }
                    new_id
                }
                None => self.recycle_page(&mut guard, tail_id)?,
            };
            guard.mark_dirty();
            return Ok(Some(new_id));
        }
    }

    /// Unlists a data page. The caller holds the data page's write
    /// latch; the owning node is found through the back-pointer.
    /// Returns false when a concurrent recycle already unlisted it.
    pub fn remove_data_page(&self, data_guard: &mut PageWriteGuard, bucket: usize) -> Result<bool> {
        if bucket >= self.buckets {
            return Err(BrumeError::Invalid("bucket out of range"));
        }
        let data_page_id = data_guard.id();
        let node_id = data::free_list_page_id(data_guard.data());
        if node_id.is_null() {
            return Err(BrumeError::Invalid("data page is not on a free list"));
        }
        let node_page = self.mem.page(node_id)?;
        let (next_id, mut recycle_id) = {
            let mut guard = node_page.get_for_write();
            if page::page_id(guard.data()) != node_id {
                return Ok(false); // Recycled concurrently; entry already gone.
            }
            page::check_io(guard.data(), T_LIST_NODE, node::VERSION)?;
            if !node::remove_page(guard.data_mut(), data_page_id) {
                return Ok(false);
            }
            guard.mark_dirty();
            if self.delta_needed(&guard) {
                self.wal_log(DeltaRecord::ListRemovePage {
                    cache_id: self.cache_id,
                    node_page_id: node_id,
                    removed_id: data_page_id,
                })?;
            }
            data::set_free_list_page_id(data_guard.data_mut(), PageId::NULL);
            data_guard.mark_dirty();
            if self.delta_needed(data_guard) {
                self.wal_log(DeltaRecord::DataSetFreeListPage {
                    cache_id: self.cache_id,
                    data_page_id,
                    free_list_page_id: PageId::NULL,
                })?;
            }
            if !node::is_empty(guard.data()) {
                return Ok(true);
            }
            let next_id = node::next_id(guard.data());
            let prev_id = node::previous_id(guard.data());
            // With no successor the latch we hold is already the first
            // in the next → current → previous order, so the merge can
            // run without re-latching.
            let recycle_id = if next_id.is_null() {
                self.merge_no_next(&mut guard, node_id, prev_id, bucket)?
            } else {
                PageId::NULL
            };
            (next_id, recycle_id)
        };
        // A successor exists: release, then retake in next → current
        // order.
        if !next_id.is_null() {
            recycle_id = self.merge(&node_page, node_id, next_id, bucket)?;
        }
        if !recycle_id.is_null() {
            self.deposit_recycled(recycle_id)?;
        }
        Ok(true)
    }

    /// Deposits recyclable pages into this list's reuse bucket.
    pub fn add_for_recycle(&self, bag: &mut ReuseBag) -> Result<()> {
        match self.reuse_bucket_idx {
            Some(bucket) => self.put_reuse_bag(bag, bucket),
            None => Err(BrumeError::Invalid("page list has no reuse bucket")),
        }
    }

    /// Drains one recycled page id from this list's reuse bucket.
    pub fn take_recycled(&self) -> Result<Option<PageId>> {
        match self.reuse_bucket_idx {
            Some(bucket) => self.take_empty_page(bucket, None),
            None => Ok(None),
        }
    }

    /// Total payload entries across the bucket, walking every stripe's
    /// chain from its tail. Unsynchronized: only meaningful while no
    /// writer is active.
    pub fn stored_pages_count(&self, bucket: usize) -> Result<u64> {
        let mut total = 0u64;
        for stripe in self.table.stripes(bucket) {
            let mut page_id = stripe.tail_id();
            while !page_id.is_null() {
                let page = self.mem.page(page_id)?;
                let guard = page.get_for_read();
                page::check_io(guard.data(), T_LIST_NODE, node::VERSION)?;
                total += node::count(guard.data()) as u64;
                page_id = node::previous_id(guard.data());
            }
        }
        Ok(total)
    }

    fn page_for_put(&self, bucket: usize) -> Result<Arc<Stripe>> {
        match self.table.random_stripe(bucket) {
            Some(stripe) => Ok(stripe),
            None => self.add_stripe(bucket, true),
        }
    }

    /// Latches the candidate tail without blocking. Failing the attempt
    /// that exhausts the budget grows the bucket (up to the cap) so the
    /// next round spreads out; past the budget the latch is blocking.
    fn write_lock_page(
        &self,
        page: &Page,
        bucket: usize,
        lock_attempt: u32,
    ) -> Result<Option<PageWriteGuard>> {
        if let Some(guard) = page.try_get_for_write() {
            return Ok(Some(guard));
        }
        if lock_attempt == self.opts.try_lock_attempts
            && self.table.len(bucket) < self.opts.max_stripes_per_bucket
        {
            self.add_stripe(bucket, false)?;
            return Ok(None);
        }
        if lock_attempt < self.opts.try_lock_attempts {
            Ok(None)
        } else {
            Ok(Some(page.get_for_write()))
        }
    }

    fn add_stripe(&self, bucket: usize, reuse: bool) -> Result<Arc<Stripe>> {
        let page_id = self.allocate_node_page(reuse)?;
        let page = self.mem.page(page_id)?;
        {
            let mut guard = page.get_for_write();
            node::init_new_page(guard.data_mut(), page_id);
            guard.mark_dirty();
            if self.delta_needed(&guard) {
                self.wal_log(DeltaRecord::InitNewPage {
                    cache_id: self.cache_id,
                    page_id,
                    io_type: T_LIST_NODE,
                    io_version: node::VERSION,
                    new_page_id: page_id,
                })?;
            }
        }
        let stripe = Arc::new(Stripe::new(page_id));
        self.table.append(bucket, Arc::clone(&stripe));
        debug!(list = %self.name, bucket, page = %page_id, "freelist.stripe_added");
        Ok(stripe)
    }

    fn allocate_node_page(&self, reuse: bool) -> Result<PageId> {
        if reuse {
            let recycled = match &self.reuse_list {
                Some(reuse_list) => reuse_list.take_recycled()?,
                None => self.take_recycled()?,
            };
            if let Some(id) = recycled {
                // Node pages are always index-typed, whatever the
                // recycled id carried.
                return Ok(id.with_flag(PageFlag::Index));
            }
        }
        self.mem.allocate_page_no_reuse(PageFlag::Index)
    }

    fn deposit_recycled(&self, id: PageId) -> Result<()> {
        let mut bag = ReuseBag::singleton(id);
        if let Some(reuse_list) = &self.reuse_list {
            reuse_list.add_for_recycle(&mut bag)
        } else if self.reuse_bucket_idx.is_some() {
            self.add_for_recycle(&mut bag)
        } else {
            warn!(list = %self.name, page = %id, "freelist.recycled_page_dropped");
            Ok(())
        }
    }

    /// Cuts the successor off `prev`, making `prev` the stripe's tail.
    /// Returns false when `prev` was recycled before we latched it.
    fn cut_tail(&self, prev_guard: &mut PageWriteGuard, prev_id: PageId, bucket: usize) -> Result<bool> {
        if page::page_id(prev_guard.data()) != prev_id {
            return Ok(false);
        }
        page::check_io(prev_guard.data(), T_LIST_NODE, node::VERSION)?;
        let tail_id = node::next_id(prev_guard.data());
        if tail_id.is_null() {
            return Err(BrumeError::Corruption("cut tail: node has no successor"));
        }
        node::set_next_id(prev_guard.data_mut(), PageId::NULL);
        prev_guard.mark_dirty();
        if self.delta_needed(prev_guard) {
            self.wal_log(DeltaRecord::ListSetNext {
                cache_id: self.cache_id,
                page_id: prev_id,
                next_id: PageId::NULL,
            })?;
        }
        self.table.update_tail(bucket, tail_id, prev_id)?;
        Ok(true)
    }

    /// Retires an empty node that has no successor. The caller holds its
    /// latch.
    fn merge_no_next(
        &self,
        guard: &mut PageWriteGuard,
        page_id: PageId,
        prev_id: PageId,
        bucket: usize,
    ) -> Result<PageId> {
        // Empty tails are the normal state of the reuse bucket.
        if (self.is_reuse_bucket)(bucket) {
            return Ok(PageId::NULL);
        }
        if !prev_id.is_null() {
            let prev = self.mem.page(prev_id)?;
            let mut prev_guard = prev.get_for_write();
            if !self.cut_tail(&mut prev_guard, prev_id, bucket)? {
                return Err(BrumeError::Corruption("tail cut raced with a recycle"));
            }
        } else {
            // Sole node of its stripe: drop the stripe entirely.
            self.table.update_tail(bucket, page_id, PageId::NULL)?;
            debug!(list = %self.name, bucket, "freelist.stripe_dropped");
        }
        self.recycle_page(guard, page_id)
    }

    /// Retires an empty node that had a successor when we last looked.
    /// Latches are taken next → current in a retry loop; a page id
    /// mismatch means somebody else already merged or took the node.
    fn merge(&self, page: &Page, page_id: PageId, mut next_id: PageId, bucket: usize) -> Result<PageId> {
        debug_assert!(!next_id.is_null());
        loop {
            let next_page = if next_id.is_null() {
                None
            } else {
                Some(self.mem.page(next_id)?)
            };
            let mut next_guard = match &next_page {
                Some(next) => Some(next.get_for_write()),
                None => None,
            };
            let mut guard = page.get_for_write();
            if page::page_id(guard.data()) != page_id {
                return Ok(PageId::NULL); // Merged or reused concurrently.
            }
            if !node::is_empty(guard.data()) {
                return Ok(PageId::NULL); // Refilled; nothing to merge.
            }
            let cur_next = node::next_id(guard.data());
            if cur_next == next_id {
                return self.do_merge(
                    &mut guard,
                    page_id,
                    next_guard.as_mut().map(|g| (g, next_id)),
                    bucket,
                );
            }
            // The world moved: reread the successor and retry.
            next_id = cur_next;
        }
    }

    fn do_merge(
        &self,
        guard: &mut PageWriteGuard,
        page_id: PageId,
        next: Option<(&mut PageWriteGuard, PageId)>,
        bucket: usize,
    ) -> Result<PageId> {
        let prev_id = node::previous_id(guard.data());
        match next {
            None => self.merge_no_next(guard, page_id, prev_id, bucket),
            Some((next_guard, next_id)) => {
                // We kept the node latched while reading its next
                // pointer, so the successor cannot have been recycled.
                if page::page_id(next_guard.data()) != next_id {
                    return Err(BrumeError::Corruption("next node recycled during merge"));
                }
                if node::previous_id(next_guard.data()) != page_id {
                    return Err(BrumeError::Corruption("next node does not point back"));
                }
                if prev_id.is_null() {
                    // The node is its stripe's head: the successor
                    // becomes the new head.
                    node::set_previous_id(next_guard.data_mut(), PageId::NULL);
                    next_guard.mark_dirty();
                    if self.delta_needed(next_guard) {
                        self.wal_log(DeltaRecord::ListSetPrevious {
                            cache_id: self.cache_id,
                            page_id: next_id,
                            previous_id: PageId::NULL,
                        })?;
                    }
                } else {
                    self.fair_merge(prev_id, page_id, next_guard, next_id)?;
                }
                self.recycle_page(guard, page_id)
            }
        }
    }

    /// Links previous and next to each other around the node being
    /// retired. Takes the third latch, completing the next → current →
    /// previous order.
    fn fair_merge(
        &self,
        prev_id: PageId,
        page_id: PageId,
        next_guard: &mut PageWriteGuard,
        next_id: PageId,
    ) -> Result<()> {
        let prev = self.mem.page(prev_id)?;
        let mut prev_guard = prev.get_for_write();
        if page::page_id(prev_guard.data()) != prev_id {
            return Err(BrumeError::Corruption("previous node recycled during merge"));
        }
        if node::next_id(prev_guard.data()) != page_id {
            return Err(BrumeError::Corruption("previous node does not point forward"));
        }
        node::set_next_id(prev_guard.data_mut(), next_id);
        prev_guard.mark_dirty();
        if self.delta_needed(&prev_guard) {
            self.wal_log(DeltaRecord::ListSetNext {
                cache_id: self.cache_id,
                page_id: prev_id,
                next_id,
            })?;
        }
        node::set_previous_id(next_guard.data_mut(), prev_id);
        next_guard.mark_dirty();
        if self.delta_needed(next_guard) {
            self.wal_log(DeltaRecord::ListSetPrevious {
                cache_id: self.cache_id,
                page_id: next_id,
                previous_id: prev_id,
            })?;
        }
        Ok(())
    }

    fn recycle_page(&self, guard: &mut PageWriteGuard, page_id: PageId) -> Result<PageId> {
        let rotated = page_id.rotate();
        page::set_page_id(guard.data_mut(), rotated);
        guard.mark_dirty();
        if self.delta_needed(guard) {
            self.wal_log(DeltaRecord::Recycle {
                cache_id: self.cache_id,
                page_id,
                rotated_id: rotated,
            })?;
        }
        Ok(rotated)
    }

    fn delta_needed(&self, guard: &PageWriteGuard) -> bool {
        self.wal.is_some() && guard.full_record_policy() != Some(true)
    }

    fn wal_log(&self, record: DeltaRecord) -> Result<()> {
        if let Some(wal) = &self.wal {
            wal.log(&record)?;
        }
        Ok(())
    }
}

enum PutArg<'a> {
    Data(&'a mut PageWriteGuard),
    Bag(&'a mut ReuseBag),
}

/// Links a fresh node after `prev`: initializes it, points it back and
/// chains it forward. `prev` must be a tail.
fn setup_next_page(prev_buf: &mut [u8], prev_id: PageId, next_buf: &mut [u8], next_id: PageId) {
    debug_assert!(node::next_id(prev_buf).is_null());
    node::init_new_page(next_buf, next_id);
    node::set_previous_id(next_buf, prev_id);
    node::set_next_id(prev_buf, next_id);
}

fn release_meta_page(guard: &mut PageWriteGuard) {
    // The save rewrites meta pages wholesale; a full image beats deltas.
    guard.set_full_record_policy(Some(true));
    guard.mark_dirty();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(buckets: usize, reuse: Option<usize>) -> PageList {
        let mem = PageMemory::new(crate::pagemem::MIN_PAGE_SIZE).unwrap();
        let meta_id = mem.allocate_page_no_reuse(PageFlag::Index).unwrap();
        let config = ListConfig::new(1, "test", buckets, meta_id);
        PageList::new(
            mem,
            None,
            config,
            Box::new(move |bucket| Some(bucket) == reuse),
            None,
        )
        .unwrap()
    }

    #[test]
    fn config_rejects_zero_buckets() {
        let mem = PageMemory::new(crate::pagemem::MIN_PAGE_SIZE).unwrap();
        let config = ListConfig::new(1, "broken", 0, PageId::NULL);
        assert!(PageList::new(mem, None, config, Box::new(|_| false), None).is_err());
    }

    #[test]
    fn reuse_bucket_is_detected() {
        let list = list(4, Some(3));
        assert_eq!(list.reuse_bucket_idx, Some(3));
        assert!(list.take_recycled().unwrap().is_none());
    }

    #[test]
    fn recycle_without_destination_is_rejected_for_bags() {
        let list = list(2, None);
        let mut bag = ReuseBag::new();
        assert!(list.add_for_recycle(&mut bag).is_err());
    }

    #[test]
    fn default_options_match_documented_bounds() {
        let options = ListOptions::default();
        assert_eq!(options.try_lock_attempts, 10);
        assert!(options.max_stripes_per_bucket >= 1);
        assert!(options.max_stripes_per_bucket <= 8);
    }
}
