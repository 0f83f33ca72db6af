use std::sync::Arc;
use std::thread;
use std::time::Duration;

use brume::page::{self, data, node};
use brume::{
    ListConfig, PageFlag, PageId, PageList, PageMemory, RecordingWal, Result, ReuseBag, WalSink,
};

// Two page ids per node page, two entries per meta page.
const PAGE_SIZE: usize = 56;

fn new_list(buckets: usize, reuse: Option<usize>) -> Result<(Arc<PageList>, PageMemory, PageId)> {
    let mem = PageMemory::new(PAGE_SIZE)?;
    let wal: Arc<RecordingWal> = Arc::new(RecordingWal::new());
    let meta_id = mem.allocate_page_no_reuse(PageFlag::Index)?;
    let mut config = ListConfig::new(7, "scenarios", buckets, meta_id);
    config.options.max_stripes_per_bucket = 8;
    let list = PageList::new(
        mem.clone(),
        Some(wal as Arc<dyn WalSink>),
        config,
        Box::new(move |bucket| Some(bucket) == reuse),
        None,
    )?;
    list.init(true)?;
    Ok((Arc::new(list), mem, meta_id))
}

fn alloc_data_page(mem: &PageMemory, items: usize) -> Result<PageId> {
    let id = mem.allocate_page_no_reuse(PageFlag::Data)?;
    let p = mem.page(id)?;
    let mut guard = p.get_for_write();
    page::DATA_IO.init_new_page(guard.data_mut(), id)?;
    data::set_item_count(guard.data_mut(), items);
    guard.mark_dirty();
    Ok(id)
}

fn put_data(list: &PageList, mem: &PageMemory, id: PageId, bucket: usize) -> Result<()> {
    let p = mem.page(id)?;
    let mut guard = p.get_for_write();
    list.put_data_page(&mut guard, bucket)
}

fn remove_data(list: &PageList, mem: &PageMemory, id: PageId, bucket: usize) -> Result<bool> {
    let p = mem.page(id)?;
    let mut guard = p.get_for_write();
    list.remove_data_page(&mut guard, bucket)
}

fn read_back_pointer(mem: &PageMemory, id: PageId) -> PageId {
    let p = mem.page(id).expect("data page");
    let guard = p.get_for_read();
    data::free_list_page_id(guard.data())
}

fn node_snapshot(mem: &PageMemory, id: PageId) -> (PageId, PageId, Vec<PageId>) {
    let p = mem.page(id).expect("node page");
    let guard = p.get_for_read();
    (
        node::previous_id(guard.data()),
        node::next_id(guard.data()),
        node::pages(guard.data()),
    )
}

/// Grows `bucket` by one stripe: holds every current tail latched so a
/// concurrent put exhausts its non-blocking attempts and adds a stripe.
fn grow_bucket_once(list: &Arc<PageList>, mem: &PageMemory, bucket: usize) {
    let tails = list.bucket_tails(bucket);
    let want = tails.len() + 1;
    let pages: Vec<_> = tails.iter().map(|&id| mem.page(id).unwrap()).collect();
    let guards: Vec<_> = pages.iter().map(|p| p.get_for_write()).collect();

    let data_id = alloc_data_page(mem, 1).unwrap();
    let list2 = Arc::clone(list);
    let mem2 = mem.clone();
    let handle = thread::spawn(move || put_data(&list2, &mem2, data_id, bucket));

    while list.bucket_tails(bucket).len() < want {
        thread::sleep(Duration::from_millis(1));
    }
    drop(guards);
    handle.join().unwrap().unwrap();
}

#[test]
fn first_put_creates_stripe_and_back_pointer() -> Result<()> {
    let (list, mem, _) = new_list(1, None)?;
    let p1 = alloc_data_page(&mem, 1)?;

    put_data(&list, &mem, p1, 0)?;

    let tails = list.bucket_tails(0);
    assert_eq!(tails.len(), 1);
    let (prev, next, pages) = node_snapshot(&mem, tails[0]);
    assert!(prev.is_null());
    assert!(next.is_null());
    assert_eq!(pages, vec![p1]);
    assert_eq!(read_back_pointer(&mem, p1), tails[0]);
    assert_eq!(list.stored_pages_count(0)?, 1);
    Ok(())
}

#[test]
fn put_past_capacity_splits_the_tail() -> Result<()> {
    let (list, mem, _) = new_list(1, None)?;
    let pages: Vec<PageId> = (0..3)
        .map(|_| alloc_data_page(&mem, 1))
        .collect::<Result<_>>()?;
    for &p in &pages {
        put_data(&list, &mem, p, 0)?;
    }

    let tails = list.bucket_tails(0);
    assert_eq!(tails.len(), 1);
    let n2 = tails[0];
    let (n2_prev, n2_next, n2_pages) = node_snapshot(&mem, n2);
    assert!(n2_next.is_null());
    assert_eq!(n2_pages, vec![pages[2]]);

    let n1 = n2_prev;
    assert!(!n1.is_null());
    let (n1_prev, n1_next, n1_pages) = node_snapshot(&mem, n1);
    assert!(n1_prev.is_null());
    assert_eq!(n1_next, n2);
    assert_eq!(n1_pages, vec![pages[0], pages[1]]);

    assert_eq!(read_back_pointer(&mem, pages[0]), n1);
    assert_eq!(read_back_pointer(&mem, pages[2]), n2);
    assert_eq!(list.stored_pages_count(0)?, 3);
    Ok(())
}

#[test]
fn removing_last_entry_merges_tail_back() -> Result<()> {
    let (list, mem, _) = new_list(1, None)?;
    let pages: Vec<PageId> = (0..3)
        .map(|_| alloc_data_page(&mem, 1))
        .collect::<Result<_>>()?;
    for &p in &pages {
        put_data(&list, &mem, p, 0)?;
    }
    let n2 = list.bucket_tails(0)[0];
    let (n1, _, _) = node_snapshot(&mem, n2);

    assert!(remove_data(&list, &mem, pages[2], 0)?);

    // N2 drained: the tail moved back to N1 and N2's id was rotated.
    let tails = list.bucket_tails(0);
    assert_eq!(tails, vec![n1]);
    let (_, n1_next, n1_pages) = node_snapshot(&mem, n1);
    assert!(n1_next.is_null());
    assert_eq!(n1_pages, vec![pages[0], pages[1]]);
    assert!(read_back_pointer(&mem, pages[2]).is_null());

    let n2_frame = mem.page(n2)?;
    let embedded = page::page_id(n2_frame.get_for_read().data());
    assert_eq!(embedded.rotation(), n2.rotation() + 1);
    assert_eq!(embedded.index(), n2.index());
    Ok(())
}

#[test]
fn removing_from_head_node_keeps_the_chain() -> Result<()> {
    let (list, mem, _) = new_list(1, None)?;
    let pages: Vec<PageId> = (0..3)
        .map(|_| alloc_data_page(&mem, 1))
        .collect::<Result<_>>()?;
    for &p in &pages {
        put_data(&list, &mem, p, 0)?;
    }
    let n2 = list.bucket_tails(0)[0];
    let (n1, _, _) = node_snapshot(&mem, n2);

    assert!(remove_data(&list, &mem, pages[0], 0)?);

    assert_eq!(list.bucket_tails(0), vec![n2]);
    let (_, n1_next, n1_pages) = node_snapshot(&mem, n1);
    assert_eq!(n1_next, n2);
    assert_eq!(n1_pages, vec![pages[1]]);
    assert!(read_back_pointer(&mem, pages[0]).is_null());
    assert_eq!(list.stored_pages_count(0)?, 2);
    Ok(())
}

#[test]
fn reuse_bucket_split_consumes_the_bag_page() -> Result<()> {
    let (list, mem, _) = new_list(1, Some(0))?;
    let a = alloc_data_page(&mem, 0)?;
    let b = alloc_data_page(&mem, 0)?;
    let mut bag = ReuseBag::new();
    bag.add_free_page(a);
    bag.add_free_page(b);
    list.put_reuse_bag(&mut bag, 0)?;
    assert!(bag.is_empty());
    assert_eq!(list.stored_pages_count(0)?, 2);
    let n0 = list.bucket_tails(0)[0];

    let x = alloc_data_page(&mem, 0)?;
    let fresh_before = mem.fresh_allocations();
    let mut bag = ReuseBag::singleton(x);
    list.put_reuse_bag(&mut bag, 0)?;

    // The node was full, so X itself became the new tail; nothing was
    // allocated.
    assert!(bag.is_empty());
    assert_eq!(mem.fresh_allocations(), fresh_before);
    assert_eq!(list.bucket_tails(0), vec![x]);
    let (x_prev, x_next, x_pages) = node_snapshot(&mem, x);
    assert_eq!(x_prev, n0);
    assert!(x_next.is_null());
    assert!(x_pages.is_empty());
    let (_, n0_next, _) = node_snapshot(&mem, n0);
    assert_eq!(n0_next, x);
    Ok(())
}

#[test]
fn empty_data_page_put_to_reuse_bucket_never_allocates() -> Result<()> {
    let (list, mem, _) = new_list(1, Some(0))?;
    // Prime the bucket so the next put hits a full tail and splits.
    let mut bag = ReuseBag::new();
    for _ in 0..2 {
        bag.add_free_page(alloc_data_page(&mem, 0)?);
    }
    list.put_reuse_bag(&mut bag, 0)?;

    let p = alloc_data_page(&mem, 0)?;
    let fresh_before = mem.fresh_allocations();
    put_data(&list, &mem, p, 0)?;
    assert_eq!(mem.fresh_allocations(), fresh_before);
    // The deposited page was consumed as the new tail node, retyped to
    // an index page.
    let tails = list.bucket_tails(0);
    assert_eq!(tails.len(), 1);
    assert_eq!(tails[0].index(), p.index());
    assert_eq!(tails[0].flag(), PageFlag::Index as u8);
    Ok(())
}

#[test]
fn take_returns_entries_then_recycles_drained_nodes() -> Result<()> {
    let (list, mem, _) = new_list(1, None)?;
    let pages: Vec<PageId> = (0..3)
        .map(|_| alloc_data_page(&mem, 1))
        .collect::<Result<_>>()?;
    for &p in &pages {
        put_data(&list, &mem, p, 0)?;
    }
    let n2 = list.bucket_tails(0)[0];
    let (n1, _, _) = node_snapshot(&mem, n2);

    // The tail's payload drains first.
    assert_eq!(list.take_empty_page(0, None)?, Some(pages[2]));
    // Next take finds the tail empty: N2 is unlinked and handed out
    // under a rotated id.
    let rotated = list.take_empty_page(0, None)?.expect("recycled node");
    assert_eq!(rotated.index(), n2.index());
    assert_eq!(rotated.rotation(), n2.rotation() + 1);
    assert_eq!(list.bucket_tails(0), vec![n1]);

    assert_eq!(list.take_empty_page(0, None)?, Some(pages[1]));
    assert_eq!(list.take_empty_page(0, None)?, Some(pages[0]));

    // The sole remaining node is an empty head: the stripe stays and
    // takes observe an empty bucket.
    assert_eq!(list.take_empty_page(0, None)?, None);
    assert_eq!(list.bucket_tails(0), vec![n1]);
    assert_eq!(list.stored_pages_count(0)?, 0);
    Ok(())
}

#[test]
fn take_with_init_retypes_the_drained_node() -> Result<()> {
    let (list, mem, _) = new_list(1, None)?;
    let pages: Vec<PageId> = (0..3)
        .map(|_| alloc_data_page(&mem, 1))
        .collect::<Result<_>>()?;
    for &p in &pages {
        put_data(&list, &mem, p, 0)?;
    }
    let n2 = list.bucket_tails(0)[0];

    assert_eq!(list.take_empty_page(0, Some(page::DATA_IO))?, Some(pages[2]));
    let taken = list
        .take_empty_page(0, Some(page::DATA_IO))?
        .expect("drained node page");
    assert_eq!(taken.index(), n2.index());
    assert_eq!(taken.rotation(), n2.rotation());
    assert_eq!(taken.flag(), PageFlag::Data as u8);

    let frame = mem.page(taken)?;
    let guard = frame.get_for_read();
    assert_eq!(page::page_id(guard.data()), taken);
    assert!(data::is_empty(guard.data()));
    assert!(data::free_list_page_id(guard.data()).is_null());
    Ok(())
}

#[test]
fn metadata_round_trip_restores_stripe_tails() -> Result<()> {
    let (list, mem, meta_id) = new_list(2, None)?;

    // Three stripes in bucket 0, one in bucket 1.
    put_data(&list, &mem, alloc_data_page(&mem, 1)?, 0)?;
    grow_bucket_once(&list, &mem, 0);
    grow_bucket_once(&list, &mem, 0);
    let b1_page = alloc_data_page(&mem, 1)?;
    put_data(&list, &mem, b1_page, 1)?;
    assert_eq!(list.bucket_tails(0).len(), 3);
    assert_eq!(list.bucket_tails(1).len(), 1);

    let counts_before = (list.stored_pages_count(0)?, list.stored_pages_count(1)?);
    list.save_metadata()?;

    // A fresh instance over the same memory restores the same tails.
    let restored = PageList::new(
        mem.clone(),
        None,
        ListConfig::new(7, "restored", 2, meta_id),
        Box::new(|_| false),
        None,
    )?;
    restored.init(false)?;
    assert_eq!(restored.bucket_tails(0), list.bucket_tails(0));
    assert_eq!(restored.bucket_tails(1), list.bucket_tails(1));
    assert_eq!(restored.stored_pages_count(0)?, counts_before.0);
    assert_eq!(restored.stored_pages_count(1)?, counts_before.1);

    // Shrink: bucket 1's sole entry leaves, its stripe is dropped, and
    // a re-save must not resurrect it.
    assert!(remove_data(&list, &mem, b1_page, 1)?);
    assert!(list.bucket_tails(1).is_empty());
    list.save_metadata()?;

    let restored = PageList::new(
        mem.clone(),
        None,
        ListConfig::new(7, "restored2", 2, meta_id),
        Box::new(|_| false),
        None,
    )?;
    restored.init(false)?;
    assert_eq!(restored.bucket_tails(0), list.bucket_tails(0));
    assert!(restored.bucket_tails(1).is_empty());
    Ok(())
}
