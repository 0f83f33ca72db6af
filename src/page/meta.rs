//! List-meta pages: the persisted `(bucket, stripe tail)` assignments,
//! chained through `next_meta_page_id`. The entry set across a chain is
//! exactly the set of stripe tails at save time.

use core::ops::Range;
use std::collections::BTreeMap;

use crate::page::{self, T_LIST_META};
use crate::types::PageId;

pub const VERSION: u16 = 1;

const NEXT_META_ID: Range<usize> = 16..24;
const COUNT: Range<usize> = 24..26;
const RESERVED: Range<usize> = 26..32;

const ITEMS_OFF: usize = 32;
const ITEM_LEN: usize = 10;

pub(crate) fn capacity(page_size: usize) -> usize {
    (page_size - ITEMS_OFF) / ITEM_LEN
}

pub(crate) fn init_new_page(buf: &mut [u8], id: PageId) {
    page::init_common(buf, T_LIST_META, VERSION, id);
    buf[NEXT_META_ID].fill(0);
    buf[COUNT].fill(0);
    buf[RESERVED].fill(0);
}

pub fn next_meta_page_id(buf: &[u8]) -> PageId {
    PageId::from_raw(u64::from_be_bytes(buf[NEXT_META_ID].try_into().unwrap()))
}

pub(crate) fn set_next_meta_page_id(buf: &mut [u8], id: PageId) {
    buf[NEXT_META_ID].copy_from_slice(&id.raw().to_be_bytes());
}

pub fn count(buf: &[u8]) -> usize {
    u16::from_be_bytes(buf[COUNT].try_into().unwrap()) as usize
}

fn set_count(buf: &mut [u8], count: usize) {
    buf[COUNT].copy_from_slice(&(count as u16).to_be_bytes());
}

/// Empties the page without touching the chain link, so a stale chain
/// tail stops contributing entries but stays allocated for the next
/// save.
pub(crate) fn reset_count(buf: &mut [u8]) {
    set_count(buf, 0);
}

fn set_entry(buf: &mut [u8], idx: usize, bucket: u16, tail: PageId) {
    let off = ITEMS_OFF + idx * ITEM_LEN;
    buf[off..off + 2].copy_from_slice(&bucket.to_be_bytes());
    buf[off + 2..off + ITEM_LEN].copy_from_slice(&tail.raw().to_be_bytes());
}

fn entry(buf: &[u8], idx: usize) -> (u16, PageId) {
    let off = ITEMS_OFF + idx * ITEM_LEN;
    let bucket = u16::from_be_bytes(buf[off..off + 2].try_into().unwrap());
    let tail = PageId::from_raw(u64::from_be_bytes(
        buf[off + 2..off + ITEM_LEN].try_into().unwrap(),
    ));
    (bucket, tail)
}

/// Packs as many of `tails[from..]` as fit, tagged with `bucket`.
/// Returns the number written; 0 means the page is full.
pub(crate) fn add_tails(buf: &mut [u8], bucket: u16, tails: &[PageId], from: usize) -> usize {
    let cnt = count(buf);
    let room = capacity(buf.len()) - cnt;
    let write = room.min(tails.len() - from);
    for i in 0..write {
        set_entry(buf, cnt + i, bucket, tails[from + i]);
    }
    set_count(buf, cnt + write);
    write
}

/// Accumulates this page's entries into `out`, preserving entry order
/// within each bucket.
pub fn buckets_data(buf: &[u8], out: &mut BTreeMap<u16, Vec<PageId>>) {
    for idx in 0..count(buf) {
        let (bucket, tail) = entry(buf, idx);
        out.entry(bucket).or_default().push(tail);
    }
}
