//! List-node pages: the skeleton of the striped page list.
//!
//! A node carries previous/next links, a count and a payload array of
//! page ids. Capacity is fixed by the page size; removal is by
//! swap-with-last so the payload stays dense and images stay
//! deterministic under redo.

use core::ops::Range;

use crate::page::{self, T_LIST_NODE};
use crate::types::PageId;

pub const VERSION: u16 = 1;

const PREVIOUS_ID: Range<usize> = 16..24;
const NEXT_ID: Range<usize> = 24..32;
const COUNT: Range<usize> = 32..34;
const RESERVED: Range<usize> = 34..40;

const ITEMS_OFF: usize = 40;
const ITEM_LEN: usize = 8;

pub(crate) fn capacity(page_size: usize) -> usize {
    (page_size - ITEMS_OFF) / ITEM_LEN
}

pub(crate) fn init_new_page(buf: &mut [u8], id: PageId) {
    page::init_common(buf, T_LIST_NODE, VERSION, id);
    buf[PREVIOUS_ID].fill(0);
    buf[NEXT_ID].fill(0);
    buf[COUNT].fill(0);
    buf[RESERVED].fill(0);
}

pub fn previous_id(buf: &[u8]) -> PageId {
    PageId::from_raw(u64::from_be_bytes(buf[PREVIOUS_ID].try_into().unwrap()))
}

pub(crate) fn set_previous_id(buf: &mut [u8], id: PageId) {
    buf[PREVIOUS_ID].copy_from_slice(&id.raw().to_be_bytes());
}

pub fn next_id(buf: &[u8]) -> PageId {
    PageId::from_raw(u64::from_be_bytes(buf[NEXT_ID].try_into().unwrap()))
}

pub(crate) fn set_next_id(buf: &mut [u8], id: PageId) {
    buf[NEXT_ID].copy_from_slice(&id.raw().to_be_bytes());
}

pub fn count(buf: &[u8]) -> usize {
    u16::from_be_bytes(buf[COUNT].try_into().unwrap()) as usize
}

fn set_count(buf: &mut [u8], count: usize) {
    buf[COUNT].copy_from_slice(&(count as u16).to_be_bytes());
}

pub fn is_empty(buf: &[u8]) -> bool {
    count(buf) == 0
}

fn item(buf: &[u8], idx: usize) -> PageId {
    let off = ITEMS_OFF + idx * ITEM_LEN;
    PageId::from_raw(u64::from_be_bytes(buf[off..off + ITEM_LEN].try_into().unwrap()))
}

fn set_item(buf: &mut [u8], idx: usize, id: PageId) {
    let off = ITEMS_OFF + idx * ITEM_LEN;
    buf[off..off + ITEM_LEN].copy_from_slice(&id.raw().to_be_bytes());
}

pub fn contains(buf: &[u8], id: PageId) -> bool {
    (0..count(buf)).any(|idx| item(buf, idx) == id)
}

/// Payload snapshot, in slot order.
pub fn pages(buf: &[u8]) -> Vec<PageId> {
    (0..count(buf)).map(|idx| item(buf, idx)).collect()
}

/// Appends `id` to the payload. Returns the slot, or `None` when the
/// node is full.
pub(crate) fn add_page(buf: &mut [u8], id: PageId) -> Option<usize> {
    let cnt = count(buf);
    if cnt == capacity(buf.len()) {
        return None;
    }
    set_item(buf, cnt, id);
    set_count(buf, cnt + 1);
    Some(cnt)
}

/// Takes the last payload id, zeroing the vacated slot.
pub(crate) fn take_any_page(buf: &mut [u8]) -> Option<PageId> {
    let cnt = count(buf);
    if cnt == 0 {
        return None;
    }
    let id = item(buf, cnt - 1);
    set_item(buf, cnt - 1, PageId::NULL);
    set_count(buf, cnt - 1);
    Some(id)
}

/// Removes `id` from the payload by moving the last id into its slot.
pub(crate) fn remove_page(buf: &mut [u8], id: PageId) -> bool {
    let cnt = count(buf);
    for idx in 0..cnt {
        if item(buf, idx) == id {
            let last = cnt - 1;
            if idx != last {
                set_item(buf, idx, item(buf, last));
            }
            set_item(buf, last, PageId::NULL);
            set_count(buf, last);
            return true;
        }
    }
    false
}
