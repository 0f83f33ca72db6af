//! The slice of the data-page header the free list touches: the
//! back-pointer naming the list node that currently owns the page, plus
//! the item count the emptiness check reads. Record layout beyond these
//! slots belongs to the record layer and is opaque here.

use core::ops::Range;

use crate::page::{self, T_DATA};
use crate::types::PageId;

pub const VERSION: u16 = 1;

const FREE_LIST_PAGE_ID: Range<usize> = 16..24;
const ITEM_COUNT: Range<usize> = 24..26;

pub(crate) fn init_new_page(buf: &mut [u8], id: PageId) {
    page::init_common(buf, T_DATA, VERSION, id);
    buf[FREE_LIST_PAGE_ID].fill(0);
    buf[ITEM_COUNT].fill(0);
}

/// The node page that lists this data page, or null when the page is
/// not on any list.
pub fn free_list_page_id(buf: &[u8]) -> PageId {
    PageId::from_raw(u64::from_be_bytes(buf[FREE_LIST_PAGE_ID].try_into().unwrap()))
}

pub(crate) fn set_free_list_page_id(buf: &mut [u8], id: PageId) {
    buf[FREE_LIST_PAGE_ID].copy_from_slice(&id.raw().to_be_bytes());
}

pub fn item_count(buf: &[u8]) -> usize {
    u16::from_be_bytes(buf[ITEM_COUNT].try_into().unwrap()) as usize
}

/// Maintained by the record layer; exposed so the owning engine can keep
/// the emptiness signal accurate.
pub fn set_item_count(buf: &mut [u8], count: usize) {
    buf[ITEM_COUNT].copy_from_slice(&(count as u16).to_be_bytes());
}

pub fn is_empty(buf: &[u8]) -> bool {
    item_count(buf) == 0
}
