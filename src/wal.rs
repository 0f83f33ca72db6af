//! Redo records for page-list mutations.
//!
//! Every in-place page mutation the list performs is described by one
//! delta record, logged to the attached [`WalSink`] while the page's
//! write latch is still held, so the log order is causally consistent
//! with the page images. Replaying the records against a snapshot of
//! the pages reproduces the images byte for byte.

use parking_lot::Mutex;

use crate::error::{BrumeError, Result};
use crate::page::{self, data, node};
use crate::types::PageId;

/// An opaque, thread-safe log sink. Implementations must persist or
/// buffer records in the order `log` is called.
pub trait WalSink: Send + Sync {
    fn log(&self, record: &DeltaRecord) -> Result<()>;
}

const REC_INIT_NEW_PAGE: u8 = 1;
const REC_LIST_INIT_NEW_PAGE: u8 = 2;
const REC_LIST_ADD_PAGE: u8 = 3;
const REC_LIST_REMOVE_PAGE: u8 = 4;
const REC_LIST_SET_NEXT: u8 = 5;
const REC_LIST_SET_PREVIOUS: u8 = 6;
const REC_DATA_SET_FREE_LIST_PAGE: u8 = 7;
const REC_RECYCLE: u8 = 8;

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeltaRecord {
    /// A page was (re)initialized as a fresh page of the given io.
    InitNewPage {
        cache_id: u32,
        page_id: PageId,
        io_type: u16,
        io_version: u16,
        new_page_id: PageId,
    },
    /// A page became a list node linked after `previous_id`, optionally
    /// seeded with one data page id.
    ListInitNewPage {
        cache_id: u32,
        page_id: PageId,
        previous_id: PageId,
        add_data_page_id: PageId,
    },
    ListAddPage {
        cache_id: u32,
        node_page_id: PageId,
        added_id: PageId,
    },
    ListRemovePage {
        cache_id: u32,
        node_page_id: PageId,
        removed_id: PageId,
    },
    ListSetNext {
        cache_id: u32,
        page_id: PageId,
        next_id: PageId,
    },
    ListSetPrevious {
        cache_id: u32,
        page_id: PageId,
        previous_id: PageId,
    },
    DataSetFreeListPage {
        cache_id: u32,
        data_page_id: PageId,
        free_list_page_id: PageId,
    },
    /// A page id was rotated, retiring the previous generation.
    Recycle {
        cache_id: u32,
        page_id: PageId,
        rotated_id: PageId,
    },
}

impl DeltaRecord {
    /// The page this record mutates (the frame to apply redo against).
    pub fn page_id(&self) -> PageId {
        match *self {
            DeltaRecord::InitNewPage { page_id, .. } => page_id,
            DeltaRecord::ListInitNewPage { page_id, .. } => page_id,
            DeltaRecord::ListAddPage { node_page_id, .. } => node_page_id,
            DeltaRecord::ListRemovePage { node_page_id, .. } => node_page_id,
            DeltaRecord::ListSetNext { page_id, .. } => page_id,
            DeltaRecord::ListSetPrevious { page_id, .. } => page_id,
            DeltaRecord::DataSetFreeListPage { data_page_id, .. } => data_page_id,
            DeltaRecord::Recycle { page_id, .. } => page_id,
        }
    }

    /// Redoes this record's mutation against a page image.
    pub fn apply(&self, buf: &mut [u8]) -> Result<()> {
        match *self {
            DeltaRecord::InitNewPage {
                io_type,
                io_version,
                new_page_id,
                ..
            } => page::init_io(io_type, io_version, buf, new_page_id),
            DeltaRecord::ListInitNewPage {
                page_id,
                previous_id,
                add_data_page_id,
                ..
            } => {
                node::init_new_page(buf, page_id);
                node::set_previous_id(buf, previous_id);
                if !add_data_page_id.is_null() && node::add_page(buf, add_data_page_id).is_none() {
                    return Err(BrumeError::Corruption("node page full during redo"));
                }
                Ok(())
            }
            DeltaRecord::ListAddPage { added_id, .. } => {
                if node::add_page(buf, added_id).is_none() {
                    return Err(BrumeError::Corruption("node page full during redo"));
                }
                Ok(())
            }
            DeltaRecord::ListRemovePage { removed_id, .. } => {
                if !node::remove_page(buf, removed_id) {
                    return Err(BrumeError::Corruption("page id missing during redo"));
                }
                Ok(())
            }
            DeltaRecord::ListSetNext { next_id, .. } => {
                node::set_next_id(buf, next_id);
                Ok(())
            }
            DeltaRecord::ListSetPrevious { previous_id, .. } => {
                node::set_previous_id(buf, previous_id);
                Ok(())
            }
            DeltaRecord::DataSetFreeListPage {
                free_list_page_id, ..
            } => {
                data::set_free_list_page_id(buf, free_list_page_id);
                Ok(())
            }
            DeltaRecord::Recycle { rotated_id, .. } => {
                page::set_page_id(buf, rotated_id);
                Ok(())
            }
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        match *self {
            DeltaRecord::InitNewPage {
                cache_id,
                page_id,
                io_type,
                io_version,
                new_page_id,
            } => {
                out.push(REC_INIT_NEW_PAGE);
                out.extend_from_slice(&cache_id.to_be_bytes());
                out.extend_from_slice(&page_id.raw().to_be_bytes());
                out.extend_from_slice(&io_type.to_be_bytes());
                out.extend_from_slice(&io_version.to_be_bytes());
                out.extend_from_slice(&new_page_id.raw().to_be_bytes());
            }
            DeltaRecord::ListInitNewPage {
                cache_id,
                page_id,
                previous_id,
                add_data_page_id,
            } => {
                out.push(REC_LIST_INIT_NEW_PAGE);
                out.extend_from_slice(&cache_id.to_be_bytes());
                out.extend_from_slice(&page_id.raw().to_be_bytes());
                out.extend_from_slice(&previous_id.raw().to_be_bytes());
                out.extend_from_slice(&add_data_page_id.raw().to_be_bytes());
            }
            DeltaRecord::ListAddPage {
                cache_id,
                node_page_id,
                added_id,
            } => encode_pair(out, REC_LIST_ADD_PAGE, cache_id, node_page_id, added_id),
            DeltaRecord::ListRemovePage {
                cache_id,
                node_page_id,
                removed_id,
            } => encode_pair(out, REC_LIST_REMOVE_PAGE, cache_id, node_page_id, removed_id),
            DeltaRecord::ListSetNext {
                cache_id,
                page_id,
                next_id,
            } => encode_pair(out, REC_LIST_SET_NEXT, cache_id, page_id, next_id),
            DeltaRecord::ListSetPrevious {
                cache_id,
                page_id,
                previous_id,
            } => encode_pair(out, REC_LIST_SET_PREVIOUS, cache_id, page_id, previous_id),
            DeltaRecord::DataSetFreeListPage {
                cache_id,
                data_page_id,
                free_list_page_id,
            } => encode_pair(
                out,
                REC_DATA_SET_FREE_LIST_PAGE,
                cache_id,
                data_page_id,
                free_list_page_id,
            ),
            DeltaRecord::Recycle {
                cache_id,
                page_id,
                rotated_id,
            } => encode_pair(out, REC_RECYCLE, cache_id, page_id, rotated_id),
        }
    }

    /// Decodes one record, returning it and the number of bytes read.
    pub fn decode(src: &[u8]) -> Result<(DeltaRecord, usize)> {
        let mut r = Reader::new(src);
        let tag = r.u8()?;
        let cache_id = r.u32()?;
        let record = match tag {
            REC_INIT_NEW_PAGE => DeltaRecord::InitNewPage {
                cache_id,
                page_id: r.page_id()?,
                io_type: r.u16()?,
                io_version: r.u16()?,
                new_page_id: r.page_id()?,
            },
            REC_LIST_INIT_NEW_PAGE => DeltaRecord::ListInitNewPage {
                cache_id,
                page_id: r.page_id()?,
                previous_id: r.page_id()?,
                add_data_page_id: r.page_id()?,
            },
            REC_LIST_ADD_PAGE => DeltaRecord::ListAddPage {
                cache_id,
                node_page_id: r.page_id()?,
                added_id: r.page_id()?,
            },
            REC_LIST_REMOVE_PAGE => DeltaRecord::ListRemovePage {
                cache_id,
                node_page_id: r.page_id()?,
                removed_id: r.page_id()?,
            },
            REC_LIST_SET_NEXT => DeltaRecord::ListSetNext {
                cache_id,
                page_id: r.page_id()?,
                next_id: r.page_id()?,
            },
            REC_LIST_SET_PREVIOUS => DeltaRecord::ListSetPrevious {
                cache_id,
                page_id: r.page_id()?,
                previous_id: r.page_id()?,
            },
            REC_DATA_SET_FREE_LIST_PAGE => DeltaRecord::DataSetFreeListPage {
                cache_id,
                data_page_id: r.page_id()?,
                free_list_page_id: r.page_id()?,
            },
            REC_RECYCLE => DeltaRecord::Recycle {
                cache_id,
                page_id: r.page_id()?,
                rotated_id: r.page_id()?,
            },
            _ => return Err(BrumeError::Corruption("unknown wal record tag")),
        };
        Ok((record, r.pos))
    }
}

fn encode_pair(out: &mut Vec<u8>, tag: u8, cache_id: u32, a: PageId, b: PageId) {
    out.push(tag);
    out.extend_from_slice(&cache_id.to_be_bytes());
    out.extend_from_slice(&a.raw().to_be_bytes());
    out.extend_from_slice(&b.raw().to_be_bytes());
}

struct Reader<'a> {
    src: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(src: &'a [u8]) -> Self {
        Self { src, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.src.len() - self.pos < len {
            return Err(BrumeError::Corruption("wal record truncated"));
        }
        let out = &self.src[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn page_id(&mut self) -> Result<PageId> {
        Ok(PageId::from_raw(u64::from_be_bytes(
            self.take(8)?.try_into().unwrap(),
        )))
    }
}

/// A sink that keeps records in memory, in log order. Used by the test
/// suite and by recovery harnesses that replay against page snapshots.
#[derive(Default)]
pub struct RecordingWal {
    records: Mutex<Vec<DeltaRecord>>,
}

impl RecordingWal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DeltaRecord> {
        self.records.lock().clone()
    }

    pub fn drain(&self) -> Vec<DeltaRecord> {
        std::mem::take(&mut *self.records.lock())
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

impl WalSink for RecordingWal {
    fn log(&self, record: &DeltaRecord) -> Result<()> {
        self.records.lock().push(record.clone());
        Ok(())
    }
}
