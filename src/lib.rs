//! Page infrastructure for the Brume storage engine.
//!
//! The centerpiece is [`freelist::PageList`], a striped, doubly-linked
//! on-disk list of page ids used to track free and partially-filled
//! data pages and recyclable empty pages. It runs against the page
//! store in [`pagemem`] and describes every mutation with the redo
//! records in [`wal`].

pub mod error;
pub mod freelist;
pub mod page;
pub mod pagemem;
pub mod types;
pub mod wal;

pub use crate::error::{BrumeError, Result};
pub use crate::freelist::{ListConfig, ListOptions, PageList, ReuseBucketFn, Stripe};
pub use crate::pagemem::{Page, PageMemory, PageReadGuard, PageWriteGuard, DEFAULT_PAGE_SIZE};
pub use crate::types::{PageFlag, PageId, ReuseBag};
pub use crate::wal::{DeltaRecord, RecordingWal, WalSink};
