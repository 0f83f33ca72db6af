//! On-page binary layouts.
//!
//! Every page starts with a common 16-byte header carrying the io type,
//! the io version and the full tagged page id. Layouts are big-endian
//! and version-tagged: writers emit the latest version, readers accept
//! any version from 1 up to the latest they know.

pub mod data;
pub mod meta;
pub mod node;

use crate::error::{BrumeError, Result};
use crate::types::PageId;

pub const T_DATA: u16 = 1;
pub const T_LIST_NODE: u16 = 4;
pub const T_LIST_META: u16 = 5;

pub const COMMON_HDR_LEN: usize = 16;

pub mod header {
    //! Byte offsets for the common page header.
    use core::ops::Range;

    pub const IO_TYPE: Range<usize> = 0..2;
    pub const IO_VERSION: Range<usize> = 2..4;
    pub const PAGE_ID: Range<usize> = 4..12;
    pub const RESERVED: Range<usize> = 12..16;
}

pub fn io_type(buf: &[u8]) -> u16 {
    u16::from_be_bytes(buf[header::IO_TYPE].try_into().unwrap())
}

pub fn io_version(buf: &[u8]) -> u16 {
    u16::from_be_bytes(buf[header::IO_VERSION].try_into().unwrap())
}

/// Full page id embedded in the header. Compared against the id a latch
/// was taken for to detect concurrent recycles.
pub fn page_id(buf: &[u8]) -> PageId {
    PageId::from_raw(u64::from_be_bytes(buf[header::PAGE_ID].try_into().unwrap()))
}

pub fn set_page_id(buf: &mut [u8], id: PageId) {
    buf[header::PAGE_ID].copy_from_slice(&id.raw().to_be_bytes());
}

pub(crate) fn init_common(buf: &mut [u8], io_type: u16, io_version: u16, id: PageId) {
    buf[header::IO_TYPE].copy_from_slice(&io_type.to_be_bytes());
    buf[header::IO_VERSION].copy_from_slice(&io_version.to_be_bytes());
    set_page_id(buf, id);
    buf[header::RESERVED].fill(0);
}

/// Validates the header against an expected io type and returns the
/// stored version.
pub fn check_io(buf: &[u8], expected: u16, latest: u16) -> Result<u16> {
    if io_type(buf) != expected {
        return Err(BrumeError::Corruption("unexpected page io type"));
    }
    let version = io_version(buf);
    if version == 0 || version > latest {
        return Err(BrumeError::Corruption("unsupported page io version"));
    }
    Ok(version)
}

/// A named io layout: type code plus the latest version this build
/// writes. Used where a caller chooses how to re-initialize a page,
/// e.g. retyping a drained list node into a fresh data page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct IoVersions {
    io_type: u16,
    latest: u16,
}

pub const DATA_IO: IoVersions = IoVersions {
    io_type: T_DATA,
    latest: data::VERSION,
};

pub const LIST_NODE_IO: IoVersions = IoVersions {
    io_type: T_LIST_NODE,
    latest: node::VERSION,
};

pub const LIST_META_IO: IoVersions = IoVersions {
    io_type: T_LIST_META,
    latest: meta::VERSION,
};

impl IoVersions {
    pub fn io_type(self) -> u16 {
        self.io_type
    }

    pub fn latest(self) -> u16 {
        self.latest
    }

    pub fn init_new_page(self, buf: &mut [u8], id: PageId) -> Result<()> {
        init_io(self.io_type, self.latest, buf, id)
    }
}

/// Initializes `buf` as a fresh page of the given io type and version.
/// The redo path dispatches through here when replaying init records.
pub fn init_io(io_type: u16, io_version: u16, buf: &mut [u8], id: PageId) -> Result<()> {
    let versions = match io_type {
        T_DATA => DATA_IO,
        T_LIST_NODE => LIST_NODE_IO,
        T_LIST_META => LIST_META_IO,
        _ => return Err(BrumeError::Corruption("unknown page io type")),
    };
    if io_version == 0 || io_version > versions.latest {
        return Err(BrumeError::Corruption("unsupported page io version"));
    }
    match io_type {
        T_DATA => data::init_new_page(buf, id),
        T_LIST_NODE => node::init_new_page(buf, id),
        T_LIST_META => meta::init_new_page(buf, id),
        _ => unreachable!(),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PageFlag;

    #[test]
    fn check_io_rejects_type_and_version_mismatch() {
        let mut buf = vec![0u8; 64];
        let id = PageId::new(PageFlag::Index, 3);
        node::init_new_page(&mut buf, id);
        assert_eq!(check_io(&buf, T_LIST_NODE, node::VERSION).unwrap(), 1);
        assert!(check_io(&buf, T_LIST_META, meta::VERSION).is_err());
        buf[header::IO_VERSION].copy_from_slice(&2u16.to_be_bytes());
        assert!(check_io(&buf, T_LIST_NODE, node::VERSION).is_err());
    }

    #[test]
    fn embedded_page_id_round_trips() {
        let mut buf = vec![0u8; 64];
        let id = PageId::new(PageFlag::Data, 77).rotate();
        set_page_id(&mut buf, id);
        assert_eq!(page_id(&buf), id);
    }
}
