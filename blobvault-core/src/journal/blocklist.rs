//! Extent allocator, extent chains and the free list
//!
//! An extent is a header plus `cap` payload bytes:
//!
//! - 8 bytes: next extent (0 = none)
//! - 4 bytes: capacity
//! - 4 bytes: flags and used length (bit 31 = end of blob, bit 30 = free)
//!
//! A list head (24 bytes: first, last, total bytes) strings extents together.
//! Every day bucket is one list holding the extents of all its blobs in
//! store order; the end-of-blob flag marks where one blob stops. The free
//! list has the same shape, so reclaiming a bucket is a single splice.

use super::pager::Pager;
use crate::{BlobError, Result};
use bytes::{Buf, BufMut};
use std::fs::File;
use std::os::unix::fs::FileExt;

/// Size of an extent header
pub const EXTENT_HEADER: u64 = 16;

/// Size of a list head
pub const LIST_HEAD: u64 = 24;

const END_OF_BLOB: u32 = 1 << 31;
const FREE: u32 = 1 << 30;
const USED_MASK: u32 = FREE - 1;

/// Largest extent handed out in one piece
pub const MAX_EXTENT: u32 = USED_MASK;

/// Decoded extent header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentHeader {
    pub next: u64,
    pub cap: u32,
    pub used: u32,
    pub end_of_blob: bool,
    pub free: bool,
}

impl ExtentHeader {
    pub fn encode(&self) -> [u8; EXTENT_HEADER as usize] {
        let mut ext = self.used & USED_MASK;
        if self.end_of_blob {
            ext |= END_OF_BLOB;
        }
        if self.free {
            ext |= FREE;
        }
        let mut buf = [0u8; EXTENT_HEADER as usize];
        let mut cursor = &mut buf[..];
        cursor.put_u64(self.next);
        cursor.put_u32(self.cap);
        cursor.put_u32(ext);
        buf
    }

    pub fn decode(raw: &[u8]) -> Self {
        let mut cursor = raw;
        let next = cursor.get_u64();
        let cap = cursor.get_u32();
        let ext = cursor.get_u32();
        Self {
            next,
            cap,
            used: ext & USED_MASK,
            end_of_blob: ext & END_OF_BLOB != 0,
            free: ext & FREE != 0,
        }
    }

    /// Read a header from committed data without the pager
    pub fn read_at(file: &File, offset: u64) -> Result<Self> {
        let mut raw = [0u8; EXTENT_HEADER as usize];
        file.read_exact_at(&mut raw, offset)?;
        Ok(Self::decode(&raw))
    }

    /// The 4-byte flags word of a stale extent
    pub fn free_marker(&self) -> [u8; 4] {
        (FREE | (self.used & USED_MASK)).to_be_bytes()
    }
}

/// Location and size of one piece of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub cap: u32,
    pub used: u32,
}

impl Extent {
    pub fn payload_offset(&self) -> u64 {
        self.offset + EXTENT_HEADER
    }

    /// Bytes the extent occupies including its header
    pub fn footprint(&self) -> u64 {
        EXTENT_HEADER + self.cap as u64
    }
}

/// Head of an extent list
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListHead {
    pub first: u64,
    pub last: u64,
    pub total: u64,
}

impl ListHead {
    /// Allocate an empty list head inside the open transaction
    pub fn create(pager: &mut Pager) -> u64 {
        let offset = pager.allocate(LIST_HEAD);
        ListHead::default().write(pager, offset);
        offset
    }

    pub fn read(pager: &Pager, offset: u64) -> Result<Self> {
        let raw = pager.read(offset, LIST_HEAD as usize)?;
        let mut cursor = &raw[..];
        Ok(Self {
            first: cursor.get_u64(),
            last: cursor.get_u64(),
            total: cursor.get_u64(),
        })
    }

    pub fn write(&self, pager: &mut Pager, offset: u64) {
        let mut buf = Vec::with_capacity(LIST_HEAD as usize);
        buf.put_u64(self.first);
        buf.put_u64(self.last);
        buf.put_u64(self.total);
        pager.write(offset, &buf);
    }

    pub fn is_empty(&self) -> bool {
        self.first == 0
    }
}

/// Result of an allocation
#[derive(Debug, Default)]
pub struct Allocation {
    pub extents: Vec<Extent>,
    /// Bytes drawn from the free list, headers included
    pub reclaimed: u64,
}

/// Cover `len` bytes with extents, reusing freed extents first.
pub fn allocate(pager: &mut Pager, free_list: u64, len: u64) -> Result<Allocation> {
    let mut allocation = Allocation::default();
    let mut remaining = len;

    let mut free = ListHead::read(pager, free_list)?;
    while remaining > 0 && !free.is_empty() {
        let offset = free.first;
        let header = ExtentHeader::decode(&pager.read(offset, EXTENT_HEADER as usize)?);
        if header.cap == 0 || header.cap > MAX_EXTENT {
            return Err(BlobError::Corruption(format!(
                "free extent at {} has capacity {}",
                offset, header.cap
            )));
        }

        if offset == free.last {
            free.first = 0;
            free.last = 0;
        } else {
            free.first = header.next;
        }
        let extent = Extent {
            offset,
            cap: header.cap,
            used: remaining.min(header.cap as u64) as u32,
        };
        free.total = free.total.saturating_sub(extent.footprint());
        allocation.reclaimed += extent.footprint();
        remaining -= extent.used as u64;
        allocation.extents.push(extent);
    }
    if allocation.reclaimed > 0 {
        free.write(pager, free_list);
    }

    while remaining > 0 {
        let cap = remaining.min(MAX_EXTENT as u64) as u32;
        let offset = pager.allocate(EXTENT_HEADER + cap as u64);
        allocation.extents.push(Extent {
            offset,
            cap,
            used: cap,
        });
        remaining -= cap as u64;
    }

    Ok(allocation)
}

/// Link `extents` as one blob onto the end of the list at `head`.
pub fn chainify(pager: &mut Pager, head: u64, extents: &[Extent]) -> Result<()> {
    let (first, last) = match (extents.first(), extents.last()) {
        (Some(first), Some(last)) => (first.offset, last.offset),
        _ => return Ok(()),
    };

    for (i, extent) in extents.iter().enumerate() {
        let next = extents.get(i + 1);
        let header = ExtentHeader {
            next: next.map_or(0, |n| n.offset),
            cap: extent.cap,
            used: extent.used,
            end_of_blob: next.is_none(),
            free: false,
        };
        pager.write(extent.offset, &header.encode());
    }

    let mut list = ListHead::read(pager, head)?;
    link_after(pager, &mut list, first);
    list.last = last;
    list.total += extents.iter().map(Extent::footprint).sum::<u64>();
    list.write(pager, head);
    Ok(())
}

/// Move every extent of `list` onto the end of the free list.
pub fn splice(pager: &mut Pager, free_list: u64, list: &ListHead) -> Result<()> {
    if list.is_empty() {
        return Ok(());
    }
    let mut free = ListHead::read(pager, free_list)?;
    link_after(pager, &mut free, list.first);
    free.last = list.last;
    free.total += list.total;
    free.write(pager, free_list);
    Ok(())
}

fn link_after(pager: &mut Pager, list: &mut ListHead, first: u64) {
    if list.is_empty() {
        list.first = first;
    } else {
        pager.write_u64(list.last, first);
    }
}
