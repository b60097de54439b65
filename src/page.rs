//! Page-level I/O helpers.
//!
//! pgread and pgwrite move data in 4096-byte pages, each protected by a
//! CRC32C. This module owns the segmentation math (a pgwrite may start and
//! end with short page fragments), the per-request accumulator of failed
//! checksums, and the per-file book of offsets still awaiting correction.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use zerocopy::IntoBytes;
use zerocopy::byteorder::big_endian::{I16, I64, U32};

use crate::ll::wire::{CRC_LEN, PAGE_BITS, PAGE_SIZE, PGW_MAX_EOS, PGW_MAX_EPR, PgWriteCse};

/// CRC32C over a byte run.
pub fn crc32c_of(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Split a pgwrite of `dlen` payload bytes at `offset` into its wire units.
///
/// Each unit on the wire is a 4-byte CRC followed by that unit's data bytes.
/// The first unit is short when the offset is not page aligned; the last may
/// be short as well but must still carry at least one data byte.
pub fn pgw_layout(offset: i64, dlen: usize) -> Result<Vec<(i64, usize)>, &'static str> {
    if dlen <= CRC_LEN {
        return Err("pgwrite length is too short");
    }
    let mut segs = Vec::new();
    let mut at = offset;
    let mut remaining = dlen;

    let pg_off = (offset & ((PAGE_SIZE as i64) - 1)) as usize;
    if pg_off != 0 {
        let first = (PAGE_SIZE - pg_off).min(remaining - CRC_LEN);
        segs.push((at, first));
        at += first as i64;
        remaining -= first + CRC_LEN;
    }
    while remaining >= PAGE_SIZE + CRC_LEN {
        segs.push((at, PAGE_SIZE));
        at += PAGE_SIZE as i64;
        remaining -= PAGE_SIZE + CRC_LEN;
    }
    if remaining > 0 {
        if remaining <= CRC_LEN {
            return Err("pgwrite last segment too short");
        }
        segs.push((at, remaining - CRC_LEN));
    }
    Ok(segs)
}

/// Per-request accumulator of failing pages, emitted as the trailing
/// corrective record on the final pgwrite response.
#[derive(Debug, Default)]
pub struct BadCsAccum {
    offs: Vec<i64>,
    dl_first: i16,
    dl_last: i16,
}

impl BadCsAccum {
    pub fn new() -> BadCsAccum {
        BadCsAccum::default()
    }

    pub fn count(&self) -> usize {
        self.offs.len()
    }

    /// Record one failing page. `dlen` is the in-page length actually
    /// written, short only for edge fragments.
    pub fn add(&mut self, book: &PgwBook, offset: i64, dlen: usize) -> Result<(), &'static str> {
        if self.offs.is_empty() {
            self.dl_first = dlen as i16;
        }
        self.dl_last = dlen as i16;
        if self.offs.len() + 1 >= PGW_MAX_EPR {
            return Err("Too many checksum errors in request");
        }
        self.offs.push(offset);
        if !book.add_offs(offset, dlen) {
            return Err("Too many uncorrected checksum errors in file");
        }
        Ok(())
    }

    /// Serialize the corrective record, or `None` when every page passed.
    /// The leading CRC covers the lengths and the offset vector.
    pub fn info(&self) -> Option<Vec<u8>> {
        if self.offs.is_empty() {
            return None;
        }
        let mut body = Vec::with_capacity(size_of::<PgWriteCse>() + self.offs.len() * 8);
        let cse = PgWriteCse {
            cse_crc: U32::new(0),
            dl_first: I16::new(self.dl_first),
            dl_last: I16::new(self.dl_last),
        };
        body.extend_from_slice(cse.as_bytes());
        for off in &self.offs {
            body.extend_from_slice(I64::new(*off).as_bytes());
        }
        let crc = crc32c_of(&body[CRC_LEN..]);
        body[..CRC_LEN].copy_from_slice(&crc.to_be_bytes());
        Some(body)
    }
}

fn pack_offs(offset: i64, dlen: usize) -> i64 {
    let mut key = offset << PAGE_BITS;
    if dlen < PAGE_SIZE {
        key |= dlen as i64;
    }
    key
}

/// Per-file record of page offsets whose client-supplied checksum failed.
/// Ordered so retry vectors come out deterministically sorted. Entries stay
/// until the client resubmits the page with a valid checksum.
#[derive(Debug, Default)]
pub struct PgwBook {
    inner: Mutex<BookInner>,
}

#[derive(Debug, Default)]
struct BookInner {
    offs: BTreeSet<i64>,
    num_errs: u32,
    num_fixed: u32,
}

impl PgwBook {
    pub fn new() -> PgwBook {
        PgwBook::default()
    }

    /// Returns false once the per-file cap is breached.
    pub fn add_offs(&self, offset: i64, dlen: usize) -> bool {
        let mut inner = self.inner.lock();
        inner.offs.insert(pack_offs(offset, dlen));
        inner.num_errs += 1;
        inner.offs.len() <= PGW_MAX_EOS
    }

    /// Returns true if the offset was present (a correction landed).
    pub fn del_offs(&self, offset: i64, dlen: usize) -> bool {
        let mut inner = self.inner.lock();
        let hit = inner.offs.remove(&pack_offs(offset, dlen));
        if hit {
            inner.num_fixed += 1;
        }
        hit
    }

    pub fn has_offs(&self, offset: i64, dlen: usize) -> bool {
        self.inner.lock().offs.contains(&pack_offs(offset, dlen))
    }

    pub fn num_offs(&self) -> usize {
        self.inner.lock().offs.len()
    }

    /// (errors recorded, corrections applied, still uncorrected).
    pub fn counts(&self) -> (u32, u32, usize) {
        let inner = self.inner.lock();
        (inner.num_errs, inner.num_fixed, inner.offs.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_layout_is_full_pages() {
        let segs = pgw_layout(8192, 3 * (PAGE_SIZE + CRC_LEN)).unwrap();
        assert_eq!(
            segs,
            vec![(8192, PAGE_SIZE), (12288, PAGE_SIZE), (16384, PAGE_SIZE)]
        );
    }

    #[test]
    fn unaligned_start_yields_short_first_segment() {
        let segs = pgw_layout(100, (PAGE_SIZE - 100 + CRC_LEN) + (PAGE_SIZE + CRC_LEN)).unwrap();
        assert_eq!(segs, vec![(100, PAGE_SIZE - 100), (4096, PAGE_SIZE)]);
    }

    #[test]
    fn short_last_segment() {
        let segs = pgw_layout(0, (PAGE_SIZE + CRC_LEN) + (10 + CRC_LEN)).unwrap();
        assert_eq!(segs, vec![(0, PAGE_SIZE), (PAGE_SIZE as i64, 10)]);
    }

    #[test]
    fn tiny_unaligned_write_fits_one_fragment() {
        let segs = pgw_layout(4000, 50 + CRC_LEN).unwrap();
        assert_eq!(segs, vec![(4000, 50)]);
    }

    #[test]
    fn degenerate_lengths_are_rejected() {
        assert!(pgw_layout(0, 0).is_err());
        assert!(pgw_layout(0, CRC_LEN).is_err());
        assert!(pgw_layout(0, PAGE_SIZE + CRC_LEN + CRC_LEN).is_err());
    }

    #[test]
    fn accum_serializes_sorted_record_with_crc() {
        let book = PgwBook::new();
        let mut accum = BadCsAccum::new();
        accum.add(&book, 8192, PAGE_SIZE).unwrap();
        let info = accum.info().unwrap();
        assert_eq!(info.len(), 8 + 8);
        let crc = u32::from_be_bytes([info[0], info[1], info[2], info[3]]);
        assert_eq!(crc, crc32c_of(&info[4..]));
        assert_eq!(i16::from_be_bytes([info[4], info[5]]), PAGE_SIZE as i16);
        assert_eq!(
            i64::from_be_bytes(info[8..16].try_into().unwrap()),
            8192
        );
    }

    #[test]
    fn book_correction_clears_entry() {
        let book = PgwBook::new();
        assert!(book.add_offs(8192, PAGE_SIZE));
        assert!(book.has_offs(8192, PAGE_SIZE));
        assert!(book.del_offs(8192, PAGE_SIZE));
        assert!(!book.has_offs(8192, PAGE_SIZE));
        assert_eq!(book.num_offs(), 0);
        assert_eq!(book.counts(), (1, 1, 0));
    }

    #[test]
    fn short_fragments_key_separately_from_full_pages() {
        let book = PgwBook::new();
        book.add_offs(0, 100);
        assert!(!book.has_offs(0, PAGE_SIZE));
        assert!(book.has_offs(0, 100));
    }
}
