//! Argument decomposition for request payloads.
//!
//! Helper to decompose a request's argument payload into typed wire structs,
//! null-terminated strings, and raw byte runs.

use zerocopy::{FromBytes, Immutable, KnownLayout, Unaligned};

/// An iterator that fetches typed arguments from a byte slice.
pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Create a new argument iterator for the given byte slice.
    pub(crate) fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Returns the size of the remaining data.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Fetch a slice of all remaining bytes.
    pub(crate) fn fetch_all(&mut self) -> &'a [u8] {
        let bytes = self.data;
        self.data = &[];
        bytes
    }

    /// Fetch a typed argument. Returns `None` if there's not enough data
    /// left. Wire structs are `Unaligned`, so alignment can never fail.
    pub(crate) fn fetch<T: FromBytes + KnownLayout + Immutable + Unaligned>(
        &mut self,
    ) -> Option<&'a T> {
        match T::ref_from_prefix(self.data) {
            Ok((x, rest)) => {
                self.data = rest;
                Some(x)
            }
            Err(_) => None,
        }
    }

    /// Fetch a run of `count` typed arguments. Returns `None` if there's not
    /// enough data left.
    pub(crate) fn fetch_slice<T: FromBytes + Immutable + Unaligned>(
        &mut self,
        count: usize,
    ) -> Option<&'a [T]> {
        match <[T]>::ref_from_prefix_with_elems(self.data, count) {
            Ok((x, rest)) => {
                self.data = rest;
                Some(x)
            }
            Err(_) => None,
        }
    }

    /// Fetch a zero-terminated byte string. Returns `None` if there's not
    /// enough data left or no zero-termination could be found.
    pub(crate) fn fetch_str(&mut self) -> Option<&'a [u8]> {
        let len = memchr::memchr(0, self.data)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        Some(out)
    }
}
