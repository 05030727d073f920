// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Flat byte codec for turning in-memory state into a record and back.
//!
//! Values are appended as their raw in-memory bytes, so a blob is only
//! meaningful to a build with the same layout and endianness. Reads are
//! forgiving: a read past the end of the buffer does nothing rather than
//! failing, which lets a newer build restore an older, shorter blob but also
//! means a truncated blob is silently accepted.

use core::mem::size_of;
use alloc::string::String;
use alloc::vec::Vec;
use zerocopy::{AsBytes, FromBytes};

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Codec {
    buffer: Vec<u8>,
    cursor: usize,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends the raw bytes of `value`.
    pub fn push<T: AsBytes>(&mut self, value: T) {
        self.push_raw(value.as_bytes());
    }

    pub fn push_raw(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Appends a `u32` length followed by the bytes of `s`.
    pub fn push_string(&mut self, s: &str) {
        let len = u32::try_from(s.len()).expect("string too long");
        self.push(len);
        self.push_raw(s.as_bytes());
    }

    /// Takes `n` bytes at the cursor, or nothing if fewer remain.
    fn take(&mut self, n: usize) -> Option<&[u8]> {
        let start = self.cursor;
        let end = start.checked_add(n).filter(|&end| end <= self.buffer.len())?;
        self.cursor = end;
        Some(&self.buffer[start..end])
    }

    /// Copies the next `dest.len()` bytes into `dest`. If that many bytes
    /// don't remain, `dest` and the cursor are left alone and this returns
    /// `false`.
    pub fn pull_raw(&mut self, dest: &mut [u8]) -> bool {
        match self.take(dest.len()) {
            Some(bytes) => {
                dest.copy_from_slice(bytes);
                true
            }
            None => false,
        }
    }

    /// Overwrites `dest` with the next value, unless the buffer runs out, in
    /// which case `dest` keeps whatever it held.
    pub fn pull_into<T: AsBytes + FromBytes>(&mut self, dest: &mut T) -> bool {
        self.pull_raw(dest.as_bytes_mut())
    }

    /// Reads the next value, or the all-zero value if the buffer runs out.
    pub fn pull<T: FromBytes>(&mut self) -> T {
        self.take(size_of::<T>())
            .and_then(T::read_from)
            .unwrap_or_else(T::new_zeroed)
    }

    /// Reads a length-prefixed string. Gives an empty string if the length or
    /// the bytes it promises are missing, or if the bytes aren't UTF-8; in the
    /// last two cases the length is still consumed.
    pub fn pull_string(&mut self) -> String {
        let mut len = 0u32;
        self.pull_into(&mut len);
        match self.take(len as usize) {
            Some(bytes) => String::from_utf8(bytes.to_vec()).unwrap_or_default(),
            None => String::new(),
        }
    }

    /// Discards all content.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.cursor = 0;
    }

    /// Moves the read cursor back to the start.
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    /// Replaces the content with `bytes`, ready to be read from the start.
    pub fn load_bytes(&mut self, bytes: &[u8]) {
        self.buffer.clear();
        self.buffer.extend_from_slice(bytes);
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Bytes left between the cursor and the end.
    pub fn remaining(&self) -> usize {
        self.buffer.len() - self.cursor
    }
}

impl From<Vec<u8>> for Codec {
    fn from(buffer: Vec<u8>) -> Self {
        Self { buffer, cursor: 0 }
    }
}

/// State that can be written into, and read back out of, a `Codec`.
///
/// `restore` must pull exactly what `save` pushed, in the same order, since
/// objects are stored back to back with nothing delimiting them.
pub trait Persistable {
    fn save(&self, codec: &mut Codec);
    fn restore(&mut self, codec: &mut Codec);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_and_strings() {
        let mut codec = Codec::new();
        codec.push(42u32);
        codec.push_string("hi");
        codec.reset_cursor();

        assert_eq!(codec.pull::<u32>(), 42);
        assert_eq!(codec.pull_string(), "hi");
        assert_eq!(codec.remaining(), 0);
    }

    #[test]
    fn string_layout_is_length_prefixed() {
        let mut codec = Codec::new();
        codec.push_string("abc");
        let mut expected = 3u32.to_ne_bytes().to_vec();
        expected.extend_from_slice(b"abc");
        assert_eq!(codec.as_bytes(), &expected[..]);
    }

    #[test]
    fn mixed_types_in_order() {
        let mut codec = Codec::new();
        codec.push(1.5f32);
        codec.push(-3i16);
        codec.push([7u8; 3]);
        codec.push(u64::MAX);
        assert_eq!(codec.len(), 4 + 2 + 3 + 8);

        let mut copy = Codec::from(codec.as_bytes().to_vec());
        assert_eq!(copy.pull::<f32>(), 1.5);
        assert_eq!(copy.pull::<i16>(), -3);
        assert_eq!(copy.pull::<[u8; 3]>(), [7; 3]);
        assert_eq!(copy.pull::<u64>(), u64::MAX);
    }

    #[test]
    fn short_read_leaves_destination_and_cursor() {
        let mut codec = Codec::new();
        codec.push(9u16);
        codec.reset_cursor();

        let mut wide = 0xDEAD_BEEFu32;
        assert!(!codec.pull_into(&mut wide));
        assert_eq!(wide, 0xDEAD_BEEF);
        assert_eq!(codec.remaining(), 2);

        let mut narrow = 0u16;
        assert!(codec.pull_into(&mut narrow));
        assert_eq!(narrow, 9);

        // Past the end, `pull` falls back to zero.
        assert_eq!(codec.pull::<u16>(), 0);
    }

    #[test]
    fn short_string_payload_consumes_length() {
        let mut codec = Codec::new();
        codec.push(10u32);
        codec.push_raw(b"abc");
        codec.reset_cursor();

        assert_eq!(codec.pull_string(), "");
        assert_eq!(codec.remaining(), 3);
    }

    #[test]
    fn missing_string_length() {
        let mut codec = Codec::new();
        codec.push_raw(&[1, 2]);
        codec.reset_cursor();

        assert_eq!(codec.pull_string(), "");
        assert_eq!(codec.remaining(), 2);
    }

    #[test]
    fn load_and_clear() {
        let mut codec = Codec::new();
        codec.push(1u8);
        codec.pull::<u8>();

        codec.load_bytes(&[5, 0, 0, 0]);
        assert_eq!(codec.remaining(), 4);
        assert_eq!(codec.pull::<u32>(), u32::from_ne_bytes([5, 0, 0, 0]));

        codec.clear();
        assert!(codec.is_empty());
        assert_eq!(codec.remaining(), 0);
    }
}
