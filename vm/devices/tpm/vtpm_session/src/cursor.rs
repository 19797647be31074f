// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Bounds-tracking writer over a caller-supplied output buffer.
//!
//! Callers compute the required size up front and fail with a
//! `BufferTooSmall` error before constructing a writer, so running past the
//! end of the buffer here is a bug in this crate and panics.

use zerocopy::Immutable;
use zerocopy::IntoBytes;

pub(crate) struct BufWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> BufWriter<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn written(&self) -> usize {
        self.pos
    }

    /// Hands out the next `len` bytes for the caller to fill in place.
    pub fn reserve(&mut self, len: usize) -> &mut [u8] {
        assert!(
            len <= self.remaining(),
            "writer overrun: {len} bytes requested, {} remaining",
            self.remaining()
        );
        let start = self.pos;
        self.pos += len;
        &mut self.buf[start..self.pos]
    }

    pub fn put(&mut self, data: &[u8]) {
        self.reserve(data.len()).copy_from_slice(data);
    }

    pub fn put_obj<T: IntoBytes + Immutable>(&mut self, obj: &T) {
        self.put(obj.as_bytes());
    }

    pub fn put_zeros(&mut self, len: usize) {
        self.reserve(len).fill(0);
    }
}

/// Rounds `len` up to `alignment`, which must be a power of two.
pub(crate) fn align_up(len: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two());
    (len + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_position() {
        let mut buf = [0xffu8; 8];
        let mut writer = BufWriter::new(&mut buf);
        writer.put(&[1, 2]);
        writer.put_zeros(2);
        writer.reserve(1)[0] = 5;
        assert_eq!(writer.written(), 5);
        assert_eq!(writer.remaining(), 3);
        assert_eq!(buf[..6], [1, 2, 0, 0, 5, 0xff]);
    }

    #[test]
    #[should_panic(expected = "writer overrun")]
    fn overrun_panics() {
        let mut buf = [0u8; 2];
        BufWriter::new(&mut buf).put(&[1, 2, 3]);
    }

    #[test]
    fn alignment() {
        assert_eq!(align_up(0, 4), 0);
        assert_eq!(align_up(5, 4), 8);
        assert_eq!(align_up(8, 4), 8);
        assert_eq!(align_up(7, 1), 7);
    }
}
