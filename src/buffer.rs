// Callback-driven I/O multiplexer for non-blocking TCP services.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License"); you may not use this file except
// in compliance with the License. You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software distributed under the License
// is distributed on an "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express
// or implied. See the License for the specific language governing permissions and limitations under
// the License.

//! Reference-counted byte buffers handed to asynchronous reads and writes.
//!
//! A [`Buffer`] is a window onto shared storage: clones share the bytes, so
//! a buffer held by a pending I/O stays valid however long the operation is
//! parked, and may outlive the socket it was used with. The drainable and
//! growable variants compose by wrapping the same primitive.

use std::ops::Range;
use std::sync::{Arc, Mutex};

/// Shared byte storage plus a `start..end` window onto it.
#[derive(Clone, Debug)]
pub struct Buffer {
    data: Arc<Mutex<Vec<u8>>>,
    start: usize,
    end: usize,
}

impl Buffer {
    /// A zero-initialised buffer of a fixed size.
    pub fn with_size(len: usize) -> Buffer {
        Buffer::from_vec(vec![0; len])
    }

    /// A buffer owning a copy of `bytes`.
    pub fn from_slice(bytes: &[u8]) -> Buffer { Buffer::from_vec(bytes.to_vec()) }

    /// A buffer owning the bytes of `s`.
    pub fn from_string(s: &str) -> Buffer { Buffer::from_slice(s.as_bytes()) }

    fn from_vec(data: Vec<u8>) -> Buffer {
        let end = data.len();
        Buffer { data: Arc::new(Mutex::new(data)), start: 0, end }
    }

    pub fn len(&self) -> usize { self.end - self.start }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// A sub-window relative to this window, sharing the same storage.
    pub fn slice(&self, range: Range<usize>) -> Buffer {
        assert!(range.start <= range.end && range.end <= self.len(), "slice out of range");
        Buffer {
            data: self.data.clone(),
            start: self.start + range.start,
            end: self.start + range.end,
        }
    }

    /// Copies the window contents out.
    pub fn copy_out(&self) -> Vec<u8> {
        self.with_read(self.len(), |bytes| bytes.to_vec())
    }

    /// Copies `src` into the start of the window; `src` must fit.
    pub fn copy_in(&self, src: &[u8]) {
        assert!(src.len() <= self.len(), "source does not fit the buffer window");
        self.with_write(src.len(), |bytes| bytes[..src.len()].copy_from_slice(src));
    }

    /// Locked read access to the first `len` bytes of the window (clamped to
    /// what the storage currently backs).
    pub(crate) fn with_read<R>(&self, len: usize, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.data.lock().expect("buffer mutex poisoned");
        let start = self.start.min(data.len());
        let end = self.end.min(data.len()).min(start + len);
        f(&data[start..end])
    }

    /// Locked write access to the first `len` bytes of the window.
    pub(crate) fn with_write<R>(&self, len: usize, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.data.lock().expect("buffer mutex poisoned");
        let avail = data.len();
        let start = self.start.min(avail);
        let end = self.end.min(avail).min(start + len);
        f(&mut data[start..end])
    }
}

/// A buffer being consumed front-to-back: wraps a [`Buffer`] with a cursor
/// of how many bytes have already been used, exposing the remainder as a
/// fresh window for the next partial write.
#[derive(Debug)]
pub struct DrainableBuffer {
    base: Buffer,
    size: usize,
    consumed: usize,
}

impl DrainableBuffer {
    pub fn new(base: Buffer, size: usize) -> DrainableBuffer {
        assert!(size <= base.len(), "drainable window exceeds the buffer");
        DrainableBuffer { base, size, consumed: 0 }
    }

    /// Window over the not-yet-consumed bytes.
    pub fn remaining(&self) -> Buffer { self.base.slice(self.consumed..self.size) }

    pub fn did_consume(&mut self, bytes: usize) { self.set_offset(self.consumed + bytes); }

    pub fn set_offset(&mut self, bytes: usize) {
        assert!(bytes <= self.size, "consumed past the end of the buffer");
        self.consumed = bytes;
    }

    pub fn bytes_consumed(&self) -> usize { self.consumed }

    pub fn bytes_remaining(&self) -> usize { self.size - self.consumed }

    pub fn size(&self) -> usize { self.size }
}

/// A buffer being filled incrementally: resizable storage with a separate
/// capacity and a read/write offset.
#[derive(Debug)]
pub struct GrowableBuffer {
    data: Arc<Mutex<Vec<u8>>>,
    offset: usize,
}

impl Default for GrowableBuffer {
    fn default() -> Self { GrowableBuffer::new() }
}

impl GrowableBuffer {
    pub fn new() -> GrowableBuffer {
        GrowableBuffer { data: Arc::new(Mutex::new(empty!())), offset: 0 }
    }

    /// Grows or shrinks the storage, preserving data and clamping the offset.
    pub fn set_capacity(&mut self, capacity: usize) {
        self.data.lock().expect("buffer mutex poisoned").resize(capacity, 0);
        if self.offset > capacity {
            self.offset = capacity;
        }
    }

    pub fn capacity(&self) -> usize { self.data.lock().expect("buffer mutex poisoned").len() }

    pub fn set_offset(&mut self, offset: usize) {
        assert!(offset <= self.capacity(), "offset past the buffer capacity");
        self.offset = offset;
    }

    pub fn offset(&self) -> usize { self.offset }

    pub fn remaining_capacity(&self) -> usize { self.capacity() - self.offset }

    /// Window over `offset..capacity`, the span the next read fills.
    pub fn write_window(&self) -> Buffer {
        let capacity = self.capacity();
        Buffer { data: self.data.clone(), start: self.offset, end: capacity }
    }

    /// Window over the whole storage.
    pub fn as_buffer(&self) -> Buffer {
        let capacity = self.capacity();
        Buffer { data: self.data.clone(), start: 0, end: capacity }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sized_and_string_buffers() {
        let b = Buffer::with_size(8);
        assert_eq!(b.len(), 8);
        assert_eq!(b.copy_out(), vec![0; 8]);

        let s = Buffer::from_string("hello");
        assert_eq!(s.len(), 5);
        assert_eq!(s.copy_out(), b"hello");
    }

    #[test]
    fn clones_share_storage() {
        let a = Buffer::with_size(4);
        let b = a.clone();
        a.copy_in(b"abcd");
        assert_eq!(b.copy_out(), b"abcd");
    }

    #[test]
    fn windows_share_storage() {
        let base = Buffer::from_string("abcdef");
        let tail = base.slice(3..6);
        assert_eq!(tail.copy_out(), b"def");
        tail.copy_in(b"xyz");
        assert_eq!(base.copy_out(), b"abcxyz");
    }

    #[test]
    fn drainable_tracks_consumption() {
        let base = Buffer::from_string("abcdef");
        let mut d = DrainableBuffer::new(base, 6);
        assert_eq!(d.bytes_remaining(), 6);
        assert_eq!(d.remaining().copy_out(), b"abcdef");

        d.did_consume(2);
        assert_eq!(d.bytes_consumed(), 2);
        assert_eq!(d.bytes_remaining(), 4);
        assert_eq!(d.remaining().copy_out(), b"cdef");

        d.set_offset(5);
        assert_eq!(d.remaining().copy_out(), b"f");
        d.did_consume(1);
        assert_eq!(d.bytes_remaining(), 0);
        assert!(d.remaining().is_empty());
    }

    #[test]
    fn growable_capacity_and_offset() {
        let mut g = GrowableBuffer::new();
        assert_eq!(g.capacity(), 0);
        assert_eq!(g.remaining_capacity(), 0);

        g.set_capacity(8);
        assert_eq!(g.capacity(), 8);
        assert_eq!(g.remaining_capacity(), 8);

        g.write_window().copy_in(b"abc");
        g.set_offset(3);
        assert_eq!(g.remaining_capacity(), 5);
        assert_eq!(g.write_window().len(), 5);
        assert_eq!(g.as_buffer().slice(0..3).copy_out(), b"abc");

        // shrinking clamps the offset but keeps the prefix
        g.set_capacity(2);
        assert_eq!(g.offset(), 2);
        assert_eq!(g.as_buffer().copy_out(), b"ab");
    }

    #[test]
    fn buffer_outlives_source_window() {
        let window = {
            let owner = Buffer::from_string("persistent");
            owner.slice(0..6)
        };
        assert_eq!(window.copy_out(), b"persis");
    }
}
