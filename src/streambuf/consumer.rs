// Event-driven file descriptor I/O with lock-free SPSC stream buffers.
//
// SPDX-License-Identifier: Apache-2.0
//
// Written in 2021-2025 by
//     Dr. Maxim Orlovsky <orlovsky@ubideco.org>
//
// Copyright 2022-2025 UBIDECO Labs, InDCS, Lugano, Switzerland. All Rights reserved.
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

use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release, SeqCst};
use std::sync::Arc;

use super::{release_half, Producer, Shared};
use crate::block::{block_size_for, MemoryBlock, Msg};
use crate::fuzzy::Fuzzy;

/// The read end of a stream buffer.
///
/// Owned by exactly one thread at a time. The get area (current block,
/// read cursor, last seen producer cursor) is private. Blocks are released
/// lazily: only once the cursor moves past their end and a successor is
/// visible.
pub struct Consumer {
    shared: Arc<Shared>,
    block: NonNull<MemoryBlock>,
    gptr: *mut u8,
    egptr: *mut u8,
}

// Single-owner handle; the shared state is built from atomics.
unsafe impl Send for Consumer {}

impl Consumer {
    pub(super) fn new(shared: Arc<Shared>, block: NonNull<MemoryBlock>, start: *mut u8) -> Consumer {
        Consumer {
            shared,
            block,
            gptr: start,
            egptr: start,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> { &self.shared }
    pub(crate) fn block_ptr(&self) -> *const MemoryBlock { self.block.as_ptr() }
    pub(crate) fn gptr(&self) -> *const u8 { self.gptr }

    fn block_start(&self) -> *mut u8 { unsafe { self.block.as_ref().start() } }
    fn block_end(&self) -> *mut u8 { unsafe { self.block.as_ref().end() } }

    /// Bytes already consumed from the head of the current block.
    pub(crate) fn unused_in_first_block(&self) -> usize {
        self.gptr as usize - self.block_start() as usize
    }

    /// Tell the producer where an empty buffer ends, enabling its reset.
    fn publish_empty(&self, at: *mut u8) { self.shared.last_gptr.store(at, Release) }

    /// Re-derive the get area from the producer's published cursor.
    ///
    /// Returns the read position, the contiguous bytes available there,
    /// and whether the area stops at the block end with a successor block
    /// already linked. Handles the reset handshake and advances over fully
    /// consumed blocks; an empty result means the buffer is truly empty
    /// (and the producer has been told so).
    pub(crate) fn refresh_get_area(&mut self) -> (*const u8, usize, bool) {
        loop {
            let mut cursor = self.shared.last_pptr.load(Acquire);
            let start = self.block_start();
            let end = self.block_end();

            if self.shared.resetting.load(Acquire) {
                // Reset cycle. Rewind our view to the block start, clear
                // the handshake bit, then fold the newest producer cursor
                // back into the published one. A publication racing with
                // the clear either went to the shadow slot -- whose SeqCst
                // order places it before our read below -- or went
                // directly to the published cursor, where it defeats the
                // CAS and makes the loop pick it up.
                self.shared.last_gptr.store(start, Relaxed);
                self.shared.resetting.store(false, SeqCst);
                let mut expected = cursor;
                cursor = loop {
                    let newest = self.shared.next_pptr.load(SeqCst);
                    match self
                        .shared
                        .last_pptr
                        .compare_exchange(expected, newest, SeqCst, SeqCst)
                    {
                        Ok(_) => break newest,
                        Err(actual) => expected = actual,
                    }
                };
                self.gptr = start;
                self.egptr = start;
            }

            let in_block = start <= cursor && cursor <= end;
            let limit = if in_block { cursor } else { end };
            debug_assert!(limit as usize >= self.gptr as usize);
            let available = limit as usize - self.gptr as usize;

            if available > 0 {
                self.egptr = limit;
                return (self.gptr, available, !in_block);
            }
            if in_block {
                self.egptr = limit;
                self.publish_empty(self.gptr);
                return (self.gptr, 0, false);
            }

            // The write cursor lives in a later block and this one is
            // fully consumed: move on. A successor must have been linked
            // before that cursor was published.
            let Some(next) = NonNull::new(unsafe { self.block.as_ref().next() }) else {
                unreachable!(
                    "stream buffer chain ended while the write cursor points outside \
                     the last block"
                );
            };
            self.advance_block(next);
        }
    }

    /// Step onto the successor block and release the consumed one.
    fn advance_block(&mut self, next: NonNull<MemoryBlock>) {
        let prev = self.block;
        let start = unsafe { next.as_ref().start() };
        self.block = next;
        self.gptr = start;
        self.egptr = start;
        // last_gptr must leave the old block before it is freed: a stale
        // pointer could otherwise match a recycled allocation and fool the
        // producer's empty-buffer check.
        self.publish_empty(start);
        let freed = self.shared.total_freed.load(Relaxed) + unsafe { prev.as_ref().size() };
        self.shared.total_freed.store(freed, Release);
        unsafe { MemoryBlock::release(prev) };
    }

    /// Move the read cursor over `n` consumed bytes.
    fn bump(&mut self, n: usize) {
        self.gptr = unsafe { self.gptr.add(n) };
        if self.egptr < self.gptr {
            self.egptr = self.gptr;
        }
        let read = self.shared.total_read.load(Relaxed) + n;
        self.shared.total_read.store(read, Release);
    }

    /// Copy up to `dst.len()` bytes out of the buffer; returns how many
    /// were actually available.
    pub fn read_bytes(&mut self, dst: &mut [u8]) -> usize {
        let mut remaining = dst.len();
        let mut out = dst.as_mut_ptr();
        while remaining > 0 {
            let (cur, available, at_end_with_next) = self.refresh_get_area();
            if available == 0 {
                break; // refresh already published the empty state
            }
            let len = available.min(remaining);
            unsafe { ptr::copy_nonoverlapping(cur, out, len) };
            self.bump(len);
            out = unsafe { out.add(len) };
            remaining -= len;
            if len == available {
                if at_end_with_next {
                    let Some(next) = NonNull::new(unsafe { self.block.as_ref().next() }) else {
                        unreachable!("successor vanished from the block chain");
                    };
                    self.advance_block(next);
                } else {
                    // We drained everything published so far.
                    self.publish_empty(self.gptr);
                    break;
                }
            }
        }
        dst.len() - remaining
    }

    /// Put the last consumed byte back into the stream.
    ///
    /// Only the idiom "read one byte, inspect, put it back immediately" is
    /// supported, and only while the byte is still inside the current get
    /// block; anything else is a programming bug and panics.
    pub fn unread_byte(&mut self, byte: u8) {
        assert!(
            self.gptr > self.block_start(),
            "put-back across a block boundary is not supported"
        );
        let pos = unsafe { self.gptr.sub(1) };
        assert!(
            unsafe { ptr::read(pos) } == byte,
            "put-back byte differs from the stream contents"
        );
        self.gptr = pos;
        let read = self.shared.total_read.load(Relaxed) - 1;
        self.shared.total_read.store(read, Release);
        self.publish_empty(self.gptr);
    }

    /// Consumer-side emptiness probe: a non-empty answer is stable, an
    /// empty one may be invalidated by the producer at any moment.
    pub fn nothing_to_get(&self) -> Fuzzy {
        let reference = if self.shared.resetting.load(Acquire) {
            self.block_start()
        } else {
            self.gptr
        };
        if self.shared.last_pptr.load(Acquire) == reference {
            Fuzzy::WasTrue
        } else {
            Fuzzy::False
        }
    }

    /// Whether `len` bytes starting at the read cursor sit inside the
    /// current block.
    pub fn is_contiguous(&self, len: usize) -> bool {
        self.gptr as usize + len <= self.block_end() as usize
    }

    /// Whether this half has fallen behind the put block.
    pub(crate) fn has_multiple_blocks(&self, producer: &Producer) -> bool {
        self.block_ptr() != producer.block_ptr()
    }

    /// Hand out `len` contiguous bytes at the read cursor as a message
    /// borrowing the current block, and consume them.
    pub(crate) fn take_msg(&mut self, len: usize) -> Msg {
        debug_assert!(self.is_contiguous(len));
        let msg = unsafe { Msg::in_block(self.gptr, len, self.block.as_ref()) };
        self.bump(len);
        msg
    }

    /// Copy a block-straddling message of `len` bytes into a fresh single
    /// block so the decoder sees contiguous memory. `None` on allocation
    /// failure.
    pub(crate) fn take_msg_copied(&mut self, len: usize) -> Option<Msg> {
        let block_size = block_size_for(len.max(self.shared.min_block_size));
        let block = MemoryBlock::create(block_size)?;
        let start = unsafe { block.as_ref().start() };
        let mut copied = 0;
        while copied < len {
            let (cur, available, _) = self.refresh_get_area();
            debug_assert!(available > 0, "framed message longer than the buffered data");
            let n = available.min(len - copied);
            unsafe { ptr::copy_nonoverlapping(cur, start.add(copied), n) };
            self.bump(n);
            copied += n;
        }
        let msg = unsafe { Msg::in_block(start, len, block.as_ref()) };
        // The message now owns the only lasting reference.
        unsafe { MemoryBlock::release(block) };
        Some(msg)
    }

    /// Contiguous readable span, for draining the buffer into a `write`
    /// syscall. An empty span means the buffer is empty.
    pub(crate) fn read_span(&mut self) -> (*const u8, usize) {
        let (ptr, available, _) = self.refresh_get_area();
        (ptr, available)
    }

    /// Consume `n` bytes previously obtained through [`Self::read_span`].
    pub(crate) fn consume(&mut self, n: usize) { self.bump(n) }

    /// Shrink an empty buffer back to one minimum-sized block and rewind
    /// all cursors. Both halves must be driven by the calling thread.
    pub(crate) fn reduce_if_empty(&mut self, producer: &mut Producer) {
        if self.gptr != producer.pptr() {
            return;
        }
        debug_assert!(!self.has_multiple_blocks(producer), "empty buffer cannot span blocks");
        // We are both ends at once: cancel any half-done reset handshake
        // and rebuild the cursors from scratch.
        self.shared.resetting.store(false, Relaxed);
        let span = self.unused_in_first_block();
        let size = unsafe { self.block.as_ref().size() };
        let min = self.shared.min_block_size;
        if size > min {
            let Some(block) = MemoryBlock::create(min) else {
                return; // shrinking is best effort
            };
            self.shared
                .total_allocated
                .store(self.shared.total_allocated.load(Relaxed) + min, Relaxed);
            let start = unsafe { block.as_ref().start() };
            let end = unsafe { block.as_ref().end() };
            let old = self.block;
            self.block = block;
            self.gptr = start;
            self.egptr = start;
            producer.set_block(block, start, end);
            self.publish_empty(start);
            let freed = self.shared.total_freed.load(Relaxed) + size;
            self.shared.total_freed.store(freed, Release);
            unsafe { MemoryBlock::release(old) };
            self.shared
                .total_reset
                .store(self.shared.total_reset.load(Relaxed) + span, Relaxed);
            // The retired block counts as fully read: settle the counter
            // so the data-size identity keeps holding at zero.
            let read = self.shared.total_allocated.load(Relaxed) - min
                + self.shared.total_reset.load(Relaxed);
            self.shared.total_read.store(read, Release);
        } else {
            let start = self.block_start();
            self.gptr = start;
            self.egptr = start;
            producer.set_block(self.block, start, unsafe { self.block.as_ref().end() });
            self.publish_empty(start);
            self.shared
                .total_reset
                .store(self.shared.total_reset.load(Relaxed) + span, Relaxed);
        }
        producer.publish_cursor();
    }
}

impl Drop for Consumer {
    fn drop(&mut self) { release_half(&self.shared, Some(self.block)) }
}

#[cfg(test)]
mod tests {
    use super::super::{streambuf, BufferSpec};

    #[test]
    fn reduce_restores_minimum_block() {
        let (mut tx, mut rx) = streambuf(BufferSpec::with_min_block(64));
        let shared = tx.shared().clone();
        let min = shared.min_block_size;
        let data = vec![7u8; 4 * min];
        tx.write_bytes(&data).unwrap();
        let mut out = vec![0u8; data.len()];
        assert_eq!(rx.read_bytes(&mut out), data.len());

        rx.reduce_if_empty(&mut tx);
        assert_eq!(tx.data_size(), 0, "buffer must still read as empty");
        assert_eq!(tx.contiguous(), min, "put area must span one minimum block");
        assert_eq!(tx.put_offset(), 0);

        // The buffer keeps working after the shrink.
        tx.write_bytes(b"post-shrink").unwrap();
        let mut out = [0u8; 16];
        assert_eq!(rx.read_bytes(&mut out), 11);
        assert_eq!(&out[..11], b"post-shrink");
    }

    #[test]
    fn msg_extraction_contiguous_and_copied() {
        let (mut tx, mut rx) = streambuf(BufferSpec::with_min_block(32));
        let mut payload = vec![b'A'; 30];
        payload.push(b'\n');
        payload.extend_from_slice(b"tail\n");
        tx.write_bytes(&payload).unwrap();

        // First message sits inside the first 32-byte block.
        let (_, available, _) = rx.refresh_get_area();
        assert!(available >= 31);
        assert!(rx.is_contiguous(31));
        let msg = rx.take_msg(31);
        assert_eq!(&msg[..30], &payload[..30]);
        assert_eq!(msg[30], b'\n');

        // Second message straddles the block boundary.
        assert!(!rx.is_contiguous(5));
        let msg = rx.take_msg_copied(5).expect("allocation");
        assert_eq!(&*msg, b"tail\n");
        assert_eq!(tx.data_size(), 0);
    }
}
