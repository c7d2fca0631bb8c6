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

use super::{release_half, BufferError, Shared};
use crate::block::{block_size_for, max_block_size_for, MemoryBlock};
use crate::fuzzy::Fuzzy;

/// The write end of a stream buffer.
///
/// Owned by exactly one thread at a time. The put area (current block,
/// write cursor, block end) is private; every write ends by publishing the
/// cursor through the shared state with release ordering, which is the
/// happens-before edge making the bytes visible to the [`super::Consumer`].
pub struct Producer {
    shared: Arc<Shared>,
    block: NonNull<MemoryBlock>,
    pptr: *mut u8,
    epptr: *mut u8,
}

// Single-owner handle; the shared state is built from atomics.
unsafe impl Send for Producer {}

impl Producer {
    pub(super) fn new(
        shared: Arc<Shared>,
        block: NonNull<MemoryBlock>,
        pptr: *mut u8,
        epptr: *mut u8,
    ) -> Producer {
        Producer {
            shared,
            block,
            pptr,
            epptr,
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> { &self.shared }
    pub(crate) fn block_ptr(&self) -> *const MemoryBlock { self.block.as_ptr() }
    pub(crate) fn pptr(&self) -> *mut u8 { self.pptr }

    /// Offset of the write cursor within the current block.
    pub(crate) fn put_offset(&self) -> usize {
        self.pptr as usize - self.block_start() as usize
    }

    fn block_start(&self) -> *mut u8 { unsafe { self.block.as_ref().start() } }

    /// Unused bytes at the tail of the put block.
    fn unused(&self) -> usize { self.epptr as usize - self.pptr as usize }

    /// Publish the write cursor. The shadow slot is kept fresh
    /// unconditionally; the consumer-visible cursor is only advanced
    /// outside a reset window (the consumer re-syncs it when it
    /// acknowledges the reset).
    fn sync_cursor(&self, cursor: *mut u8) {
        self.shared.next_pptr.store(cursor, SeqCst);
        if !self.shared.resetting.load(SeqCst) {
            self.shared.last_pptr.store(cursor, Release);
        }
    }

    /// Rewind the put area when both ends agree the buffer is empty, then
    /// return the contiguous room left in the put block.
    fn update_put_area(&mut self) -> usize {
        let start = self.block_start();
        if self.pptr != start
            && !self.shared.resetting.load(Relaxed)
            && !self.shared.last_pptr.load(Relaxed).is_null()
            && self.pptr == self.shared.last_gptr.load(Acquire)
        {
            // The consumer read everything we published and told us so via
            // last_gptr. Seed the reset target, raise the handshake bit,
            // and reuse the block from its start.
            self.shared.next_pptr.store(start, Relaxed);
            self.shared.resetting.store(true, Release);
            let span = self.pptr as usize - start as usize;
            self.shared.total_reset.store(self.shared.total_reset.load(Relaxed) + span, Relaxed);
            self.pptr = start;
        }
        self.unused()
    }

    /// Move the cursor over `n` freshly written bytes and publish it.
    fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.unused());
        self.pptr = unsafe { self.pptr.add(n) };
        self.sync_cursor(self.pptr);
    }

    /// Append a block to the chain, sized from the current amount of
    /// buffered data and capped by the allocation limit.
    fn grow(&mut self) -> Result<(), BufferError> {
        let mut block_size = self.new_block_size();
        let held = self.shared.allocated_upper_bound();
        if held + block_size > self.shared.max_alloc {
            block_size = max_block_size_for(self.shared.max_alloc.saturating_sub(held));
            if block_size < self.shared.min_block_size {
                self.shared.buffer_was_full.store(true, Relaxed);
                return Err(BufferError::Full);
            }
        }
        let block = MemoryBlock::create(block_size).ok_or(BufferError::OutOfMemory)?;
        self.shared
            .total_allocated
            .store(self.shared.total_allocated.load(Relaxed) + block_size, Relaxed);
        let start = unsafe { block.as_ref().start() };
        let end = unsafe { block.as_ref().end() };
        // Link the successor first: the consumer is guaranteed not to read
        // it before the cursor published below.
        unsafe { self.block.as_ref().set_next(block) };
        self.pptr = start;
        self.epptr = end;
        self.sync_cursor(start);
        self.block = block;
        Ok(())
    }

    fn new_block_size(&self) -> usize {
        block_size_for(self.data_size_upper_bound().max(self.shared.min_block_size))
    }

    /// Copy up to `data.len()` bytes into the buffer.
    ///
    /// Returns the number of bytes accepted, which is short of the input
    /// when the allocation cap is reached; errs only when nothing at all
    /// could be written.
    pub fn write_bytes(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        let mut remaining = data.len();
        let mut src = data.as_ptr();
        while remaining > 0 {
            let available = self.update_put_area();
            if available > 0 {
                let len = available.min(remaining);
                // Bytes must land in memory before the cursor moves.
                unsafe { ptr::copy_nonoverlapping(src, self.pptr, len) };
                self.advance(len);
                src = unsafe { src.add(len) };
                remaining -= len;
            }
            if remaining > 0 {
                if let Err(err) = self.grow() {
                    let written = data.len() - remaining;
                    return if written == 0 { Err(err) } else { Ok(written) };
                }
            }
        }
        Ok(data.len())
    }

    /// Contiguous room at the write cursor right now.
    pub fn contiguous(&self) -> usize { self.unused() }

    /// Like [`Self::contiguous`], but rewinds or grows the buffer when the
    /// put block is exhausted. Returns `Ok(0)` only when the allocation
    /// cap refuses another block.
    pub fn contiguous_forced(&mut self) -> Result<usize, BufferError> {
        let available = self.update_put_area();
        if available > 0 {
            return Ok(available);
        }
        match self.grow() {
            Ok(()) => Ok(self.unused()),
            Err(BufferError::Full) => Ok(0),
            Err(err) => Err(err),
        }
    }

    /// Raw write position for filling the put area directly (e.g. from a
    /// `read` syscall).
    pub fn put_ptr(&self) -> *mut u8 { self.pptr }

    /// Publish `n` bytes which have already been written at
    /// [`Self::put_ptr`].
    ///
    /// # Safety
    ///
    /// The caller must have initialized exactly `n` bytes at the write
    /// position, with `n` no larger than [`Self::contiguous`].
    pub unsafe fn commit(&mut self, n: usize) { self.advance(n) }

    /// Bytes currently buffered, as an upper bound (the consumer may be
    /// draining concurrently).
    pub fn data_size_upper_bound(&self) -> usize {
        self.shared.total_allocated.load(Relaxed) - self.unused()
            + self.shared.total_reset.load(Relaxed)
            - self.shared.total_read.load(Acquire)
    }

    /// Exact byte count; only meaningful when the calling thread is also
    /// the consumer.
    pub fn data_size(&self) -> usize {
        self.shared.total_allocated.load(Relaxed) - self.unused()
            + self.shared.total_reset.load(Relaxed)
            - self.shared.total_read.load(Relaxed)
    }

    /// Whether the buffered amount reached the configured watermark.
    pub fn buffer_full(&self) -> bool {
        self.data_size_upper_bound() >= self.shared.full_watermark
    }

    /// Producer-side emptiness probe. An empty answer is stable (only this
    /// thread can add data); a non-empty one is already fuzzy by the time
    /// the caller looks at it.
    pub fn nothing_to_get(&self) -> Fuzzy {
        if self.shared.resetting.load(Acquire) {
            return if self.put_offset() == 0 { Fuzzy::True } else { Fuzzy::WasFalse };
        }
        let last_pptr = self.shared.last_pptr.load(Relaxed);
        let last_gptr = self.shared.last_gptr.load(Acquire);
        if !last_pptr.is_null() && last_pptr == last_gptr {
            Fuzzy::True
        } else {
            Fuzzy::WasFalse
        }
    }

    pub(crate) fn set_block(&mut self, block: NonNull<MemoryBlock>, pptr: *mut u8, epptr: *mut u8) {
        self.block = block;
        self.pptr = pptr;
        self.epptr = epptr;
    }

    pub(crate) fn publish_cursor(&self) { self.sync_cursor(self.pptr) }
}

impl Drop for Producer {
    fn drop(&mut self) { release_half(&self.shared, None) }
}
