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

//! Reference-counted memory blocks backing stream buffers, and the [`Msg`]
//! view type handed to protocol decoders.

use std::alloc::{alloc, dealloc, Layout};
use std::fmt::{self, Debug, Formatter};
use std::mem::{align_of, size_of};
use std::ops::Deref;
use std::ptr::{self, NonNull};
use std::slice;
use std::sync::atomic::{fence, AtomicPtr, AtomicU32, Ordering};

/// Heap overhead of one allocation, in bytes. Matches the glibc chunk
/// header so that header + data + overhead lands exactly on an allocator
/// size class.
pub(crate) const ALLOC_OVERHEAD: usize = size_of::<usize>();

/// Size of the in-band [`MemoryBlock`] header preceding the data area.
pub(crate) const BLOCK_HEADER: usize = size_of::<MemoryBlock>();

/// Round `requested` (a gross size including [`BLOCK_HEADER`]) to the
/// nearest allocator-friendly usable size: together with [`ALLOC_OVERHEAD`]
/// the allocation is a power of two up to one page, and a page multiple
/// beyond that.
pub(crate) fn malloc_size(requested: usize) -> usize {
    let gross = (requested + ALLOC_OVERHEAD).max(64);
    let rounded = if gross <= 4096 { gross.next_power_of_two() } else { (gross + 4095) & !4095 };
    rounded - ALLOC_OVERHEAD
}

/// Net data capacity of a block whose payload must hold at least `data`
/// bytes.
pub(crate) fn block_size_for(data: usize) -> usize {
    malloc_size(data + BLOCK_HEADER) - BLOCK_HEADER
}

/// Largest pre-rounded data capacity whose whole allocation fits within
/// `room + BLOCK_HEADER` bytes; zero when not even an empty block fits.
pub(crate) fn max_block_size_for(room: usize) -> usize {
    let gross_cap = room + BLOCK_HEADER + ALLOC_OVERHEAD;
    if gross_cap < 64 {
        return 0;
    }
    let gross = if gross_cap >= 4096 {
        gross_cap & !4095
    } else {
        1usize << (usize::BITS - 1 - gross_cap.leading_zeros())
    };
    (gross - ALLOC_OVERHEAD).saturating_sub(BLOCK_HEADER)
}

/// A reference-counted contiguous byte block, linked into a singly-linked
/// chain by the stream buffer producer.
///
/// The header is placed at the start of a single heap allocation; the data
/// area follows immediately after it. Once a block is linked into a chain
/// its `next` pointer is written exactly once (by the producer) and read by
/// the consumer only after the producer published a release store on the
/// shared write cursor.
#[repr(C)]
pub(crate) struct MemoryBlock {
    count: AtomicU32,
    block_size: usize,
    next: AtomicPtr<MemoryBlock>,
}

impl MemoryBlock {
    /// Allocate a block with a reference count of one and no successor.
    ///
    /// `block_size` must come from [`block_size_for`] so the allocation
    /// matches what the allocator hands out anyway.
    pub(crate) fn create(block_size: usize) -> Option<NonNull<MemoryBlock>> {
        debug_assert!(
            (BLOCK_HEADER + block_size + ALLOC_OVERHEAD).is_power_of_two()
                || (BLOCK_HEADER + block_size + ALLOC_OVERHEAD) % 4096 == 0,
            "block size {block_size} was not pre-rounded"
        );
        let layout = Self::layout(block_size);
        let raw = unsafe { alloc(layout) } as *mut MemoryBlock;
        let block = NonNull::new(raw)?;
        unsafe {
            ptr::write(block.as_ptr(), MemoryBlock {
                count: AtomicU32::new(1),
                block_size,
                next: AtomicPtr::new(ptr::null_mut()),
            });
        }
        Some(block)
    }

    fn layout(block_size: usize) -> Layout {
        // Alignment of the header also aligns the data area, since the
        // header size is a multiple of the pointer size.
        Layout::from_size_align(BLOCK_HEADER + block_size, align_of::<MemoryBlock>())
            .expect("block size overflows usize")
    }

    pub(crate) fn add_ref(&self) { self.count.fetch_add(1, Ordering::Relaxed); }

    /// Drop one reference; frees the allocation when the last one goes.
    ///
    /// # Safety
    ///
    /// `block` must come from [`MemoryBlock::create`] and the caller must
    /// own one reference which it gives up with this call.
    pub(crate) unsafe fn release(block: NonNull<MemoryBlock>) {
        if block.as_ref().count.fetch_sub(1, Ordering::Release) == 1 {
            fence(Ordering::Acquire);
            let block_size = block.as_ref().block_size;
            dealloc(block.as_ptr() as *mut u8, Self::layout(block_size));
        }
    }

    /// First byte of the data area.
    pub(crate) fn start(&self) -> *mut u8 {
        (self as *const MemoryBlock as *mut u8).wrapping_add(BLOCK_HEADER)
    }

    /// One past the last byte of the data area.
    pub(crate) fn end(&self) -> *mut u8 { self.start().wrapping_add(self.block_size) }

    pub(crate) fn size(&self) -> usize { self.block_size }

    pub(crate) fn next(&self) -> *mut MemoryBlock { self.next.load(Ordering::Acquire) }

    /// Link the successor block. Written exactly once per block, by the
    /// producer, before the write cursor covering the successor is
    /// published.
    pub(crate) fn set_next(&self, next: NonNull<MemoryBlock>) {
        debug_assert!(self.next.load(Ordering::Relaxed).is_null(), "block successor relinked");
        self.next.store(next.as_ptr(), Ordering::Release);
    }
}

/// A complete message framed by a decoder, viewed as a byte slice.
///
/// A `Msg` borrows a span inside a [`MemoryBlock`] and keeps that block
/// alive past its release by the stream buffer. Only the consumer thread
/// creates messages, but a decoder may move one to another thread.
pub struct Msg {
    start: *const u8,
    len: usize,
    block: Option<NonNull<MemoryBlock>>,
}

// The span is immutable and block reference counting is atomic.
unsafe impl Send for Msg {}
unsafe impl Sync for Msg {}

impl Msg {
    /// View over a span inside `block`; bumps the block reference count.
    pub(crate) fn in_block(start: *const u8, len: usize, block: &MemoryBlock) -> Msg {
        debug_assert!(
            start as usize >= block.start() as usize
                && start as usize + len <= block.end() as usize,
            "message span escapes its memory block"
        );
        block.add_ref();
        Msg {
            start,
            len,
            block: Some(NonNull::from(block)),
        }
    }

    pub fn len(&self) -> usize { self.len }
    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn as_bytes(&self) -> &[u8] {
        if self.len == 0 {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.start, self.len) }
    }

    /// Shrink the view from the front, e.g. to drop framing bytes.
    pub fn remove_prefix(&mut self, n: usize) {
        assert!(n <= self.len, "prefix longer than the message");
        self.start = self.start.wrapping_add(n);
        self.len -= n;
    }

    /// Shrink the view from the back.
    pub fn remove_suffix(&mut self, n: usize) {
        assert!(n <= self.len, "suffix longer than the message");
        self.len -= n;
    }
}

impl Deref for Msg {
    type Target = [u8];

    fn deref(&self) -> &[u8] { self.as_bytes() }
}

impl AsRef<[u8]> for Msg {
    fn as_ref(&self) -> &[u8] { self.as_bytes() }
}

impl Drop for Msg {
    fn drop(&mut self) {
        if let Some(block) = self.block {
            unsafe { MemoryBlock::release(block) }
        }
    }
}

impl Debug for Msg {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Msg({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn malloc_rounding() {
        // Small requests snap to powers of two including the allocator
        // overhead; large ones to page multiples.
        for requested in [1usize, 24, 100, 512, 1000, 4000, 5000, 100_000] {
            let usable = malloc_size(requested);
            assert!(usable >= requested);
            let gross = usable + ALLOC_OVERHEAD;
            assert!(gross.is_power_of_two() || gross % 4096 == 0, "gross = {gross}");
        }
        let net = block_size_for(256);
        assert!(net >= 256);
    }

    #[test]
    fn block_lifecycle() {
        let size = block_size_for(256);
        let block = MemoryBlock::create(size).expect("allocation");
        unsafe {
            assert_eq!(block.as_ref().size(), size);
            assert!(block.as_ref().next().is_null());
            assert_eq!(block.as_ref().end() as usize - block.as_ref().start() as usize, size);
            block.as_ref().add_ref();
            MemoryBlock::release(block);
            // Still alive: the data area stays accessible.
            ptr::write(block.as_ref().start(), 0xA5);
            assert_eq!(ptr::read(block.as_ref().start()), 0xA5);
            MemoryBlock::release(block);
        }
    }

    #[test]
    fn msg_keeps_block_alive() {
        let size = block_size_for(64);
        let block = MemoryBlock::create(size).expect("allocation");
        let msg = unsafe {
            let start = block.as_ref().start();
            ptr::copy_nonoverlapping(b"hello\n".as_ptr(), start, 6);
            Msg::in_block(start, 6, block.as_ref())
        };
        // The buffer's own reference goes away; the message still reads.
        unsafe { MemoryBlock::release(block) };
        assert_eq!(&*msg, b"hello\n");
        let mut msg = msg;
        msg.remove_suffix(1);
        assert_eq!(msg.as_bytes(), b"hello");
        msg.remove_prefix(4);
        assert_eq!(msg.as_bytes(), b"o");
    }
}
