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

//! Single-producer / single-consumer byte stream over a linked chain of
//! reference-counted memory blocks.
//!
//! A buffer is created with [`streambuf`], which returns the two typed
//! halves, in the way channel constructors hand out their endpoints:
//!
//! ```
//! use eventio::streambuf::{streambuf, BufferSpec};
//!
//! let (mut tx, mut rx) = streambuf(BufferSpec::with_min_block(256));
//! tx.write_bytes(b"hello").unwrap();
//! let mut out = [0u8; 16];
//! assert_eq!(rx.read_bytes(&mut out), 5);
//! assert_eq!(&out[..5], b"hello");
//! ```
//!
//! Each half may be used from exactly one thread at a time; the two
//! threads never take a lock against each other. Data is never moved:
//! writers fill the current put block, readers walk the chain and drop
//! blocks lazily. When both ends agree the buffer is empty, the producer
//! rewinds its cursor to the block start instead of allocating, using an
//! atomic handshake the consumer acknowledges on its next read (the reset
//! cycle).

mod consumer;
mod producer;

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

pub use consumer::Consumer;
pub use producer::Producer;

use crate::block::{block_size_for, MemoryBlock};

/// Default minimum block size, in bytes, before allocator rounding.
pub const DEFAULT_MIN_BLOCK: usize = 512;

/// Errors of stream buffer write operations.
#[derive(Copy, Clone, Eq, PartialEq, Debug, Display, Error)]
#[display(doc_comments)]
pub enum BufferError {
    /// memory block allocation failed
    OutOfMemory,

    /// maximum allocated buffer size reached
    Full,
}

/// Sizing policy for one stream buffer.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct BufferSpec {
    /// Smallest block the buffer will allocate (rounded up to allocator
    /// granularity at construction).
    pub min_block_size: usize,
    /// [`Producer::buffer_full`] reports `true` once this many bytes are
    /// buffered.
    pub full_watermark: usize,
    /// Hard cap on the total allocated block size; reaching it makes
    /// writes come up short.
    pub max_alloc: usize,
}

impl BufferSpec {
    /// Spec with the given minimum block size, a watermark of eight blocks
    /// and no allocation cap.
    pub fn with_min_block(min_block_size: usize) -> BufferSpec {
        BufferSpec {
            min_block_size,
            full_watermark: 8 * min_block_size,
            max_alloc: usize::MAX,
        }
    }
}

impl Default for BufferSpec {
    fn default() -> Self { BufferSpec::with_min_block(DEFAULT_MIN_BLOCK) }
}

/// Transfer state shared between the two halves.
///
/// All cross-thread communication goes through these atomics; the
/// per-half cursors live privately inside [`Producer`] and [`Consumer`].
pub(crate) struct Shared {
    pub(crate) min_block_size: usize,
    pub(crate) full_watermark: usize,
    pub(crate) max_alloc: usize,

    /// Producer's latest published write position. Release stores pair
    /// with the consumer's acquire loads to make written bytes visible.
    /// During a reset window the producer leaves it alone and the
    /// consumer CASes it back in sync as part of the acknowledgement.
    pub(crate) last_pptr: AtomicPtr<u8>,
    /// Shadow of the write position, updated on every publication with
    /// SeqCst. Carries cursor updates across a reset window.
    pub(crate) next_pptr: AtomicPtr<u8>,
    /// Consumer's read position, published when the buffer is found
    /// empty and before any block is freed.
    pub(crate) last_gptr: AtomicPtr<u8>,
    /// Reset handshake bit: set by the producer after rewinding, cleared
    /// by the consumer when it has rewound its own view.
    pub(crate) resetting: AtomicBool,

    /// Monotone counters. Each has a single writer: the producer owns
    /// `total_allocated` and `total_reset`, the consumer owns
    /// `total_freed` and `total_read`; plain load-then-store is enough.
    pub(crate) total_allocated: AtomicUsize,
    pub(crate) total_reset: AtomicUsize,
    pub(crate) total_freed: AtomicUsize,
    pub(crate) total_read: AtomicUsize,

    /// Set by the producer when an allocation was refused; cleared by the
    /// consumer-side watermark check which restarts a stopped reader.
    pub(crate) buffer_was_full: AtomicBool,

    halves_alive: AtomicU8,
    chain_head: AtomicPtr<MemoryBlock>,
}

impl Shared {
    /// Allocated bytes currently held by the chain (upper bound: the
    /// consumer may be freeing concurrently).
    pub(crate) fn allocated_upper_bound(&self) -> usize {
        self.total_allocated.load(Ordering::Relaxed) - self.total_freed.load(Ordering::Acquire)
    }

    pub(crate) fn total_reset(&self) -> usize { self.total_reset.load(Ordering::Relaxed) }
    pub(crate) fn total_read(&self) -> usize { self.total_read.load(Ordering::Acquire) }
    pub(crate) fn total_allocated(&self) -> usize { self.total_allocated.load(Ordering::Relaxed) }
    pub(crate) fn total_freed(&self) -> usize { self.total_freed.load(Ordering::Acquire) }

    /// Fuzzy emptiness probe computable from any thread; used to decide
    /// whether a flush has to start the draining device.
    pub(crate) fn probe_empty(&self) -> crate::fuzzy::Fuzzy {
        use crate::fuzzy::Fuzzy;
        if self.resetting.load(Ordering::Acquire) {
            // A reset is in flight: bytes may already sit behind it.
            return Fuzzy::WasFalse;
        }
        let last_pptr = self.last_pptr.load(Ordering::Acquire);
        let last_gptr = self.last_gptr.load(Ordering::Acquire);
        Fuzzy::momentary(!last_pptr.is_null() && last_pptr == last_gptr)
    }
}

/// Create one SPSC byte stream and hand out its two halves.
pub fn streambuf(spec: BufferSpec) -> (Producer, Consumer) {
    let min_block_size = block_size_for(spec.min_block_size);
    let block =
        MemoryBlock::create(min_block_size).expect("initial stream buffer block allocation");
    let start = unsafe { block.as_ref().start() };
    let end = unsafe { block.as_ref().end() };
    let shared = Arc::new(Shared {
        min_block_size,
        full_watermark: spec.full_watermark,
        max_alloc: spec.max_alloc,
        last_pptr: AtomicPtr::new(start),
        next_pptr: AtomicPtr::new(start),
        last_gptr: AtomicPtr::new(std::ptr::null_mut()),
        resetting: AtomicBool::new(false),
        total_allocated: AtomicUsize::new(min_block_size),
        total_reset: AtomicUsize::new(0),
        total_freed: AtomicUsize::new(0),
        total_read: AtomicUsize::new(0),
        buffer_was_full: AtomicBool::new(false),
        halves_alive: AtomicU8::new(2),
        chain_head: AtomicPtr::new(std::ptr::null_mut()),
    });
    let producer = Producer::new(shared.clone(), block, start, end);
    let consumer = Consumer::new(shared, block, start);
    (producer, consumer)
}

/// Called from the drop of either half. The consumer contributes the head
/// of the block chain; whichever half goes last walks it and releases
/// every block, so outstanding [`crate::Msg`] references keep only their
/// own blocks alive.
pub(crate) fn release_half(shared: &Shared, chain: Option<NonNull<MemoryBlock>>) {
    if let Some(head) = chain {
        shared.chain_head.store(head.as_ptr(), Ordering::Release);
    }
    if shared.halves_alive.fetch_sub(1, Ordering::AcqRel) != 1 {
        return;
    }
    let mut node = shared.chain_head.load(Ordering::Acquire);
    while let Some(block) = NonNull::new(node) {
        node = unsafe { block.as_ref().next() };
        let freed = shared.total_freed.load(Ordering::Relaxed) + unsafe { block.as_ref().size() };
        shared.total_freed.store(freed, Ordering::Release);
        unsafe { MemoryBlock::release(block) };
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn spec(min: usize) -> BufferSpec { BufferSpec::with_min_block(min) }

    #[test]
    fn single_small_write() {
        let (mut tx, mut rx) = streambuf(spec(256));
        assert_eq!(tx.write_bytes(b"hello").unwrap(), 5);
        let mut out = [0u8; 8];
        assert_eq!(rx.read_bytes(&mut out), 5);
        assert_eq!(&out[..5], b"hello");
        assert_eq!(rx.read_bytes(&mut out), 0, "buffer must be drained");
        let shared = tx.shared().clone();
        assert_eq!(shared.total_read(), 5);
    }

    #[test]
    fn block_straddling_write() {
        // An effective block of exactly 32 bytes.
        let (mut tx, mut rx) = streambuf(spec(32));
        let mut payload = vec![b'A'; 30];
        payload.push(b'\n');
        payload.extend_from_slice(b"tail");
        assert_eq!(tx.write_bytes(&payload).unwrap(), 35);
        let shared = tx.shared().clone();
        assert!(shared.total_allocated() > 32, "data must span two blocks");

        let mut out = vec![0u8; 35];
        assert_eq!(rx.read_bytes(&mut out), 35);
        assert_eq!(&out[..31], &payload[..31]);
        assert_eq!(&out[31..], b"tail");
        // The first block got consumed and released.
        assert!(shared.total_freed() >= 32);
    }

    #[test]
    fn reset_cycle_reuses_the_block() {
        let (mut tx, mut rx) = streambuf(spec(64));
        let first: Vec<u8> = (0u8..50).collect();
        assert_eq!(tx.write_bytes(&first).unwrap(), 50);
        let mut out = [0u8; 50];
        assert_eq!(rx.read_bytes(&mut out), 50);
        assert_eq!(out[..], first[..]);

        // Both ends agree the buffer is empty; the next write must rewind
        // instead of growing the chain.
        let second: Vec<u8> = (100u8..120).collect();
        assert_eq!(tx.write_bytes(&second).unwrap(), 20);
        assert_eq!(tx.put_offset(), 20, "put cursor must sit at block start + 20");
        let shared = tx.shared().clone();
        assert_eq!(shared.total_reset(), 50);

        let mut out = [0u8; 20];
        assert_eq!(rx.read_bytes(&mut out), 20);
        assert_eq!(out[..], second[..]);
        assert_eq!(shared.total_read(), 70);
    }

    #[test]
    fn back_pressure_on_max_alloc() {
        let block = crate::block::block_size_for(64);
        let (mut tx, mut rx) = streambuf(BufferSpec {
            min_block_size: 64,
            full_watermark: block,
            max_alloc: block,
        });
        let data = vec![0x5Au8; block + 10];
        // Only the single allowed block fits.
        assert_eq!(tx.write_bytes(&data).unwrap(), block);
        assert!(tx.buffer_full());
        let shared = tx.shared().clone();
        assert!(shared.buffer_was_full.load(std::sync::atomic::Ordering::Relaxed));
        // Nothing was written, so the failure surfaces as an error now.
        assert_eq!(tx.write_bytes(b"x"), Err(BufferError::Full));

        let mut out = vec![0u8; block];
        assert_eq!(rx.read_bytes(&mut out[..1]), 1);
        assert!(!tx.buffer_full(), "one byte off the watermark is enough");
        assert_eq!(rx.read_bytes(&mut out[1..]), block - 1);

        // Drained: the producer may rewind and accept bytes again.
        assert_eq!(tx.write_bytes(b"again").unwrap(), 5);
        assert_eq!(shared.total_reset(), block);
        let mut out = [0u8; 8];
        assert_eq!(rx.read_bytes(&mut out), 5);
        assert_eq!(&out[..5], b"again");
    }

    #[test]
    fn unread_single_byte() {
        let (mut tx, mut rx) = streambuf(spec(64));
        tx.write_bytes(b"ab").unwrap();
        let mut out = [0u8; 1];
        assert_eq!(rx.read_bytes(&mut out), 1);
        rx.unread_byte(b'a');
        let mut out = [0u8; 2];
        assert_eq!(rx.read_bytes(&mut out), 2);
        assert_eq!(&out, b"ab");
    }

    /// FIFO property: an arbitrary interleaving of writes and reads over a
    /// multi-block, frequently-reset buffer delivers the exact byte
    /// sequence that was written.
    #[test]
    fn spsc_fifo_across_threads() {
        const TOTAL: usize = 1 << 20;

        let (mut tx, mut rx) = streambuf(spec(64));
        let shared = tx.shared().clone();

        let writer = thread::spawn(move || {
            let mut seed = 0x2545_F491_4F6C_DD1Du64;
            let mut sent = 0usize;
            let mut byte = 0u8;
            while sent < TOTAL {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let chunk = (seed as usize % 300 + 1).min(TOTAL - sent);
                let data: Vec<u8> = (0..chunk)
                    .map(|_| {
                        byte = byte.wrapping_add(1);
                        byte
                    })
                    .collect();
                let mut off = 0;
                while off < data.len() {
                    match tx.write_bytes(&data[off..]) {
                        Ok(n) => off += n,
                        Err(BufferError::Full) => thread::yield_now(),
                        Err(err) => panic!("writer failed: {err}"),
                    }
                }
                sent += chunk;
            }
        });

        let reader = thread::spawn(move || {
            let mut seed = 0x9E37_79B9_7F4A_7C15u64;
            let mut expect = 0u8;
            let mut received = 0usize;
            let mut buf = [0u8; 511];
            while received < TOTAL {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                let want = (seed as usize % buf.len() + 1).min(TOTAL - received);
                let got = rx.read_bytes(&mut buf[..want]);
                if got == 0 {
                    thread::yield_now();
                    continue;
                }
                for &b in &buf[..got] {
                    expect = expect.wrapping_add(1);
                    assert_eq!(b, expect, "byte {received} out of order");
                    received += 1;
                }
            }
            assert_eq!(rx.read_bytes(&mut buf), 0, "no bytes past the end");
            rx
        });

        writer.join().expect("writer");
        let rx = reader.join().expect("reader");
        assert_eq!(shared.total_read(), TOTAL);
        assert!(shared.total_freed() <= shared.total_allocated());

        drop(rx);
        // Both halves gone: every block of the chain must be accounted.
        assert_eq!(shared.total_allocated(), shared.total_freed());
    }

    #[test]
    fn chain_freed_when_producer_drops_last() {
        let (mut tx, rx) = streambuf(spec(64));
        tx.write_bytes(&vec![1u8; 500]).unwrap();
        let shared = tx.shared().clone();
        drop(rx);
        assert_ne!(shared.total_allocated(), shared.total_freed());
        drop(tx);
        assert_eq!(shared.total_allocated(), shared.total_freed());
        assert!(Arc::strong_count(&shared) == 1);
    }
}
