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

//! Deferred device destruction.
//!
//! When the last owning reference to a device goes away inside a pool
//! worker -- typically at the tail of its own event closure -- the device
//! must not be destroyed right there. It is pushed onto this lock-free
//! intrusive LIFO instead and the event thread drains the list once per
//! loop iteration, well after every closure referencing the device has
//! completed.

use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::device::Device;

pub(crate) struct GarbageList {
    head: AtomicPtr<Device>,
}

impl GarbageList {
    pub(crate) fn new() -> GarbageList {
        GarbageList {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    /// Hand a device over for destruction. Callable from any thread; the
    /// caller gives up its (last) reference.
    pub(crate) fn push(&self, device: NonNull<Device>) {
        let mut old = self.head.load(Ordering::Relaxed);
        loop {
            unsafe { device.as_ref().garbage_link().store(old, Ordering::Relaxed) };
            match self.head.compare_exchange_weak(
                old,
                device.as_ptr(),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => old = actual,
            }
        }
    }

    /// Destroy everything pushed so far. Runs on the event thread (or
    /// after it exited).
    pub(crate) fn drain(&self) {
        let mut node = self.head.swap(ptr::null_mut(), Ordering::Acquire);
        while !node.is_null() {
            let next = unsafe { (*node).garbage_link().load(Ordering::Relaxed) };
            drop(unsafe { Box::from_raw(node) });
            node = next;
        }
    }

}

impl Drop for GarbageList {
    fn drop(&mut self) { self.drain() }
}

// The list only ever hands device pointers between threads.
unsafe impl Send for GarbageList {}
unsafe impl Sync for GarbageList {}
