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

//! Devices: file descriptors registered with the event loop, together
//! with their attached stream buffers and per-direction state.

mod input;
mod output;

use std::io;
use std::os::unix::io::RawFd;
use std::ptr::NonNull;
use std::sync::atomic::Ordering::{AcqRel, Acquire, Relaxed, Release};
use std::sync::atomic::{fence, AtomicI32, AtomicPtr, AtomicU32};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub use output::OutputStream;

use crate::decoder::{Decoder, OutputEvents};
use crate::dispatcher::LoopShared;
use crate::poller::{EV_ERR, EV_HUP, EV_READ, EV_WRITE};
use crate::streambuf::{Consumer, Producer};

/// The two transfer directions of a device.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Direction {
    Input,
    Output,
}

impl Direction {
    pub(crate) fn open_bit(self) -> u32 {
        match self {
            Direction::Input => FdFlags::R_OPEN,
            Direction::Output => FdFlags::W_OPEN,
        }
    }

    pub(crate) fn active_bit(self) -> u32 {
        match self {
            Direction::Input => FdFlags::R_ACTIVE,
            Direction::Output => FdFlags::W_ACTIVE,
        }
    }

    pub(crate) fn added_bit(self) -> u32 {
        match self {
            Direction::Input => FdFlags::R_ADDED,
            Direction::Output => FdFlags::W_ADDED,
        }
    }

    pub(crate) fn disabled_bit(self) -> u32 {
        match self {
            Direction::Input => FdFlags::R_DISABLED,
            Direction::Output => FdFlags::W_DISABLED,
        }
    }
}

/// Per-device flag bitset, guarded by the device state lock.
#[derive(Copy, Clone, Eq, PartialEq, Default, Debug)]
pub(crate) struct FdFlags(u32);

impl FdFlags {
    pub(crate) const R_OPEN: u32 = 1 << 0;
    pub(crate) const W_OPEN: u32 = 1 << 1;
    pub(crate) const R_ACTIVE: u32 = 1 << 2;
    pub(crate) const W_ACTIVE: u32 = 1 << 3;
    pub(crate) const R_ADDED: u32 = 1 << 4;
    pub(crate) const W_ADDED: u32 = 1 << 5;
    pub(crate) const R_DISABLED: u32 = 1 << 6;
    pub(crate) const W_DISABLED: u32 = 1 << 7;
    /// The fd refers to a regular file: always ready, bypasses the poller.
    pub(crate) const REGULAR_FILE: u32 = 1 << 8;
    /// One fd serves both directions; closed only when both are closed.
    pub(crate) const SAME_FD: u32 = 1 << 9;
    /// Excluded from the active-device tally.
    pub(crate) const INFERIOR: u32 = 1 << 10;
    /// No open direction remains.
    pub(crate) const DEAD: u32 = 1 << 11;

    pub(crate) fn test(self, mask: u32) -> bool { self.0 & mask != 0 }
    pub(crate) fn set(&mut self, mask: u32) { self.0 |= mask }
    pub(crate) fn clear(&mut self, mask: u32) { self.0 &= !mask }

    /// Set `mask`; true when it was not set before.
    pub(crate) fn try_set(&mut self, mask: u32) -> bool {
        let was = self.test(mask);
        self.set(mask);
        !was
    }

    /// Clear `mask`; true when it was set before.
    pub(crate) fn try_clear(&mut self, mask: u32) -> bool {
        let was = self.test(mask);
        self.clear(mask);
        was
    }
}

/// State guarded by the per-device lock. The lock is held only for flag
/// transitions and poller calls, never across a read/write syscall.
pub(crate) struct DeviceState {
    pub(crate) flags: FdFlags,
}

/// Identity and lifetime state of a device.
pub(crate) struct DeviceCore {
    fd: AtomicI32,
    /// Owning reference count: [`DeviceRef`] handles, the poller's loan
    /// while the fd is registered, and one per in-flight event closure.
    count: AtomicI32,
    /// One bit per event kind currently being handled by a pool worker;
    /// prevents double-dispatch of the same direction.
    being_processed: AtomicU32,
    /// Intrusive link for the garbage list.
    garbage_next: AtomicPtr<Device>,
    pub(crate) rt: Arc<LoopShared>,
    state: Mutex<DeviceState>,
}

pub(crate) struct InputHalf {
    pub(crate) prod: Producer,
    pub(crate) cons: Consumer,
    pub(crate) decoder: Box<dyn Decoder>,
}

pub(crate) struct OutputHalf {
    pub(crate) cons: Consumer,
    pub(crate) events: Box<dyn OutputEvents>,
}

/// A file descriptor device: per-fd flags, owning reference count and the
/// attached stream buffer halves.
///
/// Created through the event-loop factory methods which hand out an
/// owning [`DeviceRef`]; destruction is deferred through the garbage list
/// so it never happens inside a worker closure still using the device.
pub struct Device {
    core: DeviceCore,
    has_input: bool,
    has_output: bool,
    input: Mutex<Option<InputHalf>>,
    output: Mutex<Option<OutputHalf>>,
}

/// Owning pointer to a [`Device`].
///
/// Clones bump the device's intrusive reference count; dropping the last
/// owner (including the loans held by the poller and by in-flight event
/// closures) sends the device to the garbage list.
pub struct DeviceRef(NonNull<Device>);

unsafe impl Send for DeviceRef {}
unsafe impl Sync for DeviceRef {}

impl Clone for DeviceRef {
    fn clone(&self) -> Self {
        self.inhibit_deletion();
        DeviceRef(self.0)
    }
}

impl Drop for DeviceRef {
    fn drop(&mut self) { unsafe { self.0.as_ref() }.allow_deletion(1) }
}

impl std::ops::Deref for DeviceRef {
    type Target = Device;

    fn deref(&self) -> &Device { unsafe { self.0.as_ref() } }
}

/// Raw device pointer which may travel into a worker closure. The pointee
/// is kept alive by an `inhibit_deletion` taken before the send.
pub(crate) struct DevPtr(pub(crate) NonNull<Device>);

unsafe impl Send for DevPtr {}

fn is_fd_valid(fd: RawFd) -> bool { unsafe { libc::fcntl(fd, libc::F_GETFL) != -1 } }

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags == -1 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK == 0
        && unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
    {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

fn is_regular_file(fd: RawFd) -> bool {
    let mut stat: libc::stat = unsafe { std::mem::zeroed() };
    unsafe { libc::fstat(fd, &mut stat) == 0 && stat.st_mode & libc::S_IFMT == libc::S_IFREG }
}

impl Device {
    pub(crate) fn alloc(
        rt: Arc<LoopShared>,
        input: Option<InputHalf>,
        output: Option<OutputHalf>,
    ) -> DeviceRef {
        let device = Box::new(Device {
            core: DeviceCore {
                fd: AtomicI32::new(-1),
                count: AtomicI32::new(1),
                being_processed: AtomicU32::new(0),
                garbage_next: AtomicPtr::new(std::ptr::null_mut()),
                rt,
                state: Mutex::new(DeviceState {
                    flags: FdFlags::default(),
                }),
            },
            has_input: input.is_some(),
            has_output: output.is_some(),
            input: Mutex::new(input),
            output: Mutex::new(output),
        });
        DeviceRef(NonNull::from(Box::leak(device)))
    }

    pub fn fd(&self) -> RawFd { self.core.fd.load(Acquire) }

    pub(crate) fn lock_state(&self) -> MutexGuard<'_, DeviceState> {
        self.core.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn garbage_link(&self) -> &AtomicPtr<Device> { &self.core.garbage_next }

    /// Take the fd into the device: validate it, make it non-blocking and
    /// reset the per-direction flags. Must be called before any `start_*`.
    pub fn init(&self, fd: RawFd) -> io::Result<()> {
        if !is_fd_valid(fd) {
            return Err(io::Error::last_os_error());
        }
        if fd > 2 {
            set_nonblocking(fd)?;
        } else {
            // Making the standard streams non-blocking breaks every other
            // user of them in the process; leave the fd as it is.
            #[cfg(feature = "log")]
            log::warn!(target: "eventio", "initializing device on standard stream fd {fd}");
        }
        let regular = is_regular_file(fd);
        let mut state = self.lock_state();
        let inferior = state.flags.test(FdFlags::INFERIOR);
        state.flags = FdFlags::default();
        if inferior {
            state.flags.set(FdFlags::INFERIOR);
        }
        if self.has_input {
            state.flags.set(FdFlags::R_OPEN);
        }
        if self.has_output {
            state.flags.set(FdFlags::W_OPEN);
        }
        if self.has_input && self.has_output {
            state.flags.set(FdFlags::SAME_FD);
        }
        if regular {
            state.flags.set(FdFlags::REGULAR_FILE);
        }
        self.core.fd.store(fd, Release);
        Ok(())
    }

    /// Exclude this device from the active tally used for clean shutdown.
    /// Call before the first `start_*`.
    pub fn set_inferior(&self) { self.lock_state().flags.set(FdFlags::INFERIOR) }

    pub fn is_dead(&self) -> bool { self.lock_state().flags.test(FdFlags::DEAD) }

    pub(crate) fn input_open(&self) -> bool {
        self.lock_state().flags.test(FdFlags::R_OPEN)
    }

    pub(crate) fn output_open(&self) -> bool {
        self.lock_state().flags.test(FdFlags::W_OPEN)
    }

    //
    // Reference counting
    //

    pub(crate) fn inhibit_deletion(&self) { self.core.count.fetch_add(1, Relaxed); }

    /// Give back `n` references; the last one sends the device to the
    /// garbage list, where the event thread performs the destruction.
    pub(crate) fn allow_deletion(&self, n: u32) {
        if n == 0 {
            return;
        }
        let previous = self.core.count.fetch_sub(n as i32, Release);
        debug_assert!(previous >= n as i32, "device reference count underflow");
        if previous == n as i32 {
            fence(Acquire);
            let rt = self.core.rt.clone();
            rt.garbage.push(NonNull::from(self));
            // With the event thread gone nothing would ever drain the
            // list; do it on the releasing thread instead.
            if !rt.running.load(Acquire) {
                rt.garbage.drain();
            }
        }
    }

    //
    // Event dispatch bookkeeping
    //

    /// Claim event bits for a worker; returns the bits that were already
    /// claimed (and must not be dispatched again).
    pub(crate) fn claim_processing(&self, events: u32) -> u32 {
        self.core.being_processed.fetch_or(events, AcqRel)
    }

    fn release_processing(&self, bit: u32) {
        self.core.being_processed.fetch_and(!bit, Release);
    }

    /// Drop the claim on one event bit and re-arm the registration: an
    /// edge reported while the bit was still claimed has been swallowed,
    /// and a re-registration makes the kernel evaluate readiness afresh.
    fn finish_processing(&self, bit: u32, dir: Option<Direction>) {
        self.release_processing(bit);
        let Some(dir) = dir else { return };
        let state = self.lock_state();
        if state.flags.test(dir.added_bit()) && state.flags.test(dir.active_bit()) {
            self.core.rt.rearm(&state, self);
        }
    }

    /// Entry point of the pool worker closure: route claimed event bits
    /// into the per-direction handlers.
    pub(crate) fn process_events(&self, events: u32) {
        if events & !(EV_READ | EV_WRITE) != 0 {
            if events & EV_HUP != 0 {
                self.hup_event();
                // Leaving the fd open would flood us with further events.
                self.close();
                self.release_processing(EV_HUP);
            } else if events & EV_ERR != 0 {
                self.exceptional_event();
                self.close();
                self.release_processing(EV_ERR);
            }
        } else {
            if events & EV_READ != 0 {
                self.read_event();
                self.finish_processing(EV_READ, Some(Direction::Input));
            }
            if events & EV_WRITE != 0 {
                self.write_event();
                self.finish_processing(EV_WRITE, Some(Direction::Output));
            }
        }
    }

    fn hup_event(&self) {
        #[cfg(feature = "log")]
        log::debug!(target: "eventio", "hang-up on fd {}", self.fd());
    }

    fn exceptional_event(&self) {
        #[cfg(feature = "log")]
        log::debug!(target: "eventio", "exceptional condition on fd {}", self.fd());
    }

    /// Close both directions.
    pub fn close(&self) {
        self.close_input();
        self.close_output();
    }

    /// Close one direction: deactivate, unregister, close the fd once no
    /// direction shares it, and fire the `closed` notifications when the
    /// device went dead.
    pub(crate) fn close_direction(&self, dir: Direction) {
        let mut deferred = 0u32;
        let mut went_dead = false;
        {
            let mut state = self.lock_state();
            if !state.flags.try_clear(dir.open_bit()) {
                return;
            }
            self.core.rt.remove(&mut state, dir, self, &mut deferred);
            let other_open = match dir {
                Direction::Input => state.flags.test(FdFlags::W_OPEN),
                Direction::Output => state.flags.test(FdFlags::R_OPEN),
            };
            if !(state.flags.test(FdFlags::SAME_FD) && other_open) {
                let fd = self.core.fd.load(Relaxed);
                if fd >= 0 && unsafe { libc::close(fd) } == -1 {
                    #[cfg(feature = "log")]
                    log::warn!(target: "eventio", "failed to close fd {fd}: {}",
                        io::Error::last_os_error());
                }
            }
            state.flags.clear(dir.disabled_bit());
            if !state.flags.test(FdFlags::R_OPEN | FdFlags::W_OPEN) {
                state.flags.set(FdFlags::DEAD);
                went_dead = true;
            }
        }
        if went_dead {
            if self.has_input {
                if let Some(half) =
                    self.input.lock().unwrap_or_else(PoisonError::into_inner).as_mut()
                {
                    half.decoder.closed();
                }
            }
            if self.has_output {
                if let Some(half) =
                    self.output.lock().unwrap_or_else(PoisonError::into_inner).as_mut()
                {
                    half.events.closed();
                }
            }
        }
        self.allow_deletion(deferred);
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        // A device destroyed with a direction still open owns the fd.
        let flags = self.lock_state().flags;
        let fd = self.core.fd.load(Relaxed);
        if fd >= 0 && flags.test(FdFlags::R_OPEN | FdFlags::W_OPEN) {
            unsafe { libc::close(fd) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poller::{EV_READ, EV_WRITE};

    #[test]
    fn flag_bit_ops() {
        let mut flags = FdFlags::default();
        assert!(flags.try_set(FdFlags::R_OPEN));
        assert!(!flags.try_set(FdFlags::R_OPEN), "second set must report no change");
        assert!(flags.test(FdFlags::R_OPEN));
        assert!(flags.try_clear(FdFlags::R_OPEN));
        assert!(!flags.try_clear(FdFlags::R_OPEN));
    }

    #[test]
    fn processing_bits_exclude_double_dispatch() {
        let core = AtomicU32::new(0);
        // First claim takes both bits, second gets told they are taken.
        let already = core.fetch_or(EV_READ | EV_WRITE, AcqRel);
        assert_eq!(already & (EV_READ | EV_WRITE), 0);
        let already = core.fetch_or(EV_READ, AcqRel);
        assert_ne!(already & EV_READ, 0, "read direction already claimed");
        core.fetch_and(!EV_READ, Release);
        let already = core.fetch_or(EV_READ, AcqRel);
        assert_eq!(already & EV_READ, 0, "claim released");
    }
}
