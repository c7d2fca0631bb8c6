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

//! The output direction of a device: application writes buffer up in the
//! output stream buffer; the event loop drains it into the fd whenever
//! write readiness fires.

use std::io::{self, Write};
use std::sync::PoisonError;

use super::{Device, DeviceRef, Direction, FdFlags};
use crate::fuzzy::FuzzyCondition;
use crate::streambuf::{BufferError, Producer};

impl Device {
    /// Register write interest with the event loop.
    pub fn start_output(&self) {
        let mut state = self.lock_state();
        self.core.rt.start(&mut state, Direction::Output, self);
    }

    /// Conditionally register write interest; the condition is re-tested
    /// under the device state lock when its cached value is transitory.
    pub(crate) fn start_output_if(&self, condition: FuzzyCondition) -> bool {
        let mut state = self.lock_state();
        self.core.rt.start_if(&mut state, condition, Direction::Output, self)
    }

    /// Drop write interest but stay registered with the poller.
    pub fn stop_output(&self) {
        let mut state = self.lock_state();
        self.core.rt.stop(&mut state, Direction::Output, self);
    }

    /// Conditionally drop write interest; the condition is re-tested
    /// under the device state lock when its cached value is transitory.
    pub(crate) fn stop_output_if(&self, condition: FuzzyCondition) -> bool {
        let mut state = self.lock_state();
        self.core.rt.stop_if(&mut state, condition, Direction::Output, self)
    }

    /// Stop writing until [`Self::enable_output`].
    pub fn disable_output(&self) {
        let mut state = self.lock_state();
        if state.flags.try_set(FdFlags::W_DISABLED) {
            self.core.rt.stop(&mut state, Direction::Output, self);
        }
    }

    pub fn enable_output(&self) {
        let mut state = self.lock_state();
        if state.flags.try_clear(FdFlags::W_DISABLED) && state.flags.test(FdFlags::W_OPEN) {
            self.core.rt.start(&mut state, Direction::Output, self);
        }
    }

    /// Close the output direction; closes the fd itself unless the input
    /// direction still shares it.
    pub fn close_output(&self) { self.close_direction(Direction::Output) }

    /// Drain the output buffer into the fd until `EAGAIN` or empty; on
    /// empty, write interest is dropped. Runs on a pool worker with the
    /// per-direction claim bit held.
    pub(crate) fn write_event(&self) {
        let fd = self.fd();
        'drain: loop {
            let mut guard = self.output.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(half) = guard.as_mut() else { return };
            loop {
                if !self.output_open() {
                    return;
                }
                let (data, available) = half.cons.read_span();
                if available == 0 {
                    // The producer may refill between this observation and
                    // the stop; the condition is re-tested under the state
                    // lock and the stop reverted when bytes showed up.
                    let shared = half.cons.shared().clone();
                    drop(guard);
                    let condition = FuzzyCondition::new(move || shared.probe_empty());
                    if condition.cached().is_momentary_false() {
                        continue 'drain;
                    }
                    if self.stop_output_if(condition) {
                        return;
                    }
                    continue 'drain;
                }
                let written = unsafe { libc::write(fd, data as *const libc::c_void, available) };
                if written == -1 {
                    let err = io::Error::last_os_error();
                    match err.raw_os_error() {
                        Some(libc::EINTR) => continue,
                        Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                            return;
                        }
                        _ => {
                            half.events.write_error(err);
                            drop(guard);
                            self.close_output();
                            return;
                        }
                    }
                }
                half.cons.consume(written as usize);
                #[cfg(feature = "log")]
                log::trace!(target: "eventio", "wrote {written} bytes to fd {fd}");
            }
        }
    }
}

/// Application handle to the write end of an output device.
///
/// Bytes go into the device's output stream buffer without blocking; a
/// full buffer surfaces as [`io::ErrorKind::WouldBlock`]. [`Write::flush`]
/// guarantees the device will attempt a write and is idempotent.
pub struct OutputStream {
    device: DeviceRef,
    producer: Producer,
}

impl OutputStream {
    pub(crate) fn new(device: DeviceRef, producer: Producer) -> OutputStream {
        OutputStream { device, producer }
    }

    pub fn device(&self) -> &DeviceRef { &self.device }

    /// Bytes currently buffered (upper bound).
    pub fn pending(&self) -> usize { self.producer.data_size_upper_bound() }
}

impl Write for OutputStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.producer.write_bytes(buf) {
            Ok(written) if written > 0 => Ok(written),
            Ok(_) | Err(BufferError::Full) => {
                Err(io::Error::from(io::ErrorKind::WouldBlock))
            }
            Err(err @ BufferError::OutOfMemory) => {
                Err(io::Error::new(io::ErrorKind::OutOfMemory, err))
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        // An empty answer is stable from this thread: nothing to push out.
        if self.producer.nothing_to_get().is_momentary_true() {
            return Ok(());
        }
        let shared = self.producer.shared().clone();
        let condition = FuzzyCondition::new(move || !shared.probe_empty());
        if condition.cached().is_momentary_true() {
            self.device.start_output_if(condition);
        }
        Ok(())
    }
}
