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

//! The input direction of a device: draining the fd into the input buffer
//! and feeding framed messages to the decoder.

use std::io;
use std::slice;
use std::sync::PoisonError;

use super::{Device, Direction, FdFlags, InputHalf};
use crate::streambuf::BufferError;

fn out_of_memory(err: BufferError) -> io::Error {
    io::Error::new(io::ErrorKind::OutOfMemory, err)
}

impl Device {
    /// Register read interest with the event loop. A no-op when already
    /// active; a warning when the direction is disabled.
    pub fn start_input(&self) {
        let mut state = self.lock_state();
        self.core.rt.start(&mut state, Direction::Input, self);
    }

    /// Drop read interest but stay registered with the poller, which makes
    /// a later restart cheap.
    pub fn stop_input(&self) {
        let mut state = self.lock_state();
        self.core.rt.stop(&mut state, Direction::Input, self);
    }

    /// Stop reading until [`Self::enable_input`].
    pub fn disable_input(&self) {
        let mut state = self.lock_state();
        if state.flags.try_set(FdFlags::R_DISABLED) {
            self.core.rt.stop(&mut state, Direction::Input, self);
        }
    }

    pub fn enable_input(&self) {
        let mut state = self.lock_state();
        if state.flags.try_clear(FdFlags::R_DISABLED) && state.flags.test(FdFlags::R_OPEN) {
            self.core.rt.start(&mut state, Direction::Input, self);
        }
    }

    /// Close the input direction; closes the fd itself unless the output
    /// direction still shares it.
    pub fn close_input(&self) { self.close_direction(Direction::Input) }

    /// Drain the fd until `EAGAIN`, filling the input buffer and handing
    /// complete messages to the decoder. Runs on a pool worker; the
    /// per-direction claim bit guarantees a single instance per device.
    pub(crate) fn read_event(&self) {
        let fd = self.fd();
        let mut guard = self.input.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(half) = guard.as_mut() else { return };
        loop {
            if !self.input_open() {
                return;
            }
            let mut space = half.prod.contiguous();
            if space == 0 {
                space = match half.prod.contiguous_forced() {
                    Ok(space) => space,
                    Err(err) => {
                        half.decoder.read_error(out_of_memory(err));
                        return;
                    }
                };
                if space == 0 {
                    // The buffer hit its allocation cap. Stop reading; the
                    // consuming side restarts us once it drained below the
                    // watermark.
                    drop(guard);
                    self.stop_input();
                    return;
                }
            }
            let new_data = half.prod.put_ptr();
            let rlen = loop {
                let rlen = unsafe { libc::read(fd, new_data as *mut libc::c_void, space) };
                if rlen >= 0 {
                    break rlen as usize;
                }
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EINTR) => continue,
                    Some(code) if code == libc::EAGAIN || code == libc::EWOULDBLOCK => {
                        // Kernel drained; with edge triggering we are done
                        // until the next event.
                        return;
                    }
                    _ => {
                        half.decoder.read_error(err);
                        return;
                    }
                }
            };
            if rlen == 0 {
                // End of stream.
                half.decoder.end_of_stream();
                drop(guard);
                self.close_input();
                return;
            }
            unsafe { half.prod.commit(rlen) };
            #[cfg(feature = "log")]
            log::trace!(target: "eventio", "read {rlen} bytes from fd {fd}");
            if !self.data_received(half, new_data as *const u8, rlen) {
                return;
            }
        }
    }

    /// Feed the decoder every complete message that the freshly received
    /// span finishes. The worker is both producer and consumer of the
    /// input buffer here, so exact size accounting is available.
    ///
    /// Returns `false` when the device closed under us.
    fn data_received(&self, half: &mut InputHalf, mut new_data: *const u8, mut rlen: usize) -> bool {
        loop {
            let span = unsafe { slice::from_raw_parts(new_data, rlen) };
            let len = half.decoder.end_of_msg_finder(span);
            if len == 0 {
                break;
            }
            let msg = if half.cons.has_multiple_blocks(&half.prod) {
                // The message starts at the head of the buffer; its total
                // length is everything buffered minus the bytes received
                // beyond its end.
                let msg_len = half.prod.data_size() - (rlen - len);
                if half.cons.is_contiguous(msg_len) {
                    half.cons.take_msg(msg_len)
                } else {
                    // Rematerialize into a single fresh block so the
                    // decoder sees contiguous memory.
                    match half.cons.take_msg_copied(msg_len) {
                        Some(msg) => msg,
                        None => {
                            half.decoder.read_error(out_of_memory(BufferError::OutOfMemory));
                            return false;
                        }
                    }
                }
            } else {
                let msg_len = (new_data as usize - half.cons.gptr() as usize) + len;
                half.cons.take_msg(msg_len)
            };
            half.decoder.decode(msg);
            half.cons.reduce_if_empty(&mut half.prod);
            if !self.input_open() {
                return false;
            }
            rlen -= len;
            if rlen == 0 {
                break;
            }
            new_data = unsafe { new_data.add(len) };
        }
        self.restart_input_if_needed(half);
        true
    }

    /// The buffer-full edge in reverse: once the decoder drained below the
    /// watermark, pick the stopped device back up.
    fn restart_input_if_needed(&self, half: &InputHalf) {
        use std::sync::atomic::Ordering::Relaxed;
        let shared = half.prod.shared();
        if !shared.buffer_was_full.load(Relaxed) {
            return;
        }
        if shared.allocated_upper_bound() - half.cons.unused_in_first_block()
            < shared.full_watermark
        {
            shared.buffer_was_full.store(false, Relaxed);
            self.start_input();
        }
    }
}
