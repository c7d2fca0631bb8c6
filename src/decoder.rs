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

//! User-facing protocol callbacks.

use std::io;

use crate::Msg;

/// Protocol decoder attached to an input device.
///
/// All methods run on a pool worker, one at a time per device; a decoder
/// never needs interior synchronization for its own state.
pub trait Decoder: Send {
    /// Given the bytes just received, return the length of the span that
    /// completes the first message pending at the read cursor, including
    /// any framing bytes -- or zero when the message is still incomplete.
    ///
    /// The default frames messages on a newline.
    fn end_of_msg_finder(&mut self, new_data: &[u8]) -> usize {
        new_data.iter().position(|&b| b == b'\n').map_or(0, |pos| pos + 1)
    }

    /// Consume one complete message.
    fn decode(&mut self, msg: Msg);

    /// A `read` syscall failed with something other than `EINTR` or
    /// `EAGAIN`; the device keeps its state and may be closed by the
    /// implementation.
    fn read_error(&mut self, _err: io::Error) {}

    /// The peer closed its end; the input direction is about to close.
    fn end_of_stream(&mut self) {}

    /// No open direction remains on the device.
    fn closed(&mut self) {}
}

/// Notifications for the output direction of a device.
///
/// The unit type serves as the no-op implementation:
///
/// ```ignore
/// let (device, stream) = eventio::output_device(&event_loop, (), Default::default());
/// ```
pub trait OutputEvents: Send {
    /// A `write` syscall failed with something other than `EINTR` or
    /// `EAGAIN`; the output direction is about to close.
    fn write_error(&mut self, _err: io::Error) {}

    /// No open direction remains on the device.
    fn closed(&mut self) {}
}

impl OutputEvents for () {}

#[cfg(test)]
mod tests {
    use super::*;

    struct Nop;
    impl Decoder for Nop {
        fn decode(&mut self, _msg: Msg) {}
    }

    #[test]
    fn newline_framing_default() {
        let mut decoder = Nop;
        assert_eq!(decoder.end_of_msg_finder(b"no end yet"), 0);
        assert_eq!(decoder.end_of_msg_finder(b"one\ntwo\n"), 4);
        assert_eq!(decoder.end_of_msg_finder(b"\n"), 1);
    }
}
