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

//! Event-driven I/O over file descriptors, built on edge-triggered
//! readiness notification.
//!
//! Applications register file descriptors as *devices* (input, output or
//! both), attach buffered byte streams, and let a single dedicated
//! [`EventLoop`] thread dispatch read/write readiness into a
//! [`ThreadPool`] which runs the user decode and encode logic.
//!
//! The two central subsystems are:
//!
//! - the [`EventLoop`] dispatcher: readiness polling, event fan-out with
//!   per-direction exclusion, device lifetime across concurrent access,
//!   and graceful/forced shutdown;
//! - the [`streambuf`] module: a single-producer / single-consumer byte
//!   stream over a linked chain of reference-counted memory blocks, with
//!   no locking on the hot read/write paths and an empty-buffer reset
//!   handshake avoiding unbounded block growth.

#[macro_use]
extern crate amplify;

#[cfg(not(target_os = "linux"))]
compile_error!("this crate requires Linux: edge-triggered epoll and realtime signals");

mod block;
mod decoder;
mod device;
mod dispatcher;
pub mod fuzzy;
mod garbage;
mod poller;
mod pool;
mod signal;
pub mod streambuf;

pub use block::Msg;
pub use decoder::{Decoder, OutputEvents};
pub use device::{Device, DeviceRef, Direction, OutputStream};
pub use dispatcher::EventLoop;
pub use pool::{PoolHandle, ThreadPool};
pub use streambuf::{streambuf, BufferError, BufferSpec};
