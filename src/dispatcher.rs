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

//! The event loop: a single dedicated thread around an edge-triggered
//! readiness poll, fanning ready events out into the worker pool.
//!
//! ```no_run
//! use std::io::Write;
//!
//! use eventio::{BufferSpec, EventLoop, ThreadPool};
//!
//! let pool = ThreadPool::new(4, 64);
//! let event_loop = EventLoop::new(pool.handle()).unwrap();
//!
//! let (device, mut stream) = event_loop.output_device((), BufferSpec::default());
//! # let fd = 1;
//! device.init(fd).unwrap();
//! stream.write_all(b"hello\n").unwrap();
//! stream.flush().unwrap();
//!
//! event_loop.terminate(true);
//! event_loop.join();
//! pool.shutdown();
//! ```

use std::io;
use std::ptr::{self, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU64, AtomicU8};
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel as chan;

use crate::decoder::{Decoder, OutputEvents};
use crate::device::{DevPtr, Device, DeviceRef, DeviceState, Direction, FdFlags, OutputStream};
use crate::fuzzy::FuzzyCondition;
use crate::garbage::GarbageList;
use crate::poller::{Interest, Poller, EV_ALL};
use crate::pool::PoolHandle;
use crate::signal;
use crate::streambuf::{streambuf, BufferSpec};

const TERM_NOT_YET: u8 = 0;
const TERM_CLEANLY: u8 = 1;
const TERM_FORCED: u8 = 2;

/// Upper bound of events transferred out of one readiness wait.
const MAX_EVENTS: usize = 256;

/// The one event loop of the process, for the wakeup signal handler; a
/// handler cannot carry state, so it finds the loop through this pointer.
static CURRENT: AtomicPtr<LoopShared> = AtomicPtr::new(ptr::null_mut());

extern "C" fn wakeup_handler(_signum: libc::c_int) {
    // Runs on the event thread with the wakeup signal unblocked only
    // inside the readiness wait. Only atomics; async-signal-safe.
    let shared = CURRENT.load(Acquire);
    if shared.is_null() {
        return;
    }
    let shared = unsafe { &*shared };
    let terminate = shared.terminate.load(Relaxed);
    if terminate == TERM_FORCED
        || (terminate == TERM_CLEANLY && shared.active.load(Relaxed) == 0)
    {
        shared.stop_running.store(true, Relaxed);
    }
}

/// State shared between the event thread, devices and the application.
pub(crate) struct LoopShared {
    pub(crate) poller: Poller,
    pub(crate) pool: PoolHandle,
    pub(crate) garbage: GarbageList,
    /// `TERM_*`: not yet / cleanly / forced.
    terminate: AtomicU8,
    stop_running: AtomicBool,
    pub(crate) running: AtomicBool,
    /// Count of active non-inferior device directions.
    pub(crate) active: AtomicI32,
    signum: libc::c_int,
    event_thread: AtomicU64,
}

impl LoopShared {
    /// Deliver the wakeup signal to the event thread.
    pub(crate) fn wake_up(&self) {
        let thread = self.event_thread.load(Acquire);
        if thread != 0 && self.running.load(Acquire) {
            signal::kill_thread(thread as libc::pthread_t, self.signum);
        }
    }

    /// Wake the event thread iff a termination request is pending, so the
    /// handler can re-evaluate whether to stop.
    pub(crate) fn bump_terminate(&self) {
        if self.terminate.load(Relaxed) != TERM_NOT_YET {
            self.wake_up();
        }
    }

    fn decrement_active(&self) {
        if self.active.fetch_sub(1, Relaxed) == 1 {
            self.bump_terminate();
        }
    }

    /// (Re-)register the device with the poller, with the interest set
    /// derived from the currently active directions.
    pub(crate) fn rearm(&self, state: &DeviceState, device: &Device) {
        self.update_registration(state, device, false);
    }

    fn update_registration(&self, state: &DeviceState, device: &Device, adding: bool) {
        let interest = Interest {
            read: state.flags.test(FdFlags::R_ACTIVE),
            write: state.flags.test(FdFlags::W_ACTIVE),
        };
        let fd = device.fd();
        let cookie = device as *const Device as u64;
        let result = if adding {
            self.poller.add(fd, interest, cookie)
        } else {
            self.poller.modify(fd, interest, cookie)
        };
        if let Err(_err) = result {
            #[cfg(feature = "log")]
            log::error!(target: "eventio-loop",
                "failed to update poll registration of fd {fd} to {interest}: {_err}");
        }
    }

    /// Activation tail shared by `start` and `start_if`: bump the active
    /// tally, then either register with the poller or, for a regular
    /// file, feed the worker pool directly.
    fn commit_start(&self, state: &mut DeviceState, dir: Direction, device: &Device) {
        if !state.flags.test(FdFlags::INFERIOR) {
            self.active.fetch_add(1, Relaxed);
        }
        if state.flags.test(FdFlags::REGULAR_FILE) {
            // Regular files are always ready: readiness polling is
            // useless for them, schedule the I/O right away.
            self.enqueue_direct(dir, device);
            return;
        }
        let first = !state.flags.test(FdFlags::R_ADDED | FdFlags::W_ADDED);
        state.flags.set(dir.added_bit());
        if first {
            // The registration lends the poller one reference.
            device.inhibit_deletion();
        }
        self.update_registration(state, device, first);
    }

    pub(crate) fn start(&self, state: &mut DeviceState, dir: Direction, device: &Device) {
        if !state.flags.test(dir.open_bit()) {
            return;
        }
        if state.flags.test(dir.disabled_bit()) {
            #[cfg(feature = "log")]
            log::warn!(target: "eventio-loop",
                "refusing to start a disabled direction of fd {}", device.fd());
            return;
        }
        if !state.flags.try_set(dir.active_bit()) {
            return;
        }
        self.commit_start(state, dir, device);
    }

    /// `start` under a fuzzy condition: the caller observed the condition
    /// momentarily or transitorily true outside the lock and commits to a
    /// re-test inside it. A transitorily false condition means two
    /// producers race on the same buffer, which is a contract violation.
    pub(crate) fn start_if(
        &self,
        state: &mut DeviceState,
        condition: FuzzyCondition,
        dir: Direction,
        device: &Device,
    ) -> bool {
        if condition.cached().is_false() {
            return false;
        }
        assert!(
            !condition.cached().is_transitory_false(),
            "start_if with a transitorily false condition: a second producer is racing"
        );
        if !state.flags.test(dir.open_bit()) {
            return true;
        }
        if state.flags.test(dir.disabled_bit()) {
            return true;
        }
        if !state.flags.try_set(dir.active_bit()) {
            return true;
        }
        if condition.cached().is_transitory_true()
            && condition.recompute().is_momentary_false()
        {
            state.flags.clear(dir.active_bit());
            return false;
        }
        self.commit_start(state, dir, device);
        true
    }

    pub(crate) fn stop(&self, state: &mut DeviceState, dir: Direction, device: &Device) {
        if !state.flags.try_clear(dir.active_bit()) {
            return;
        }
        if !state.flags.test(FdFlags::REGULAR_FILE) {
            self.update_registration(state, device, false);
        }
        if !state.flags.test(FdFlags::INFERIOR) {
            self.decrement_active();
        }
    }

    /// `stop` under a fuzzy condition, re-tested under the state lock.
    pub(crate) fn stop_if(
        &self,
        state: &mut DeviceState,
        condition: FuzzyCondition,
        dir: Direction,
        device: &Device,
    ) -> bool {
        if condition.cached().is_false() {
            return false;
        }
        assert!(
            !condition.cached().is_transitory_false(),
            "stop_if with a transitorily false condition: a second consumer is racing"
        );
        if !state.flags.try_clear(dir.active_bit()) {
            return true;
        }
        if condition.cached().is_transitory_true()
            && condition.recompute().is_momentary_false()
        {
            state.flags.set(dir.active_bit());
            return false;
        }
        if !state.flags.test(FdFlags::REGULAR_FILE) {
            self.update_registration(state, device, false);
        }
        if !state.flags.test(FdFlags::INFERIOR) {
            self.decrement_active();
        }
        true
    }

    /// Deactivate and unregister one direction. `deferred` accumulates
    /// reference releases which the caller must perform after dropping
    /// the state lock.
    pub(crate) fn remove(
        &self,
        state: &mut DeviceState,
        dir: Direction,
        device: &Device,
        deferred: &mut u32,
    ) {
        let had_added = state.flags.try_clear(dir.added_bit());
        let removal = had_added && !state.flags.test(FdFlags::R_ADDED | FdFlags::W_ADDED);
        let cleared_active = state.flags.try_clear(dir.active_bit());
        if !state.flags.test(FdFlags::REGULAR_FILE) && (cleared_active || removal) {
            if removal {
                let _ = self.poller.remove(device.fd());
                // Give back the reference lent to the poller.
                *deferred += 1;
            } else if had_added || cleared_active {
                self.update_registration(state, device, false);
            }
        }
        if cleared_active && !state.flags.test(FdFlags::INFERIOR) {
            self.decrement_active();
        }
    }

    /// Regular-file fallback: schedule the direction's handler directly.
    fn enqueue_direct(&self, dir: Direction, device: &Device) {
        device.inhibit_deletion();
        let ptr = DevPtr(NonNull::from(device));
        let submitted = self.pool.submit(move || {
            let ptr = ptr;
            let device = unsafe { ptr.0.as_ref() };
            match dir {
                Direction::Input => device.read_event(),
                Direction::Output => device.write_event(),
            }
            device.allow_deletion(1);
        });
        if submitted.is_err() {
            #[cfg(feature = "log")]
            log::warn!(target: "eventio-loop", "worker pool gone; dropping file I/O event");
            device.allow_deletion(1);
        }
    }
}

/// The dispatcher: owns the poll fd and the event thread.
///
/// Construct exactly one per process, at the start of the program; ask
/// for devices through the factory methods; call [`Self::terminate`]
/// with `cleanly = true` before shutting down. Dropping the object
/// forces termination.
pub struct EventLoop {
    shared: Arc<LoopShared>,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    /// Start the event thread using the default wakeup signal.
    pub fn new(pool: PoolHandle) -> io::Result<EventLoop> {
        EventLoop::with_signal(pool, signal::default_signum())
    }

    /// Start the event thread waking up on `signum`, which must be a
    /// realtime signal unused by anything else in the process.
    pub fn with_signal(pool: PoolHandle, signum: libc::c_int) -> io::Result<EventLoop> {
        let shared = Arc::new(LoopShared {
            poller: Poller::new()?,
            pool,
            garbage: GarbageList::new(),
            terminate: AtomicU8::new(TERM_NOT_YET),
            stop_running: AtomicBool::new(false),
            running: AtomicBool::new(false),
            active: AtomicI32::new(0),
            signum,
            event_thread: AtomicU64::new(0),
        });

        let registered = Arc::into_raw(shared.clone()) as *mut LoopShared;
        if CURRENT
            .compare_exchange(ptr::null_mut(), registered, Release, Relaxed)
            .is_err()
        {
            drop(unsafe { Arc::from_raw(registered) });
            panic!("an event loop is already running in this process");
        }
        if let Err(err) = signal::install_handler(signum, wakeup_handler) {
            CURRENT.store(ptr::null_mut(), Release);
            drop(unsafe { Arc::from_raw(registered) });
            return Err(err);
        }

        let (ready_tx, ready_rx) = chan::bounded(1);
        let thread_shared = shared.clone();
        let thread = std::thread::Builder::new()
            .name(s!("eventio-loop"))
            .spawn(move || event_loop_main(thread_shared, ready_tx))
            .expect("failed to spawn the event thread");
        ready_rx.recv().expect("event thread failed to start");

        Ok(EventLoop {
            shared,
            thread: Some(thread),
        })
    }

    /// Request termination. With `cleanly` the loop keeps running until
    /// the last active device direction is gone; forced termination stops
    /// it at the next wakeup regardless.
    pub fn terminate(&self, cleanly: bool) {
        let terminate = if cleanly { TERM_CLEANLY } else { TERM_FORCED };
        self.shared.terminate.store(terminate, Release);
        self.shared.wake_up();
    }

    /// Wait for the event thread to exit and release the signal handler.
    pub fn join(mut self) { self.join_thread() }

    /// Number of active non-inferior device directions.
    pub fn active_count(&self) -> i32 { self.shared.active.load(Relaxed) }

    fn join_thread(&mut self) {
        let Some(thread) = self.thread.take() else { return };
        let _ = thread.join();
        signal::restore_default(self.shared.signum);
        let registered = CURRENT.swap(ptr::null_mut(), Acquire);
        if !registered.is_null() {
            drop(unsafe { Arc::from_raw(registered) });
        }
        self.shared.garbage.drain();
    }

    //
    // Device factories
    //

    /// An input device decoding the byte stream of an fd with `decoder`.
    pub fn input_device(&self, decoder: impl Decoder + 'static, spec: BufferSpec) -> DeviceRef {
        let (prod, cons) = streambuf(spec);
        Device::alloc(
            self.shared.clone(),
            Some(crate::device::InputHalf {
                prod,
                cons,
                decoder: Box::new(decoder),
            }),
            None,
        )
    }

    /// An output device; the returned [`OutputStream`] is the write end
    /// handed to the application.
    pub fn output_device(
        &self,
        events: impl OutputEvents + 'static,
        spec: BufferSpec,
    ) -> (DeviceRef, OutputStream) {
        let (prod, cons) = streambuf(spec);
        let device = Device::alloc(
            self.shared.clone(),
            None,
            Some(crate::device::OutputHalf {
                cons,
                events: Box::new(events),
            }),
        );
        let stream = OutputStream::new(device.clone(), prod);
        (device, stream)
    }

    /// A full-duplex device over a single fd.
    pub fn io_device(
        &self,
        decoder: impl Decoder + 'static,
        events: impl OutputEvents + 'static,
        input_spec: BufferSpec,
        output_spec: BufferSpec,
    ) -> (DeviceRef, OutputStream) {
        let (iprod, icons) = streambuf(input_spec);
        let (oprod, ocons) = streambuf(output_spec);
        let device = Device::alloc(
            self.shared.clone(),
            Some(crate::device::InputHalf {
                prod: iprod,
                cons: icons,
                decoder: Box::new(decoder),
            }),
            Some(crate::device::OutputHalf {
                cons: ocons,
                events: Box::new(events),
            }),
        );
        let stream = OutputStream::new(device.clone(), oprod);
        (device, stream)
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if self.thread.is_some() {
            self.shared.terminate.store(TERM_FORCED, Release);
            self.shared.wake_up();
            self.join_thread();
        }
    }
}

/// Body of the event thread.
fn event_loop_main(shared: Arc<LoopShared>, ready_tx: chan::Sender<()>) {
    shared
        .event_thread
        .store(unsafe { libc::pthread_self() } as u64, Release);
    // The wakeup signal stays blocked everywhere except inside the
    // readiness wait; a signal arriving between the stop check and the
    // wait is delivered the moment the wait unblocks it, as EINTR.
    let pwait_mask = signal::block_on_current_thread(shared.signum)
        .expect("cannot adjust the event thread signal mask");
    shared.running.store(true, Release);
    ready_tx.send(()).expect("event loop owner vanished");

    let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; MAX_EVENTS];
    loop {
        if shared.stop_running.load(Relaxed) {
            break;
        }
        let nfds = match shared.poller.wait(&mut events, &pwait_mask) {
            Ok(nfds) => nfds,
            Err(err) if err.raw_os_error() == Some(libc::EINTR) => {
                shared.garbage.drain();
                continue;
            }
            Err(err) => panic!("readiness wait failed: {err}"),
        };
        for event in &events[..nfds] {
            let device = unsafe { &*(event.u64 as *const Device) };
            let mask = event.events & EV_ALL;
            let fresh = mask & !device.claim_processing(mask);
            if fresh == 0 {
                // Every reported event is already being handled by a
                // worker; edge draining will pick the data up.
                continue;
            }
            device.inhibit_deletion();
            let ptr = DevPtr(NonNull::from(device));
            // The submission blocks when the pool queue is full; this is
            // the only place the event thread blocks outside the wait.
            let submitted = shared.pool.submit(move || {
                let ptr = ptr;
                let device = unsafe { ptr.0.as_ref() };
                device.process_events(fresh);
                device.allow_deletion(1);
            });
            if submitted.is_err() {
                #[cfg(feature = "log")]
                log::warn!(target: "eventio-loop", "worker pool gone; dropping I/O event");
                device.allow_deletion(1);
            }
        }
        shared.garbage.drain();
    }
    // The running store must precede the final drain: a release that lands
    // after it self-drains, a release that landed before it is caught
    // below. Draining first would leave a window where a push sees
    // `running == true` yet no further drain ever happens.
    shared.running.store(false, Release);
    shared.garbage.drain();
    shared.terminate.store(TERM_NOT_YET, Release);
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::os::unix::io::RawFd;
    use std::sync::atomic::Ordering::Relaxed;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::sync::{Arc, Mutex as StdMutex};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::decoder::Decoder;
    use crate::pool::ThreadPool;
    use crate::Msg;

    // One event loop per process at a time: serialize the tests.
    static SERIAL: StdMutex<()> = StdMutex::new(());

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn wait_until(what: &str, mut done: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !done() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[derive(Default)]
    struct Probe {
        bytes: AtomicUsize,
        messages: AtomicUsize,
        eof: AtomicBool,
        closed: AtomicBool,
        dropped: AtomicBool,
        collected: StdMutex<Vec<Vec<u8>>>,
    }

    struct CollectingDecoder {
        probe: Arc<Probe>,
        collect: bool,
    }

    impl Decoder for CollectingDecoder {
        fn decode(&mut self, msg: Msg) {
            self.probe.bytes.fetch_add(msg.len(), Relaxed);
            self.probe.messages.fetch_add(1, Relaxed);
            if self.collect {
                self.probe.collected.lock().unwrap().push(msg.to_vec());
            }
        }

        fn end_of_stream(&mut self) { self.probe.eof.store(true, Relaxed) }

        fn closed(&mut self) { self.probe.closed.store(true, Relaxed) }
    }

    impl Drop for CollectingDecoder {
        fn drop(&mut self) { self.probe.dropped.store(true, Relaxed) }
    }

    #[test]
    fn graceful_shutdown_after_eof() {
        let _serial = SERIAL.lock().unwrap_or_else(|err| err.into_inner());
        const TOTAL: usize = 1 << 20;

        let pool = ThreadPool::new(2, 32);
        let event_loop = EventLoop::new(pool.handle()).expect("event loop");
        let (rd, wr) = pipe();

        let probe = Arc::new(Probe::default());
        let device = event_loop.input_device(
            CollectingDecoder {
                probe: probe.clone(),
                collect: false,
            },
            BufferSpec::with_min_block(1024),
        );
        device.init(rd).expect("init");
        device.start_input();
        assert_eq!(event_loop.active_count(), 1);

        // Feed one mebibyte of newline-framed data through the pipe from
        // a plain blocking writer.
        let writer = std::thread::spawn(move || {
            let line = [b'x'; 63];
            let mut sent = 0;
            while sent < TOTAL {
                let mut chunk = Vec::with_capacity(4096);
                while chunk.len() < 4096 && sent < TOTAL {
                    chunk.extend_from_slice(&line);
                    chunk.push(b'\n');
                    sent += line.len() + 1;
                }
                let mut offset = 0;
                while offset < chunk.len() {
                    let written = unsafe {
                        libc::write(
                            wr,
                            chunk[offset..].as_ptr() as *const libc::c_void,
                            chunk.len() - offset,
                        )
                    };
                    assert!(written > 0, "pipe write failed");
                    offset += written as usize;
                }
            }
            unsafe { libc::close(wr) };
            sent
        });

        let sent = writer.join().expect("writer");
        wait_until("input EOF", || probe.eof.load(Relaxed));
        wait_until("all devices inactive", || event_loop.active_count() == 0);
        assert_eq!(probe.bytes.load(Relaxed), sent);
        assert!(probe.closed.load(Relaxed), "closed notification must fire");

        event_loop.terminate(true);
        event_loop.join();
        drop(device);
        pool.shutdown();
        assert!(probe.dropped.load(Relaxed), "device must be destroyed");
    }

    #[test]
    fn forced_shutdown_with_active_device() {
        let _serial = SERIAL.lock().unwrap_or_else(|err| err.into_inner());

        let pool = ThreadPool::new(2, 32);
        let event_loop = EventLoop::new(pool.handle()).expect("event loop");
        let (rd, wr) = pipe();

        let probe = Arc::new(Probe::default());
        let device = event_loop.input_device(
            CollectingDecoder {
                probe: probe.clone(),
                collect: false,
            },
            BufferSpec::default(),
        );
        device.init(rd).expect("init");
        device.start_input();
        assert_eq!(event_loop.active_count(), 1);

        // No EOF, no inactivity: only a forced termination may stop it.
        let started = Instant::now();
        event_loop.terminate(false);
        event_loop.join();
        assert!(started.elapsed() < Duration::from_secs(5), "one wakeup must suffice");

        device.close();
        drop(device);
        pool.shutdown();
        assert!(probe.dropped.load(Relaxed), "device must be destroyed");
        unsafe { libc::close(wr) };
    }

    #[test]
    fn newline_messages_across_blocks() {
        let _serial = SERIAL.lock().unwrap_or_else(|err| err.into_inner());

        let pool = ThreadPool::new(2, 32);
        let event_loop = EventLoop::new(pool.handle()).expect("event loop");
        let (rd, wr) = pipe();

        let probe = Arc::new(Probe::default());
        let device = event_loop.input_device(
            CollectingDecoder {
                probe: probe.clone(),
                collect: true,
            },
            // Blocks of 32 bytes force the second message to straddle.
            BufferSpec::with_min_block(32),
        );
        device.init(rd).expect("init");
        device.start_input();

        let mut payload = vec![b'A'; 30];
        payload.push(b'\n');
        payload.extend_from_slice(b"tail");
        assert_eq!(
            unsafe { libc::write(wr, payload.as_ptr() as *const libc::c_void, payload.len()) },
            payload.len() as isize
        );
        wait_until("first message", || probe.messages.load(Relaxed) >= 1);
        {
            let collected = probe.collected.lock().unwrap();
            assert_eq!(collected.len(), 1, "tail is incomplete and must wait");
            assert_eq!(collected[0].len(), 31);
            assert_eq!(&collected[0][..30], &payload[..30]);
            assert_eq!(collected[0][30], b'\n');
        }

        assert_eq!(unsafe { libc::write(wr, b"\n".as_ptr() as *const libc::c_void, 1) }, 1);
        wait_until("second message", || probe.messages.load(Relaxed) >= 2);
        {
            let collected = probe.collected.lock().unwrap();
            assert_eq!(collected[1], b"tail\n");
        }

        unsafe { libc::close(wr) };
        wait_until("input EOF", || probe.eof.load(Relaxed));
        event_loop.terminate(true);
        event_loop.join();
        drop(device);
        pool.shutdown();
    }

    #[test]
    fn output_device_drains_into_pipe() {
        let _serial = SERIAL.lock().unwrap_or_else(|err| err.into_inner());

        let pool = ThreadPool::new(2, 32);
        let event_loop = EventLoop::new(pool.handle()).expect("event loop");
        let (rd, wr) = pipe();

        let (device, mut stream) = event_loop.output_device((), BufferSpec::default());
        device.init(wr).expect("init");

        stream.write_all(b"ping over the loop\n").expect("buffered write");
        stream.flush().expect("flush");

        let mut received = Vec::new();
        let mut buf = [0u8; 64];
        wait_until("bytes on the pipe", || {
            let got =
                unsafe { libc::read(rd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if got > 0 {
                received.extend_from_slice(&buf[..got as usize]);
            }
            received.len() >= 19
        });
        assert_eq!(&received, b"ping over the loop\n");

        // Flushing an already empty stream is a cheap no-op.
        stream.flush().expect("idempotent flush");

        device.close_output();
        wait_until("device inactive", || event_loop.active_count() == 0);
        event_loop.terminate(true);
        event_loop.join();
        drop(stream);
        drop(device);
        pool.shutdown();
        unsafe { libc::close(rd) };
    }

    #[test]
    fn regular_file_bypasses_the_poller() {
        let _serial = SERIAL.lock().unwrap_or_else(|err| err.into_inner());

        let pool = ThreadPool::new(2, 32);
        let event_loop = EventLoop::new(pool.handle()).expect("event loop");

        let fd = unsafe {
            libc::memfd_create(b"eventio-test\0".as_ptr() as *const libc::c_char, 0)
        };
        assert!(fd >= 0, "memfd_create failed");

        let (device, mut stream) = event_loop.output_device((), BufferSpec::default());
        device.init(fd).expect("init");
        stream.write_all(b"file payload").expect("buffered write");
        stream.flush().expect("flush");

        let mut buf = [0u8; 64];
        wait_until("payload written to the file", || {
            let got = unsafe {
                libc::pread(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len(), 0)
            };
            got == 12
        });
        assert_eq!(&buf[..12], b"file payload");

        device.close_output();
        event_loop.terminate(true);
        event_loop.join();
        drop(stream);
        drop(device);
        pool.shutdown();
    }
}
