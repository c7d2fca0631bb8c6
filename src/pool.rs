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

//! Worker thread pool executing per-event closures.
//!
//! The queue is a bounded channel with the producer-wait / consumer-notify
//! discipline the dispatcher relies on: submitting into a full queue
//! blocks the submitter until a worker takes a task. Closures are oneshot
//! and carry no ordering guarantees between each other.

use std::thread::{self, JoinHandle};

use crossbeam_channel as chan;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// A fixed set of worker threads draining one bounded task queue.
pub struct ThreadPool {
    tx: Option<chan::Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `workers` threads behind a queue holding at most `capacity`
    /// pending tasks.
    pub fn new(workers: usize, capacity: usize) -> ThreadPool {
        let (tx, rx) = chan::bounded::<Task>(capacity);
        let workers = (0..workers.max(1))
            .map(|no| {
                let rx = rx.clone();
                thread::Builder::new()
                    .name(format!("eventio-worker-{no}"))
                    .spawn(move || {
                        for task in rx {
                            task();
                        }
                    })
                    .expect("failed to spawn a pool worker")
            })
            .collect();
        ThreadPool {
            tx: Some(tx),
            workers,
        }
    }

    /// A cloneable submission handle.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            tx: self.tx.as_ref().expect("pool queue missing").clone(),
        }
    }

    /// Stop accepting tasks, run out the queue and join all workers.
    pub fn shutdown(mut self) { self.join_workers() }

    fn join_workers(&mut self) {
        self.tx = None;
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) { self.join_workers() }
}

/// Producer access to the pool queue.
#[derive(Clone)]
pub struct PoolHandle {
    tx: chan::Sender<Task>,
}

impl PoolHandle {
    /// Enqueue a closure, blocking while the queue is full.
    ///
    /// Errors with the task given back when the pool has shut down.
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<(), ()> {
        self.tx.send(Box::new(task)).map_err(|_| ())
    }

    pub fn capacity(&self) -> usize { self.tx.capacity().unwrap_or(usize::MAX) }
    pub fn len(&self) -> usize { self.tx.len() }
    pub fn is_empty(&self) -> bool { self.tx.is_empty() }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    #[test]
    fn runs_all_tasks() {
        let pool = ThreadPool::new(4, 16);
        let handle = pool.handle();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            handle
                .submit(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .expect("pool alive");
        }
        pool.shutdown();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn submit_blocks_until_a_worker_frees_the_queue() {
        let pool = ThreadPool::new(1, 1);
        let handle = pool.handle();
        let (gate_tx, gate_rx) = crossbeam_channel::bounded::<()>(0);
        handle
            .submit(move || {
                gate_rx.recv().ok();
            })
            .expect("first task");
        // Fill the queue; the next submission has to wait for the worker.
        handle.submit(|| {}).expect("queued task");
        let blocked = {
            let handle = handle.clone();
            std::thread::spawn(move || handle.submit(|| {}).expect("unblocked task"))
        };
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!blocked.is_finished(), "submission must block on a full queue");
        gate_tx.send(()).expect("open the gate");
        blocked.join().expect("blocked submitter");
        pool.shutdown();
    }
}
