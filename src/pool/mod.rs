//! Work pool for the payload copy phase.
//!
//! All ranks share one MPMC queue and a pending-task counter. Each rank first
//! runs the create callback to enqueue its locally known work, then every
//! rank drains the queue until it is globally empty, so a rank that finishes
//! its own files early keeps pulling items enqueued by slower ranks. The
//! reduce callback runs on every poll iteration and is expected to rate-limit
//! itself (the progress tracker does).
//!
//! Callbacks are closures, so the build context (open archive descriptor,
//! options, counters) travels by capture instead of through globals.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{unbounded, Sender, TryRecvError};

use crate::comm::Group;

/// Handle through which callbacks enqueue work.
pub struct TaskQueue<T> {
    tx: Sender<T>,
    pending: Arc<AtomicU64>,
}

impl<T> Clone for TaskQueue<T> {
    fn clone(&self) -> Self {
        TaskQueue { tx: self.tx.clone(), pending: Arc::clone(&self.pending) }
    }
}

impl<T> TaskQueue<T> {
    pub fn enqueue(&self, item: T) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(item).is_err() {
            self.pending.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

/// Run one distributed work phase.
///
/// Every rank of the group must call this with the same type parameters.
/// `create` enqueues this rank's initial items; `process` handles one item
/// and may enqueue follow-up work; `reduce` is polled for telemetry.
pub fn run<T, C, P, R>(group: &Group, create: C, mut process: P, mut reduce: R)
where
    T: Send + 'static,
    C: FnOnce(&TaskQueue<T>),
    P: FnMut(T, &TaskQueue<T>),
    R: FnMut(),
{
    let channel = if group.rank() == 0 {
        let (tx, rx) = unbounded::<T>();
        Some((tx, rx, Arc::new(AtomicU64::new(0))))
    } else {
        None
    };
    let (tx, rx, pending) = group.broadcast(channel, 0);
    let queue = TaskQueue { tx, pending: Arc::clone(&pending) };

    create(&queue);
    group.barrier();

    loop {
        match rx.try_recv() {
            Ok(item) => {
                process(item, &queue);
                pending.fetch_sub(1, Ordering::SeqCst);
            }
            Err(TryRecvError::Empty) => {
                if pending.load(Ordering::SeqCst) == 0 {
                    break;
                }
                std::thread::sleep(Duration::from_millis(1));
            }
            Err(TryRecvError::Disconnected) => break,
        }
        reduce();
    }

    group.barrier();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm;

    #[test]
    fn all_items_processed_once() {
        let results = comm::spawn(4, |group| {
            let done = Arc::new(AtomicU64::new(0));
            let done_in = Arc::clone(&done);
            run(
                &group,
                |queue| {
                    // every rank contributes 25 items
                    for i in 0..25u64 {
                        queue.enqueue(group.rank() as u64 * 100 + i);
                    }
                },
                move |_item, _queue| {
                    done_in.fetch_add(1, Ordering::SeqCst);
                },
                || {},
            );
            done.load(Ordering::SeqCst)
        });
        let total: u64 = results.iter().sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn follow_up_work_is_drained() {
        let results = comm::spawn(2, |group| {
            let done = Arc::new(AtomicU64::new(0));
            let done_in = Arc::clone(&done);
            run(
                &group,
                |queue| {
                    if group.rank() == 0 {
                        queue.enqueue(3u64);
                    }
                },
                move |item, queue| {
                    done_in.fetch_add(1, Ordering::SeqCst);
                    if item > 0 {
                        queue.enqueue(item - 1);
                    }
                },
                || {},
            );
            done.load(Ordering::SeqCst)
        });
        let total: u64 = results.iter().sum();
        assert_eq!(total, 4);
    }
}
