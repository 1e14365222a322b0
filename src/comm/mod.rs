//! Thread-backed collective group.
//!
//! The archiver is written in a bulk-synchronous style: N rank threads make
//! the same sequence of collective calls (`broadcast`, `scan_sum`,
//! `allreduce_sum`, `all_true`, `barrier`) at the same points of the
//! algorithm. All collectives are built on one slot-exchange primitive: every
//! rank deposits a value, a barrier flips, every rank reads all values.
//!
//! The calls must be made by every member of the group in the same order;
//! mixing different collectives across ranks deadlocks, exactly as it would
//! on any message-passing substrate.

use std::any::Any;
use std::sync::{Arc, Barrier, Mutex};

struct Shared {
    barrier: Barrier,
    slots: Mutex<Vec<Option<Box<dyn Any + Send>>>>,
}

/// One rank's handle onto the collective group.
pub struct Group {
    rank: usize,
    size: usize,
    shared: Arc<Shared>,
}

impl Group {
    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn barrier(&self) {
        self.shared.barrier.wait();
    }

    /// Deposit a value and collect every rank's deposit, in rank order.
    fn exchange<T: Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        {
            let mut slots = self.shared.slots.lock().unwrap();
            slots[self.rank] = Some(Box::new(value));
        }
        self.shared.barrier.wait();
        let gathered: Vec<T> = {
            let slots = self.shared.slots.lock().unwrap();
            slots
                .iter()
                .map(|slot| {
                    slot.as_ref()
                        .expect("collective slot missing")
                        .downcast_ref::<T>()
                        .expect("collective type mismatch")
                        .clone()
                })
                .collect()
        };
        self.shared.barrier.wait();
        {
            let mut slots = self.shared.slots.lock().unwrap();
            slots[self.rank] = None;
        }
        self.shared.barrier.wait();
        gathered
    }

    /// Concatenation of every rank's value, in rank order.
    pub fn all_gather<T: Clone + Send + 'static>(&self, value: T) -> Vec<T> {
        self.exchange(value)
    }

    /// One value from `root` to everyone. The root must pass `Some`.
    pub fn broadcast<T: Clone + Send + 'static>(&self, value: Option<T>, root: usize) -> T {
        let mut gathered = self.exchange(value);
        gathered.swap_remove(root).expect("broadcast root supplied no value")
    }

    /// Inclusive prefix sum over ranks.
    pub fn scan_sum(&self, value: u64) -> u64 {
        let gathered = self.exchange(value);
        gathered[..=self.rank].iter().sum()
    }

    /// Sum of values on ranks below this one.
    pub fn exclusive_prefix_sum(&self, value: u64) -> u64 {
        self.scan_sum(value) - value
    }

    /// Global sum.
    pub fn allreduce_sum(&self, value: u64) -> u64 {
        self.exchange(value).iter().sum()
    }

    /// Global element-wise sum of a fixed-size counter vector.
    pub fn allreduce_sum2(&self, value: [u64; 2]) -> [u64; 2] {
        let gathered = self.exchange(value);
        let mut out = [0u64; 2];
        for v in gathered {
            out[0] += v[0];
            out[1] += v[1];
        }
        out
    }

    /// True only when every rank passed true.
    pub fn all_true(&self, value: bool) -> bool {
        self.exchange(value).into_iter().all(|v| v)
    }
}

/// Run one closure per rank on scoped threads and collect the results in
/// rank order. Panics in a rank propagate to the caller.
pub fn spawn<R, F>(size: usize, f: F) -> Vec<R>
where
    F: Fn(Group) -> R + Sync,
    R: Send,
{
    assert!(size > 0, "group must have at least one rank");
    let shared = Arc::new(Shared {
        barrier: Barrier::new(size),
        slots: Mutex::new((0..size).map(|_| None).collect()),
    });
    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(size);
        for rank in 0..size {
            let group = Group { rank, size, shared: Arc::clone(&shared) };
            let f = &f;
            handles.push(scope.spawn(move || f(group)));
        }
        handles
            .into_iter()
            .map(|h| h.join().expect("rank thread panicked"))
            .collect()
    })
}
