use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rand::Rng;

/// Strategy for assigning a newly accepted connection to an event loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadBalance {
    /// Uniform pick, independent across accepts.
    #[default]
    Random,
    /// Wrapping counter; even distribution in accept order.
    RoundRobin,
    /// Loop with the fewest live connections, lowest index on ties.
    LeastConnections,
}

/// Picks the owning loop for each accepted connection.
///
/// The per-loop connection counts are owned by the loops themselves: a
/// loop increments and decrements only its own slot, the balancer takes
/// relaxed snapshot reads. With one loop the choice is always 0.
pub(crate) struct Balancer {
    strategy: LoadBalance,
    next: AtomicUsize,
    counts: Arc<[AtomicUsize]>,
}

impl Balancer {
    pub(crate) fn new(strategy: LoadBalance, counts: Arc<[AtomicUsize]>) -> Self {
        Self {
            strategy,
            next: AtomicUsize::new(0),
            counts,
        }
    }

    pub(crate) fn choose(&self) -> usize {
        let n = self.counts.len();
        if n <= 1 {
            return 0;
        }
        match self.strategy {
            LoadBalance::Random => rand::thread_rng().gen_range(0..n),
            LoadBalance::RoundRobin => self.next.fetch_add(1, Ordering::Relaxed) % n,
            LoadBalance::LeastConnections => {
                let mut best = 0;
                let mut best_load = usize::MAX;
                for (i, c) in self.counts.iter().enumerate() {
                    let load = c.load(Ordering::Relaxed);
                    if load < best_load {
                        best = i;
                        best_load = load;
                    }
                }
                best
            }
        }
    }
}
