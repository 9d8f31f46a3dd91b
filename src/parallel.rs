// file: src/parallel.rs
// description: Fixed-size rayon worker pool that operators use to scatter independent rows.
// author: cipher-rc5

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use crate::error::Result;

/// A rayon pool whose thread count is fixed when the operator is built.
pub struct WorkerPool {
    pool: rayon::ThreadPool,
    threads: usize,
}

impl WorkerPool {
    /// `threads == 0` lets rayon pick the thread count.
    pub fn new(threads: usize, name: &str) -> Result<Self> {
        let prefix = name.to_string();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(move |idx| format!("{prefix}-{idx}"))
            .build()?;
        let threads = pool.current_num_threads();
        Ok(Self { pool, threads })
    }

    /// Process-wide pool for `threads` workers. Operators built with the
    /// same thread count share one pool, so the number of OS threads does
    /// not grow with the number of layers.
    pub fn shared(threads: usize) -> Result<Arc<WorkerPool>> {
        static POOLS: OnceLock<Mutex<HashMap<usize, Arc<WorkerPool>>>> = OnceLock::new();
        let mut pools = POOLS
            .get_or_init(Default::default)
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(pool) = pools.get(&threads) {
            return Ok(Arc::clone(pool));
        }
        let pool = Arc::new(WorkerPool::new(threads, &format!("cpu-ops-{threads}"))?);
        pools.insert(threads, Arc::clone(&pool));
        Ok(pool)
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs `op` inside the pool; parallel iterators used by `op` are
    /// scheduled on this pool's workers and joined before returning.
    pub fn install<OP, R>(&self, op: OP) -> R
    where
        OP: FnOnce() -> R + Send,
        R: Send,
    {
        self.pool.install(op)
    }
}

impl fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPool")
            .field("threads", &self.threads)
            .finish()
    }
}
