//! Bounded worker pool for per-plane extraction.
//!
//! ```text
//!   caller ──tasks──► [ crossbeam queue ] ──► worker 1 ─┐
//!      │                     │            ──► worker 2 ─┤  scope join
//!      └────── drains ◄──────┘            ──► ...      ─┘
//! ```
//!
//! Every task is queued before any runs and the sender is dropped, so the
//! queue only shrinks. Tasks borrow their inputs and their own output slot
//! from the caller's stack; [`Executor::run_all`] returns only after every
//! task finished. A panicking task propagates out of `run_all`.

use log::{debug, warn};

/// One unit of work; borrows live for the duration of [`Executor::run_all`].
pub type Task<'a> = Box<dyn FnOnce() + Send + 'a>;

#[derive(Debug, Clone)]
pub struct Executor {
    name: String,
    threads: usize,
}

impl Executor {
    /// Pool of `threads` workers (the calling thread counts as one).
    #[must_use]
    pub fn new(name: &str, threads: usize) -> Self {
        Self { name: name.to_string(), threads: threads.max(1) }
    }

    /// One worker per available CPU.
    #[must_use]
    pub fn with_available_parallelism(name: &str) -> Self {
        let threads = std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get);
        Self::new(name, threads)
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.threads
    }

    /// Runs every task and joins.
    pub fn run_all(&self, tasks: Vec<Task<'_>>) {
        if tasks.is_empty() {
            return;
        }
        let num_tasks = tasks.len();
        let (tx, rx) = crossbeam_channel::unbounded::<Task<'_>>();
        for task in tasks {
            // The receiver outlives this loop.
            let _ = tx.send(task);
        }
        drop(tx);

        let helpers = (self.threads - 1).min(num_tasks - 1);
        debug!("{}: {num_tasks} tasks on {} threads", self.name, helpers + 1);
        std::thread::scope(|scope| {
            for i in 0..helpers {
                let rx = rx.clone();
                let spawned = std::thread::Builder::new()
                    .name(format!("{}-{i}", self.name))
                    .spawn_scoped(scope, move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    });
                if let Err(e) = spawned {
                    warn!("{}: failed to spawn worker {i}: {e}", self.name);
                }
            }
            while let Ok(task) = rx.try_recv() {
                task();
            }
        });
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::with_available_parallelism("opstats")
    }
}
