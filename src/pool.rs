//! Worker pool coordinator: maps independent units of work over a
//! bounded pool and merges each task's local result into shared state
//! under one mutex. Task bodies never touch shared state directly; the
//! lock is held only for the merge step, never across I/O or decoding.

use crate::error::{Result, StoreError};
use rayon::prelude::*;
use rayon::ThreadPoolBuilder;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

pub struct WorkerPool {
	pool: rayon::ThreadPool,
}

impl WorkerPool {
	/// `threads == 0` sizes the pool to the available parallelism.
	pub fn new(threads: usize) -> Result<WorkerPool> {
		let pool = ThreadPoolBuilder::new()
			.num_threads(threads)
			.build()
			.map_err(|e| StoreError::Config(format!("worker pool: {}", e)))?;
		Ok(WorkerPool { pool })
	}

	pub fn threads(&self) -> usize {
		self.pool.current_num_threads()
	}

	/// Run `task` over every item, merging each result into `shared`.
	///
	/// The first error recorded wins and cancels items not yet started;
	/// tasks already running complete but their results are discarded.
	/// The error surfaces only after the pool has drained. Merges that
	/// fail count as task errors.
	pub fn run<I, R, S, T, M>(&self, items: Vec<I>, shared: &Mutex<S>, task: T, merge: M) -> Result<()>
	where
		I: Send,
		R: Send,
		S: Send,
		T: Fn(I) -> Result<R> + Sync,
		M: Fn(&mut S, R) -> Result<()> + Sync,
	{
		let cancelled = AtomicBool::new(false);
		let first_error: Mutex<Option<StoreError>> = Mutex::new(None);

		self.pool.install(|| {
			items.into_par_iter().for_each(|item| {
				if cancelled.load(Ordering::Relaxed) {
					return;
				}
				let outcome = task(item).and_then(|result| {
					if cancelled.load(Ordering::Relaxed) {
						// A sibling failed while this task ran; drop the
						// result instead of merging it.
						return Ok(());
					}
					let mut guard = shared.lock().expect("shared state lock poisoned");
					merge(&mut guard, result)
				});
				if let Err(error) = outcome {
					cancelled.store(true, Ordering::Relaxed);
					let mut slot = first_error.lock().expect("error slot lock poisoned");
					if slot.is_none() {
						*slot = Some(error);
					}
				}
			});
		});

		match first_error.into_inner().expect("error slot lock poisoned") {
			Some(error) => Err(error),
			None => Ok(()),
		}
	}
}
