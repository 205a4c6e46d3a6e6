#![allow(clippy::tabs_in_doc_comments)]

use num_traits::ToPrimitive;
use std::{
	sync::{
		atomic::{AtomicU64, Ordering},
		Arc,
	},
	time::{Duration, Instant},
};

/**
A `ProgressCounter` tracks how many instances have been explained so far, across every worker thread of a rayon pool.

Explaining a batch is embarrassingly parallel, so the counter is cloned into each worker and incremented with a relaxed atomic add after each instance:

```ignore
use treeshap_progress::ProgressCounter;

let progress_counter = ProgressCounter::new(n_instances as u64);
rows.par_chunks_mut(row_size).for_each(|row| {
	explain_row(row);
	progress_counter.inc(1);
});
```

The counter also remembers when it was created, so a caller polling it from another thread can report the elapsed time and an estimate of the time remaining.
*/
#[derive(Clone, Debug)]
pub struct ProgressCounter {
	current: Arc<AtomicU64>,
	total: u64,
	start: Instant,
}

impl ProgressCounter {
	/// Create a new `ProgressCounter` that will count from 0 up to the specified `total`.
	pub fn new(total: u64) -> Self {
		Self {
			current: Arc::new(AtomicU64::new(0)),
			total,
			start: Instant::now(),
		}
	}

	pub fn total(&self) -> u64 {
		self.total
	}

	pub fn get(&self) -> u64 {
		self.current.load(Ordering::Relaxed)
	}

	pub fn inc(&self, amount: u64) {
		self.current.fetch_add(amount, Ordering::Relaxed);
	}

	/// The fraction of the work completed, in [0, 1]. An empty counter is complete.
	pub fn fraction(&self) -> f32 {
		if self.total == 0 {
			return 1.0;
		}
		let current = self.get().min(self.total);
		current.to_f32().unwrap() / self.total.to_f32().unwrap()
	}

	pub fn elapsed(&self) -> Duration {
		self.start.elapsed()
	}

	/// Extrapolate the remaining time from the average time per completed item. Returns `None` until at least one item has completed.
	pub fn estimate_remaining(&self) -> Option<Duration> {
		let current = self.get().min(self.total);
		if current == 0 {
			return None;
		}
		let remaining = self.total - current;
		let seconds_per_item = self.elapsed().as_secs_f64() / current.to_f64().unwrap();
		Some(Duration::from_secs_f64(
			seconds_per_item * remaining.to_f64().unwrap(),
		))
	}
}

#[test]
fn test_progress_counter() {
	let progress_counter = ProgressCounter::new(4);
	assert_eq!(progress_counter.fraction(), 0.0);
	assert!(progress_counter.estimate_remaining().is_none());
	let clone = progress_counter.clone();
	clone.inc(1);
	progress_counter.inc(2);
	assert_eq!(progress_counter.get(), 3);
	assert_eq!(clone.fraction(), 0.75);
	assert!(progress_counter.estimate_remaining().is_some());
	progress_counter.inc(1);
	assert_eq!(progress_counter.estimate_remaining(), Some(Duration::from_secs(0)));
}

#[test]
fn test_empty_progress_counter() {
	let progress_counter = ProgressCounter::new(0);
	assert_eq!(progress_counter.fraction(), 1.0);
	assert!(progress_counter.estimate_remaining().is_none());
}
