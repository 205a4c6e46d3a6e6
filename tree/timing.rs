use num_traits::ToPrimitive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

#[derive(Debug)]
pub struct Timing {
	pub tree_path_dependent: TimingDuration,
	pub interactions: TimingDuration,
	pub saabas: TimingDuration,
	pub independent_reformat: TimingDuration,
	pub independent_background_margins: TimingDuration,
	pub independent_output_pass: TimingDuration,
	pub build_merged_tree: TimingDuration,
	pub explain_merged_tree: TimingDuration,
	pub total: TimingDuration,
}

pub struct TimingDuration(AtomicU64);

impl Timing {
	pub fn new() -> Timing {
		Timing {
			tree_path_dependent: TimingDuration::new(),
			interactions: TimingDuration::new(),
			saabas: TimingDuration::new(),
			independent_reformat: TimingDuration::new(),
			independent_background_margins: TimingDuration::new(),
			independent_output_pass: TimingDuration::new(),
			build_merged_tree: TimingDuration::new(),
			explain_merged_tree: TimingDuration::new(),
			total: TimingDuration::new(),
		}
	}
}

impl TimingDuration {
	pub fn new() -> Self {
		Self(AtomicU64::new(0))
	}
	pub fn get(&self) -> Duration {
		Duration::from_nanos(self.0.load(Ordering::Relaxed))
	}
	pub fn inc(&self, value: Duration) -> u64 {
		self.0
			.fetch_add(value.as_nanos().to_u64().unwrap(), Ordering::Relaxed)
	}
}

impl std::fmt::Debug for TimingDuration {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{:?}", self.get())
	}
}

#[test]
fn test_timing_duration_accumulates() {
	let timing = Timing::new();
	timing.independent_reformat.inc(Duration::from_micros(3));
	timing.independent_reformat.inc(Duration::from_micros(4));
	assert_eq!(timing.independent_reformat.get(), Duration::from_micros(7));
	assert_eq!(timing.total.get(), Duration::from_nanos(0));
	assert_eq!(format!("{:?}", timing.independent_reformat), "7µs");
}
