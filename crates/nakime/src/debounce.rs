//! Trailing-edge debounce for file change bursts.
//!
//! The clock is passed in so the watcher task and tests drive the same
//! logic: raw events are recorded with `record`, and `poll` hands out one
//! [`Burst`] once `delay` has passed since the last raw event.

use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Burst {
	pub last_path: PathBuf,
	pub count: usize,
}

#[derive(Debug)]
struct Pending {
	last_path: PathBuf,
	last_at: Instant,
	count: usize,
}

#[derive(Debug)]
pub struct Debouncer {
	delay: Duration,
	pending: Option<Pending>,
}

impl Debouncer {
	pub fn new(delay: Duration) -> Self {
		Self { delay, pending: None }
	}

	pub fn from_millis(ms: u64) -> Self {
		Self::new(Duration::from_millis(ms))
	}

	/// Record a raw event; pushes the deadline back to `now + delay`.
	pub fn record(&mut self, path: PathBuf, now: Instant) {
		match &mut self.pending {
			Some(pending) => {
				pending.last_path = path;
				pending.last_at = now;
				pending.count += 1;
			}
			None => {
				self.pending = Some(Pending {
					last_path: path,
					last_at: now,
					count: 1,
				});
			}
		}
	}

	/// When the pending burst becomes ready, if there is one.
	pub fn deadline(&self) -> Option<Instant> {
		self.pending.as_ref().map(|p| p.last_at + self.delay)
	}

	/// Take the burst if it has been quiet for `delay`.
	pub fn poll(&mut self, now: Instant) -> Option<Burst> {
		let ready = self
			.deadline()
			.is_some_and(|deadline| now >= deadline);
		if !ready {
			return None;
		}
		self.pending.take().map(|p| Burst {
			last_path: p.last_path,
			count: p.count,
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn ms(n: u64) -> Duration {
		Duration::from_millis(n)
	}

	#[test]
	fn burst_within_delay_emits_once() {
		let t0 = Instant::now();
		let mut d = Debouncer::from_millis(1000);

		for i in 0..10u64 {
			d.record(PathBuf::from(format!("src/{}.py", i)), t0 + ms(i * 50));
		}

		assert_eq!(d.poll(t0 + ms(1000)), None);
		let burst = d.poll(t0 + ms(450 + 1000)).expect("burst ready");
		assert_eq!(burst.count, 10);
		assert_eq!(burst.last_path, PathBuf::from("src/9.py"));
		assert_eq!(d.poll(t0 + ms(5000)), None);
	}

	#[test]
	fn deadline_trails_last_event() {
		let t0 = Instant::now();
		let mut d = Debouncer::from_millis(1000);
		assert_eq!(d.deadline(), None);

		d.record("src/a.py".into(), t0);
		assert_eq!(d.deadline(), Some(t0 + ms(1000)));

		d.record("src/b.py".into(), t0 + ms(200));
		assert_eq!(d.deadline(), Some(t0 + ms(1200)));
		assert_eq!(d.poll(t0 + ms(1100)), None);
		assert!(d.poll(t0 + ms(1200)).is_some());
	}

	#[test]
	fn separated_bursts_emit_separately() {
		let t0 = Instant::now();
		let mut d = Debouncer::from_millis(100);

		d.record("a".into(), t0);
		assert!(d.poll(t0 + ms(100)).is_some());

		d.record("b".into(), t0 + ms(300));
		let burst = d.poll(t0 + ms(400)).unwrap();
		assert_eq!(burst.count, 1);
		assert_eq!(burst.last_path, PathBuf::from("b"));
	}

	#[test]
	fn zero_delay_is_ready_immediately() {
		let t0 = Instant::now();
		let mut d = Debouncer::from_millis(0);
		d.record("a".into(), t0);
		assert!(d.poll(t0).is_some());
	}
}
