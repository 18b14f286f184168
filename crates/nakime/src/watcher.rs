//! Filesystem watching: notify events in, debounced [`ChangeEvent`]s out.

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::debounce::Debouncer;
use crate::error::WatchError;
use crate::ignore::IgnoreFilter;
use crate::types::{ChangeEvent, WatchSpec};

/// A cancellable stream of debounced change events.
///
/// Events arrive in emission order. Once cancelled (or dropped) the OS
/// watches are released and [`FileWatcher::next`] returns `None` forever.
pub struct FileWatcher {
	events: mpsc::UnboundedReceiver<ChangeEvent>,
	cancel: CancellationToken,
	task: Option<JoinHandle<()>>,
}

/// Cancels a [`FileWatcher`] from any thread.
#[derive(Debug, Clone)]
pub struct WatchCanceller(CancellationToken);

impl WatchCanceller {
	pub fn cancel(&self) {
		self.0.cancel();
	}

	pub fn is_cancelled(&self) -> bool {
		self.0.is_cancelled()
	}
}

/// Start watching `spec.paths` recursively. Must be called inside a tokio runtime.
pub fn watch(spec: &WatchSpec) -> Result<FileWatcher, WatchError> {
	let roots = canonical_roots(&spec.paths)?;
	let filter = IgnoreFilter::new(&spec.ignore)?.with_roots(roots.clone());

	let (raw_tx, raw_rx) = mpsc::unbounded_channel();
	let mut watcher = RecommendedWatcher::new(
		move |res: notify::Result<Event>| {
			let _ = raw_tx.send(res);
		},
		notify::Config::default(),
	)
	.map_err(WatchError::Init)?;

	for root in &roots {
		watcher
			.watch(root, RecursiveMode::Recursive)
			.map_err(|e| WatchError::from_notify(root.clone(), e))?;
	}

	info!(
		"watching {} path(s), {} ignore pattern(s), delay {}ms",
		roots.len(),
		spec.ignore.len(),
		spec.debounce_ms
	);

	let (tx, rx) = mpsc::unbounded_channel();
	let cancel = CancellationToken::new();
	let task = tokio::spawn(run_watch_loop(
		watcher,
		raw_rx,
		filter,
		Debouncer::from_millis(spec.debounce_ms),
		tx,
		cancel.clone(),
	));

	Ok(FileWatcher {
		events: rx,
		cancel,
		task: Some(task),
	})
}

impl FileWatcher {
	/// Wait for the next debounced change. `None` once cancelled.
	pub async fn next(&mut self) -> Option<ChangeEvent> {
		if self.cancel.is_cancelled() {
			return None;
		}
		tokio::select! {
			_ = self.cancel.cancelled() => None,
			event = self.events.recv() => event,
		}
	}

	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	pub fn canceller(&self) -> WatchCanceller {
		WatchCanceller(self.cancel.clone())
	}

	pub fn is_cancelled(&self) -> bool {
		self.cancel.is_cancelled()
	}

	/// Cancel and wait until the OS watches are released.
	pub async fn close(mut self) {
		self.cancel.cancel();
		if let Some(task) = self.task.take() {
			let _ = task.await;
		}
	}
}

impl Drop for FileWatcher {
	fn drop(&mut self) {
		self.cancel.cancel();
	}
}

fn canonical_roots(paths: &[PathBuf]) -> Result<Vec<PathBuf>, WatchError> {
	paths
		.iter()
		.map(|path| {
			std::fs::canonicalize(path)
				.map_err(|e| WatchError::from_notify(path.clone(), notify::Error::io(e)))
		})
		.collect()
}

fn is_change(kind: &EventKind) -> bool {
	matches!(
		kind,
		EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_) | EventKind::Any
	)
}

async fn run_watch_loop(
	watcher: RecommendedWatcher,
	mut raw: mpsc::UnboundedReceiver<notify::Result<Event>>,
	filter: IgnoreFilter,
	mut debouncer: Debouncer,
	out: mpsc::UnboundedSender<ChangeEvent>,
	cancel: CancellationToken,
) {
	// held for the lifetime of the loop; dropping it removes the OS watches
	let _watcher = watcher;
	let mut seq: u64 = 0;

	loop {
		let deadline = debouncer.deadline();
		tokio::select! {
			biased;
			_ = cancel.cancelled() => break,
			res = raw.recv() => match res {
				Some(Ok(event)) => {
					if !is_change(&event.kind) {
						continue;
					}
					for path in event.paths {
						if filter.is_ignored(&path) {
							trace!("ignored change: {}", path.display());
							continue;
						}
						trace!("raw change: {}", path.display());
						debouncer.record(path, Instant::now());
					}
				}
				Some(Err(e)) => warn!("file watcher error: {}", e),
				None => break,
			},
			_ = sleep_until(deadline) => {
				if let Some(burst) = debouncer.poll(Instant::now()) {
					seq += 1;
					debug!(
						"change #{}: {} ({} raw event(s))",
						seq,
						burst.last_path.display(),
						burst.count
					);
					let event = ChangeEvent {
						path: burst.last_path,
						seq,
						coalesced: burst.count,
						at: Instant::now(),
					};
					if out.send(event).is_err() {
						break;
					}
				}
			}
		}
	}

	debug!("file watcher stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
		None => std::future::pending().await,
	}
}
