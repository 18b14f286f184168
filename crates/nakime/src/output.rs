use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tracing::warn;

use crate::logs;

const RING_BUFFER_SIZE: usize = 64 * 1024;

/// Where a child's stdout/stderr go.
#[derive(Clone, Default)]
pub enum OutputMode {
	/// Share the supervisor's stdout/stderr.
	#[default]
	Inherit,
	/// Pipe both streams into a capture; drained concurrently with `wait`.
	Capture(OutputCapture),
}

/// Ring buffer of recent output, a size-rotated log file and a live feed.
///
/// Clones share the same buffers, so a capture survives restarts of the
/// child it is attached to.
#[derive(Clone)]
pub struct OutputCapture {
	ring: Arc<Mutex<VecDeque<u8>>>,
	log_writer: Option<Arc<Mutex<LogWriter>>>,
	sender: broadcast::Sender<Vec<u8>>,
}

struct LogWriter {
	file: Option<File>,
	bytes_written: u64,
	max_size: u64,
	keep: u32,
	log_dir: PathBuf,
	name: String,
}

impl OutputCapture {
	/// In-memory only: ring buffer and live feed, no log file.
	pub fn memory() -> Self {
		let (sender, _) = broadcast::channel(256);
		Self {
			ring: Arc::new(Mutex::new(VecDeque::with_capacity(RING_BUFFER_SIZE))),
			log_writer: None,
			sender,
		}
	}

	/// Also append to `<log_dir>/<name>.log`, rotating once it reaches
	/// `max_log_size` bytes and keeping `keep` rotated files.
	pub fn with_log_file(log_dir: &Path, name: &str, max_log_size: u64, keep: u32) -> Self {
		if let Err(e) = fs::create_dir_all(log_dir) {
			warn!("cannot create log dir {}: {}", log_dir.display(), e);
		}
		let path = logs::log_path(log_dir, name);
		let file = open_append(&path);
		let bytes_written = file
			.as_ref()
			.and_then(|f| f.metadata().ok())
			.map(|m| m.len())
			.unwrap_or(0);

		Self {
			log_writer: Some(Arc::new(Mutex::new(LogWriter {
				file,
				bytes_written,
				max_size: max_log_size,
				keep,
				log_dir: log_dir.to_path_buf(),
				name: name.to_string(),
			}))),
			..Self::memory()
		}
	}

	pub async fn write(&self, data: &[u8]) {
		{
			let mut ring = self.ring.lock().await;
			let overflow = (ring.len() + data.len()).saturating_sub(RING_BUFFER_SIZE);
			let cut = overflow.min(ring.len());
			ring.drain(..cut);
			let tail = data.len().saturating_sub(RING_BUFFER_SIZE);
			ring.extend(&data[tail..]);
		}

		if let Some(writer) = &self.log_writer {
			writer.lock().await.write(data);
		}

		let _ = self.sender.send(data.to_vec());
	}

	pub async fn snapshot(&self) -> Vec<u8> {
		let ring = self.ring.lock().await;
		ring.iter().copied().collect()
	}

	pub fn subscribe(&self) -> broadcast::Receiver<Vec<u8>> {
		self.sender.subscribe()
	}

	/// Copy `reader` into the capture until EOF.
	pub async fn drain<R: AsyncRead + Unpin>(&self, mut reader: R) {
		let mut buf = [0u8; 4096];
		loop {
			match reader.read(&mut buf).await {
				Ok(0) => break,
				Ok(n) => self.write(&buf[..n]).await,
				Err(_) => break,
			}
		}
	}
}

fn open_append(path: &Path) -> Option<File> {
	match OpenOptions::new().create(true).append(true).open(path) {
		Ok(f) => Some(f),
		Err(e) => {
			warn!("cannot open log file {}: {}", path.display(), e);
			None
		}
	}
}

impl LogWriter {
	fn write(&mut self, data: &[u8]) {
		if let Some(ref mut file) = self.file {
			if let Err(e) = file.write_all(data) {
				warn!("log write failed for {}: {}", self.name, e);
				return;
			}
			self.bytes_written += data.len() as u64;

			if self.max_size > 0 && self.bytes_written >= self.max_size {
				self.rotate();
			}
		}
	}

	fn rotate(&mut self) {
		drop(self.file.take());
		if let Err(e) = logs::rotate(&self.log_dir, &self.name, self.keep) {
			warn!("log rotation failed for {}: {}", self.name, e);
		}
		self.file = open_append(&logs::log_path(&self.log_dir, &self.name));
		self.bytes_written = 0;
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn ring_keeps_most_recent_bytes() {
		let capture = OutputCapture::memory();
		capture.write(&vec![b'a'; RING_BUFFER_SIZE]).await;
		capture.write(b"tail").await;

		let snapshot = capture.snapshot().await;
		assert_eq!(snapshot.len(), RING_BUFFER_SIZE);
		assert!(snapshot.ends_with(b"aaaatail"));
	}

	#[tokio::test]
	async fn subscribers_see_live_output() {
		let capture = OutputCapture::memory();
		let mut rx = capture.subscribe();
		capture.write(b"hello").await;
		assert_eq!(rx.recv().await.unwrap(), b"hello".to_vec());
	}

	#[tokio::test]
	async fn log_file_rotates_at_max_size() {
		let tmp = tempfile::tempdir().unwrap();
		let capture = OutputCapture::with_log_file(tmp.path(), "bot", 10, 3);

		capture.write(b"0123456789").await;
		capture.write(b"abc").await;

		let rotated = fs::read_to_string(logs::rotated_log_path(tmp.path(), "bot", 1)).unwrap();
		assert_eq!(rotated, "0123456789");
		let current = fs::read_to_string(logs::log_path(tmp.path(), "bot")).unwrap();
		assert_eq!(current, "abc");
	}

	#[tokio::test]
	async fn drain_reads_until_eof() {
		let capture = OutputCapture::memory();
		capture.drain(&b"line one\nline two\n"[..]).await;
		assert_eq!(capture.snapshot().await, b"line one\nline two\n".to_vec());
	}
}
