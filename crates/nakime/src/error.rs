use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The OS refused to create the child.
#[derive(Error, Debug)]
pub enum SpawnError {
	#[error("executable not found: {}", path.display())]
	NotFound { path: PathBuf },

	#[error("permission denied executing {}", path.display())]
	PermissionDenied { path: PathBuf },

	#[error("failed to spawn {}: {source}", path.display())]
	Io {
		path: PathBuf,
		#[source]
		source: io::Error,
	},
}

impl SpawnError {
	pub(crate) fn from_io(path: PathBuf, source: io::Error) -> Self {
		match source.kind() {
			io::ErrorKind::NotFound => SpawnError::NotFound { path },
			io::ErrorKind::PermissionDenied => SpawnError::PermissionDenied { path },
			_ => SpawnError::Io { path, source },
		}
	}

	pub fn path(&self) -> &PathBuf {
		match self {
			SpawnError::NotFound { path }
			| SpawnError::PermissionDenied { path }
			| SpawnError::Io { path, .. } => path,
		}
	}
}

/// Watcher setup failed.
#[derive(Error, Debug)]
pub enum WatchError {
	#[error("watch path does not exist: {}", path.display())]
	PathNotFound { path: PathBuf },

	#[error("invalid ignore pattern {pattern:?}: {source}")]
	Pattern {
		pattern: String,
		#[source]
		source: glob::PatternError,
	},

	#[error("OS watch limit exceeded while watching {} (raise fs.inotify.max_user_watches)", path.display())]
	LimitExceeded { path: PathBuf },

	#[error("failed to initialize file watcher: {0}")]
	Init(#[source] notify::Error),

	#[error("cannot watch {}: {source}", path.display())]
	Path {
		path: PathBuf,
		#[source]
		source: notify::Error,
	},
}

impl WatchError {
	pub(crate) fn from_notify(path: PathBuf, source: notify::Error) -> Self {
		match &source.kind {
			notify::ErrorKind::PathNotFound => WatchError::PathNotFound { path },
			notify::ErrorKind::MaxFilesWatch => WatchError::LimitExceeded { path },
			notify::ErrorKind::Io(e) if e.kind() == io::ErrorKind::NotFound => {
				WatchError::PathNotFound { path }
			}
			_ => WatchError::Path { path, source },
		}
	}
}

#[derive(Error, Debug)]
pub enum SupervisorError {
	#[error("{name}: already running")]
	AlreadyRunning { name: String },

	#[error("{name}: not running")]
	NotRunning { name: String },

	#[error(transparent)]
	Spawn(#[from] SpawnError),

	#[error(transparent)]
	Watch(#[from] WatchError),

	#[error("{name}: supervisor task has shut down")]
	Closed { name: String },
}

pub type Result<T, E = SupervisorError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn spawn_error_classifies_io_kind() {
		let err = SpawnError::from_io("/nope".into(), io::Error::from(io::ErrorKind::NotFound));
		assert!(matches!(err, SpawnError::NotFound { .. }));
		assert_eq!(err.to_string(), "executable not found: /nope");

		let err = SpawnError::from_io(
			"/etc/passwd".into(),
			io::Error::from(io::ErrorKind::PermissionDenied),
		);
		assert!(matches!(err, SpawnError::PermissionDenied { .. }));
		assert_eq!(err.path(), &PathBuf::from("/etc/passwd"));
	}

	#[test]
	fn watch_error_maps_notify_kinds() {
		let err = WatchError::from_notify(
			"/src".into(),
			notify::Error::new(notify::ErrorKind::MaxFilesWatch),
		);
		assert!(matches!(err, WatchError::LimitExceeded { .. }));

		let err = WatchError::from_notify("/src".into(), notify::Error::path_not_found());
		assert!(matches!(err, WatchError::PathNotFound { .. }));
	}
}
