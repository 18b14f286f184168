use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

/// What to launch: one executable with its argv, working directory and environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
	pub name: String,
	pub executable: PathBuf,
	#[serde(default)]
	pub args: Vec<String>,
	pub cwd: PathBuf,
	#[serde(default)]
	pub env: HashMap<String, String>,
	/// Start the child with an empty environment instead of inheriting ours.
	#[serde(default)]
	pub clear_env: bool,
}

impl ProcessSpec {
	pub fn new(name: impl Into<String>, executable: impl Into<PathBuf>) -> Self {
		Self {
			name: name.into(),
			executable: executable.into(),
			args: Vec::new(),
			cwd: PathBuf::from("."),
			env: HashMap::new(),
			clear_env: false,
		}
	}

	pub fn arg(mut self, arg: impl Into<String>) -> Self {
		self.args.push(arg.into());
		self
	}

	pub fn args<I, S>(mut self, args: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.args.extend(args.into_iter().map(Into::into));
		self
	}

	pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
		self.cwd = cwd.into();
		self
	}

	pub fn env(mut self, key: impl Into<String>, val: impl Into<String>) -> Self {
		self.env.insert(key.into(), val.into());
		self
	}

	/// The command line as a single display string, for logs.
	pub fn command_line(&self) -> String {
		let mut line = self.executable.display().to_string();
		for arg in &self.args {
			line.push(' ');
			line.push_str(arg);
		}
		line
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchSpec {
	pub paths: Vec<PathBuf>,
	#[serde(default)]
	pub ignore: Vec<String>,
	#[serde(default = "default_debounce_ms")]
	pub debounce_ms: u64,
}

fn default_debounce_ms() -> u64 {
	1000
}

impl WatchSpec {
	pub fn new<I, P>(paths: I) -> Self
	where
		I: IntoIterator<Item = P>,
		P: Into<PathBuf>,
	{
		Self {
			paths: paths.into_iter().map(Into::into).collect(),
			ignore: Vec::new(),
			debounce_ms: default_debounce_ms(),
		}
	}

	pub fn ignore<I, S>(mut self, patterns: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: Into<String>,
	{
		self.ignore.extend(patterns.into_iter().map(Into::into));
		self
	}

	pub fn debounce_ms(mut self, ms: u64) -> Self {
		self.debounce_ms = ms;
		self
	}
}

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitStatus {
	Exited { code: i32 },
	Signaled { signal: i32 },
}

impl ExitStatus {
	pub fn success(&self) -> bool {
		matches!(self, ExitStatus::Exited { code: 0 })
	}
}

impl From<std::process::ExitStatus> for ExitStatus {
	fn from(status: std::process::ExitStatus) -> Self {
		use std::os::unix::process::ExitStatusExt;
		match (status.code(), status.signal()) {
			(Some(code), _) => ExitStatus::Exited { code },
			(None, Some(signal)) => ExitStatus::Signaled { signal },
			// neither code nor signal only happens for stopped/continued children
			(None, None) => ExitStatus::Exited { code: -1 },
		}
	}
}

impl fmt::Display for ExitStatus {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ExitStatus::Exited { code } => write!(f, "exit code {}", code),
			ExitStatus::Signaled { signal } => write!(f, "signal {}", signal),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessState {
	Stopped,
	Starting,
	Running { pid: u32 },
	Restarting,
	/// The child went away on its own. `exit` is `None` when a restart failed to spawn.
	Crashed { exit: Option<ExitStatus> },
}

impl ProcessState {
	pub fn is_running(&self) -> bool {
		matches!(self, ProcessState::Running { .. })
	}

	pub fn is_stopped(&self) -> bool {
		matches!(self, ProcessState::Stopped)
	}

	pub fn is_crashed(&self) -> bool {
		matches!(self, ProcessState::Crashed { .. })
	}

	pub fn label(&self) -> &'static str {
		match self {
			ProcessState::Stopped => "stopped",
			ProcessState::Starting => "starting",
			ProcessState::Running { .. } => "running",
			ProcessState::Restarting => "restarting",
			ProcessState::Crashed { .. } => "crashed",
		}
	}
}

impl fmt::Display for ProcessState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			ProcessState::Running { pid } => write!(f, "running (pid {})", pid),
			ProcessState::Crashed { exit: Some(exit) } => write!(f, "crashed ({})", exit),
			ProcessState::Crashed { exit: None } => write!(f, "crashed (spawn failed)"),
			other => f.write_str(other.label()),
		}
	}
}

/// Snapshot of one supervisor, published on every state change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStatus {
	pub name: String,
	pub state: ProcessState,
	pub pid: Option<u32>,
	/// Completed restarts of any kind (watch, manual, crash policy).
	pub restarts: u32,
	pub last_exit: Option<ExitStatus>,
	pub last_error: Option<String>,
	pub watching: bool,
}

impl SupervisorStatus {
	pub fn new(name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			state: ProcessState::Stopped,
			pid: None,
			restarts: 0,
			last_exit: None,
			last_error: None,
			watching: false,
		}
	}

	pub fn is_running(&self) -> bool {
		self.state.is_running()
	}
}

/// One debounced burst of filesystem activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
	/// Path of the last raw event in the burst.
	pub path: PathBuf,
	/// Monotonic per watcher, starting at 1.
	pub seq: u64,
	/// Number of raw events folded into this one.
	pub coalesced: usize,
	pub at: Instant,
}

impl ChangeEvent {
	pub fn new(path: impl Into<PathBuf>, seq: u64) -> Self {
		Self {
			path: path.into(),
			seq,
			coalesced: 1,
			at: Instant::now(),
		}
	}
}
