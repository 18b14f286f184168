use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::SpawnError;
use crate::output::OutputMode;
use crate::types::{ExitStatus, ProcessSpec};

const GROUP_POLL: Duration = Duration::from_millis(20);
const KILL_SETTLE: Duration = Duration::from_millis(500);

/// One live (or reaped) child process.
///
/// The child leads its own process group so signals reach anything it
/// forks. Stopping a handle takes down the whole group, not just the
/// leader; dropping one whose group was never cleared SIGKILLs it.
pub struct ProcessHandle {
	name: String,
	pid: u32,
	child: Child,
	exit: Option<ExitStatus>,
	group_cleared: bool,
	drains: Vec<JoinHandle<()>>,
}

impl ProcessHandle {
	pub fn start(spec: &ProcessSpec, output: &OutputMode) -> Result<Self, SpawnError> {
		let mut cmd = Command::new(&spec.executable);
		cmd.args(&spec.args)
			.current_dir(&spec.cwd)
			.stdin(Stdio::null())
			.process_group(0)
			.kill_on_drop(true);

		if spec.clear_env {
			cmd.env_clear();
		}
		cmd.envs(&spec.env);

		match output {
			OutputMode::Inherit => {
				cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
			}
			OutputMode::Capture(_) => {
				cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
			}
		}

		let mut child = cmd
			.spawn()
			.map_err(|e| SpawnError::from_io(spec.executable.clone(), e))?;
		// only None after the child has been polled to completion
		let pid = child.id().unwrap_or(0);

		let mut drains = Vec::new();
		if let OutputMode::Capture(capture) = output {
			if let Some(stdout) = child.stdout.take() {
				let out = capture.clone();
				drains.push(tokio::spawn(async move { out.drain(stdout).await }));
			}
			if let Some(stderr) = child.stderr.take() {
				let out = capture.clone();
				drains.push(tokio::spawn(async move { out.drain(stderr).await }));
			}
		}

		info!("{}: spawned pid {} ({})", spec.name, pid, spec.command_line());

		Ok(Self {
			name: spec.name.clone(),
			pid,
			child,
			exit: None,
			group_cleared: false,
			drains,
		})
	}

	pub fn pid(&self) -> u32 {
		self.pid
	}

	/// Non-blocking check for exit.
	pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
		if self.exit.is_some() {
			return Ok(self.exit);
		}
		let status = self.child.try_wait()?.map(ExitStatus::from);
		if status.is_some() {
			self.exit = status;
		}
		Ok(status)
	}

	/// Wait for the child to exit. Returns at once if it already has.
	///
	/// Cancel safe: dropping the future leaves the child running and the
	/// handle usable.
	pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
		if let Some(status) = self.exit {
			return Ok(status);
		}
		let status = ExitStatus::from(self.child.wait().await?);
		self.exit = Some(status);
		Ok(status)
	}

	/// SIGTERM the group, wait up to `grace`, then SIGKILL whatever is left
	/// of it. Never fails.
	///
	/// If the leader has already exited, anything it left behind in the
	/// group is killed at once.
	pub async fn stop(&mut self, grace: Duration) -> ExitStatus {
		let status = match self.exit {
			Some(status) => {
				self.clear_group(Instant::now()).await;
				status
			}
			None => self.terminate(grace).await,
		};
		self.finish_drains().await;
		status
	}

	async fn terminate(&mut self, grace: Duration) -> ExitStatus {
		let deadline = Instant::now() + grace;
		self.signal(Signal::SIGTERM);
		let status = self.wait_leader(deadline, grace).await;
		// descendants get whatever is left of the grace period
		self.clear_group(deadline).await;
		status
	}

	async fn wait_leader(&mut self, deadline: Instant, grace: Duration) -> ExitStatus {
		match tokio::time::timeout_at(deadline, self.wait()).await {
			Ok(Ok(status)) => status,
			Ok(Err(e)) => {
				warn!("{}: wait for pid {} failed: {}", self.name, self.pid, e);
				self.force_kill().await
			}
			Err(_) => {
				info!(
					"{}: pid {} still alive after {}ms, sending SIGKILL",
					self.name,
					self.pid,
					grace.as_millis()
				);
				self.force_kill().await
			}
		}
	}

	async fn force_kill(&mut self) -> ExitStatus {
		self.signal(Signal::SIGKILL);
		match self.wait().await {
			Ok(status) => status,
			Err(e) => {
				warn!("{}: reaping pid {} failed: {}", self.name, self.pid, e);
				let status = ExitStatus::Signaled {
					signal: Signal::SIGKILL as i32,
				};
				self.exit = Some(status);
				status
			}
		}
	}

	/// Wait until `deadline` for the rest of the group to exit, then SIGKILL it.
	async fn clear_group(&mut self, deadline: Instant) {
		if self.group_cleared {
			return;
		}
		while self.group_alive() && Instant::now() < deadline {
			tokio::time::sleep(GROUP_POLL).await;
		}
		if self.group_alive() {
			info!(
				"{}: process group {} outlived its leader, sending SIGKILL",
				self.name, self.pid
			);
			self.signal(Signal::SIGKILL);
			let settle = Instant::now() + KILL_SETTLE;
			while self.group_alive() && Instant::now() < settle {
				tokio::time::sleep(GROUP_POLL).await;
			}
		}
		self.group_cleared = true;
	}

	fn group_alive(&self) -> bool {
		self.pid != 0 && killpg(Pid::from_raw(self.pid as i32), None).is_ok()
	}

	/// Best effort; a group that is already gone is not an error.
	pub fn signal(&self, signal: Signal) {
		if self.pid == 0 {
			return;
		}
		if let Err(e) = killpg(Pid::from_raw(self.pid as i32), signal) {
			debug!("{}: killpg({}, {:?}) failed: {}", self.name, self.pid, signal, e);
		}
	}

	/// Let output drains flush whatever the child wrote before exiting.
	async fn finish_drains(&mut self) {
		for mut drain in self.drains.drain(..) {
			// a grandchild holding the pipe open must not stall the caller
			if tokio::time::timeout(Duration::from_millis(500), &mut drain)
				.await
				.is_err()
			{
				drain.abort();
			}
		}
	}
}

impl Drop for ProcessHandle {
	fn drop(&mut self) {
		if !self.group_cleared {
			// kill_on_drop only reaches the leader; take the whole group down
			self.signal(Signal::SIGKILL);
		}
		for drain in &self.drains {
			drain.abort();
		}
	}
}
