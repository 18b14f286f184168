use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

use crate::error::{Result, SpawnError, SupervisorError};
use crate::output::OutputMode;
use crate::process::ProcessHandle;
use crate::types::*;
use crate::watcher::{self, FileWatcher};

/// What to do when the child exits while it is supposed to be running.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CrashPolicy {
	/// Stay `Crashed` until a file change or a manual `restart()`.
	#[default]
	Stay,
	/// Respawn after `delay`. After `max_restarts` consecutive crashes the
	/// supervisor gives up and stays `Crashed`; a child that lived at least
	/// `min_uptime` resets the count.
	Restart {
		delay: Duration,
		max_restarts: Option<u32>,
		min_uptime: Duration,
	},
}

#[derive(Clone)]
pub struct SupervisorConfig {
	/// Time between SIGTERM and SIGKILL.
	pub grace_timeout: Duration,
	pub crash_policy: CrashPolicy,
	/// Fail `start()` when the watcher cannot be set up, instead of
	/// running without it.
	pub require_watch: bool,
	pub output: OutputMode,
}

impl Default for SupervisorConfig {
	fn default() -> Self {
		Self {
			grace_timeout: Duration::from_millis(1600),
			crash_policy: CrashPolicy::Stay,
			require_watch: false,
			output: OutputMode::Inherit,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartOutcome {
	Restarted,
	/// A child spawned after the request was made is already running.
	Coalesced,
}

enum Command {
	Start {
		reply: oneshot::Sender<Result<()>>,
	},
	Stop {
		reply: oneshot::Sender<Option<ExitStatus>>,
	},
	Restart {
		issued_at: Instant,
		reply: oneshot::Sender<Result<RestartOutcome>>,
	},
	Change(ChangeEvent),
	Shutdown {
		reply: oneshot::Sender<Option<ExitStatus>>,
	},
}

/// Handle to one supervised process.
///
/// All state lives in a control task spawned by [`Supervisor::new`]; the
/// handle only sends it commands and reads the published status. When the
/// last handle is dropped the control task stops the child and exits.
#[derive(Clone)]
pub struct Supervisor {
	name: String,
	commands: mpsc::UnboundedSender<Command>,
	status: watch::Receiver<SupervisorStatus>,
}

impl Supervisor {
	/// Must be called inside a tokio runtime. Nothing is spawned until `start()`.
	pub fn new(
		process: ProcessSpec,
		watch_spec: Option<WatchSpec>,
		config: SupervisorConfig,
	) -> Self {
		let name = process.name.clone();
		let (status_tx, status_rx) = watch::channel(SupervisorStatus::new(&name));
		let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

		let controller = Controller {
			process,
			watch_spec,
			config,
			status: status_tx,
			child: None,
			watcher: None,
			spawned_at: None,
			retry_at: None,
			consecutive_crashes: 0,
		};
		tokio::spawn(controller.run(cmd_rx));

		Self {
			name,
			commands: cmd_tx,
			status: status_rx,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Stopped → Running. Fails with `AlreadyRunning` from any other state.
	pub async fn start(&self) -> Result<()> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Start { reply })?;
		rx.await.map_err(|_| self.closed())?
	}

	/// Any state → Stopped. Returns the child's final status if one was alive.
	pub async fn stop(&self) -> Result<Option<ExitStatus>> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Stop { reply })?;
		rx.await.map_err(|_| self.closed())
	}

	/// Stop-then-start from `Running` or `Crashed`.
	pub async fn restart(&self) -> Result<RestartOutcome> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Restart {
			issued_at: Instant::now(),
			reply,
		})?;
		rx.await.map_err(|_| self.closed())?
	}

	/// Feed a change event as if the watcher had emitted it.
	pub fn notify_change(&self, event: ChangeEvent) -> Result<()> {
		self.send(Command::Change(event))
	}

	pub fn status(&self) -> SupervisorStatus {
		self.status.borrow().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<SupervisorStatus> {
		self.status.clone()
	}

	/// Wait until the published status satisfies `pred`.
	pub async fn wait_for(
		&self,
		mut pred: impl FnMut(&SupervisorStatus) -> bool,
	) -> Result<SupervisorStatus> {
		let mut rx = self.status.clone();
		let status = rx.wait_for(|s| pred(s)).await.map_err(|_| self.closed())?;
		Ok(status.clone())
	}

	/// Stop and end the control task.
	pub async fn shutdown(self) -> Result<Option<ExitStatus>> {
		let (reply, rx) = oneshot::channel();
		self.send(Command::Shutdown { reply })?;
		rx.await.map_err(|_| self.closed())
	}

	fn send(&self, cmd: Command) -> Result<()> {
		self.commands.send(cmd).map_err(|_| self.closed())
	}

	fn closed(&self) -> SupervisorError {
		SupervisorError::Closed {
			name: self.name.clone(),
		}
	}
}

enum Step {
	Command(Option<Command>),
	Change(Option<ChangeEvent>),
	Exited(std::io::Result<ExitStatus>),
	Retry,
}

/// Sole owner of the child, the watcher and the published state.
struct Controller {
	process: ProcessSpec,
	watch_spec: Option<WatchSpec>,
	config: SupervisorConfig,
	status: watch::Sender<SupervisorStatus>,
	child: Option<ProcessHandle>,
	watcher: Option<FileWatcher>,
	spawned_at: Option<Instant>,
	retry_at: Option<Instant>,
	consecutive_crashes: u32,
}

impl Controller {
	async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
		loop {
			let step = tokio::select! {
				cmd = commands.recv() => Step::Command(cmd),
				change = next_change(&mut self.watcher) => Step::Change(change),
				exit = wait_child(&mut self.child) => Step::Exited(exit),
				_ = sleep_until(self.retry_at) => Step::Retry,
			};

			match step {
				Step::Command(Some(cmd)) => {
					if !self.handle(cmd).await {
						break;
					}
				}
				Step::Command(None) => {
					self.stop_all().await;
					break;
				}
				Step::Change(Some(event)) => self.on_change(event).await,
				Step::Change(None) => {
					warn!("{}: file watcher ended", self.name());
					self.watcher = None;
					self.status.send_modify(|s| s.watching = false);
				}
				Step::Exited(result) => self.on_exit(result).await,
				Step::Retry => self.on_retry().await,
			}
		}
		debug!("{}: supervisor task finished", self.name());
	}

	fn name(&self) -> &str {
		&self.process.name
	}

	fn state(&self) -> ProcessState {
		self.status.borrow().state
	}

	fn set_state(&self, state: ProcessState) {
		debug!("{}: {}", self.process.name, state);
		self.status.send_modify(|s| {
			s.state = state;
			s.pid = match state {
				ProcessState::Running { pid } => Some(pid),
				_ => None,
			};
		});
	}

	/// Returns false once the control loop should end.
	async fn handle(&mut self, cmd: Command) -> bool {
		match cmd {
			Command::Start { reply } => {
				let result = self.start().await;
				let _ = reply.send(result);
			}
			Command::Stop { reply } => {
				let exit = self.stop_all().await;
				let _ = reply.send(exit);
			}
			Command::Restart { issued_at, reply } => {
				let result = self.manual_restart(issued_at).await;
				let _ = reply.send(result);
			}
			Command::Change(event) => self.on_change(event).await,
			Command::Shutdown { reply } => {
				let exit = self.stop_all().await;
				let _ = reply.send(exit);
				return false;
			}
		}
		true
	}

	async fn start(&mut self) -> Result<()> {
		if !self.state().is_stopped() {
			return Err(SupervisorError::AlreadyRunning {
				name: self.name().to_string(),
			});
		}
		self.consecutive_crashes = 0;
		self.status.send_modify(|s| s.last_error = None);

		if let Some(spec) = &self.watch_spec {
			match watcher::watch(spec) {
				Ok(w) => {
					self.watcher = Some(w);
					self.status.send_modify(|s| s.watching = true);
				}
				Err(e) if self.config.require_watch => return Err(e.into()),
				Err(e) => {
					warn!("{}: running without file watching: {}", self.name(), e);
					let msg = e.to_string();
					self.status.send_modify(|s| s.last_error = Some(msg));
				}
			}
		}

		if let Err(e) = self.spawn_child() {
			self.close_watcher().await;
			self.set_state(ProcessState::Stopped);
			return Err(e.into());
		}
		Ok(())
	}

	/// Starting → Running, or back to the caller with the spawn error.
	fn spawn_child(&mut self) -> std::result::Result<(), SpawnError> {
		self.set_state(ProcessState::Starting);
		match ProcessHandle::start(&self.process, &self.config.output) {
			Ok(handle) => {
				let pid = handle.pid();
				self.child = Some(handle);
				self.spawned_at = Some(Instant::now());
				self.set_state(ProcessState::Running { pid });
				Ok(())
			}
			Err(e) => {
				warn!("{}: {}", self.name(), e);
				let msg = e.to_string();
				self.status.send_modify(|s| s.last_error = Some(msg));
				Err(e)
			}
		}
	}

	/// Running/Crashed → Restarting → Starting → Running. The old child is
	/// reaped before the new one is spawned.
	async fn restart_child(&mut self) -> std::result::Result<(), SpawnError> {
		self.retry_at = None;
		self.set_state(ProcessState::Restarting);

		if let Some(mut child) = self.child.take() {
			let exit = child.stop(self.config.grace_timeout).await;
			info!("{}: stopped pid {} ({})", self.name(), child.pid(), exit);
			self.status.send_modify(|s| s.last_exit = Some(exit));
		}

		match self.spawn_child() {
			Ok(()) => {
				self.status.send_modify(|s| {
					s.restarts += 1;
					s.last_error = None;
				});
				Ok(())
			}
			Err(e) => {
				self.set_state(ProcessState::Crashed { exit: None });
				self.schedule_retry(None);
				Err(e)
			}
		}
	}

	/// True when the running child was spawned after `at`.
	fn fresher_than(&self, at: Instant) -> bool {
		self.state().is_running() && self.spawned_at.is_some_and(|spawned| spawned > at)
	}

	async fn manual_restart(&mut self, issued_at: Instant) -> Result<RestartOutcome> {
		match self.state() {
			ProcessState::Stopped => Err(SupervisorError::NotRunning {
				name: self.name().to_string(),
			}),
			_ if self.fresher_than(issued_at) => {
				debug!("{}: restart request coalesced", self.name());
				Ok(RestartOutcome::Coalesced)
			}
			_ => {
				info!("{}: restart requested", self.name());
				self.restart_child().await?;
				Ok(RestartOutcome::Restarted)
			}
		}
	}

	async fn on_change(&mut self, event: ChangeEvent) {
		match self.state() {
			ProcessState::Running { .. } | ProcessState::Crashed { .. } => {}
			other => {
				debug!(
					"{}: change #{} ignored while {}",
					self.name(),
					event.seq,
					other.label()
				);
				return;
			}
		}
		if self.fresher_than(event.at) {
			debug!(
				"{}: change #{} already covered by current child",
				self.name(),
				event.seq
			);
			return;
		}

		info!(
			"{}: change detected in {} ({} event(s)), restarting",
			self.name(),
			event.path.display(),
			event.coalesced
		);
		self.consecutive_crashes = 0;
		// spawn failures are already logged and recorded in the status
		let _ = self.restart_child().await;
	}

	async fn on_exit(&mut self, result: std::io::Result<ExitStatus>) {
		let Some(mut child) = self.child.take() else {
			return;
		};
		if let Err(e) = &result {
			warn!("{}: waiting on pid {} failed: {}", self.name(), child.pid(), e);
		}
		// kills whatever the child left running in its group before we record the crash
		let exit = child.stop(self.config.grace_timeout).await;
		let uptime = self.spawned_at.map(|t| t.elapsed());

		if exit.success() {
			info!("{}: pid {} exited ({})", self.name(), child.pid(), exit);
		} else {
			warn!("{}: pid {} crashed ({})", self.name(), child.pid(), exit);
		}
		self.status.send_modify(|s| s.last_exit = Some(exit));
		self.set_state(ProcessState::Crashed { exit: Some(exit) });
		self.schedule_retry(uptime);
	}

	fn schedule_retry(&mut self, uptime: Option<Duration>) {
		let CrashPolicy::Restart {
			delay,
			max_restarts,
			min_uptime,
		} = self.config.crash_policy
		else {
			return;
		};

		if uptime.is_some_and(|up| up >= min_uptime) {
			self.consecutive_crashes = 0;
		}
		if max_restarts.is_some_and(|max| self.consecutive_crashes >= max) {
			warn!(
				"{}: giving up after {} consecutive restarts",
				self.name(),
				self.consecutive_crashes
			);
			let msg = format!("too many restarts ({})", self.consecutive_crashes);
			self.status.send_modify(|s| s.last_error = Some(msg));
			return;
		}

		self.consecutive_crashes += 1;
		info!(
			"{}: restarting in {}ms (attempt {})",
			self.name(),
			delay.as_millis(),
			self.consecutive_crashes
		);
		self.retry_at = Some(Instant::now() + delay);
	}

	async fn on_retry(&mut self) {
		self.retry_at = None;
		if self.state().is_crashed() {
			let _ = self.restart_child().await;
		}
	}

	async fn close_watcher(&mut self) {
		if let Some(w) = self.watcher.take() {
			w.close().await;
		}
		self.status.send_modify(|s| s.watching = false);
	}

	async fn stop_all(&mut self) -> Option<ExitStatus> {
		self.retry_at = None;
		self.close_watcher().await;

		let exit = match self.child.take() {
			Some(mut child) => {
				let exit = child.stop(self.config.grace_timeout).await;
				info!("{}: stopped pid {} ({})", self.name(), child.pid(), exit);
				Some(exit)
			}
			None => None,
		};

		self.status.send_modify(|s| {
			if let Some(exit) = exit {
				s.last_exit = Some(exit);
			}
		});
		self.set_state(ProcessState::Stopped);
		exit
	}
}

async fn next_change(watcher: &mut Option<FileWatcher>) -> Option<ChangeEvent> {
	match watcher {
		Some(w) => w.next().await,
		None => std::future::pending().await,
	}
}

async fn wait_child(child: &mut Option<ProcessHandle>) -> std::io::Result<ExitStatus> {
	match child {
		Some(c) => c.wait().await,
		None => std::future::pending().await,
	}
}

async fn sleep_until(deadline: Option<Instant>) {
	match deadline {
		Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
		None => std::future::pending().await,
	}
}
