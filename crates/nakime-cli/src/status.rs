use nakime::{ProcessState, SupervisorStatus};
use owo_colors::{AnsiColors, OwoColorize};
use std::io::Write;
use tokio::sync::{broadcast, watch};
use tracing::warn;

const PALETTE: [AnsiColors; 6] = [
	AnsiColors::Cyan,
	AnsiColors::Magenta,
	AnsiColors::Blue,
	AnsiColors::Yellow,
	AnsiColors::Green,
	AnsiColors::BrightCyan,
];

/// Colored, padded app name that prefixes every line an app produces.
#[derive(Debug, Clone)]
pub struct Label {
	name: String,
	color: AnsiColors,
	width: usize,
}

impl Label {
	pub fn new(name: &str, index: usize, width: usize) -> Self {
		Self {
			name: name.to_string(),
			color: PALETTE[index % PALETTE.len()],
			width,
		}
	}

	fn prefix(&self) -> String {
		format!("{:<width$} |", self.name, width = self.width)
			.color(self.color)
			.to_string()
	}
}

/// Print a line whenever the supervisor's state changes. Ends with the supervisor.
pub async fn report_transitions(mut rx: watch::Receiver<SupervisorStatus>, label: Label) {
	let mut last = rx.borrow_and_update().state;
	while rx.changed().await.is_ok() {
		let status = rx.borrow_and_update().clone();
		if status.state == last {
			continue;
		}
		last = status.state;
		eprintln!("{} {}", label.prefix(), describe(&status));
	}
}

fn describe(status: &SupervisorStatus) -> String {
	match status.state {
		ProcessState::Running { pid } if status.restarts > 0 => format!(
			"{} pid {} (restart #{})",
			"● running".green(),
			pid,
			status.restarts
		),
		ProcessState::Running { pid } => format!("{} pid {}", "● running".green(), pid),
		ProcessState::Starting => "○ starting".dimmed().to_string(),
		ProcessState::Restarting => "○ restarting".yellow().to_string(),
		ProcessState::Stopped => "○ stopped".dimmed().to_string(),
		ProcessState::Crashed { exit: Some(exit) } => match &status.last_error {
			Some(err) if err.starts_with("too many restarts") => {
				format!("{} ({}, {})", "● crashed".red(), exit, err)
			}
			_ => format!("{} ({})", "● crashed".red(), exit),
		},
		ProcessState::Crashed { exit: None } => format!(
			"{} ({})",
			"● crashed".red(),
			status.last_error.as_deref().unwrap_or("spawn failed")
		),
	}
}

/// Echo captured output to stdout, one prefixed line at a time.
pub async fn echo_output(mut rx: broadcast::Receiver<Vec<u8>>, label: Label) {
	let mut pending: Vec<u8> = Vec::new();
	loop {
		match rx.recv().await {
			Ok(chunk) => {
				pending.extend_from_slice(&chunk);
				while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
					let line: Vec<u8> = pending.drain(..=pos).collect();
					print_line(&label, &line[..line.len() - 1]);
				}
			}
			Err(broadcast::error::RecvError::Lagged(skipped)) => {
				warn!("{}: terminal fell behind, skipped {} chunk(s)", label.name, skipped);
			}
			Err(broadcast::error::RecvError::Closed) => break,
		}
	}
	if !pending.is_empty() {
		print_line(&label, &pending);
	}
}

fn print_line(label: &Label, line: &[u8]) {
	let text = String::from_utf8_lossy(line);
	let mut out = std::io::stdout().lock();
	let _ = writeln!(out, "{} {}", label.prefix(), text.trim_end_matches('\r'));
}

#[cfg(test)]
mod tests {
	use super::*;
	use nakime::ExitStatus;

	fn status(state: ProcessState) -> SupervisorStatus {
		let mut status = SupervisorStatus::new("doomer");
		status.state = state;
		status
	}

	#[test]
	fn describe_running_mentions_restarts() {
		let mut s = status(ProcessState::Running { pid: 4242 });
		assert!(describe(&s).contains("pid 4242"));
		assert!(!describe(&s).contains("restart #"));

		s.restarts = 3;
		assert!(describe(&s).contains("restart #3"));
	}

	#[test]
	fn describe_crash_shows_exit_or_error() {
		let s = status(ProcessState::Crashed {
			exit: Some(ExitStatus::Exited { code: 2 }),
		});
		assert!(describe(&s).contains("exit code 2"));

		let mut s = status(ProcessState::Crashed { exit: None });
		s.last_error = Some("executable not found: /nope".into());
		assert!(describe(&s).contains("/nope"));
	}

	#[test]
	fn label_pads_to_width() {
		let label = Label::new("api", 0, 6);
		assert!(label.prefix().contains("api    |"));
	}
}
