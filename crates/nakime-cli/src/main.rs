mod config;
mod paths;
mod status;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nakime::{OutputCapture, OutputMode, Supervisor};
use owo_colors::OwoColorize;
use std::path::{Path, PathBuf};
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinSet;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use config::AppSummary;

#[derive(Debug, Parser)]
#[command(name = "nakime", version, about = "Watch-restart process supervisor")]
struct Cli {
	#[command(subcommand)]
	command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
	/// Start apps and supervise them until interrupted
	Run {
		/// Ecosystem file (TOML, or JSON with a .json extension)
		#[arg(default_value = config::DEFAULT_CONFIG)]
		config: PathBuf,
		/// Only run the named app (repeatable)
		#[arg(long = "only", value_name = "NAME")]
		only: Vec<String>,
		/// Directory for captured output logs
		#[arg(long, value_name = "DIR")]
		log_dir: Option<PathBuf>,
		/// Don't echo child output to the terminal
		#[arg(short, long)]
		quiet: bool,
	},
	/// Validate an ecosystem file and print the resolved apps
	Check {
		#[arg(default_value = config::DEFAULT_CONFIG)]
		config: PathBuf,
		/// Print as JSON
		#[arg(long)]
		json: bool,
	},
}

#[tokio::main]
async fn main() -> Result<()> {
	let cli = Cli::parse();
	init_tracing();

	match cli.command {
		Command::Run {
			config,
			only,
			log_dir,
			quiet,
		} => cmd_run(&config, &only, log_dir, quiet).await,
		Command::Check { config, json } => cmd_check(&config, json),
	}
}

fn init_tracing() {
	let filter = EnvFilter::try_from_env("NAKIME_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

async fn cmd_run(path: &Path, only: &[String], log_dir: Option<PathBuf>, quiet: bool) -> Result<()> {
	let mut eco = config::load(path)?;
	eco.select(only)?;

	let log_dir = log_dir
		.or_else(|| eco.logs.dir.clone())
		.unwrap_or_else(paths::log_dir);
	info!("child output is logged under {}", log_dir.display());

	let width = eco.apps.iter().map(|a| a.name().len()).max().unwrap_or(0);
	let mut supervisors = Vec::with_capacity(eco.apps.len());
	let mut failed = 0;

	for (index, app) in eco.apps.iter().enumerate() {
		let capture = OutputCapture::with_log_file(
			&log_dir,
			app.name(),
			eco.logs.max_size,
			eco.logs.max_files,
		);
		let label = status::Label::new(app.name(), index, width);
		if !quiet {
			tokio::spawn(status::echo_output(capture.subscribe(), label.clone()));
		}

		let sup = Supervisor::new(
			app.process.clone(),
			app.watch.clone(),
			app.supervisor_config(OutputMode::Capture(capture)),
		);
		tokio::spawn(status::report_transitions(sup.subscribe(), label));

		if let Err(e) = sup.start().await {
			eprintln!("{} {}", "error:".red().bold(), e);
			failed += 1;
		}
		supervisors.push(sup);
	}

	if failed == supervisors.len() {
		bail!("no app could be started");
	}

	wait_for_shutdown().await?;
	info!("stopping {} app(s)", supervisors.len());

	let mut stops = JoinSet::new();
	for sup in supervisors {
		stops.spawn(sup.shutdown());
	}
	while let Some(joined) = stops.join_next().await {
		match joined {
			Ok(Ok(_)) => {}
			Ok(Err(e)) => warn!("{}", e),
			Err(e) => warn!("shutdown task failed: {}", e),
		}
	}

	if failed > 0 {
		bail!("{} app(s) failed to start", failed);
	}
	Ok(())
}

async fn wait_for_shutdown() -> Result<()> {
	let mut term = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
	tokio::select! {
		res = tokio::signal::ctrl_c() => res.context("failed to listen for ctrl-c")?,
		_ = term.recv() => info!("received SIGTERM"),
	}
	Ok(())
}

fn cmd_check(path: &Path, json: bool) -> Result<()> {
	let eco = config::load(path)?;
	let summaries: Vec<AppSummary> = eco.apps.iter().map(|a| a.summary()).collect();

	if json {
		println!("{}", serde_json::to_string_pretty(&summaries)?);
		return Ok(());
	}

	println!("{} ({} app(s))", eco.path.display().bold(), summaries.len());
	for s in &summaries {
		println!();
		print_summary(s);
	}
	Ok(())
}

fn print_summary(s: &AppSummary) {
	println!("{}", s.name.cyan().bold());
	println!("  {:<14} {}", "command", s.command);
	println!("  {:<14} {}", "cwd", s.cwd.display());

	if s.watch.is_empty() {
		println!("  {:<14} {}", "watch", "off".dimmed());
	} else {
		for (i, path) in s.watch.iter().enumerate() {
			let key = if i == 0 { "watch" } else { "" };
			if path.exists() {
				println!("  {:<14} {}", key, path.display());
			} else {
				println!("  {:<14} {} {}", key, path.display(), "(missing)".yellow());
			}
		}
		if !s.ignore_watch.is_empty() {
			println!("  {:<14} {}", "ignore_watch", s.ignore_watch.join(", "));
		}
		if let Some(delay) = s.watch_delay {
			println!("  {:<14} {}ms", "watch_delay", delay);
		}
	}

	println!("  {:<14} {}ms", "kill_timeout", s.kill_timeout);
	match (s.autorestart, s.restart_delay, s.max_restarts) {
		(true, Some(delay), Some(max)) => println!(
			"  {:<14} {} (delay {}ms, max {})",
			"autorestart",
			"on".green(),
			delay,
			max
		),
		(true, _, _) => println!("  {:<14} {}", "autorestart", "on".green()),
		(false, _, _) => println!("  {:<14} {}", "autorestart", "off".dimmed()),
	}
}
