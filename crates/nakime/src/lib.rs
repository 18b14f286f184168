//! # nakime
//!
//! Watch-restart process supervisor.
//!
//! One [`Supervisor`] owns one child process and, optionally, a
//! [`FileWatcher`] over a set of paths. Debounced file changes restart the
//! child; a crash is recorded and, depending on the [`CrashPolicy`],
//! either left alone or retried after a delay.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use nakime::{ProcessSpec, Supervisor, SupervisorConfig, WatchSpec};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), nakime::SupervisorError> {
//! let process = ProcessSpec::new("doomer", "python")
//!     .arg("bot.py")
//!     .arg("--cog-path=bots.doomer2.doomer")
//!     .cwd("/marsbots");
//! let watch = WatchSpec::new(["/marsbots/bots/doomer"])
//!     .ignore(["*.pyc", "__pycache__"])
//!     .debounce_ms(1000);
//!
//! let sup = Supervisor::new(process, Some(watch), SupervisorConfig::default());
//! sup.start().await?;
//! tokio::signal::ctrl_c().await.ok();
//! sup.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod debounce;
pub mod error;
pub mod ignore;
pub mod logs;
pub mod output;
pub mod process;
pub mod supervisor;
pub mod types;
pub mod watcher;

pub use debounce::{Burst, Debouncer};
pub use error::{SpawnError, SupervisorError, WatchError};
pub use ignore::IgnoreFilter;
pub use output::{OutputCapture, OutputMode};
pub use process::ProcessHandle;
pub use supervisor::{CrashPolicy, RestartOutcome, Supervisor, SupervisorConfig};
pub use types::*;
pub use watcher::{watch, FileWatcher, WatchCanceller};
