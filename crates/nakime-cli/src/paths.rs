use std::path::PathBuf;

const APP_NAME: &str = "nakime";

/// `$XDG_STATE_HOME/nakime`, falling back to `~/.local/state/nakime`.
pub fn state_dir() -> PathBuf {
	if let Ok(dir) = std::env::var("XDG_STATE_HOME") {
		PathBuf::from(dir).join(APP_NAME)
	} else if let Some(home) = home_dir() {
		home.join(".local").join("state").join(APP_NAME)
	} else {
		std::env::temp_dir().join(APP_NAME)
	}
}

/// Where captured child output goes unless the config or `--log-dir` says otherwise.
pub fn log_dir() -> PathBuf {
	state_dir().join("logs")
}

pub fn home_dir() -> Option<PathBuf> {
	std::env::var("HOME").ok().map(PathBuf::from)
}
