use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// `<dir>/<name>.log`, the file a running child appends to.
pub fn log_path(log_dir: &Path, name: &str) -> PathBuf {
	log_dir.join(format!("{}.log", sanitize(name)))
}

/// `<dir>/<name>.<index>.log`; index 1 is the most recently rotated file.
pub fn rotated_log_path(log_dir: &Path, name: &str, index: u32) -> PathBuf {
	log_dir.join(format!("{}.{}.log", sanitize(name), index))
}

/// Shift `name.log` into `name.1.log`, `name.1.log` into `name.2.log` and so
/// on, deleting whatever falls past `keep`. With `keep == 0` the current
/// file is simply removed.
pub fn rotate(log_dir: &Path, name: &str, keep: u32) -> io::Result<()> {
	let current = log_path(log_dir, name);
	if keep == 0 {
		return remove_if_exists(&current);
	}

	remove_if_exists(&rotated_log_path(log_dir, name, keep))?;
	for index in (1..keep).rev() {
		let from = rotated_log_path(log_dir, name, index);
		if from.exists() {
			fs::rename(&from, rotated_log_path(log_dir, name, index + 1))?;
		}
	}
	if current.exists() {
		fs::rename(&current, rotated_log_path(log_dir, name, 1))?;
	}
	Ok(())
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
	match fs::remove_file(path) {
		Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
		_ => Ok(()),
	}
}

fn sanitize(name: &str) -> String {
	name.chars()
		.map(|c| if c == '/' || c == '\\' || c.is_whitespace() { '-' } else { c })
		.collect()
}
