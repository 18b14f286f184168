//! Ignore-pattern matching for watcher events.
//!
//! `*` never crosses a `/`. A pattern without a separator (`*.pyc`,
//! `__pycache__`) is tested against every segment of the path below its
//! watch root; a pattern with one (`logs/*.log`) is tested against the
//! whole root-relative path.

use glob::{MatchOptions, Pattern};
use std::path::{Path, PathBuf};

use crate::error::WatchError;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
	case_sensitive: true,
	require_literal_separator: true,
	require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
struct Rule {
	pattern: Pattern,
	anchored: bool,
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreFilter {
	rules: Vec<Rule>,
	roots: Vec<PathBuf>,
}

impl IgnoreFilter {
	pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, WatchError> {
		let mut rules = Vec::with_capacity(patterns.len());
		for raw in patterns {
			let raw = raw.as_ref().trim();
			if raw.is_empty() {
				continue;
			}
			let trimmed = raw.trim_start_matches("./").trim_end_matches('/');
			let pattern = Pattern::new(trimmed).map_err(|source| WatchError::Pattern {
				pattern: raw.to_string(),
				source,
			})?;
			rules.push(Rule {
				pattern,
				anchored: trimmed.contains('/'),
			});
		}
		Ok(Self { rules, roots: Vec::new() })
	}

	/// Paths are matched relative to the first root that contains them.
	pub fn with_roots(mut self, roots: Vec<PathBuf>) -> Self {
		self.roots = roots;
		self
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	pub fn is_ignored(&self, path: &Path) -> bool {
		if self.rules.is_empty() {
			return false;
		}
		let relative = self
			.roots
			.iter()
			.find_map(|root| path.strip_prefix(root).ok())
			.unwrap_or(path);

		self.rules.iter().any(|rule| {
			if rule.anchored {
				rule.pattern.matches_path_with(relative, MATCH_OPTIONS)
			} else {
				relative
					.components()
					.filter_map(|c| c.as_os_str().to_str())
					.any(|segment| rule.pattern.matches_with(segment, MATCH_OPTIONS))
			}
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn filter(patterns: &[&str]) -> IgnoreFilter {
		IgnoreFilter::new(patterns)
			.unwrap()
			.with_roots(vec![PathBuf::from("/app/src")])
	}

	#[test]
	fn extension_pattern_matches_nested_file() {
		let f = filter(&["*.pyc"]);
		assert!(f.is_ignored(Path::new("/app/src/__pycache__/x.pyc")));
		assert!(f.is_ignored(Path::new("/app/src/c.pyc")));
		assert!(!f.is_ignored(Path::new("/app/src/a.py")));
	}

	#[test]
	fn bare_name_matches_any_directory_segment() {
		let f = filter(&["__pycache__", "node_modules"]);
		assert!(f.is_ignored(Path::new("/app/src/__pycache__/mod.cpython-311.pyc")));
		assert!(f.is_ignored(Path::new("/app/src/web/node_modules/left-pad/index.js")));
		assert!(!f.is_ignored(Path::new("/app/src/pycache.py")));
	}

	#[test]
	fn star_does_not_cross_separator() {
		let f = filter(&["logs/*.log"]);
		assert!(f.is_ignored(Path::new("/app/src/logs/out.log")));
		assert!(!f.is_ignored(Path::new("/app/src/logs/2024/out.log")));
		assert!(!f.is_ignored(Path::new("/app/src/other/logs/out.log")));
	}

	#[test]
	fn segments_above_root_are_not_considered() {
		let f = IgnoreFilter::new(&["app"])
			.unwrap()
			.with_roots(vec![PathBuf::from("/app/src")]);
		assert!(!f.is_ignored(Path::new("/app/src/main.py")));
	}

	#[test]
	fn leading_dot_slash_and_trailing_slash_are_normalized() {
		let f = filter(&["./build/", "./dist/*"]);
		assert!(f.is_ignored(Path::new("/app/src/build/out.o")));
		assert!(f.is_ignored(Path::new("/app/src/dist/bundle.js")));
	}

	#[test]
	fn invalid_pattern_is_reported() {
		let err = IgnoreFilter::new(&["[z-a"]).unwrap_err();
		assert!(matches!(err, WatchError::Pattern { ref pattern, .. } if pattern == "[z-a"));
	}

	#[test]
	fn empty_filter_ignores_nothing() {
		let f = IgnoreFilter::new::<&str>(&[]).unwrap();
		assert!(f.is_empty());
		assert!(!f.is_ignored(Path::new("/anything.pyc")));
	}
}
