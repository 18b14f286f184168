use nakime::{CrashPolicy, IgnoreFilter, OutputMode, ProcessSpec, SupervisorConfig, WatchSpec};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG: &str = "nakime.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
	#[error("cannot read {}: {source}", path.display())]
	Read {
		path: PathBuf,
		source: std::io::Error,
	},

	#[error("invalid TOML in {}: {source}", path.display())]
	Toml {
		path: PathBuf,
		source: toml::de::Error,
	},

	#[error("invalid JSON in {}: {source}", path.display())]
	Json {
		path: PathBuf,
		source: serde_json::Error,
	},

	#[error("{} defines no apps", path.display())]
	Empty { path: PathBuf },

	#[error("app #{index}: {message}")]
	Invalid { index: usize, message: String },

	#[error("{app}: {message}")]
	InvalidApp { app: String, message: String },

	#[error("duplicate app name {name:?}")]
	Duplicate { name: String },

	#[error("no app named {name:?} (known: {known})")]
	UnknownApp { name: String, known: String },
}

#[derive(Debug, Clone, Deserialize, Default)]
struct EcosystemFile {
	#[serde(default)]
	defaults: Defaults,
	#[serde(default)]
	apps: Vec<AppDef>,
}

#[derive(Debug, Clone, Deserialize)]
struct Defaults {
	#[serde(default = "default_watch_delay")]
	watch_delay: u64,
	#[serde(default = "default_kill_timeout")]
	kill_timeout: u64,
	#[serde(default)]
	autorestart: bool,
	#[serde(default)]
	restart_delay: u64,
	#[serde(default = "default_max_restarts")]
	max_restarts: u32,
	#[serde(default = "default_min_uptime")]
	min_uptime: u64,
	#[serde(default)]
	env: HashMap<String, String>,
	log_dir: Option<PathBuf>,
	#[serde(default = "default_max_log_size")]
	max_log_size: u64,
	#[serde(default = "default_max_log_files")]
	max_log_files: u32,
}

impl Default for Defaults {
	fn default() -> Self {
		Self {
			watch_delay: default_watch_delay(),
			kill_timeout: default_kill_timeout(),
			autorestart: false,
			restart_delay: 0,
			max_restarts: default_max_restarts(),
			min_uptime: default_min_uptime(),
			env: HashMap::new(),
			log_dir: None,
			max_log_size: default_max_log_size(),
			max_log_files: default_max_log_files(),
		}
	}
}

fn default_watch_delay() -> u64 {
	1000
}

fn default_kill_timeout() -> u64 {
	1600
}

fn default_max_restarts() -> u32 {
	16
}

fn default_min_uptime() -> u64 {
	1000
}

fn default_max_log_size() -> u64 {
	10 * 1024 * 1024
}

fn default_max_log_files() -> u32 {
	5
}

#[derive(Debug, Clone, Deserialize)]
struct AppDef {
	name: Option<String>,
	#[serde(alias = "executable")]
	script: Option<String>,
	interpreter: Option<String>,
	#[serde(default)]
	args: ArgsDef,
	cwd: Option<PathBuf>,
	#[serde(default)]
	env: HashMap<String, String>,
	#[serde(default)]
	watch: WatchDef,
	#[serde(default)]
	ignore_watch: OneOrMany,
	watch_delay: Option<u64>,
	autorestart: Option<bool>,
	restart_delay: Option<u64>,
	max_restarts: Option<u32>,
	min_uptime: Option<u64>,
	kill_timeout: Option<u64>,
	#[serde(default)]
	require_watch: bool,
}

/// `args = ["a", "b"]` or `args = "a 'b c'"`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ArgsDef {
	List(Vec<String>),
	Line(String),
}

impl Default for ArgsDef {
	fn default() -> Self {
		ArgsDef::List(Vec::new())
	}
}

/// `watch = true`, `watch = "src"` or `watch = ["src", "lib"]`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum WatchDef {
	Enabled(bool),
	Path(PathBuf),
	Paths(Vec<PathBuf>),
}

impl Default for WatchDef {
	fn default() -> Self {
		WatchDef::Enabled(false)
	}
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
	One(String),
	Many(Vec<String>),
}

impl Default for OneOrMany {
	fn default() -> Self {
		OneOrMany::Many(Vec::new())
	}
}

impl OneOrMany {
	fn into_vec(self) -> Vec<String> {
		match self {
			OneOrMany::One(s) => vec![s],
			OneOrMany::Many(v) => v,
		}
	}
}

/// One app from the ecosystem file, ready to hand to a `Supervisor`.
#[derive(Debug, Clone)]
pub struct App {
	pub process: ProcessSpec,
	pub watch: Option<WatchSpec>,
	pub kill_timeout: Duration,
	pub crash_policy: CrashPolicy,
	pub require_watch: bool,
}

impl App {
	pub fn name(&self) -> &str {
		&self.process.name
	}

	pub fn supervisor_config(&self, output: OutputMode) -> SupervisorConfig {
		SupervisorConfig {
			grace_timeout: self.kill_timeout,
			crash_policy: self.crash_policy,
			require_watch: self.require_watch,
			output,
		}
	}

	pub fn summary(&self) -> AppSummary {
		let (autorestart, restart_delay, max_restarts) = match self.crash_policy {
			CrashPolicy::Stay => (false, None, None),
			CrashPolicy::Restart {
				delay,
				max_restarts,
				..
			} => (true, Some(delay.as_millis() as u64), max_restarts),
		};
		AppSummary {
			name: self.process.name.clone(),
			command: self.process.command_line(),
			cwd: self.process.cwd.clone(),
			watch: self.watch.as_ref().map(|w| w.paths.clone()).unwrap_or_default(),
			ignore_watch: self.watch.as_ref().map(|w| w.ignore.clone()).unwrap_or_default(),
			watch_delay: self.watch.as_ref().map(|w| w.debounce_ms),
			kill_timeout: self.kill_timeout.as_millis() as u64,
			autorestart,
			restart_delay,
			max_restarts,
		}
	}
}

/// What `nakime check` prints.
#[derive(Debug, Clone, Serialize)]
pub struct AppSummary {
	pub name: String,
	pub command: String,
	pub cwd: PathBuf,
	pub watch: Vec<PathBuf>,
	pub ignore_watch: Vec<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub watch_delay: Option<u64>,
	pub kill_timeout: u64,
	pub autorestart: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub restart_delay: Option<u64>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub max_restarts: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct LogSettings {
	pub dir: Option<PathBuf>,
	pub max_size: u64,
	pub max_files: u32,
}

#[derive(Debug, Clone)]
pub struct Ecosystem {
	pub path: PathBuf,
	pub apps: Vec<App>,
	pub logs: LogSettings,
}

impl Ecosystem {
	/// Keep only the apps named in `only`, in file order. Empty keeps all.
	pub fn select(&mut self, only: &[String]) -> Result<(), ConfigError> {
		if only.is_empty() {
			return Ok(());
		}
		for name in only {
			if !self.apps.iter().any(|a| a.name() == name) {
				let known: Vec<&str> = self.apps.iter().map(|a| a.name()).collect();
				return Err(ConfigError::UnknownApp {
					name: name.clone(),
					known: known.join(", "),
				});
			}
		}
		self.apps.retain(|a| only.iter().any(|n| n == a.name()));
		Ok(())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
	Toml,
	Json,
}

impl Format {
	pub fn from_path(path: &Path) -> Self {
		match path.extension().and_then(|e| e.to_str()) {
			Some(ext) if ext.eq_ignore_ascii_case("json") => Format::Json,
			_ => Format::Toml,
		}
	}
}

pub fn load(path: &Path) -> Result<Ecosystem, ConfigError> {
	let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
		path: path.to_path_buf(),
		source,
	})?;
	let base_dir = match path.parent() {
		Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
		_ => PathBuf::from("."),
	};
	let base_dir = base_dir.canonicalize().unwrap_or(base_dir);
	parse(&content, Format::from_path(path), path, &base_dir)
}

/// Parse and resolve an ecosystem file. Relative paths resolve against `base_dir`.
pub fn parse(
	content: &str,
	format: Format,
	path: &Path,
	base_dir: &Path,
) -> Result<Ecosystem, ConfigError> {
	let file: EcosystemFile = match format {
		Format::Toml => toml::from_str(content).map_err(|source| ConfigError::Toml {
			path: path.to_path_buf(),
			source,
		})?,
		Format::Json => serde_json::from_str(content).map_err(|source| ConfigError::Json {
			path: path.to_path_buf(),
			source,
		})?,
	};

	if file.apps.is_empty() {
		return Err(ConfigError::Empty {
			path: path.to_path_buf(),
		});
	}

	let mut seen = HashSet::new();
	let mut apps = Vec::with_capacity(file.apps.len());
	for (index, def) in file.apps.into_iter().enumerate() {
		let app = resolve_app(def, index, &file.defaults, base_dir)?;
		if !seen.insert(app.name().to_string()) {
			return Err(ConfigError::Duplicate {
				name: app.name().to_string(),
			});
		}
		apps.push(app);
	}

	let log_dir = file.defaults.log_dir.map(|d| absolutize(base_dir, &d));
	Ok(Ecosystem {
		path: path.to_path_buf(),
		apps,
		logs: LogSettings {
			dir: log_dir,
			max_size: file.defaults.max_log_size,
			max_files: file.defaults.max_log_files,
		},
	})
}

fn resolve_app(
	def: AppDef,
	index: usize,
	defaults: &Defaults,
	base_dir: &Path,
) -> Result<App, ConfigError> {
	let Some(script) = def.script.filter(|s| !s.trim().is_empty()) else {
		return Err(ConfigError::Invalid {
			index,
			message: "missing `script`".into(),
		});
	};

	let name = match def.name {
		Some(name) if !name.trim().is_empty() => name,
		_ => Path::new(&script)
			.file_stem()
			.map(|s| s.to_string_lossy().to_string())
			.unwrap_or_else(|| script.clone()),
	};
	let invalid = |message: String| ConfigError::InvalidApp {
		app: name.clone(),
		message,
	};

	let cwd = match &def.cwd {
		Some(cwd) => absolutize(base_dir, cwd),
		None => base_dir.to_path_buf(),
	};

	let args = match def.args {
		ArgsDef::List(args) => args,
		ArgsDef::Line(line) => shlex::split(&line)
			.ok_or_else(|| invalid(format!("cannot split args {:?}: unbalanced quotes", line)))?,
	};

	let script_path = resolve_script(&cwd, &script);
	let mut process = match def.interpreter.filter(|i| !i.is_empty() && i != "none") {
		Some(interpreter) => ProcessSpec::new(&name, interpreter)
			.arg(script_path.to_string_lossy().to_string()),
		None => ProcessSpec::new(&name, script_path),
	};
	process = process.args(args).cwd(&cwd);
	for (key, val) in defaults.env.iter().chain(def.env.iter()) {
		process = process.env(key, val);
	}

	let ignore = def.ignore_watch.into_vec();
	IgnoreFilter::new(ignore.as_slice()).map_err(|e| invalid(e.to_string()))?;

	let watch_paths = match def.watch {
		WatchDef::Enabled(false) => Vec::new(),
		WatchDef::Enabled(true) => vec![cwd.clone()],
		WatchDef::Path(path) => vec![absolutize(&cwd, &path)],
		WatchDef::Paths(paths) => paths.iter().map(|p| absolutize(&cwd, p)).collect(),
	};
	let watch = if watch_paths.is_empty() {
		None
	} else {
		Some(
			WatchSpec::new(watch_paths)
				.ignore(ignore)
				.debounce_ms(def.watch_delay.unwrap_or(defaults.watch_delay)),
		)
	};

	let crash_policy = if def.autorestart.unwrap_or(defaults.autorestart) {
		CrashPolicy::Restart {
			delay: Duration::from_millis(def.restart_delay.unwrap_or(defaults.restart_delay)),
			max_restarts: Some(def.max_restarts.unwrap_or(defaults.max_restarts)),
			min_uptime: Duration::from_millis(def.min_uptime.unwrap_or(defaults.min_uptime)),
		}
	} else {
		CrashPolicy::Stay
	};

	Ok(App {
		process,
		watch,
		kill_timeout: Duration::from_millis(def.kill_timeout.unwrap_or(defaults.kill_timeout)),
		crash_policy,
		require_watch: def.require_watch,
	})
}

/// A bare command name (`node`, `python3`) is left for `PATH` lookup unless
/// a file of that name exists in `cwd`.
fn resolve_script(cwd: &Path, script: &str) -> PathBuf {
	let path = Path::new(script);
	let path = expand_tilde(path);
	if path.is_absolute() {
		return path;
	}
	let joined = cwd.join(&path);
	if path.components().count() > 1 || joined.exists() {
		joined
	} else {
		path
	}
}

fn absolutize(base: &Path, path: &Path) -> PathBuf {
	let path = expand_tilde(path);
	if path.is_absolute() {
		path
	} else {
		base.join(path)
	}
}

fn expand_tilde(path: &Path) -> PathBuf {
	if let Ok(rest) = path.strip_prefix("~") {
		if let Some(home) = crate::paths::home_dir() {
			return home.join(rest);
		}
	}
	path.to_path_buf()
}

#[cfg(test)]
mod tests {
	use super::*;

	fn parse_toml(content: &str) -> Result<Ecosystem, ConfigError> {
		parse(content, Format::Toml, Path::new("nakime.toml"), Path::new("/srv/bots"))
	}

	#[test]
	fn string_args_match_list_args() {
		let line = parse_toml(
			r#"
			[[apps]]
			name = "doomer"
			script = "/marsbots/bot.py"
			interpreter = "python"
			args = "--cog-path=bots.doomer2.doomer --greeting 'hello there'"
			"#,
		)
		.unwrap();
		let list = parse_toml(
			r#"
			[[apps]]
			name = "doomer"
			script = "/marsbots/bot.py"
			interpreter = "python"
			args = ["--cog-path=bots.doomer2.doomer", "--greeting", "hello there"]
			"#,
		)
		.unwrap();

		let process = &line.apps[0].process;
		assert_eq!(process, &list.apps[0].process);
		assert_eq!(process.executable, PathBuf::from("python"));
		assert_eq!(
			process.args,
			vec![
				"/marsbots/bot.py",
				"--cog-path=bots.doomer2.doomer",
				"--greeting",
				"hello there"
			]
		);
	}

	#[test]
	fn unbalanced_quotes_are_rejected() {
		let err = parse_toml(
			r#"
			[[apps]]
			name = "bad"
			script = "run.sh"
			args = "--name 'unterminated"
			"#,
		)
		.unwrap_err();
		assert!(matches!(err, ConfigError::InvalidApp { .. }));
		assert!(err.to_string().starts_with("bad:"));
	}

	#[test]
	fn defaults_fill_missing_options() {
		let eco = parse_toml(
			r#"
			[defaults]
			kill_timeout = 3000
			autorestart = true
			env = { PYTHONUNBUFFERED = "1" }

			[[apps]]
			script = "worker.py"
			interpreter = "python3"
			env = { LOG_LEVEL = "debug" }
			"#,
		)
		.unwrap();

		let app = &eco.apps[0];
		assert_eq!(app.name(), "worker");
		assert_eq!(app.kill_timeout, Duration::from_millis(3000));
		assert_eq!(
			app.crash_policy,
			CrashPolicy::Restart {
				delay: Duration::ZERO,
				max_restarts: Some(16),
				min_uptime: Duration::from_millis(1000),
			}
		);
		assert_eq!(app.process.env.get("PYTHONUNBUFFERED").map(String::as_str), Some("1"));
		assert_eq!(app.process.env.get("LOG_LEVEL").map(String::as_str), Some("debug"));
		assert_eq!(app.process.cwd, PathBuf::from("/srv/bots"));
		assert!(app.watch.is_none());
		assert_eq!(eco.logs.max_files, 5);
	}

	#[test]
	fn app_env_overrides_defaults() {
		let eco = parse_toml(
			r#"
			[defaults]
			env = { MODE = "prod" }

			[[apps]]
			script = "/bin/true"
			env = { MODE = "dev" }
			"#,
		)
		.unwrap();
		assert_eq!(eco.apps[0].process.env["MODE"], "dev");
	}

	#[test]
	fn watch_true_watches_cwd() {
		let eco = parse_toml(
			r#"
			[[apps]]
			name = "api"
			script = "/usr/bin/node"
			cwd = "api"
			watch = true
			ignore_watch = "node_modules"
			watch_delay = 250
			"#,
		)
		.unwrap();

		let watch = eco.apps[0].watch.as_ref().unwrap();
		assert_eq!(watch.paths, vec![PathBuf::from("/srv/bots/api")]);
		assert_eq!(watch.ignore, vec!["node_modules".to_string()]);
		assert_eq!(watch.debounce_ms, 250);
	}

	#[test]
	fn watch_paths_resolve_against_cwd() {
		let eco = parse_toml(
			r#"
			[[apps]]
			name = "doomer"
			script = "/bin/sleep"
			cwd = "/marsbots"
			watch = ["bots/doomer", "/etc/doomer"]
			ignore_watch = ["*.pyc", "__pycache__"]
			"#,
		)
		.unwrap();

		let watch = eco.apps[0].watch.as_ref().unwrap();
		assert_eq!(
			watch.paths,
			vec![PathBuf::from("/marsbots/bots/doomer"), PathBuf::from("/etc/doomer")]
		);
		assert_eq!(watch.debounce_ms, 1000);
	}

	#[test]
	fn relative_script_resolves_against_cwd() {
		let eco = parse_toml(
			r#"
			[[apps]]
			name = "local"
			script = "./bin/server"
			cwd = "/opt/app"

			[[apps]]
			name = "global"
			script = "python3"
			"#,
		)
		.unwrap();
		assert_eq!(eco.apps[0].process.executable, PathBuf::from("/opt/app/./bin/server"));
		assert_eq!(eco.apps[1].process.executable, PathBuf::from("python3"));
	}

	#[test]
	fn invalid_ignore_pattern_is_rejected() {
		let err = parse_toml(
			r#"
			[[apps]]
			name = "globby"
			script = "/bin/true"
			watch = true
			ignore_watch = ["[unclosed"]
			"#,
		)
		.unwrap_err();
		assert!(err.to_string().contains("[unclosed"), "{}", err);
	}

	#[test]
	fn missing_script_and_duplicates() {
		let err = parse_toml("[[apps]]\nname = \"nothing\"\n").unwrap_err();
		assert!(matches!(err, ConfigError::Invalid { index: 0, .. }));

		let err = parse_toml(
			"[[apps]]\nscript = \"/bin/a\"\nname = \"x\"\n[[apps]]\nscript = \"/bin/b\"\nname = \"x\"\n",
		)
		.unwrap_err();
		assert!(matches!(err, ConfigError::Duplicate { .. }));

		let err = parse_toml("").unwrap_err();
		assert!(matches!(err, ConfigError::Empty { .. }));
	}

	#[test]
	fn json_ecosystem() {
		let eco = parse(
			r#"{
				"apps": [{
					"name": "doomer",
					"script": "/marsbots/bot.py",
					"interpreter": "python",
					"args": "--cog-path=bots.doomer2.doomer",
					"watch": ["/marsbots/bots/doomer"],
					"ignore_watch": ["*.pyc"],
					"autorestart": false
				}]
			}"#,
			Format::Json,
			Path::new("ecosystem.json"),
			Path::new("/"),
		)
		.unwrap();
		let app = &eco.apps[0];
		assert_eq!(app.crash_policy, CrashPolicy::Stay);
		assert_eq!(app.summary().command, "python /marsbots/bot.py --cog-path=bots.doomer2.doomer");
		assert_eq!(Format::from_path(Path::new("ecosystem.config.JSON")), Format::Json);
	}

	#[test]
	fn select_filters_and_rejects_unknown() {
		let mut eco = parse_toml(
			"[[apps]]\nscript = \"/bin/a\"\n[[apps]]\nscript = \"/bin/b\"\n[[apps]]\nscript = \"/bin/c\"\n",
		)
		.unwrap();

		let err = eco.select(&["zzz".into()]).unwrap_err();
		assert_eq!(err.to_string(), "no app named \"zzz\" (known: a, b, c)");

		eco.select(&["c".into(), "a".into()]).unwrap();
		let names: Vec<&str> = eco.apps.iter().map(|a| a.name()).collect();
		assert_eq!(names, vec!["a", "c"]);
	}
}
