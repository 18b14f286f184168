use std::path::Path;
use std::process::Command;

fn nakime(args: &[&str], cwd: &Path) -> std::process::Output {
	Command::new(env!("CARGO_BIN_EXE_nakime"))
		.args(args)
		.current_dir(cwd)
		.env("NAKIME_LOG", "warn")
		.output()
		.expect("failed to run nakime")
}

fn write(path: &Path, contents: &str) {
	std::fs::write(path, contents).unwrap();
}

#[test]
fn check_json_resolves_apps() {
	let tmp = tempfile::tempdir().unwrap();
	std::fs::create_dir_all(tmp.path().join("src")).unwrap();
	write(
		&tmp.path().join("nakime.toml"),
		r#"
[defaults]
kill_timeout = 500

[[apps]]
name = "bot"
script = "bot.py"
interpreter = "python3"
args = "--cog-path=bots.doomer2.doomer --verbose"
watch = ["src"]
ignore_watch = ["*.pyc"]
"#,
	);

	let out = nakime(&["check", "--json"], tmp.path());
	assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));

	let apps: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
	let app = &apps[0];
	assert_eq!(app["name"], "bot");
	assert_eq!(app["kill_timeout"], 500);
	assert_eq!(app["autorestart"], false);
	assert_eq!(app["ignore_watch"][0], "*.pyc");

	let command = app["command"].as_str().unwrap();
	assert!(command.starts_with("python3 "), "{}", command);
	assert!(command.ends_with("bot.py --cog-path=bots.doomer2.doomer --verbose"), "{}", command);

	let watch = app["watch"][0].as_str().unwrap();
	assert!(watch.ends_with("/src"), "{}", watch);
}

#[test]
fn check_reads_json_ecosystem() {
	let tmp = tempfile::tempdir().unwrap();
	write(
		&tmp.path().join("ecosystem.json"),
		r#"{"apps": [{"name": "api", "script": "/bin/sleep", "args": ["60"], "autorestart": true}]}"#,
	);

	let out = nakime(&["check", "ecosystem.json"], tmp.path());
	assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
	let stdout = String::from_utf8_lossy(&out.stdout);
	assert!(stdout.contains("api"));
	assert!(stdout.contains("/bin/sleep 60"));
}

#[test]
fn check_reports_config_errors() {
	let tmp = tempfile::tempdir().unwrap();
	write(&tmp.path().join("nakime.toml"), "[[apps]]\nname = \"noscript\"\n");

	let out = nakime(&["check"], tmp.path());
	assert!(!out.status.success());
	let stderr = String::from_utf8_lossy(&out.stderr);
	assert!(stderr.contains("missing `script`"), "stderr: {}", stderr);

	let out = nakime(&["check", "does-not-exist.toml"], tmp.path());
	assert!(!out.status.success());
	assert!(String::from_utf8_lossy(&out.stderr).contains("does-not-exist.toml"));
}

#[test]
fn run_with_unknown_app_fails() {
	let tmp = tempfile::tempdir().unwrap();
	write(
		&tmp.path().join("nakime.toml"),
		"[[apps]]\nname = \"a\"\nscript = \"/bin/true\"\n",
	);

	let out = nakime(&["run", "--only", "b"], tmp.path());
	assert!(!out.status.success());
	assert!(String::from_utf8_lossy(&out.stderr).contains("no app named \"b\""));
}

#[test]
fn run_fails_when_nothing_starts() {
	let tmp = tempfile::tempdir().unwrap();
	write(
		&tmp.path().join("nakime.toml"),
		"[[apps]]\nname = \"ghost\"\nscript = \"/no/such/program\"\n",
	);
	let logs = tmp.path().join("logs");

	let out = nakime(
		&["run", "--quiet", "--log-dir", logs.to_str().unwrap()],
		tmp.path(),
	);
	assert!(!out.status.success());
	let stderr = String::from_utf8_lossy(&out.stderr);
	assert!(stderr.contains("/no/such/program"), "stderr: {}", stderr);
	assert!(stderr.contains("no app could be started"), "stderr: {}", stderr);
}
