use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

fn datasandbox(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_datasandbox"))
        .args(args)
        .current_dir(cwd)
        .env_remove("DATASANDBOX_WORK_DIR")
        .env_remove("DATASANDBOX_LANGUAGE")
        .output()
        .unwrap()
}

fn write_script(dir: &Path, contents: &str) -> String {
    let path = dir.join("analysis.sh");
    std::fs::write(&path, contents).unwrap();
    path.to_string_lossy().into_owned()
}

#[test]
fn test_unreadable_source_exits_1() {
    let dir = TempDir::new().unwrap();
    let output = datasandbox(&["does-not-exist.py"], dir.path());

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("Failed to read file"));
}

#[test]
fn test_success_prints_output_and_exits_0() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir(&work).unwrap();
    let script = write_script(dir.path(), "echo hello");

    let output = datasandbox(
        &["--language", "shell", "--work-dir", work.to_str().unwrap(), &script],
        dir.path(),
    );

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "hello\n");
}

#[test]
fn test_failure_exits_2() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("work");
    std::fs::create_dir(&work).unwrap();
    let script = write_script(dir.path(), "echo oops >&2\nexit 5");

    let output = datasandbox(
        &["--language", "shell", "--work-dir", work.to_str().unwrap(), &script],
        dir.path(),
    );

    assert_eq!(output.status.code(), Some(2));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("oops"));
    assert!(stdout.contains("[runtime error]"));
}

#[test]
fn test_default_work_dir_is_used() {
    let dir = TempDir::new().unwrap();
    let work = dir.path().join("app/assets/data");
    std::fs::create_dir_all(&work).unwrap();
    let script = write_script(dir.path(), "printf x > plot.png");

    let output = datasandbox(&["--language", "shell", "--json", &script], dir.path());

    assert_eq!(output.status.code(), Some(0));
    let result: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(result["success"], true);
    assert_eq!(result["plots"], serde_json::json!(["plot.png"]));
    assert!(work.join("plot.png").exists());
}

#[test]
fn test_missing_default_work_dir_exits_1() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "echo hi");

    let output = datasandbox(&["--language", "shell", &script], dir.path());

    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does not exist"));
}

#[test]
fn test_timeout_flag() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "while :; do :; done");

    let output = datasandbox(
        &[
            "--language",
            "shell",
            "--timeout",
            "0.5",
            "--work-dir",
            dir.path().to_str().unwrap(),
            &script,
        ],
        dir.path(),
    );

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stdout).contains("timeout"));
}

#[test]
fn test_out_of_range_limits_do_not_panic() {
    let dir = TempDir::new().unwrap();
    let script = write_script(dir.path(), "echo ok");
    let work = dir.path().to_str().unwrap();

    let output = datasandbox(
        &["--language", "shell", "--timeout", "1e20", "--work-dir", work, &script],
        dir.path(),
    );
    assert_eq!(output.status.code(), Some(0));

    let output = datasandbox(
        &[
            "--language",
            "shell",
            "--memory-mb",
            "18446744073709551",
            "--work-dir",
            work,
            &script,
        ],
        dir.path(),
    );
    assert_eq!(output.status.code(), Some(0));
    assert_eq!(String::from_utf8_lossy(&output.stdout), "ok\n");
}

#[test]
fn test_bad_arguments_exit_1() {
    let dir = TempDir::new().unwrap();
    let output = datasandbox(&[], dir.path());
    assert_eq!(output.status.code(), Some(1));

    let output = datasandbox(&["--language", "cobol", "x.py"], dir.path());
    assert_eq!(output.status.code(), Some(1));
}

#[test]
fn test_help_exits_0() {
    let dir = TempDir::new().unwrap();
    let output = datasandbox(&["--help"], dir.path());
    assert_eq!(output.status.code(), Some(0));
}
