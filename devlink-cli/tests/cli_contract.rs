//! Integration tests for core CLI contract behavior.

use {devlink::ImageBuilder, predicates::prelude::*, std::fs, tempfile::tempdir};

/// Command isolated from the caller's environment and configuration.
fn cli_cmd(home: &std::path::Path) -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("devlink");
    cmd.current_dir(home)
        .env("HOME", home)
        .env("XDG_CONFIG_HOME", home.join(".config"))
        .env_remove("DEVLINK_PORT")
        .env_remove("DEVLINK_BAUD")
        .env_remove("DEVLINK_TRANSPORT")
        .env_remove("DEVLINK_DEMO")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let dir = tempdir().expect("tempdir should be created");
    for flag in ["--help", "-h"] {
        cli_cmd(dir.path())
            .arg(flag)
            .assert()
            .success()
            .stdout(predicate::str::contains("devlink"))
            .stderr(predicate::str::is_empty());
    }
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let dir = tempdir().expect("tempdir should be created");
    for flag in ["--version", "-V"] {
        cli_cmd(dir.path())
            .arg(flag)
            .assert()
            .success()
            .stdout(predicate::str::contains("devlink"))
            .stderr(predicate::str::is_empty());
    }
}

#[test]
fn list_ports_json_returns_valid_json() {
    let dir = tempdir().expect("tempdir should be created");
    let output = cli_cmd(dir.path())
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert!(parsed.is_array());
}

#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .arg("frobnicate")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty());
}

#[test]
fn exit_code_two_for_usage_error_invalid_flag() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .args(["list-ports", "--no-such-flag"])
        .assert()
        .code(2);
}

#[test]
fn completions_write_script_to_stdout() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("devlink"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .arg("completions")
        .assert()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("specify a shell"));
}

#[test]
fn invalid_local_config_warns_and_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("devlink.toml"), "[connection\nport = ")
        .expect("config should be written");

    cli_cmd(dir.path())
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .stderr(predicate::str::contains("Failed to parse config file"));
}

#[test]
fn image_info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("missing.img");

    cli_cmd(dir.path())
        .args(["image-info", "--json"])
        .arg(&missing)
        .assert()
        .failure()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn image_info_json_describes_image() {
    let dir = tempdir().expect("tempdir should be created");
    let path = dir.path().join("fw.img");
    let bytes = ImageBuilder::new(vec![0x11; 256])
        .version(3, 1, 0)
        .build();
    fs::write(&path, bytes).expect("image should be written");

    let output = cli_cmd(dir.path())
        .args(["image-info", "--json"])
        .arg(&path)
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let info: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(info["version"], "3.1.0");
    assert_eq!(info["size"], 256);
    assert_eq!(info["valid"], true);
}

#[test]
fn demo_params_get_prints_value() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .args(["--demo", "params", "get", "gain", "threshold"])
        .assert()
        .success()
        .stdout(predicate::str::contains("gain = 10"))
        .stdout(predicate::str::contains("threshold = 0.5 V"));
}

#[test]
fn demo_params_set_out_of_range_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .args(["--demo", "params", "set", "gain", "5000"])
        .assert()
        .code(2);
}

#[test]
fn demo_params_set_read_only_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .args(["--demo", "params", "set", "serial", "DL-9"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("read-only"));
}

#[test]
fn demo_params_set_accepts_valid_value() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .args(["--demo", "params", "set", "filter", "high"])
        .assert()
        .success();
}

#[test]
fn demo_params_read_all_json_reports_each_parameter() {
    let dir = tempdir().expect("tempdir should be created");
    let output = cli_cmd(dir.path())
        .args(["--demo", "params", "read-all", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let report: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(report["operation"], "read-all");
    assert_eq!(report["succeeded"], report["total"]);
    let names: Vec<&str> = report["items"]
        .as_array()
        .expect("items should be an array")
        .iter()
        .filter_map(|item| item["name"].as_str())
        .collect();
    assert!(names.contains(&"gain"));
    assert!(!names.contains(&"passcode"));
}

#[test]
fn demo_status_json_reports_link_counters() {
    let dir = tempdir().expect("tempdir should be created");
    let output = cli_cmd(dir.path())
        .args(["--demo", "--quiet", "status", "--json"])
        .output()
        .expect("command should execute");

    assert!(output.status.success());
    let status: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(status["state"], "connected");
    assert!(status["stats"]["bytes_received"].as_u64() > Some(0));
    assert!(status["stats"]["lines_sent"].as_u64() > Some(0));
    assert_eq!(status["stats"]["errors"], 0);
}

#[test]
fn demo_terminal_sends_stdin_lines() {
    let dir = tempdir().expect("tempdir should be created");
    cli_cmd(dir.path())
        .args(["--demo", "terminal"])
        .write_stdin("status\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("status: ok"));
}

#[test]
fn demo_terminal_log_records_sent_and_received_lines() {
    let dir = tempdir().expect("tempdir should be created");
    let log = dir.path().join("session.log");
    cli_cmd(dir.path())
        .args(["--demo", "--quiet", "terminal", "--log"])
        .arg(&log)
        .write_stdin("status\n")
        .assert()
        .success();

    let text = fs::read_to_string(&log).expect("log should be written");
    assert!(text.contains("[host] status"));
    assert!(text.contains("[device] status: ok"));
}

#[test]
fn demo_upgrade_with_yes_succeeds() {
    let dir = tempdir().expect("tempdir should be created");
    let path = dir.path().join("fw.img");
    fs::write(&path, ImageBuilder::new(vec![0x5A; 1500]).build())
        .expect("image should be written");

    cli_cmd(dir.path())
        .args(["--demo", "--quiet", "upgrade", "--yes"])
        .arg(&path)
        .assert()
        .success();
}

#[test]
fn upgrade_without_confirmation_is_usage_error() {
    let dir = tempdir().expect("tempdir should be created");
    let path = dir.path().join("fw.img");
    fs::write(&path, ImageBuilder::new(vec![0x5A; 64]).build())
        .expect("image should be written");

    cli_cmd(dir.path())
        .args(["--demo", "upgrade"])
        .arg(&path)
        .write_stdin("")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("--yes"));
}
