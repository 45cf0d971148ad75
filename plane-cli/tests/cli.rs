use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;

fn shareplane() -> Command {
    Command::cargo_bin("shareplane").unwrap()
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{contents}").unwrap();
    file
}

#[test]
fn help_lists_commands() {
    shareplane()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("join"))
        .stdout(predicate::str::contains("project"));
}

#[test]
fn project_on_second_screen() {
    let config = config_file(
        r#"
[node]
device_id = "b"

[screen]
width_dp = 400
height_dp = 480
density = 1.8
"#,
    );

    // 100 x 200 VU at 0.4 dp/VU and 1.8 px/dp is 72 x 144 px
    let output = shareplane()
        .arg("--config")
        .arg(config.path())
        .args(["project", "--offset-x", "1000", "1100", "100", "100", "200"])
        .output()
        .unwrap();
    assert!(output.status.success());

    let json: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let rect = &json["screen_rect"];
    let close = |value: &serde_json::Value, expected: f64| {
        (value.as_f64().unwrap() - expected).abs() < 1e-9
    };
    assert!(close(&rect["x"], 72.0));
    assert!(close(&rect["width"], 72.0));
    assert!(close(&rect["height"], 144.0));
    assert_eq!(json["viewport"]["offset_x"], 1000.0);
}

#[test]
fn project_off_screen_is_null() {
    let config = config_file("");
    shareplane()
        .arg("--config")
        .arg(config.path())
        .args(["project", "1500", "10", "5", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"screen_rect\": null"));
}

#[test]
fn project_rejects_viewport_past_the_edge() {
    let config = config_file("");
    shareplane()
        .arg("--config")
        .arg(config.path())
        .args(["project", "--offset-x", "1500", "0", "0", "1", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not fit"));
}

#[test]
fn missing_config_fails() {
    shareplane()
        .args(["--config", "/nonexistent/shareplane.toml", "project", "0", "0", "1", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn invalid_config_fails() {
    let config = config_file("[plane]\nglobal_scale_dp_per_vu = -1\n");
    shareplane()
        .arg("--config")
        .arg(config.path())
        .args(["project", "0", "0", "1", "1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("must be positive"));
}

#[test]
fn init_writes_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("shareplane.toml");

    shareplane()
        .arg("--config")
        .arg(&path)
        .arg("init")
        .assert()
        .success();
    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("[plane]"));
    assert!(written.contains("global_scale_dp_per_vu"));

    shareplane()
        .arg("--config")
        .arg(&path)
        .arg("init")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--force"));

    shareplane()
        .arg("--config")
        .arg(&path)
        .args(["init", "--force"])
        .assert()
        .success();
}
