//! CLI contract tests: exit codes, printed results and masked settings.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Temp workspace with a settings file pointing charm at the workspace.
fn setup_workspace() -> (TempDir, std::path::PathBuf) {
    let dir = TempDir::new().expect("create temp dir");
    let config = dir.path().join("starport.toml");
    let data_dir = dir.path().join("charm");
    std::fs::write(
        &config,
        format!(
            "[logging]\nlevel = \"error\"\n\n[email]\nresend_api_key = \"re_secret_value\"\nsender_domain = \"example.com\"\n\n[charm]\ndata_dir = {:?}\n",
            data_dir.to_string_lossy()
        ),
    )
    .expect("write settings");
    (dir, config)
}

fn starport(config: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("starport").expect("binary");
    cmd.arg("--config").arg(config);
    cmd
}

#[test]
fn run_prints_returned_values() {
    let (dir, config) = setup_workspace();
    let script = dir.path().join("add.lua");
    std::fs::write(&script, "\u{FEFF}return 1 + 2, nil, 'done'").unwrap();

    starport(&config)
        .arg("run")
        .arg(&script)
        .assert()
        .success()
        .stdout(predicate::str::contains("3"))
        .stdout(predicate::str::contains("\"done\""));
}

#[test]
fn script_error_exits_nonzero() {
    let (dir, config) = setup_workspace();
    let script = dir.path().join("bad.lua");
    std::fs::write(&script, "error('kaboom')").unwrap();

    starport(&config)
        .arg("run")
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("kaboom"));
}

#[test]
fn binding_errors_reach_the_caller() {
    let (dir, config) = setup_workspace();
    let script = dir.path().join("mail.lua");
    std::fs::write(&script, "email.send{subject = 's', to = {}, text = 'x', from_id = 'bot'}").unwrap();

    starport(&config)
        .arg("run")
        .arg(&script)
        .assert()
        .failure()
        .stderr(predicate::str::contains("to must be set and non-empty"));
}

#[test]
fn scripts_use_charm_storage() {
    let (dir, config) = setup_workspace();
    let script = dir.path().join("kv.lua");
    std::fs::write(&script, "ckv.set('visits', '41') return tonumber(ckv.get('visits')) + 1").unwrap();

    starport(&config)
        .arg("run")
        .arg(&script)
        .assert()
        .success()
        .stdout(predicate::str::contains("42"));
    assert!(dir.path().join("charm").join("kv").exists());
}

#[test]
fn sandbox_hides_os() {
    let (dir, config) = setup_workspace();
    let script = dir.path().join("os.lua");
    std::fs::write(&script, "return os.getenv('HOME')").unwrap();

    starport(&config).arg("run").arg(&script).assert().failure();
}

#[test]
fn config_masks_secrets() {
    let (_dir, config) = setup_workspace();
    starport(&config)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("sender_domain = \"example.com\""))
        .stdout(predicate::str::contains("re_secret_value").not());
}

#[test]
fn missing_script_is_an_error() {
    let (dir, config) = setup_workspace();
    starport(&config)
        .arg("run")
        .arg(dir.path().join("nope.lua"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read script"));
}
