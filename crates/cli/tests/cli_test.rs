use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

fn devbot(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("devbot").unwrap();
    cmd.current_dir(dir.path());
    for (key, _) in std::env::vars() {
        if key.starts_with("DEVBOT_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

// ============================================================================
// Help & Version
// ============================================================================

#[test]
fn test_help_lists_subcommands() {
    let dir = TempDir::new().unwrap();
    devbot(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("run"))
        .stdout(predicate::str::contains("crds"))
        .stdout(predicate::str::contains("config"));
}

#[test]
fn test_version() {
    let dir = TempDir::new().unwrap();
    devbot(&dir)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

// ============================================================================
// crds
// ============================================================================

#[test]
fn test_crds_prints_all_kinds() {
    let dir = TempDir::new().unwrap();
    let output = devbot(&dir).arg("crds").assert().success().get_output().stdout.clone();
    let yaml = String::from_utf8(output).unwrap();

    assert_eq!(yaml.matches("\n---\n").count(), 4);
    for kind in ["Repository", "Ref", "Application", "Environment", "Deployment"] {
        assert!(yaml.contains(&format!("kind: {kind}\n")), "{kind} missing");
    }
    assert!(yaml.contains("group: devbot.kfirs.com"));
}

// ============================================================================
// config
// ============================================================================

#[test]
fn test_config_defaults_without_file() {
    let dir = TempDir::new().unwrap();
    devbot(&dir)
        .arg("config")
        .assert()
        .success()
        .stdout(predicate::str::contains("workspace_root = \"/data\""))
        .stdout(predicate::str::contains("apply_mode = \"dry-run\""))
        .stdout(predicate::str::contains("api_url = \"https://api.github.com\""));
}

#[test]
fn test_config_file_and_env_overrides() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("operator.toml"),
        "[controller]\nsafety_interval = \"30s\"\n\n[tools]\nkubectl = \"/opt/kubectl\"\n",
    )
    .unwrap();

    devbot(&dir)
        .args(["--config", "operator.toml", "config"])
        .env("DEVBOT_CONTROLLER__APPLY_MODE", "live")
        .assert()
        .success()
        .stdout(predicate::str::contains("safety_interval = \"30s\""))
        .stdout(predicate::str::contains("kubectl = \"/opt/kubectl\""))
        .stdout(predicate::str::contains("apply_mode = \"live\""));
}

#[test]
fn test_invalid_config_fails() {
    let dir = TempDir::new().unwrap();
    fs::write(
        dir.path().join("devbot.toml"),
        "[controller]\nsafety_interval = \"5m\"\n",
    )
    .unwrap();

    devbot(&dir)
        .arg("config")
        .assert()
        .failure()
        .stderr(predicate::str::contains("controller.safety_interval"));
}
