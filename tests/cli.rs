use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::io::Write;

fn mulchd() -> assert_cmd::Command {
    cargo_bin_cmd!("mulchd").into()
}

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    let mut f = std::fs::File::create(&path).unwrap();
    write!(f, "{contents}").unwrap();
    path
}

fn write_test_config(dir: &tempfile::TempDir) -> std::path::PathBuf {
    let data = dir.path().join("data");
    let storage = dir.path().join("storage");
    write_file(
        dir,
        "mulchd.toml",
        &format!(
            r#"
data_path = "{}"
storage_path = "{}"
storage_mode = "direct"
"#,
            data.display(),
            storage.display()
        ),
    )
}

const WEB1: &str = r#"
name = "web1"
seed = "debian-12"
disk_size = "2GB"
ram_size = "512MB"
cpu_count = 2
domains = ["web1.example.com", "api.example.com->8080"]
"#;

#[test]
fn help_works() {
    mulchd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Build and lifecycle orchestrator"));
}

#[test]
fn help_lists_every_subcommand() {
    let assert = mulchd().arg("--help").assert().success();
    let out = String::from_utf8_lossy(&assert.get_output().stdout).into_owned();
    for name in [
        "check",
        "create",
        "redefine",
        "backup",
        "delete",
        "status",
        "lock",
        "unlock",
        "export-backup",
    ] {
        assert!(out.contains(name), "{name} missing from --help:\n{out}");
    }
}

#[test]
fn missing_config_shows_error() {
    mulchd()
        .args(["--config", "/nonexistent/mulchd.toml", "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load config"));
}

#[test]
fn invalid_storage_mode_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_file(&dir, "mulchd.toml", "storage_mode = \"nfs\"\n");

    mulchd()
        .args(["--config", config_path.to_str().unwrap(), "status"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("storage_mode"));
}

#[test]
fn check_prints_compiled_description() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);
    let doc = write_file(&dir, "web1.toml", WEB1);

    mulchd()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "check",
            doc.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("web1"))
        .stdout(predicate::str::contains("api.example.com (port 8080)"))
        .stdout(predicate::str::contains("0 prepare, 0 backup, 0 restore"));
}

#[test]
fn check_rejects_tiny_disk() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);
    let doc = write_file(&dir, "web1.toml", &WEB1.replace("\"2GB\"", "\"500KB\""));

    mulchd()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "check",
            doc.to_str().unwrap(),
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("too small disk"));
}

#[test]
fn check_reports_missing_description() {
    let dir = tempfile::tempdir().unwrap();
    let config_path = write_test_config(&dir);

    mulchd()
        .args([
            "--config",
            config_path.to_str().unwrap(),
            "check",
            "/nonexistent/web1.toml",
        ])
        .assert()
        .failure()
        .stderr(predicate::str::contains("/nonexistent/web1.toml"));
}
