//! Command line behaviour of the `prdforge` binary

mod common;

use assert_cmd::Command;
use common::{TestContext, TestContextBuilder};
use predicates::prelude::*;

/// The binary, isolated from the user's config and data directories
fn prdforge(ctx: &TestContext) -> Command {
    let mut cmd = Command::cargo_bin("prdforge").unwrap();
    cmd.env("HOME", ctx.path())
        .env("XDG_CONFIG_HOME", ctx.path().join(".config"))
        .env("XDG_DATA_HOME", ctx.path().join(".local/share"))
        .env_remove("RUST_LOG")
        .arg("--repo")
        .arg(ctx.repo());
    for (key, _) in std::env::vars() {
        if key.starts_with("PRDFORGE_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

#[test]
fn test_help_lists_commands() {
    let ctx = TestContextBuilder::new().unwrap().build().unwrap();
    prdforge(&ctx)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("submit"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("worker").not());
}

#[test]
fn test_submit_then_status() {
    let ctx = TestContextBuilder::new().unwrap().with_git().build().unwrap();
    let prd = ctx.write_prd("auth", "feature/auth", &["A-1"]).unwrap();

    prdforge(&ctx)
        .arg("submit")
        .arg(&prd)
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued auth"));

    prdforge(&ctx)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Queued 1"))
        .stdout(predicate::str::contains("1. auth"));

    let output = prdforge(&ctx).args(["status", "--json"]).output().unwrap();
    assert!(output.status.success());
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["queued"], serde_json::json!(["auth"]));
    assert_eq!(doc["max_parallel"], 3);

    // State lives under the repository by default
    assert!(ctx.repo().join(".prdforge/registry.json").exists());
}

#[test]
fn test_project_config_and_env_override() {
    let ctx = TestContextBuilder::new()
        .unwrap()
        .with_git()
        .with_file("repo/.prdforge/config.toml", "max_parallel = 5\napi_limit = 4\n")
        .build()
        .unwrap();
    let prd = ctx.write_prd("auth", "auth", &["A-1"]).unwrap();

    prdforge(&ctx)
        .env("PRDFORGE_API_LIMIT", "7")
        .arg("submit")
        .arg(&prd)
        .assert()
        .success();

    let output = prdforge(&ctx)
        .env("PRDFORGE_API_LIMIT", "7")
        .args(["status", "--json"])
        .output()
        .unwrap();
    let doc: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["max_parallel"], 5);
    assert_eq!(doc["api_limit"], 7);
}

#[test]
fn test_invalid_prd_exits_with_usage_code() {
    let ctx = TestContextBuilder::new()
        .unwrap()
        .with_git()
        .with_file(
            "bad.json",
            r#"{"project": "p", "branch_name": "b", "tasks": [
                {"id": "T-1", "title": "t", "acceptance_criteria": [{"given": "x"}]}
            ]}"#,
        )
        .build()
        .unwrap();

    prdforge(&ctx)
        .arg("submit")
        .arg(ctx.path().join("bad.json"))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("Invalid PRD"))
        .stderr(predicate::str::contains("T-1"));
}

#[test]
fn test_stop_unknown_unit_is_not_found() {
    let ctx = TestContextBuilder::new().unwrap().with_git().build().unwrap();

    prdforge(&ctx)
        .args(["stop", "nobody"])
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Not found"));
}

#[test]
fn test_stop_queued_unit() {
    let ctx = TestContextBuilder::new().unwrap().with_git().build().unwrap();
    let prd = ctx.write_prd("auth", "auth", &["A-1"]).unwrap();
    prdforge(&ctx).arg("submit").arg(&prd).assert().success();

    prdforge(&ctx)
        .args(["stop", "auth"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped auth"));

    prdforge(&ctx)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Stopped:\n  auth"));
}

#[test]
fn test_start_rejects_zero_parallelism() {
    let ctx = TestContextBuilder::new().unwrap().with_git().build().unwrap();

    prdforge(&ctx)
        .args(["start", "--max-parallel", "0"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("max_parallel"));
}
