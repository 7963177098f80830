#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

mod common;

use assert_cmd::Command;
use common::{DEMO_STACK, TestProject};
use predicates::prelude::*;

/// CLIヘルプが正しく表示されることを確認
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("stack").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("plan"))
        .stdout(predicate::str::contains("apply"))
        .stdout(predicate::str::contains("destroy"))
        .stdout(predicate::str::contains("validate"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("stack").unwrap();
    cmd.arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("stackflow"));
}

#[test]
fn test_destroy_help() {
    let mut cmd = Command::cargo_bin("stack").unwrap();
    cmd.arg("destroy")
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--stack"))
        .stdout(predicate::str::contains("--yes"));
}

#[test]
fn test_invalid_command() {
    let mut cmd = Command::cargo_bin("stack").unwrap();
    cmd.arg("invalid-command").assert().failure();
}

#[test]
fn test_validate_ok() {
    let project = TestProject::with_stack(DEMO_STACK);
    project
        .cmd()
        .arg("validate")
        .assert()
        .success()
        .stdout(predicate::str::contains("設定ファイルは正常です"))
        .stdout(predicate::str::contains("network.vpc"))
        .stdout(predicate::str::contains("app.cluster"));
}

/// 循環依存は設定エラー（終了コード2）
#[test]
fn test_validate_cycle() {
    let project = TestProject::with_stack(
        r#"
stack "app" {
    resource "a" kind="role" {
        depends-on "b"
    }
    resource "b" kind="role" {
        depends-on "a"
    }
}
"#,
    );
    project
        .cmd()
        .arg("validate")
        .assert()
        .code(2)
        .stderr(predicate::str::contains("循環依存"));
}

/// スタックファイルが無いと終了コード2
#[test]
fn test_plan_without_stack_file() {
    let project = TestProject::new();
    project
        .cmd()
        .arg("--file")
        .arg(project.path().join("missing.kdl"))
        .arg("plan")
        .assert()
        .code(2);
}

#[test]
fn test_plan_does_not_touch_state() {
    let project = TestProject::with_stack(DEMO_STACK);
    project
        .cmd()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("3 to create"));

    assert!(!project.state_file("network").exists());
}

/// plan → apply → 再plan（変更なし） → destroy
#[test]
fn test_full_lifecycle() {
    let project = TestProject::with_stack(DEMO_STACK);

    project
        .cmd()
        .args(["apply", "--yes"])
        .assert()
        .code(0)
        .stdout(predicate::str::contains("完了"));

    assert!(project.state_file("network").exists());
    assert!(project.state_file("storage").exists());
    assert!(project.state_file("app").exists());

    project
        .cmd()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("変更はありません"));

    project
        .cmd()
        .args(["state", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("storage.artifacts"))
        .stdout(predicate::str::contains("合計: 3個"));

    project
        .cmd()
        .args(["plan", "--destroy"])
        .assert()
        .success()
        .stdout(predicate::str::contains("3 to destroy"));

    project
        .cmd()
        .args(["destroy", "--yes"])
        .assert()
        .code(0);

    assert!(!project.state_file("network").exists());
    project
        .cmd()
        .args(["state", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("記録済みのリソースはありません"));
}

/// 確認に答えなければ何もしない
#[test]
fn test_apply_requires_confirmation() {
    let project = TestProject::with_stack(DEMO_STACK);
    project
        .cmd()
        .arg("apply")
        .write_stdin("n\n")
        .assert()
        .code(0)
        .stdout(predicate::str::contains("キャンセルしました"));

    assert!(!project.state_file("network").exists());
}

/// 不正なバケット名でstorageが失敗し、appはスキップされる（終了コード1）
#[test]
fn test_partial_failure_exit_code() {
    let project = TestProject::with_stack(&DEMO_STACK.replace("demo-artifacts", "Bad_Bucket"));

    project
        .cmd()
        .args(["apply", "-y"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("一部失敗"))
        .stdout(predicate::str::contains("storage.artifacts"));

    // 成功したステップは記録され、再planでは残りだけが対象
    assert!(project.state_file("network").exists());
    assert!(!project.state_file("app").exists());

    project.write_stack_kdl(DEMO_STACK);
    project
        .cmd()
        .arg("plan")
        .assert()
        .success()
        .stdout(predicate::str::contains("2 to create"))
        .stdout(predicate::str::contains("1 unchanged"));
}

/// --stack は下流のスタックも削除する
#[test]
fn test_destroy_stack_with_downstream() {
    let project = TestProject::with_stack(DEMO_STACK);
    project.cmd().args(["apply", "-y"]).assert().code(0);

    project
        .cmd()
        .args(["destroy", "--stack", "storage", "-y"])
        .assert()
        .code(0);

    assert!(project.state_file("network").exists());
    assert!(!project.state_file("storage").exists());
    assert!(!project.state_file("app").exists());
}

#[test]
fn test_destroy_unknown_stack() {
    let project = TestProject::with_stack(DEMO_STACK);
    project
        .cmd()
        .args(["destroy", "--stack", "nope", "-y"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_zero_concurrency_rejected() {
    let project = TestProject::with_stack(DEMO_STACK);
    project
        .cmd()
        .args(["--concurrency", "0", "plan"])
        .assert()
        .code(2);
}
