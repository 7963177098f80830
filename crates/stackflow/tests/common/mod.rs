#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

use assert_cmd::Command;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const DEMO_STACK: &str = r#"
deployment "demo"

stack "network" {
    resource "vpc" kind="network" {
        cidr "10.0.0.0/16"
    }
}

stack "storage" {
    depends-on "network"

    resource "artifacts" kind="bucket" {
        bucket_name "demo-artifacts"
    }
}

stack "app" {
    depends-on "storage"

    resource "cluster" kind="cluster" {
        cluster_name "demo"
        vpc "${network.vpc.vpc_id}"
    }
}
"#;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn with_stack(content: &str) -> Self {
        let project = Self::new();
        project.write_stack_kdl(content);
        project
    }

    pub fn write_stack_kdl(&self, content: &str) {
        fs::write(self.stack_file(), content).unwrap();
    }

    pub fn stack_file(&self) -> PathBuf {
        self.root.path().join("stack.kdl")
    }

    pub fn path(&self) -> PathBuf {
        self.root.path().to_path_buf()
    }

    #[allow(dead_code)]
    pub fn state_file(&self, stack: &str) -> PathBuf {
        self.root
            .path()
            .join(".stackflow")
            .join("state")
            .join(format!("{}.json", stack))
    }

    /// プロジェクトディレクトリで `stack` を実行するコマンド
    pub fn cmd(&self) -> Command {
        let mut cmd = Command::cargo_bin("stack").unwrap();
        cmd.current_dir(self.path())
            .env_remove("STACKFLOW_CONFIG_PATH")
            .env_remove("STACKFLOW_STATE_DIR")
            .env_remove("STACKFLOW_CONCURRENCY");
        cmd
    }
}
