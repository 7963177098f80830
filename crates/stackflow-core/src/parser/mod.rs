//! KDLパーサー
//!
//! デプロイメント宣言（stack.kdl）をパースします。
//! エンジン本体は生の設定ファイルを扱わず、ここで生成された `Deployment` のみを受け取ります。

mod stack;
mod value;

pub use stack::{parse_resource, parse_stack};
pub use value::parse_interpolated;

use crate::error::{ConfigError, Result};
use crate::model::Deployment;
use kdl::KdlDocument;
use std::fs;
use std::path::Path;
use tracing::{debug, instrument};

/// KDLファイルをパースしてDeploymentを生成
#[instrument(skip(path), fields(path = %path.as_ref().display()))]
pub fn parse_kdl_file<P: AsRef<Path>>(path: P) -> Result<Deployment> {
    let content = fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::IoError {
        path: path.as_ref().to_path_buf(),
        message: e.to_string(),
    })?;
    let name = path
        .as_ref()
        .canonicalize()
        .ok()
        .as_deref()
        .and_then(|p| p.parent())
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    parse_kdl_string(&content, name)
}

/// KDL文字列をパース
pub fn parse_kdl_string(content: &str, default_name: String) -> Result<Deployment> {
    let doc: KdlDocument = content.parse()?;
    let mut deployment = Deployment::new(default_name);

    for node in doc.nodes() {
        match node.name().value() {
            "deployment" | "project" => {
                if let Some(name) = node.entries().first().and_then(|e| e.value().as_string()) {
                    deployment.name = name.to_string();
                }
            }
            "stack" => {
                let stack = parse_stack(node)?;
                deployment.add_stack(stack)?;
            }
            other => {
                // 不明なノードはスキップ
                debug!("Unknown top-level node '{}' skipped", other);
            }
        }
    }

    debug!(
        stacks = deployment.stacks.len(),
        resources = deployment.resources().count(),
        "Deployment parsed"
    );
    Ok(deployment)
}
