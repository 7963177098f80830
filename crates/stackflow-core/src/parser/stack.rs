//! stack / resource ノードのパース

use crate::error::{ConfigError, Result};
use crate::model::{ResourceConfig, ResourceDescriptor, ResourceAddress, StackDescriptor};
use crate::parser::value::{parse_address, parse_config_node};
use kdl::KdlNode;
use std::collections::BTreeSet;

/// ノードの最初の位置引数（文字列）
fn first_argument(node: &KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .find_map(|e| e.value().as_string())
}

/// 名前付きプロパティ（文字列）
fn property<'a>(node: &'a KdlNode, key: &str) -> Option<&'a str> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .and_then(|e| e.value().as_string())
}

/// 位置引数（文字列）をすべて取得
fn string_arguments(node: &KdlNode) -> Vec<&str> {
    node.entries()
        .iter()
        .filter(|e| e.name().is_none())
        .filter_map(|e| e.value().as_string())
        .collect()
}

fn validate_identifier(kind: &str, name: &str) -> Result<()> {
    if name.is_empty() || name.contains('.') || name.contains('$') {
        return Err(ConfigError::InvalidConfig(format!(
            "{} 名 '{}' は空にできず、'.' や '$' を含められません",
            kind, name
        )));
    }
    Ok(())
}

/// stack ノードをパース
pub fn parse_stack(node: &KdlNode) -> Result<StackDescriptor> {
    let id = first_argument(node)
        .ok_or_else(|| ConfigError::InvalidConfig("stack requires a name".to_string()))?;
    validate_identifier("stack", id)?;

    let mut stack = StackDescriptor::new(id);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "depends-on" | "depends_on" => {
                    for dep in string_arguments(child) {
                        stack.depends_on.insert(dep.to_string());
                    }
                }
                "resource" => {
                    let resource = parse_resource(child, id)?;
                    stack.add_resource(resource)?;
                }
                other => {
                    tracing::debug!("Unknown node '{}' in stack '{}' skipped", other, id);
                }
            }
        }
    }

    Ok(stack)
}

/// resource ノードをパース
///
/// 種別は `kind="..."` プロパティ、または2番目の位置引数で指定します。
pub fn parse_resource(node: &KdlNode, stack: &str) -> Result<ResourceDescriptor> {
    let args = string_arguments(node);
    let name = args
        .first()
        .copied()
        .ok_or_else(|| ConfigError::InvalidConfig("resource requires a name".to_string()))?;
    validate_identifier("resource", name)?;

    let kind = property(node, "kind")
        .or_else(|| args.get(1).copied())
        .ok_or_else(|| {
            ConfigError::InvalidConfig(format!(
                "resource '{}.{}' requires kind (例: resource \"{}\" kind=\"network\")",
                stack, name, name
            ))
        })?;

    let mut config = ResourceConfig::new();
    let mut depends_on = BTreeSet::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "depends-on" | "depends_on" => {
                    for dep in string_arguments(child) {
                        depends_on.insert(parse_address(dep, stack)?);
                    }
                }
                key => {
                    if config.contains_key(key) {
                        return Err(ConfigError::InvalidConfig(format!(
                            "resource '{}.{}' の設定キー '{}' が重複しています",
                            stack, name, key
                        )));
                    }
                    config.insert(key.to_string(), parse_config_node(child, stack)?);
                }
            }
        }
    }

    ResourceDescriptor::new(ResourceAddress::new(stack, name), kind, config, depends_on)
}
