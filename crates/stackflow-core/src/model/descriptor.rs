//! リソース・スタック・デプロイメントの宣言モデル

use crate::error::{ConfigError, Result};
use crate::model::{ConfigValue, OutputReference, ResourceKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// スタック識別子
pub type StackId = String;

/// リソース設定（キー順で保持し、ハッシュを決定的にする）
pub type ResourceConfig = BTreeMap<String, ConfigValue>;

/// デプロイメント内でリソースを一意に指すアドレス (`stack.resource`)
///
/// 並び順（スタック名→リソース名）はトポロジカルソートのタイブレークに使われます。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceAddress {
    pub stack: StackId,
    pub resource: String,
}

impl ResourceAddress {
    pub fn new(stack: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            resource: resource.into(),
        }
    }
}

impl fmt::Display for ResourceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.stack, self.resource)
    }
}

impl FromStr for ResourceAddress {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((stack, resource))
                if !stack.is_empty() && !resource.is_empty() && !resource.contains('.') =>
            {
                Ok(Self::new(stack, resource))
            }
            _ => Err(ConfigError::InvalidConfig(format!(
                "リソースアドレスは 'stack.resource' 形式で指定してください: {}",
                s
            ))),
        }
    }
}

impl TryFrom<String> for ResourceAddress {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ResourceAddress> for String {
    fn from(value: ResourceAddress) -> Self {
        value.to_string()
    }
}

/// 単一リソースの宣言
///
/// 構築後は変更できません。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    address: ResourceAddress,
    kind: ResourceKind,
    config: ResourceConfig,
    depends_on: BTreeSet<ResourceAddress>,
}

impl ResourceDescriptor {
    /// 種別名をレジストリで検証してリソースを作成
    pub fn new(
        address: ResourceAddress,
        kind: &str,
        config: ResourceConfig,
        depends_on: BTreeSet<ResourceAddress>,
    ) -> Result<Self> {
        let kind: ResourceKind = kind.parse()?;
        Ok(Self::with_kind(address, kind, config, depends_on))
    }

    pub fn with_kind(
        address: ResourceAddress,
        kind: ResourceKind,
        config: ResourceConfig,
        depends_on: BTreeSet<ResourceAddress>,
    ) -> Self {
        Self {
            address,
            kind,
            config,
            depends_on,
        }
    }

    pub fn address(&self) -> &ResourceAddress {
        &self.address
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn config(&self) -> &ResourceConfig {
        &self.config
    }

    /// 明示的な依存先
    pub fn depends_on(&self) -> &BTreeSet<ResourceAddress> {
        &self.depends_on
    }

    /// 設定値に埋め込まれた全ての出力参照
    pub fn references(&self) -> Vec<&OutputReference> {
        self.config
            .values()
            .flat_map(|value| value.references())
            .collect()
    }

    /// 参照を解決した設定
    pub fn resolve_config<F>(
        &self,
        lookup: &F,
    ) -> Result<serde_json::Map<String, serde_json::Value>>
    where
        F: Fn(&OutputReference) -> Option<String>,
    {
        let mut resolved = serde_json::Map::new();
        for (key, value) in &self.config {
            resolved.insert(key.clone(), value.resolve(lookup)?);
        }
        Ok(resolved)
    }

    /// 未解決の参照をプレースホルダーにした設定
    pub fn resolve_config_or_placeholder<F>(
        &self,
        lookup: &F,
    ) -> serde_json::Map<String, serde_json::Value>
    where
        F: Fn(&OutputReference) -> Option<String>,
    {
        self.config
            .iter()
            .map(|(key, value)| (key.clone(), value.resolve_or_placeholder(lookup)))
            .collect()
    }
}

/// スタック（独立してデプロイ可能なリソースのまとまり）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StackDescriptor {
    pub id: StackId,

    /// 宣言順のリソース
    pub resources: Vec<ResourceDescriptor>,

    /// 先にデプロイされている必要があるスタック
    pub depends_on: BTreeSet<StackId>,
}

impl StackDescriptor {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Default::default()
        }
    }

    pub fn with_dependency(mut self, stack: impl Into<String>) -> Self {
        self.depends_on.insert(stack.into());
        self
    }

    /// リソースを追加（スタック内でIDが重複していればエラー）
    pub fn add_resource(&mut self, resource: ResourceDescriptor) -> Result<()> {
        if resource.address().stack != self.id {
            return Err(ConfigError::InvalidConfig(format!(
                "リソース {} はスタック '{}' に属していません",
                resource.address(),
                self.id
            )));
        }
        if self.get(&resource.address().resource).is_some() {
            return Err(ConfigError::DuplicateResource(resource.address().to_string()));
        }
        self.resources.push(resource);
        Ok(())
    }

    pub fn get(&self, resource: &str) -> Option<&ResourceDescriptor> {
        self.resources
            .iter()
            .find(|r| r.address().resource == resource)
    }
}

/// デプロイメント全体（複数スタック）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub name: String,
    pub stacks: Vec<StackDescriptor>,
}

impl Deployment {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stacks: Vec::new(),
        }
    }

    pub fn add_stack(&mut self, stack: StackDescriptor) -> Result<()> {
        if self.stack(&stack.id).is_some() {
            return Err(ConfigError::InvalidConfig(format!(
                "スタック '{}' が重複しています",
                stack.id
            )));
        }
        self.stacks.push(stack);
        Ok(())
    }

    pub fn stack(&self, id: &str) -> Option<&StackDescriptor> {
        self.stacks.iter().find(|s| s.id == id)
    }

    pub fn resources(&self) -> impl Iterator<Item = &ResourceDescriptor> {
        self.stacks.iter().flat_map(|s| s.resources.iter())
    }

    pub fn resource(&self, address: &ResourceAddress) -> Option<&ResourceDescriptor> {
        self.stack(&address.stack)
            .and_then(|s| s.get(&address.resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_roundtrip_and_order() {
        let addr: ResourceAddress = "storage.artifacts".parse().unwrap();
        assert_eq!(addr.stack, "storage");
        assert_eq!(addr.resource, "artifacts");
        assert_eq!(addr.to_string(), "storage.artifacts");

        assert!("storage".parse::<ResourceAddress>().is_err());
        assert!("a.b.c".parse::<ResourceAddress>().is_err());

        let a = ResourceAddress::new("app", "z");
        let b = ResourceAddress::new("db", "a");
        assert!(a < b);
    }

    #[test]
    fn test_descriptor_unknown_kind() {
        let result = ResourceDescriptor::new(
            ResourceAddress::new("app", "lb"),
            "load-balancer",
            ResourceConfig::new(),
            BTreeSet::new(),
        );
        assert!(matches!(result, Err(ConfigError::UnknownResourceKind(_))));
    }

    #[test]
    fn test_stack_duplicate_resource() {
        let mut stack = StackDescriptor::new("app");
        let svc = ResourceDescriptor::with_kind(
            ResourceAddress::new("app", "svc"),
            ResourceKind::Service,
            ResourceConfig::new(),
            BTreeSet::new(),
        );
        stack.add_resource(svc.clone()).unwrap();
        let err = stack.add_resource(svc).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateResource(ref a) if a == "app.svc"));
    }

    #[test]
    fn test_stack_rejects_foreign_resource() {
        let mut stack = StackDescriptor::new("app");
        let db = ResourceDescriptor::with_kind(
            ResourceAddress::new("db", "mysql"),
            ResourceKind::Database,
            ResourceConfig::new(),
            BTreeSet::new(),
        );
        assert!(stack.add_resource(db).is_err());
    }
}
