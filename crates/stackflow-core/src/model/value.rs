//! 設定値と出力参照
//!
//! 設定値はリテラルか、他リソースの出力属性への参照 (`OutputReference`) です。
//! 参照は二段階で扱います。グラフ構築時に参照先の存在を検証し、
//! 適用時に実際の値で置き換えます。

use crate::error::{ConfigError, Result};
use crate::model::ResourceAddress;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// 他リソースの出力属性への参照
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutputReference {
    pub target: ResourceAddress,
    pub attribute: String,
}

impl OutputReference {
    pub fn new(target: ResourceAddress, attribute: impl Into<String>) -> Self {
        Self {
            target,
            attribute: attribute.into(),
        }
    }

    /// 未適用の参照先に使うプレースホルダー
    pub fn placeholder(&self) -> String {
        format!("(known after apply: {})", self)
    }
}

impl fmt::Display for OutputReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.target, self.attribute)
    }
}

/// 設定値
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ConfigValue {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
    List(Vec<ConfigValue>),
    Map(BTreeMap<String, ConfigValue>),
    /// 出力属性への参照
    Ref(OutputReference),
    /// 文字列補間（例: `"s3://${store.bucket_name}"`）
    Concat(Vec<ConfigValue>),
}

impl ConfigValue {
    pub fn string(value: impl Into<String>) -> Self {
        ConfigValue::String(value.into())
    }

    pub fn reference(target: ResourceAddress, attribute: impl Into<String>) -> Self {
        ConfigValue::Ref(OutputReference::new(target, attribute))
    }

    /// 値に含まれる全ての参照を収集
    pub fn references(&self) -> Vec<&OutputReference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a OutputReference>) {
        match self {
            ConfigValue::Ref(r) => refs.push(r),
            ConfigValue::List(items) | ConfigValue::Concat(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
            ConfigValue::Map(map) => {
                for value in map.values() {
                    value.collect_references(refs);
                }
            }
            _ => {}
        }
    }

    /// 参照を具体的な値で解決する
    ///
    /// `lookup` が値を返せない参照があれば `UnresolvedReference` で失敗します。
    pub fn resolve<F>(&self, lookup: &F) -> Result<serde_json::Value>
    where
        F: Fn(&OutputReference) -> Option<String>,
    {
        self.resolve_inner(&|r: &OutputReference| {
            lookup(r).ok_or_else(|| ConfigError::UnresolvedReference {
                reference: r.to_string(),
                message: "参照先リソースがまだ適用されていません".to_string(),
            })
        })
    }

    /// 解決できない参照をプレースホルダーに置き換えて解決する
    pub fn resolve_or_placeholder<F>(&self, lookup: &F) -> serde_json::Value
    where
        F: Fn(&OutputReference) -> Option<String>,
    {
        let resolved: Result<serde_json::Value> = self.resolve_inner(&|r: &OutputReference| {
            Ok(lookup(r).unwrap_or_else(|| r.placeholder()))
        });
        // lookup が常に Ok を返すので失敗しない
        resolved.unwrap_or(serde_json::Value::Null)
    }

    fn resolve_inner<F>(&self, lookup: &F) -> Result<serde_json::Value>
    where
        F: Fn(&OutputReference) -> Result<String>,
    {
        use serde_json::Value;

        Ok(match self {
            ConfigValue::Null => Value::Null,
            ConfigValue::Bool(b) => Value::Bool(*b),
            ConfigValue::Integer(i) => Value::from(*i),
            ConfigValue::Float(f) => Value::from(*f),
            ConfigValue::String(s) => Value::String(s.clone()),
            ConfigValue::List(items) => Value::Array(
                items
                    .iter()
                    .map(|item| item.resolve_inner(lookup))
                    .collect::<Result<Vec<_>>>()?,
            ),
            ConfigValue::Map(map) => {
                let mut object = serde_json::Map::new();
                for (key, value) in map {
                    object.insert(key.clone(), value.resolve_inner(lookup)?);
                }
                Value::Object(object)
            }
            ConfigValue::Ref(r) => Value::String(lookup(r)?),
            ConfigValue::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    match part.resolve_inner(lookup)? {
                        Value::String(s) => out.push_str(&s),
                        Value::Null => {}
                        other => out.push_str(&other.to_string()),
                    }
                }
                Value::String(out)
            }
        })
    }
}

impl From<&str> for ConfigValue {
    fn from(value: &str) -> Self {
        ConfigValue::String(value.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(value: String) -> Self {
        ConfigValue::String(value)
    }
}

impl From<i64> for ConfigValue {
    fn from(value: i64) -> Self {
        ConfigValue::Integer(value)
    }
}

impl From<bool> for ConfigValue {
    fn from(value: bool) -> Self {
        ConfigValue::Bool(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn addr(s: &str) -> ResourceAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_collect_nested_references() {
        let value = ConfigValue::Map(BTreeMap::from([
            (
                "environment".to_string(),
                ConfigValue::Map(BTreeMap::from([(
                    "HOST".to_string(),
                    ConfigValue::reference(addr("db.mysql"), "endpoint_address"),
                )])),
            ),
            (
                "bucket".to_string(),
                ConfigValue::Concat(vec![
                    ConfigValue::string("s3://"),
                    ConfigValue::reference(addr("storage.artifacts"), "bucket_name"),
                ]),
            ),
        ]));

        let refs: Vec<String> = value.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(
            refs,
            vec![
                "storage.artifacts.bucket_name",
                "db.mysql.endpoint_address"
            ]
        );
    }

    #[test]
    fn test_resolve_concat() {
        let value = ConfigValue::Concat(vec![
            ConfigValue::string("s3://"),
            ConfigValue::reference(addr("storage.artifacts"), "bucket_name"),
        ]);
        let resolved = value
            .resolve(&|r| (r.attribute == "bucket_name").then(|| "mlflow-artifacts".to_string()))
            .unwrap();
        assert_eq!(resolved, json!("s3://mlflow-artifacts"));
    }

    #[test]
    fn test_resolve_unresolved_reference() {
        let value = ConfigValue::reference(addr("network.vpc"), "vpc_id");
        let err = value.resolve(&|_| None).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::UnresolvedReference { ref reference, .. } if reference == "network.vpc.vpc_id"
        ));
    }

    #[test]
    fn test_resolve_placeholder() {
        let value = ConfigValue::List(vec![
            ConfigValue::Integer(5000),
            ConfigValue::reference(addr("network.vpc"), "vpc_id"),
        ]);
        let resolved = value.resolve_or_placeholder(&|_| None);
        assert_eq!(
            resolved,
            json!([5000, "(known after apply: network.vpc.vpc_id)"])
        );
    }
}
