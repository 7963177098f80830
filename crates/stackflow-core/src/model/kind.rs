//! リソース種別レジストリ
//!
//! 管理できるリソース種別は閉じた集合で、各種別ごとに
//! 再作成が必要なフィールドとプロバイダーが返す出力属性を定義します。

use crate::error::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// リソース種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    /// VPC相当のネットワーク
    Network,
    /// オブジェクトストレージのバケット
    Bucket,
    /// シークレット（DBパスワードなど）
    Secret,
    /// セキュリティグループ
    SecurityGroup,
    /// マネージドRDB
    Database,
    /// 実行ロール
    Role,
    /// コンテナクラスター
    Cluster,
    /// タスク定義
    TaskDefinition,
    /// コンテナサービス（ロードバランサー付き）
    Service,
}

/// 種別ごとのスキーマ
#[derive(Debug, Clone, Copy)]
pub struct KindSchema {
    /// 変更するとリソースの再作成が必要になるフィールド
    pub immutable_fields: &'static [&'static str],
    /// 適用後にプロバイダーが返す出力属性
    pub outputs: &'static [&'static str],
}

impl ResourceKind {
    /// 既知の全種別
    pub const ALL: [ResourceKind; 9] = [
        ResourceKind::Network,
        ResourceKind::Bucket,
        ResourceKind::Secret,
        ResourceKind::SecurityGroup,
        ResourceKind::Database,
        ResourceKind::Role,
        ResourceKind::Cluster,
        ResourceKind::TaskDefinition,
        ResourceKind::Service,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Bucket => "bucket",
            ResourceKind::Secret => "secret",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::Database => "database",
            ResourceKind::Role => "role",
            ResourceKind::Cluster => "cluster",
            ResourceKind::TaskDefinition => "task-definition",
            ResourceKind::Service => "service",
        }
    }

    pub fn schema(&self) -> KindSchema {
        match self {
            ResourceKind::Network => KindSchema {
                immutable_fields: &["cidr"],
                outputs: &["vpc_id", "cidr_block"],
            },
            ResourceKind::Bucket => KindSchema {
                immutable_fields: &["bucket_name"],
                outputs: &["bucket_name", "bucket_arn"],
            },
            ResourceKind::Secret => KindSchema {
                immutable_fields: &["secret_name"],
                outputs: &["secret_name", "secret_arn"],
            },
            ResourceKind::SecurityGroup => KindSchema {
                immutable_fields: &["vpc", "security_group_name"],
                outputs: &["group_id"],
            },
            ResourceKind::Database => KindSchema {
                immutable_fields: &["engine", "database_name", "username", "vpc"],
                outputs: &["endpoint_address", "endpoint_port", "database_name"],
            },
            ResourceKind::Role => KindSchema {
                immutable_fields: &["assumed_by"],
                outputs: &["role_arn"],
            },
            ResourceKind::Cluster => KindSchema {
                immutable_fields: &["cluster_name", "vpc"],
                outputs: &["cluster_arn", "cluster_name"],
            },
            ResourceKind::TaskDefinition => KindSchema {
                immutable_fields: &[],
                outputs: &["task_definition_arn"],
            },
            ResourceKind::Service => KindSchema {
                immutable_fields: &["service_name", "cluster"],
                outputs: &["service_arn", "load_balancer_dns"],
            },
        }
    }

    /// フィールドの変更が再作成を伴うか
    pub fn requires_replacement(&self, field: &str) -> bool {
        self.schema().immutable_fields.contains(&field)
    }

    /// 出力属性として定義されているか
    pub fn has_output(&self, attribute: &str) -> bool {
        self.schema().outputs.contains(&attribute)
    }
}

impl FromStr for ResourceKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        ResourceKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == s || kind.as_str().replace('-', "_") == s)
            .ok_or_else(|| ConfigError::UnknownResourceKind(s.to_string()))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_kinds() {
        for kind in ResourceKind::ALL {
            assert_eq!(kind.as_str().parse::<ResourceKind>().unwrap(), kind);
        }
        // snake_case も受け付ける
        assert_eq!(
            "security_group".parse::<ResourceKind>().unwrap(),
            ResourceKind::SecurityGroup
        );
    }

    #[test]
    fn test_parse_unknown_kind() {
        let err = "load-balancer".parse::<ResourceKind>().unwrap_err();
        assert!(matches!(err, ConfigError::UnknownResourceKind(ref k) if k == "load-balancer"));
    }

    #[test]
    fn test_immutable_fields() {
        assert!(ResourceKind::Network.requires_replacement("cidr"));
        assert!(!ResourceKind::Network.requires_replacement("max_azs"));
        assert!(!ResourceKind::TaskDefinition.requires_replacement("image"));
    }

    #[test]
    fn test_outputs() {
        assert!(ResourceKind::Database.has_output("endpoint_address"));
        assert!(!ResourceKind::Database.has_output("password"));
    }
}
