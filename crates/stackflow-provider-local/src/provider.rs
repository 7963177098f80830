//! Local provider implementation
//!
//! Every resource is a JSON document under `<root>/local/<handle>.json`.
//! Outputs are derived from the handle and the stored configuration, so they
//! stay stable across runs.

use crate::error::{LocalError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use stackflow_core::{ResourceAddress, ResourceKind};
use stackflow_engine::{
    Outputs, ProviderHandle, ProviderResult, ResolvedConfig, ResourceProvider,
};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, info};

const LOCAL_DIR: &str = "local";

/// Stored resource document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalResource {
    pub handle: ProviderHandle,
    pub address: ResourceAddress,
    pub kind: ResourceKind,
    pub config: ResolvedConfig,
    /// Bumped on every update
    #[serde(default)]
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl LocalResource {
    fn string_field(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    /// First eight characters of the handle
    fn short_id(&self) -> &str {
        let id = self.handle.as_str();
        id.get(..8).unwrap_or(id)
    }

    /// Output attributes for the resource kind
    pub fn outputs(&self) -> Outputs {
        let name = &self.address.resource;
        let short = self.short_id();
        let mut outputs = Outputs::new();
        let mut put = |key: &str, value: String| {
            outputs.insert(key.to_string(), value);
        };

        match self.kind {
            ResourceKind::Network => {
                put("vpc_id", format!("vpc-{}", short));
                put(
                    "cidr_block",
                    self.string_field("cidr").unwrap_or("10.0.0.0/16").to_string(),
                );
            }
            ResourceKind::Bucket => {
                let bucket = self
                    .string_field("bucket_name")
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("{}-{}", self.address.stack, name));
                put("bucket_arn", format!("arn:local:s3:::{}", bucket));
                put("bucket_name", bucket);
            }
            ResourceKind::Secret => {
                let secret = self.string_field("secret_name").unwrap_or(name).to_string();
                put(
                    "secret_arn",
                    format!("arn:local:secretsmanager:secret:{}-{}", secret, short),
                );
                put("secret_name", secret);
            }
            ResourceKind::SecurityGroup => {
                put("group_id", format!("sg-{}", short));
            }
            ResourceKind::Database => {
                let engine = self.string_field("engine").unwrap_or("mysql");
                let default_port = if engine.starts_with("postgres") { 5432 } else { 3306 };
                let port = self
                    .config
                    .get("port")
                    .and_then(Value::as_i64)
                    .unwrap_or(default_port);
                put("endpoint_address", format!("{}.{}.db.local", name, short));
                put("endpoint_port", port.to_string());
                put(
                    "database_name",
                    self.string_field("database_name").unwrap_or(name).to_string(),
                );
            }
            ResourceKind::Role => {
                put("role_arn", format!("arn:local:iam::role/{}-{}", name, short));
            }
            ResourceKind::Cluster => {
                let cluster = self.string_field("cluster_name").unwrap_or(name).to_string();
                put("cluster_arn", format!("arn:local:ecs:cluster/{}", cluster));
                put("cluster_name", cluster);
            }
            ResourceKind::TaskDefinition => {
                // task definitions are versioned, every update is a new revision
                put(
                    "task_definition_arn",
                    format!(
                        "arn:local:ecs:task-definition/{}:{}",
                        name,
                        self.revision + 1
                    ),
                );
            }
            ResourceKind::Service => {
                let service = self.string_field("service_name").unwrap_or(name);
                put("service_arn", format!("arn:local:ecs:service/{}", service));
                put("load_balancer_dns", format!("{}-{}.elb.local", service, short));
            }
        }

        outputs
    }
}

/// Validate kind-specific fields
fn validate(kind: ResourceKind, config: &ResolvedConfig) -> Result<()> {
    match kind {
        ResourceKind::Bucket => {
            if let Some(name) = config.get("bucket_name").and_then(Value::as_str) {
                let valid_chars = name
                    .chars()
                    .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.');
                if !(3..=63).contains(&name.len()) || !valid_chars {
                    return Err(LocalError::InvalidConfig(format!(
                        "invalid bucket name '{}': use 3-63 lowercase letters, digits, '-' or '.'",
                        name
                    )));
                }
            }
        }
        ResourceKind::Network => {
            if let Some(cidr) = config.get("cidr").and_then(Value::as_str) {
                if !is_cidr(cidr) {
                    return Err(LocalError::InvalidConfig(format!(
                        "invalid CIDR block '{}'",
                        cidr
                    )));
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn is_cidr(value: &str) -> bool {
    let Some((ip, prefix)) = value.split_once('/') else {
        return false;
    };
    ip.parse::<std::net::Ipv4Addr>().is_ok() && prefix.parse::<u8>().is_ok_and(|p| p <= 32)
}

/// Provider that keeps resources as JSON files
pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// `root` is the state directory (e.g. `.stackflow`)
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().join(LOCAL_DIR),
        }
    }

    fn document_path(&self, handle: &ProviderHandle) -> PathBuf {
        self.root.join(format!("{}.json", handle))
    }

    /// Read a stored resource
    pub async fn read(&self, handle: &ProviderHandle) -> Result<LocalResource> {
        let path = self.document_path(handle);
        if !path.exists() {
            return Err(LocalError::ResourceNotFound(handle.to_string()));
        }
        let content = fs::read_to_string(&path).await?;
        Ok(serde_json::from_str(&content)?)
    }

    async fn read_kind(
        &self,
        handle: &ProviderHandle,
        kind: ResourceKind,
    ) -> Result<LocalResource> {
        let resource = self.read(handle).await?;
        if resource.kind != kind {
            return Err(LocalError::KindMismatch {
                handle: handle.to_string(),
                recorded: resource.kind.to_string(),
                requested: kind.to_string(),
            });
        }
        Ok(resource)
    }

    async fn write(&self, resource: &LocalResource) -> Result<()> {
        if !self.root.exists() {
            fs::create_dir_all(&self.root).await?;
        }
        let path = self.document_path(&resource.handle);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(resource)?).await?;
        fs::rename(&tmp, &path).await?;
        debug!(handle = %resource.handle, "Wrote local resource");
        Ok(())
    }

    /// All stored resources
    pub async fn list(&self) -> Result<Vec<LocalResource>> {
        let mut resources = Vec::new();
        if !self.root.exists() {
            return Ok(resources);
        }
        let mut entries = fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let content = fs::read_to_string(&path).await?;
                resources.push(serde_json::from_str(&content)?);
            }
        }
        resources.sort_by(|a: &LocalResource, b| a.address.cmp(&b.address));
        Ok(resources)
    }

    async fn create_resource(
        &self,
        address: &ResourceAddress,
        kind: ResourceKind,
        config: &ResolvedConfig,
    ) -> Result<ProviderHandle> {
        validate(kind, config)?;

        let now = Utc::now();
        let resource = LocalResource {
            handle: ProviderHandle::new(uuid::Uuid::new_v4().to_string()),
            address: address.clone(),
            kind,
            config: config.clone(),
            revision: 0,
            created_at: now,
            updated_at: now,
        };
        self.write(&resource).await?;

        info!(%address, handle = %resource.handle, "Created local {}", kind);
        Ok(resource.handle)
    }

    async fn update_resource(
        &self,
        handle: &ProviderHandle,
        kind: ResourceKind,
        delta: &ResolvedConfig,
    ) -> Result<()> {
        let mut resource = self.read_kind(handle, kind).await?;

        if let Some(field) = delta.keys().find(|f| kind.requires_replacement(f)) {
            return Err(LocalError::ImmutableField {
                kind: kind.to_string(),
                field: field.clone(),
            });
        }

        for (key, value) in delta {
            if value.is_null() {
                resource.config.remove(key);
            } else {
                resource.config.insert(key.clone(), value.clone());
            }
        }
        validate(kind, &resource.config)?;

        resource.revision += 1;
        resource.updated_at = Utc::now();
        self.write(&resource).await?;

        info!(address = %resource.address, %handle, fields = delta.len(), "Updated local {}", kind);
        Ok(())
    }

    async fn destroy_resource(&self, handle: &ProviderHandle, kind: ResourceKind) -> Result<()> {
        let resource = self.read_kind(handle, kind).await?;
        fs::remove_file(self.document_path(handle)).await?;
        info!(address = %resource.address, %handle, "Destroyed local {}", kind);
        Ok(())
    }
}

#[async_trait]
impl ResourceProvider for LocalProvider {
    fn name(&self) -> &str {
        "local"
    }

    async fn create(
        &self,
        address: &ResourceAddress,
        kind: ResourceKind,
        config: &ResolvedConfig,
    ) -> ProviderResult<ProviderHandle> {
        Ok(self.create_resource(address, kind, config).await?)
    }

    async fn update(
        &self,
        handle: &ProviderHandle,
        kind: ResourceKind,
        delta: &ResolvedConfig,
    ) -> ProviderResult<()> {
        Ok(self.update_resource(handle, kind, delta).await?)
    }

    async fn destroy(&self, handle: &ProviderHandle, kind: ResourceKind) -> ProviderResult<()> {
        Ok(self.destroy_resource(handle, kind).await?)
    }

    async fn describe(
        &self,
        handle: &ProviderHandle,
        kind: ResourceKind,
    ) -> ProviderResult<Outputs> {
        let resource = self.read_kind(handle, kind).await?;
        Ok(resource.outputs())
    }
}
