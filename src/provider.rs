//! Collaborator interfaces consumed by the core.
//!
//! `aws.rs` implements these against the AWS SDK; tests substitute in-memory
//! fakes.

use async_trait::async_trait;

use crate::error::ProviderError;
use crate::model::{
    Cluster, DeploymentStatus, InstanceTarget, LogSource, RawCluster, RawService, RawTask, Service, Task,
    TaskDefinition,
};

/// Request to register a copy of an existing task definition with one
/// container's plain environment replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterTaskDefinition {
    pub region: String,
    pub base_arn: String,
    pub container: String,
    pub environment: Vec<(String, String)>,
}

#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn list_clusters(&self, region: &str) -> Result<Vec<RawCluster>, ProviderError>;

    async fn list_services(&self, cluster: &Cluster) -> Result<Vec<RawService>, ProviderError>;

    /// Tasks of a service, described (containers included).
    async fn list_tasks(&self, service: &Service) -> Result<Vec<RawTask>, ProviderError>;

    async fn describe_task(&self, task: &Task) -> Result<RawTask, ProviderError>;

    async fn describe_task_definition(&self, region: &str, arn: &str) -> Result<TaskDefinition, ProviderError>;

    async fn register_task_definition(&self, request: &RegisterTaskDefinition)
        -> Result<TaskDefinition, ProviderError>;

    async fn update_service(&self, service: &Service, task_definition: &str, force: bool)
        -> Result<(), ProviderError>;

    async fn describe_services(&self, services: &[Service]) -> Result<Vec<DeploymentStatus>, ProviderError>;

    /// Resolves the EC2 instance hosting `task` and its session-service registration.
    async fn resolve_instance(&self, task: &Task) -> Result<InstanceTarget, ProviderError>;
}

/// One page of a log stream query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogQuery {
    /// Forward token returned by the previous page
    pub next_token: Option<String>,
    /// Inclusive start in epoch milliseconds
    pub start_time: Option<i64>,
    /// Inclusive end in epoch milliseconds
    pub end_time: Option<i64>,
    pub start_from_head: bool,
    pub limit: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawLogEvent {
    pub timestamp: Option<i64>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogPage {
    pub events: Vec<RawLogEvent>,
    pub next_forward_token: Option<String>,
}

#[async_trait]
pub trait LogProvider: Send + Sync {
    async fn get_log_events(&self, source: &LogSource, query: &LogQuery) -> Result<LogPage, ProviderError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterValue {
    pub value: String,
    /// SecureString parameter
    pub secure: bool,
}

#[async_trait]
pub trait ParameterProvider: Send + Sync {
    async fn get_parameter(&self, region: &str, name: &str, decrypt: bool) -> Result<ParameterValue, ProviderError>;
}

#[async_trait]
pub trait SecretProvider: Send + Sync {
    async fn get_secret(&self, region: &str, secret_id: &str) -> Result<String, ProviderError>;
}
