//! Resource entities and their validation at the cache boundary.
//!
//! The cloud provider hands back loosely-typed records where every field may
//! be missing. They are converted into the typed entities in this module
//! before anything else in the application sees them: a missing required
//! field is a [`CacheError::MalformedPayload`], unknown fields are ignored.

use chrono::{DateTime, Utc};
use std::fmt;

use crate::error::CacheError;

/// Substring that identifies the ECS infrastructure agent container.
pub const AGENT_CONTAINER_MARKER: &str = "ecs-agent";

/// Display names for well-known region codes.
const REGION_NAMES: &[(&str, &str)] = &[
    ("us-east-1", "N.Virginia"),
    ("us-east-2", "Ohio"),
    ("us-west-1", "N.California"),
    ("us-west-2", "Oregon"),
    ("af-south-1", "Cape Town"),
    ("ap-east-1", "Hong Kong"),
    ("ap-south-1", "Mumbai"),
    ("ap-south-2", "Hyderabad"),
    ("ap-southeast-1", "Singapore"),
    ("ap-southeast-2", "Sydney"),
    ("ap-southeast-3", "Jakarta"),
    ("ap-southeast-4", "Melbourne"),
    ("ap-northeast-1", "Tokyo"),
    ("ap-northeast-2", "Seoul"),
    ("ap-northeast-3", "Osaka"),
    ("ca-central-1", "Canada"),
    ("ca-west-1", "Calgary"),
    ("eu-central-1", "Frankfurt"),
    ("eu-central-2", "Zurich"),
    ("eu-west-1", "Ireland"),
    ("eu-west-2", "London"),
    ("eu-west-3", "Paris"),
    ("eu-south-1", "Milan"),
    ("eu-south-2", "Spain"),
    ("eu-north-1", "Stockholm"),
    ("il-central-1", "Tel Aviv"),
    ("me-south-1", "Bahrain"),
    ("me-central-1", "UAE"),
    ("sa-east-1", "São Paulo"),
];

/// Returns the last `/`-separated segment of an ARN.
pub fn short_id(arn: &str) -> &str {
    arn.rsplit('/').next().unwrap_or(arn)
}

/// Whether a container name belongs to the infrastructure agent.
pub fn is_agent_container(name: &str) -> bool {
    name.to_lowercase().contains(AGENT_CONTAINER_MARKER)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Region {
    pub id: String,
    pub name: String,
}

impl Region {
    pub fn new(id: &str) -> Self {
        let name = REGION_NAMES
            .iter()
            .find(|(code, _)| *code == id)
            .map_or(id, |(_, name)| name);
        Self {
            id: id.to_string(),
            name: name.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub arn: String,
    pub name: String,
    pub region: String,
}

/// An ECS service within a cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub arn: String,
    pub name: String,
    pub cluster_arn: String,
    pub region: String,
    pub desired_count: i32,
    pub running_count: i32,
    /// Task definition ARN the service currently deploys
    pub task_definition: String,
}

impl Service {
    /// Family name of the service's task definition (`family:revision` without the revision).
    pub fn task_family(&self) -> &str {
        let name = short_id(&self.task_definition);
        name.split(':').next().unwrap_or(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchType {
    Ec2,
    Fargate,
}

impl fmt::Display for LaunchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ec2 => write!(f, "EC2"),
            Self::Fargate => write!(f, "FARGATE"),
        }
    }
}

/// A running task of a service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub arn: String,
    /// Short task id (last ARN segment)
    pub id: String,
    pub cluster_arn: String,
    pub region: String,
    pub service_name: String,
    pub launch_type: LaunchType,
    pub last_status: String,
    /// Container instance hosting the task (EC2 only)
    pub container_instance_arn: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub task_definition_arn: String,
    pub containers: Vec<Container>,
}

impl Task {
    /// Containers that may be navigated to (the agent container is never a target).
    pub fn eligible_containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.iter().filter(|c| !is_agent_container(&c.name))
    }

    pub fn is_running(&self) -> bool {
        self.last_status == "RUNNING"
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Container {
    pub name: String,
    pub task_arn: String,
    /// Docker container id on the host
    pub runtime_id: Option<String>,
    pub last_status: String,
}

/// Cache key kinds, used for TTL lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Clusters,
    Services,
    Tasks,
    TaskDetail,
}

// Raw provider records

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawCluster {
    pub arn: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawService {
    pub arn: Option<String>,
    pub name: Option<String>,
    pub cluster_arn: Option<String>,
    pub desired_count: Option<i32>,
    pub running_count: Option<i32>,
    pub task_definition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawTask {
    pub arn: Option<String>,
    pub cluster_arn: Option<String>,
    /// Task group, `service:<name>` for service tasks
    pub group: Option<String>,
    pub launch_type: Option<String>,
    pub last_status: Option<String>,
    pub container_instance_arn: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub task_definition_arn: Option<String>,
    pub containers: Vec<RawContainer>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawContainer {
    pub name: Option<String>,
    pub task_arn: Option<String>,
    pub runtime_id: Option<String>,
    pub last_status: Option<String>,
}

fn required<T>(value: Option<T>, kind: &'static str, field: &'static str) -> Result<T, CacheError> {
    value.ok_or(CacheError::MalformedPayload { kind, field })
}

impl Cluster {
    pub fn from_raw(raw: RawCluster, region: &str) -> Result<Self, CacheError> {
        let arn = required(raw.arn, "cluster", "clusterArn")?;
        let name = raw.name.unwrap_or_else(|| short_id(&arn).to_string());
        Ok(Self {
            arn,
            name,
            region: region.to_string(),
        })
    }
}

impl Service {
    pub fn from_raw(raw: RawService, cluster: &Cluster) -> Result<Self, CacheError> {
        Ok(Self {
            arn: required(raw.arn, "service", "serviceArn")?,
            name: required(raw.name, "service", "serviceName")?,
            cluster_arn: required(raw.cluster_arn, "service", "clusterArn")?,
            region: cluster.region.clone(),
            desired_count: raw.desired_count.unwrap_or(0),
            running_count: raw.running_count.unwrap_or(0),
            task_definition: required(raw.task_definition, "service", "taskDefinition")?,
        })
    }
}

impl Task {
    pub fn from_raw(raw: RawTask, region: &str) -> Result<Self, CacheError> {
        let arn = required(raw.arn, "task", "taskArn")?;
        let service_name = raw
            .group
            .as_deref()
            .and_then(|g| g.strip_prefix("service:"))
            .unwrap_or_default()
            .to_string();
        let launch_type = match raw.launch_type.as_deref() {
            Some("FARGATE") => LaunchType::Fargate,
            Some(_) => LaunchType::Ec2,
            // Tasks placed by a capacity provider omit the launch type; only EC2 has a host.
            None if raw.container_instance_arn.is_some() => LaunchType::Ec2,
            None => LaunchType::Fargate,
        };
        let containers = raw
            .containers
            .into_iter()
            .map(Container::from_raw)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            id: short_id(&arn).to_string(),
            cluster_arn: required(raw.cluster_arn, "task", "clusterArn")?,
            region: region.to_string(),
            service_name,
            launch_type,
            last_status: required(raw.last_status, "task", "lastStatus")?,
            container_instance_arn: raw.container_instance_arn,
            started_at: raw.started_at,
            task_definition_arn: required(raw.task_definition_arn, "task", "taskDefinitionArn")?,
            containers,
            arn,
        })
    }
}

impl Container {
    pub fn from_raw(raw: RawContainer) -> Result<Self, CacheError> {
        Ok(Self {
            name: required(raw.name, "container", "name")?,
            task_arn: required(raw.task_arn, "container", "taskArn")?,
            runtime_id: raw.runtime_id,
            last_status: raw.last_status.unwrap_or_else(|| "UNKNOWN".to_string()),
        })
    }
}

/// A task definition revision, reduced to what the editor and log streamer need.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskDefinition {
    pub arn: String,
    pub family: String,
    pub revision: i32,
    pub containers: Vec<ContainerDefinition>,
}

impl TaskDefinition {
    pub fn container(&self, name: &str) -> Option<&ContainerDefinition> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// CloudWatch log sources for `task`, one per container using the awslogs driver.
    pub fn log_sources(&self, task: &Task) -> Vec<LogSource> {
        self.containers
            .iter()
            .filter(|c| !is_agent_container(&c.name))
            .filter_map(|c| {
                let logs = c.log_config.as_ref()?;
                let stream = match &logs.stream_prefix {
                    Some(prefix) => format!("{prefix}/{}/{}", c.name, task.id),
                    None => format!("{}/{}", c.name, task.id),
                };
                Some(LogSource {
                    container: c.name.clone(),
                    group: logs.group.clone(),
                    stream,
                    region: logs.region.clone().unwrap_or_else(|| task.region.clone()),
                })
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDefinition {
    pub name: String,
    /// Plain `name=value` pairs in definition order
    pub environment: Vec<(String, String)>,
    pub secrets: Vec<SecretRef>,
    pub log_config: Option<AwsLogsConfig>,
}

/// An environment variable populated from SSM Parameter Store or Secrets Manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretRef {
    pub name: String,
    pub value_from: String,
}

impl SecretRef {
    /// Whether the reference points at Secrets Manager (otherwise Parameter Store).
    pub fn is_secrets_manager(&self) -> bool {
        self.value_from.contains(":secretsmanager:")
    }

    /// Secret id without the optional `:json-key:version-stage:version-id` suffix.
    pub fn secret_id(&self) -> &str {
        match self.value_from.match_indices(':').nth(6) {
            Some((idx, _)) => &self.value_from[..idx],
            None => &self.value_from,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AwsLogsConfig {
    pub group: String,
    pub stream_prefix: Option<String>,
    pub region: Option<String>,
}

/// One CloudWatch log stream belonging to a task container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogSource {
    pub container: String,
    pub group: String,
    pub stream: String,
    pub region: String,
}

/// Host instance resolved for an EC2 task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceTarget {
    pub instance_id: String,
    /// Whether the instance is a managed instance of the session service
    pub ssm_registered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RolloutState {
    InProgress,
    Completed,
    Failed(String),
}

/// Snapshot of a service's primary deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentStatus {
    pub service_name: String,
    pub task_definition: String,
    pub rollout: RolloutState,
    pub running_count: i32,
    pub desired_count: i32,
    /// Number of deployments still active (old revisions draining)
    pub deployments: usize,
}

impl DeploymentStatus {
    /// Steady once the primary rollout completed and no older deployment remains.
    pub fn is_steady(&self) -> bool {
        self.rollout == RolloutState::Completed && self.deployments <= 1 && self.running_count == self.desired_count
    }
}

/// Leaf actions offered for a selected container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    ContainerShell,
    HostShell,
    LiveLogs,
    LiveLogsAllContainers,
    DownloadLogs { minutes: u32 },
    EnvVars,
}

impl Action {
    /// Menu for a task: host shell only makes sense on EC2.
    pub fn menu(task: &Task, download_windows: &[u32]) -> Vec<Action> {
        let mut actions = vec![Action::ContainerShell];
        if task.launch_type == LaunchType::Ec2 {
            actions.push(Action::HostShell);
        }
        actions.push(Action::LiveLogs);
        if task.eligible_containers().count() > 1 {
            actions.push(Action::LiveLogsAllContainers);
        }
        actions.extend(download_windows.iter().map(|&minutes| Action::DownloadLogs { minutes }));
        actions.push(Action::EnvVars);
        actions
    }

    pub fn label(&self) -> String {
        match self {
            Self::ContainerShell => "Connect to container".to_string(),
            Self::HostShell => "SSH to host instance".to_string(),
            Self::LiveLogs => "Live logs".to_string(),
            Self::LiveLogsAllContainers => "Live logs (all containers)".to_string(),
            Self::DownloadLogs { minutes } if *minutes % 60 == 0 && *minutes >= 60 => {
                format!("Download logs (last {}h)", minutes / 60)
            }
            Self::DownloadLogs { minutes } => format!("Download logs (last {minutes}m)"),
            Self::EnvVars => "Environment variables".to_string(),
        }
    }
}
