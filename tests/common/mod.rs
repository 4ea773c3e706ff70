//! In-memory providers and fixtures shared by the integration tests.
#![allow(dead_code, clippy::unwrap_used)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use ecs_hatch::error::ProviderError;
use ecs_hatch::model::{
    AwsLogsConfig, Cluster, ContainerDefinition, DeploymentStatus, InstanceTarget, LogSource, RawCluster,
    RawContainer, RawService, RawTask, RolloutState, Service, Task, TaskDefinition,
};
use ecs_hatch::provider::{
    CloudProvider, LogPage, LogProvider, LogQuery, ParameterProvider, ParameterValue, RawLogEvent,
    RegisterTaskDefinition, SecretProvider,
};
use ecs_hatch::session::{ProcessExit, ProcessHandle, ProcessSpawner, SessionCommand};

pub const REGION: &str = "eu-west-1";
pub const ACCOUNT: &str = "123456789012";

pub fn cluster_arn(name: &str) -> String {
    format!("arn:aws:ecs:{REGION}:{ACCOUNT}:cluster/{name}")
}

pub fn service_arn(cluster: &str, name: &str) -> String {
    format!("arn:aws:ecs:{REGION}:{ACCOUNT}:service/{cluster}/{name}")
}

pub fn task_arn(cluster: &str, id: &str) -> String {
    format!("arn:aws:ecs:{REGION}:{ACCOUNT}:task/{cluster}/{id}")
}

pub fn task_definition_arn(family: &str, revision: i32) -> String {
    format!("arn:aws:ecs:{REGION}:{ACCOUNT}:task-definition/{family}:{revision}")
}

pub fn raw_cluster(name: &str) -> RawCluster {
    RawCluster {
        arn: Some(cluster_arn(name)),
        name: Some(name.to_string()),
    }
}

pub fn raw_service(cluster: &str, name: &str, family: &str) -> RawService {
    RawService {
        arn: Some(service_arn(cluster, name)),
        name: Some(name.to_string()),
        cluster_arn: Some(cluster_arn(cluster)),
        desired_count: Some(1),
        running_count: Some(1),
        task_definition: Some(task_definition_arn(family, 1)),
    }
}

pub fn raw_task(cluster: &str, service: &str, id: &str, family: &str, containers: &[&str]) -> RawTask {
    let arn = task_arn(cluster, id);
    RawTask {
        arn: Some(arn.clone()),
        cluster_arn: Some(cluster_arn(cluster)),
        group: Some(format!("service:{service}")),
        launch_type: Some("FARGATE".to_string()),
        last_status: Some("RUNNING".to_string()),
        container_instance_arn: None,
        started_at: None,
        task_definition_arn: Some(task_definition_arn(family, 1)),
        containers: containers
            .iter()
            .map(|name| RawContainer {
                name: Some((*name).to_string()),
                task_arn: Some(arn.clone()),
                runtime_id: Some(format!("{name}-runtime")),
                last_status: Some("RUNNING".to_string()),
            })
            .collect(),
    }
}

pub fn cluster(name: &str) -> Cluster {
    Cluster::from_raw(raw_cluster(name), REGION).unwrap()
}

pub fn service(cluster_name: &str, name: &str, family: &str) -> Service {
    Service::from_raw(raw_service(cluster_name, name, family), &cluster(cluster_name)).unwrap()
}

pub fn task(cluster_name: &str, service_name: &str, id: &str, family: &str, containers: &[&str]) -> Task {
    Task::from_raw(raw_task(cluster_name, service_name, id, family, containers), REGION).unwrap()
}

pub fn definition(family: &str, revision: i32, container: &str, environment: &[(&str, &str)]) -> TaskDefinition {
    TaskDefinition {
        arn: task_definition_arn(family, revision),
        family: family.to_string(),
        revision,
        containers: vec![ContainerDefinition {
            name: container.to_string(),
            environment: environment
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            secrets: Vec::new(),
            log_config: Some(AwsLogsConfig {
                group: format!("/ecs/{family}"),
                stream_prefix: Some("ecs".to_string()),
                region: None,
            }),
        }],
    }
}

/// ECS stand-in holding a fixed resource tree.
#[derive(Default)]
pub struct FakeCloud {
    pub clusters: Vec<RawCluster>,
    pub services: Vec<RawService>,
    pub tasks: Vec<RawTask>,
    pub definitions: Mutex<HashMap<String, TaskDefinition>>,
    /// Artificial latency of list calls
    pub delay: Duration,
    /// Services whose `update_service` call fails
    pub failing_updates: Vec<String>,
    /// Number of upcoming `describe_services` calls that are throttled
    pub throttled_polls: AtomicUsize,
    /// Secrets Manager values by secret id
    pub secret_values: HashMap<String, String>,
    pub list_calls: AtomicUsize,
    pub registrations: AtomicUsize,
    pub updates: Mutex<Vec<(String, String, bool)>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
}

impl FakeCloud {
    pub fn add_definition(&self, definition: TaskDefinition) {
        self.definitions
            .lock()
            .unwrap()
            .insert(definition.arn.clone(), definition);
    }

    async fn listing<T>(&self, value: T) -> T {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        value
    }

    fn deployed(&self, service: &Service) -> String {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(name, _, _)| *name == service.name)
            .map_or_else(|| service.task_definition.clone(), |(_, td, _)| td.clone())
    }
}

fn not_found(operation: &str, message: &str) -> ProviderError {
    ProviderError::NotFound {
        operation: operation.to_string(),
        message: message.to_string(),
    }
}

#[async_trait]
impl CloudProvider for FakeCloud {
    async fn list_clusters(&self, _region: &str) -> Result<Vec<RawCluster>, ProviderError> {
        Ok(self.listing(self.clusters.clone()).await)
    }

    async fn list_services(&self, cluster: &Cluster) -> Result<Vec<RawService>, ProviderError> {
        let services = self
            .services
            .iter()
            .filter(|s| s.cluster_arn.as_deref() == Some(cluster.arn.as_str()))
            .cloned()
            .collect();
        Ok(self.listing(services).await)
    }

    async fn list_tasks(&self, service: &Service) -> Result<Vec<RawTask>, ProviderError> {
        let group = format!("service:{}", service.name);
        let tasks = self
            .tasks
            .iter()
            .filter(|t| t.group.as_deref() == Some(group.as_str()))
            .cloned()
            .collect();
        Ok(self.listing(tasks).await)
    }

    async fn describe_task(&self, task: &Task) -> Result<RawTask, ProviderError> {
        let found = self
            .tasks
            .iter()
            .find(|t| t.arn.as_deref() == Some(task.arn.as_str()))
            .cloned();
        found.ok_or_else(|| not_found("DescribeTasks", &task.id))
    }

    async fn describe_task_definition(&self, _region: &str, arn: &str) -> Result<TaskDefinition, ProviderError> {
        let definitions = self.definitions.lock().unwrap();
        definitions
            .get(arn)
            .cloned()
            .ok_or_else(|| not_found("DescribeTaskDefinition", arn))
    }

    async fn register_task_definition(
        &self,
        request: &RegisterTaskDefinition,
    ) -> Result<TaskDefinition, ProviderError> {
        let mut definitions = self.definitions.lock().unwrap();
        let base = definitions
            .get(&request.base_arn)
            .cloned()
            .ok_or_else(|| not_found("RegisterTaskDefinition", &request.base_arn))?;
        let latest = definitions
            .values()
            .filter(|d| d.family == base.family)
            .map(|d| d.revision)
            .max()
            .unwrap_or(base.revision);

        let mut registered = base.clone();
        registered.revision = latest + 1;
        registered.arn = task_definition_arn(&base.family, registered.revision);
        for container in &mut registered.containers {
            if container.name == request.container {
                container.environment = request.environment.clone();
            }
        }
        definitions.insert(registered.arn.clone(), registered.clone());
        self.registrations.fetch_add(1, Ordering::SeqCst);
        Ok(registered)
    }

    async fn update_service(&self, service: &Service, task_definition: &str, force: bool) -> Result<(), ProviderError> {
        if self.failing_updates.contains(&service.name) {
            return Err(ProviderError::PermissionDenied {
                operation: "UpdateService".to_string(),
                message: format!("not allowed to update {}", service.name),
            });
        }
        self.updates
            .lock()
            .unwrap()
            .push((service.name.clone(), task_definition.to_string(), force));
        Ok(())
    }

    async fn describe_services(&self, services: &[Service]) -> Result<Vec<DeploymentStatus>, ProviderError> {
        let throttled = self
            .throttled_polls
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if throttled {
            return Err(ProviderError::Transient {
                operation: "DescribeServices".to_string(),
                message: "Throttling: Rate exceeded".to_string(),
            });
        }
        Ok(services
            .iter()
            .map(|s| DeploymentStatus {
                service_name: s.name.clone(),
                task_definition: self.deployed(s),
                rollout: RolloutState::Completed,
                running_count: s.desired_count,
                desired_count: s.desired_count,
                deployments: 1,
            })
            .collect())
    }

    async fn resolve_instance(&self, _task: &Task) -> Result<InstanceTarget, ProviderError> {
        Ok(InstanceTarget {
            instance_id: "i-0abc".to_string(),
            ssm_registered: true,
        })
    }
}

#[async_trait]
impl ParameterProvider for FakeCloud {
    async fn get_parameter(&self, _region: &str, name: &str, _decrypt: bool) -> Result<ParameterValue, ProviderError> {
        Err(not_found("GetParameter", name))
    }
}

#[async_trait]
impl SecretProvider for FakeCloud {
    async fn get_secret(&self, _region: &str, secret_id: &str) -> Result<String, ProviderError> {
        self.secret_values
            .get(secret_id)
            .cloned()
            .ok_or_else(|| not_found("GetSecretValue", secret_id))
    }
}

/// Serves scripted pages per stream and records every query.
#[derive(Default)]
pub struct ScriptedLogs {
    pages: Mutex<HashMap<String, VecDeque<Result<LogPage, ProviderError>>>>,
    pub queries: Mutex<Vec<(String, LogQuery)>>,
}

impl ScriptedLogs {
    pub fn push(&self, stream: &str, page: Result<LogPage, ProviderError>) {
        self.pages
            .lock()
            .unwrap()
            .entry(stream.to_string())
            .or_default()
            .push_back(page);
    }

    pub fn queries_for(&self, stream: &str) -> Vec<LogQuery> {
        self.queries
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| s == stream)
            .map(|(_, q)| q.clone())
            .collect()
    }
}

#[async_trait]
impl LogProvider for ScriptedLogs {
    async fn get_log_events(&self, source: &LogSource, query: &LogQuery) -> Result<LogPage, ProviderError> {
        self.queries
            .lock()
            .unwrap()
            .push((source.stream.clone(), query.clone()));
        let next = self
            .pages
            .lock()
            .unwrap()
            .get_mut(&source.stream)
            .and_then(VecDeque::pop_front);
        // Once the script runs out the stream is idle: no events, same token.
        next.unwrap_or_else(|| {
            Ok(LogPage {
                events: Vec::new(),
                next_forward_token: query.next_token.clone(),
            })
        })
    }
}

pub fn page(messages: &[(i64, &str)], token: Option<&str>) -> LogPage {
    LogPage {
        events: messages
            .iter()
            .map(|(ts, msg)| RawLogEvent {
                timestamp: Some(*ts),
                message: Some((*msg).to_string()),
            })
            .collect(),
        next_forward_token: token.map(str::to_string),
    }
}

pub fn source(container: &str, stream: &str) -> LogSource {
    LogSource {
        container: container.to_string(),
        group: "/ecs/app".to_string(),
        stream: stream.to_string(),
        region: REGION.to_string(),
    }
}

/// Session client that stays connected for `runs_for` and then exits cleanly.
pub struct FakeSpawner {
    pub runs_for: Duration,
    pub spawned: AtomicUsize,
}

impl FakeSpawner {
    pub fn new(runs_for: Duration) -> Arc<Self> {
        Arc::new(Self {
            runs_for,
            spawned: AtomicUsize::new(0),
        })
    }
}

struct FakeHandle {
    runs_for: Duration,
}

#[async_trait]
impl ProcessHandle for FakeHandle {
    async fn wait(&mut self) -> io::Result<ProcessExit> {
        tokio::time::sleep(self.runs_for).await;
        self.runs_for = Duration::ZERO;
        Ok(ProcessExit {
            code: Some(0),
            stderr_tail: String::new(),
        })
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.runs_for = Duration::ZERO;
        Ok(())
    }
}

impl ProcessSpawner for FakeSpawner {
    fn is_available(&self, _program: &str) -> bool {
        true
    }

    fn spawn(&self, _command: &SessionCommand) -> io::Result<Box<dyn ProcessHandle>> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeHandle { runs_for: self.runs_for }))
    }
}
