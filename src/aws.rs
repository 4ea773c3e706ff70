//! AWS implementation of the provider interfaces.
//!
//! Wraps the ECS, CloudWatch Logs, SSM and Secrets Manager SDK clients. Clients
//! are created lazily per region and shared for the lifetime of the process.

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt::Debug;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_cloudwatchlogs::Client as LogsClient;
use aws_sdk_ecs::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_ecs::types as ecs;
use aws_sdk_ecs::Client as EcsClient;
use aws_sdk_secretsmanager::Client as SecretsClient;
use aws_sdk_ssm::types::{InstanceInformationStringFilter, ParameterType};
use aws_sdk_ssm::Client as SsmClient;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use crate::error::ProviderError;
use crate::model::{
    short_id, AwsLogsConfig, Cluster, ContainerDefinition, DeploymentStatus, InstanceTarget, LogSource, RawCluster,
    RawContainer, RawService, RawTask, RolloutState, SecretRef, Service, Task, TaskDefinition,
};
use crate::provider::{
    CloudProvider, LogPage, LogProvider, LogQuery, ParameterProvider, ParameterValue, RawLogEvent,
    RegisterTaskDefinition, SecretProvider,
};

/// DescribeServices accepts at most this many services per call.
const DESCRIBE_SERVICES_BATCH: usize = 10;
/// DescribeTasks accepts at most this many tasks per call.
const DESCRIBE_TASKS_BATCH: usize = 100;

#[derive(Clone)]
struct RegionClients {
    ecs: EcsClient,
    logs: LogsClient,
    ssm: SsmClient,
    secrets: SecretsClient,
}

/// Provider backed by the AWS SDK.
///
/// One set of clients is built per region on first use, all sharing the
/// configured profile.
pub struct AwsProvider {
    profile: Option<String>,
    clients: Mutex<HashMap<String, RegionClients>>,
}

impl AwsProvider {
    /// Creates a provider using `profile` from the shared AWS config files, or
    /// the default credential chain when `None`.
    pub fn new(profile: Option<String>) -> Self {
        Self {
            profile,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn clients(&self, region: &str) -> RegionClients {
        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(region) {
            return existing.clone();
        }

        let mut config_loader =
            aws_config::defaults(BehaviorVersion::latest()).region(aws_config::Region::new(region.to_string()));
        if let Some(profile_name) = &self.profile {
            config_loader = config_loader.profile_name(profile_name);
        }
        let config = config_loader.load().await;
        debug!(region, profile = ?self.profile, "created aws clients");

        let created = RegionClients {
            ecs: EcsClient::new(&config),
            logs: LogsClient::new(&config),
            ssm: SsmClient::new(&config),
            secrets: SecretsClient::new(&config),
        };
        clients.insert(region.to_string(), created.clone());
        created
    }
}

/// Maps an SDK failure onto the provider error taxonomy.
///
/// Dispatch and timeout failures never reached the service and are always
/// transient; service errors are classified from their error code.
fn sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> ProviderError
where
    E: ProvideErrorMetadata + StdError + 'static,
    R: Debug,
{
    let message = DisplayErrorContext(&err).to_string();
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => ProviderError::Transient {
            operation: operation.to_string(),
            message,
        },
        _ => {
            let code = err.as_service_error().and_then(ProvideErrorMetadata::code);
            ProviderError::classify(operation, code, message)
        }
    }
}

fn smithy_time(value: Option<&aws_sdk_ecs::primitives::DateTime>) -> Option<DateTime<Utc>> {
    value.and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos()))
}

fn raw_service(service: &ecs::Service) -> RawService {
    RawService {
        arn: service.service_arn().map(str::to_string),
        name: service.service_name().map(str::to_string),
        cluster_arn: service.cluster_arn().map(str::to_string),
        desired_count: Some(service.desired_count()),
        running_count: Some(service.running_count()),
        task_definition: service.task_definition().map(str::to_string),
    }
}

fn raw_task(task: &ecs::Task) -> RawTask {
    RawTask {
        arn: task.task_arn().map(str::to_string),
        cluster_arn: task.cluster_arn().map(str::to_string),
        group: task.group().map(str::to_string),
        launch_type: task.launch_type().map(|lt| lt.as_str().to_string()),
        last_status: task.last_status().map(str::to_string),
        container_instance_arn: task.container_instance_arn().map(str::to_string),
        started_at: smithy_time(task.started_at()),
        task_definition_arn: task.task_definition_arn().map(str::to_string),
        containers: task
            .containers()
            .iter()
            .map(|c| RawContainer {
                name: c.name().map(str::to_string),
                task_arn: c.task_arn().map(str::to_string),
                runtime_id: c.runtime_id().map(str::to_string),
                last_status: c.last_status().map(str::to_string),
            })
            .collect(),
    }
}

fn container_definition(def: &ecs::ContainerDefinition) -> ContainerDefinition {
    let log_config = def
        .log_configuration()
        .filter(|lc| lc.log_driver().as_str() == "awslogs")
        .and_then(|lc| lc.options())
        .and_then(|options| {
            Some(AwsLogsConfig {
                group: options.get("awslogs-group")?.clone(),
                stream_prefix: options.get("awslogs-stream-prefix").cloned(),
                region: options.get("awslogs-region").cloned(),
            })
        });

    ContainerDefinition {
        name: def.name().unwrap_or_default().to_string(),
        environment: def
            .environment()
            .iter()
            .filter_map(|kv| Some((kv.name()?.to_string(), kv.value().unwrap_or_default().to_string())))
            .collect(),
        secrets: def
            .secrets()
            .iter()
            .map(|s| SecretRef {
                name: s.name().to_string(),
                value_from: s.value_from().to_string(),
            })
            .collect(),
        log_config,
    }
}

fn task_definition(def: &ecs::TaskDefinition) -> TaskDefinition {
    TaskDefinition {
        arn: def.task_definition_arn().unwrap_or_default().to_string(),
        family: def.family().unwrap_or_default().to_string(),
        revision: def.revision(),
        containers: def.container_definitions().iter().map(container_definition).collect(),
    }
}

/// Summarises a described service by its PRIMARY deployment.
///
/// Services without a deployment circuit breaker report no rollout state; for
/// those the rollout is considered complete once no other deployment remains
/// and the running count reached the desired count.
fn deployment_status(service: &ecs::Service) -> DeploymentStatus {
    let deployments = service.deployments();
    let primary = deployments.iter().find(|d| d.status() == Some("PRIMARY"));
    let running_count = primary.map_or(service.running_count(), ecs::Deployment::running_count);
    let desired_count = primary.map_or(service.desired_count(), ecs::Deployment::desired_count);

    let rollout = match primary.and_then(ecs::Deployment::rollout_state) {
        Some(ecs::DeploymentRolloutState::Completed) => RolloutState::Completed,
        Some(ecs::DeploymentRolloutState::Failed) => RolloutState::Failed(
            primary
                .and_then(ecs::Deployment::rollout_state_reason)
                .unwrap_or("deployment failed")
                .to_string(),
        ),
        Some(_) => RolloutState::InProgress,
        None if deployments.len() <= 1 && running_count == desired_count => RolloutState::Completed,
        None => RolloutState::InProgress,
    };

    DeploymentStatus {
        service_name: service.service_name().unwrap_or_default().to_string(),
        task_definition: primary
            .and_then(ecs::Deployment::task_definition)
            .or(service.task_definition())
            .unwrap_or_default()
            .to_string(),
        rollout,
        running_count,
        desired_count,
        deployments: deployments.len(),
    }
}

#[async_trait]
impl CloudProvider for AwsProvider {
    #[instrument(skip(self))]
    async fn list_clusters(&self, region: &str) -> Result<Vec<RawCluster>, ProviderError> {
        let ecs = self.clients(region).await.ecs;
        let mut clusters = Vec::new();
        let mut next_token = None;
        loop {
            let resp = ecs
                .list_clusters()
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error("ListClusters", e))?;
            clusters.extend(resp.cluster_arns().iter().map(|arn| RawCluster {
                arn: Some(arn.clone()),
                name: Some(short_id(arn).to_string()),
            }));
            next_token = resp.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }
        Ok(clusters)
    }

    #[instrument(skip(self, cluster), fields(cluster = %cluster.name))]
    async fn list_services(&self, cluster: &Cluster) -> Result<Vec<RawService>, ProviderError> {
        let ecs = self.clients(&cluster.region).await.ecs;
        let mut arns = Vec::new();
        let mut next_token = None;
        loop {
            let resp = ecs
                .list_services()
                .cluster(&cluster.arn)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error("ListServices", e))?;
            arns.extend(resp.service_arns().iter().cloned());
            next_token = resp.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        let mut services = Vec::with_capacity(arns.len());
        for batch in arns.chunks(DESCRIBE_SERVICES_BATCH) {
            let resp = ecs
                .describe_services()
                .cluster(&cluster.arn)
                .set_services(Some(batch.to_vec()))
                .send()
                .await
                .map_err(|e| sdk_error("DescribeServices", e))?;
            services.extend(resp.services().iter().map(raw_service));
        }
        Ok(services)
    }

    #[instrument(skip(self, service), fields(service = %service.name))]
    async fn list_tasks(&self, service: &Service) -> Result<Vec<RawTask>, ProviderError> {
        let ecs = self.clients(&service.region).await.ecs;
        let mut arns = Vec::new();
        let mut next_token = None;
        loop {
            let resp = ecs
                .list_tasks()
                .cluster(&service.cluster_arn)
                .service_name(&service.name)
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| sdk_error("ListTasks", e))?;
            arns.extend(resp.task_arns().iter().cloned());
            next_token = resp.next_token().map(str::to_string);
            if next_token.is_none() {
                break;
            }
        }

        let mut tasks = Vec::with_capacity(arns.len());
        for batch in arns.chunks(DESCRIBE_TASKS_BATCH) {
            let resp = ecs
                .describe_tasks()
                .cluster(&service.cluster_arn)
                .set_tasks(Some(batch.to_vec()))
                .send()
                .await
                .map_err(|e| sdk_error("DescribeTasks", e))?;
            tasks.extend(resp.tasks().iter().map(raw_task));
        }
        Ok(tasks)
    }

    #[instrument(skip(self, task), fields(task = %task.id))]
    async fn describe_task(&self, task: &Task) -> Result<RawTask, ProviderError> {
        let ecs = self.clients(&task.region).await.ecs;
        let resp = ecs
            .describe_tasks()
            .cluster(&task.cluster_arn)
            .tasks(&task.arn)
            .send()
            .await
            .map_err(|e| sdk_error("DescribeTasks", e))?;
        resp.tasks().first().map(raw_task).ok_or_else(|| ProviderError::NotFound {
            operation: "DescribeTasks".to_string(),
            message: format!("task {} no longer exists", task.id),
        })
    }

    #[instrument(skip(self))]
    async fn describe_task_definition(&self, region: &str, arn: &str) -> Result<TaskDefinition, ProviderError> {
        let ecs = self.clients(region).await.ecs;
        let resp = ecs
            .describe_task_definition()
            .task_definition(arn)
            .send()
            .await
            .map_err(|e| sdk_error("DescribeTaskDefinition", e))?;
        resp.task_definition().map(task_definition).ok_or_else(|| ProviderError::NotFound {
            operation: "DescribeTaskDefinition".to_string(),
            message: format!("task definition {arn} not found"),
        })
    }

    /// Registers a new revision copied from `base_arn` with the container's
    /// plain environment replaced. Secrets and every other setting carry over.
    #[instrument(skip(self, request), fields(base = %request.base_arn, container = %request.container))]
    async fn register_task_definition(
        &self,
        request: &RegisterTaskDefinition,
    ) -> Result<TaskDefinition, ProviderError> {
        const OPERATION: &str = "RegisterTaskDefinition";
        let ecs = self.clients(&request.region).await.ecs;
        let resp = ecs
            .describe_task_definition()
            .task_definition(&request.base_arn)
            .send()
            .await
            .map_err(|e| sdk_error("DescribeTaskDefinition", e))?;
        let base = resp.task_definition().cloned().ok_or_else(|| ProviderError::NotFound {
            operation: "DescribeTaskDefinition".to_string(),
            message: format!("task definition {} not found", request.base_arn),
        })?;

        let mut container_definitions = base.container_definitions.unwrap_or_default();
        let target = container_definitions
            .iter_mut()
            .find(|def| def.name.as_deref() == Some(request.container.as_str()))
            .ok_or_else(|| ProviderError::NotFound {
                operation: OPERATION.to_string(),
                message: format!("container {} not in {}", request.container, request.base_arn),
            })?;
        target.environment = Some(
            request
                .environment
                .iter()
                .map(|(name, value)| ecs::KeyValuePair::builder().name(name).value(value).build())
                .collect(),
        );

        let resp = ecs
            .register_task_definition()
            .set_family(base.family)
            .set_task_role_arn(base.task_role_arn)
            .set_execution_role_arn(base.execution_role_arn)
            .set_network_mode(base.network_mode)
            .set_container_definitions(Some(container_definitions))
            .set_volumes(base.volumes)
            .set_placement_constraints(base.placement_constraints)
            .set_requires_compatibilities(base.requires_compatibilities)
            .set_cpu(base.cpu)
            .set_memory(base.memory)
            .set_pid_mode(base.pid_mode)
            .set_ipc_mode(base.ipc_mode)
            .set_proxy_configuration(base.proxy_configuration)
            .set_inference_accelerators(base.inference_accelerators)
            .set_ephemeral_storage(base.ephemeral_storage)
            .set_runtime_platform(base.runtime_platform)
            .send()
            .await
            .map_err(|e| sdk_error(OPERATION, e))?;

        let registered = resp.task_definition().map(task_definition).ok_or_else(|| ProviderError::Other {
            operation: OPERATION.to_string(),
            message: "response carried no task definition".to_string(),
        })?;
        debug!(arn = %registered.arn, "registered task definition");
        Ok(registered)
    }

    #[instrument(skip(self, service), fields(service = %service.name))]
    async fn update_service(&self, service: &Service, task_definition: &str, force: bool) -> Result<(), ProviderError> {
        let ecs = self.clients(&service.region).await.ecs;
        ecs.update_service()
            .cluster(&service.cluster_arn)
            .service(&service.name)
            .task_definition(task_definition)
            .force_new_deployment(force)
            .send()
            .await
            .map_err(|e| sdk_error("UpdateService", e))?;
        Ok(())
    }

    async fn describe_services(&self, services: &[Service]) -> Result<Vec<DeploymentStatus>, ProviderError> {
        let mut by_cluster: HashMap<(&str, &str), Vec<String>> = HashMap::new();
        for service in services {
            by_cluster
                .entry((service.region.as_str(), service.cluster_arn.as_str()))
                .or_default()
                .push(service.arn.clone());
        }

        let mut statuses = Vec::with_capacity(services.len());
        for ((region, cluster_arn), arns) in by_cluster {
            let ecs = self.clients(region).await.ecs;
            for batch in arns.chunks(DESCRIBE_SERVICES_BATCH) {
                let resp = ecs
                    .describe_services()
                    .cluster(cluster_arn)
                    .set_services(Some(batch.to_vec()))
                    .send()
                    .await
                    .map_err(|e| sdk_error("DescribeServices", e))?;
                statuses.extend(resp.services().iter().map(deployment_status));
            }
        }
        Ok(statuses)
    }

    #[instrument(skip(self, task), fields(task = %task.id))]
    async fn resolve_instance(&self, task: &Task) -> Result<InstanceTarget, ProviderError> {
        let container_instance = task.container_instance_arn.as_deref().ok_or_else(|| ProviderError::NotFound {
            operation: "DescribeContainerInstances".to_string(),
            message: format!("task {} has no container instance", task.id),
        })?;
        let clients = self.clients(&task.region).await;

        let resp = clients
            .ecs
            .describe_container_instances()
            .cluster(&task.cluster_arn)
            .container_instances(container_instance)
            .send()
            .await
            .map_err(|e| sdk_error("DescribeContainerInstances", e))?;
        let instance_id = resp
            .container_instances()
            .first()
            .and_then(|ci| ci.ec2_instance_id())
            .map(str::to_string)
            .ok_or_else(|| ProviderError::NotFound {
                operation: "DescribeContainerInstances".to_string(),
                message: format!("no EC2 instance behind {}", short_id(container_instance)),
            })?;

        let filter = InstanceInformationStringFilter::builder()
            .key("InstanceIds")
            .values(&instance_id)
            .build()
            .map_err(|e| ProviderError::Other {
                operation: "DescribeInstanceInformation".to_string(),
                message: e.to_string(),
            })?;
        let resp = clients
            .ssm
            .describe_instance_information()
            .filters(filter)
            .send()
            .await
            .map_err(|e| sdk_error("DescribeInstanceInformation", e))?;

        Ok(InstanceTarget {
            ssm_registered: !resp.instance_information_list().is_empty(),
            instance_id,
        })
    }
}

#[async_trait]
impl LogProvider for AwsProvider {
    async fn get_log_events(&self, source: &LogSource, query: &LogQuery) -> Result<LogPage, ProviderError> {
        let logs = self.clients(&source.region).await.logs;
        let resp = logs
            .get_log_events()
            .log_group_name(&source.group)
            .log_stream_name(&source.stream)
            .set_next_token(query.next_token.clone())
            .set_start_time(query.start_time)
            .set_end_time(query.end_time)
            .start_from_head(query.start_from_head)
            .limit(query.limit)
            .send()
            .await
            .map_err(|e| sdk_error("GetLogEvents", e))?;

        Ok(LogPage {
            events: resp
                .events()
                .iter()
                .map(|event| RawLogEvent {
                    timestamp: event.timestamp(),
                    message: event.message().map(str::to_string),
                })
                .collect(),
            next_forward_token: resp.next_forward_token().map(str::to_string),
        })
    }
}

#[async_trait]
impl ParameterProvider for AwsProvider {
    async fn get_parameter(&self, region: &str, name: &str, decrypt: bool) -> Result<ParameterValue, ProviderError> {
        let ssm = self.clients(region).await.ssm;
        let resp = ssm
            .get_parameter()
            .name(name)
            .with_decryption(decrypt)
            .send()
            .await
            .map_err(|e| sdk_error("GetParameter", e))?;
        let parameter = resp.parameter().ok_or_else(|| ProviderError::NotFound {
            operation: "GetParameter".to_string(),
            message: format!("parameter {name} not found"),
        })?;

        Ok(ParameterValue {
            value: parameter.value().unwrap_or_default().to_string(),
            secure: parameter.r#type() == Some(&ParameterType::SecureString),
        })
    }
}

#[async_trait]
impl SecretProvider for AwsProvider {
    async fn get_secret(&self, region: &str, secret_id: &str) -> Result<String, ProviderError> {
        let secrets = self.clients(region).await.secrets;
        let resp = secrets
            .get_secret_value()
            .secret_id(secret_id)
            .send()
            .await
            .map_err(|e| sdk_error("GetSecretValue", e))?;
        resp.secret_string().map(str::to_string).ok_or_else(|| ProviderError::Other {
            operation: "GetSecretValue".to_string(),
            message: format!("secret {secret_id} has no string value"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_clients_are_built_once_per_region() {
        let provider = AwsProvider::new(None);
        let first = provider.clients("eu-west-1").await;
        provider.clients("eu-west-1").await;
        provider.clients("us-east-1").await;

        assert_eq!(first.ecs.config().region().map(|r| r.as_ref()), Some("eu-west-1"));
        assert_eq!(provider.clients.lock().await.len(), 2);
    }

    fn deployment(status: &str, rollout: Option<ecs::DeploymentRolloutState>, running: i32) -> ecs::Deployment {
        ecs::Deployment::builder()
            .status(status)
            .set_rollout_state(rollout)
            .task_definition("arn:aws:ecs:us-east-1:1:task-definition/api:7")
            .running_count(running)
            .desired_count(2)
            .build()
    }

    fn service(deployments: Vec<ecs::Deployment>) -> ecs::Service {
        ecs::Service::builder()
            .service_name("api")
            .task_definition("arn:aws:ecs:us-east-1:1:task-definition/api:6")
            .desired_count(2)
            .running_count(2)
            .set_deployments(Some(deployments))
            .build()
    }

    #[test]
    fn test_deployment_status_uses_primary() {
        let svc = service(vec![
            deployment("PRIMARY", Some(ecs::DeploymentRolloutState::InProgress), 1),
            deployment("ACTIVE", Some(ecs::DeploymentRolloutState::Completed), 2),
        ]);
        let status = deployment_status(&svc);
        assert_eq!(status.rollout, RolloutState::InProgress);
        assert_eq!(status.task_definition, "arn:aws:ecs:us-east-1:1:task-definition/api:7");
        assert_eq!(status.running_count, 1);
        assert_eq!(status.deployments, 2);
        assert!(!status.is_steady());
    }

    #[test]
    fn test_deployment_status_without_rollout_state() {
        let svc = service(vec![deployment("PRIMARY", None, 2)]);
        let status = deployment_status(&svc);
        assert_eq!(status.rollout, RolloutState::Completed);
        assert!(status.is_steady());
    }

    #[test]
    fn test_raw_task_conversion() {
        let task = ecs::Task::builder()
            .task_arn("arn:aws:ecs:us-east-1:1:task/prod/abc123")
            .cluster_arn("arn:aws:ecs:us-east-1:1:cluster/prod")
            .group("service:api")
            .launch_type(ecs::LaunchType::Fargate)
            .last_status("RUNNING")
            .containers(ecs::Container::builder().name("app").runtime_id("r1").build())
            .build();
        let raw = raw_task(&task);
        assert_eq!(raw.group.as_deref(), Some("service:api"));
        assert_eq!(raw.launch_type.as_deref(), Some("FARGATE"));
        assert_eq!(raw.containers.len(), 1);
        assert_eq!(raw.containers[0].runtime_id.as_deref(), Some("r1"));
        assert!(raw.started_at.is_none());
    }

    #[test]
    fn test_container_definition_environment() {
        let def = ecs::ContainerDefinition::builder()
            .name("app")
            .environment(ecs::KeyValuePair::builder().name("A").value("1").build())
            .environment(ecs::KeyValuePair::builder().value("orphan").build())
            .build();
        let converted = container_definition(&def);
        assert_eq!(converted.environment, vec![("A".to_string(), "1".to_string())]);
        assert!(converted.log_config.is_none());
    }
}
