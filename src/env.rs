//! Environment editing for one container definition and service redeploys.
//!
//! Plain variables come straight from the task definition. Variables backed
//! by Parameter Store or Secrets Manager are listed alongside them, masked
//! until explicitly revealed, and are read-only here.

use futures::future::join_all;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::DeployConfig;
use crate::error::{Backoff, HatchError, ProviderError, ValidationError};
use crate::model::{RolloutState, SecretRef, Service, TaskDefinition};
use crate::provider::{CloudProvider, ParameterProvider, RegisterTaskDefinition, SecretProvider};

const MASK: &str = "********";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvOrigin {
    Plain,
    Parameter,
    Secret,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvEntry {
    pub key: String,
    pub origin: EnvOrigin,
    /// Resolved value; `None` until fetched for masked entries
    value: Option<String>,
    /// Parameter name or secret ARN for non-plain entries
    pub source: Option<String>,
    /// SecureString parameter or secret
    pub secure: bool,
    pub revealed: bool,
    pub dirty: bool,
    pub error: Option<String>,
}

impl EnvEntry {
    fn plain(key: &str, value: &str) -> Self {
        Self {
            key: key.to_string(),
            origin: EnvOrigin::Plain,
            value: Some(value.to_string()),
            source: None,
            secure: false,
            revealed: true,
            dirty: false,
            error: None,
        }
    }

    pub fn is_masked(&self) -> bool {
        self.secure && !self.revealed
    }

    /// Value as it should be shown to the user.
    pub fn display_value(&self) -> String {
        if let Some(err) = &self.error {
            return format!("<error: {err}>");
        }
        if self.is_masked() {
            return MASK.to_string();
        }
        self.value.clone().unwrap_or_default()
    }

    /// Actual value, only once revealed (or for non-secure entries).
    pub fn value(&self) -> Option<&str> {
        if self.is_masked() {
            None
        } else {
            self.value.as_deref()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvChange {
    Added { key: String, value: String },
    Modified { key: String, old: String, new: String },
    Removed { key: String },
}

impl EnvChange {
    pub fn key(&self) -> &str {
        match self {
            Self::Added { key, .. } | Self::Modified { key, .. } | Self::Removed { key } => key,
        }
    }
}

/// Everything needed to carry out one redeploy, captured from the editor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeployPlan {
    pub region: String,
    pub task_definition: String,
    pub container: String,
    /// New plain environment; `None` reuses the current revision
    pub environment: Option<Vec<(String, String)>>,
    pub targets: Vec<Service>,
    pub force: bool,
    pub changes: Vec<EnvChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployStage {
    Registered { task_definition: String },
    Updating,
    Rolling { running: i32, desired: i32 },
    Steady,
    Failed(String),
}

impl DeployStage {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Steady | Self::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployProgress {
    /// Empty for plan-level stages such as registration
    pub service: String,
    pub stage: DeployStage,
}

pub type ProgressFn = Arc<dyn Fn(DeployProgress) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceOutcome {
    pub service: String,
    pub result: Result<(), HatchError>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeployReport {
    pub task_definition: String,
    /// Whether a new revision was registered
    pub registered: bool,
    pub outcomes: Vec<ServiceOutcome>,
}

impl RedeployReport {
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Registers revisions, updates services and waits for them to settle.
#[derive(Clone)]
pub struct Redeployer {
    cloud: Arc<dyn CloudProvider>,
    backoff: Backoff,
    poll_interval: Duration,
    timeout: Duration,
}

impl Redeployer {
    pub fn new(cloud: Arc<dyn CloudProvider>, config: &DeployConfig) -> Self {
        Self {
            cloud,
            backoff: Backoff::default(),
            poll_interval: config.poll_interval(),
            timeout: config.timeout(),
        }
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Executes `plan`. Each target is updated and polled independently;
    /// one service failing does not stop the others.
    pub async fn execute(
        &self,
        plan: &RedeployPlan,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<RedeployReport, HatchError> {
        let (task_definition, registered) = match &plan.environment {
            Some(environment) => {
                let request = RegisterTaskDefinition {
                    region: plan.region.clone(),
                    base_arn: plan.task_definition.clone(),
                    container: plan.container.clone(),
                    environment: environment.clone(),
                };
                let registered = self
                    .backoff
                    .retry(|| self.cloud.register_task_definition(&request))
                    .await?;
                info!(arn = %registered.arn, changes = plan.changes.len(), "registered task definition revision");
                (registered.arn, true)
            }
            None => (plan.task_definition.clone(), false),
        };
        progress(DeployProgress {
            service: String::new(),
            stage: DeployStage::Registered {
                task_definition: task_definition.clone(),
            },
        });

        let updates = plan.targets.iter().map(|service| {
            let progress = Arc::clone(&progress);
            let cancel = cancel.clone();
            let task_definition = task_definition.clone();
            async move {
                let result = self.deploy_one(service, &task_definition, plan.force, &progress, &cancel).await;
                let stage = match &result {
                    Ok(()) => DeployStage::Steady,
                    Err(err) => DeployStage::Failed(err.to_string()),
                };
                progress(DeployProgress {
                    service: service.name.clone(),
                    stage,
                });
                ServiceOutcome {
                    service: service.name.clone(),
                    result,
                }
            }
        });
        let outcomes = join_all(updates).await;

        Ok(RedeployReport {
            task_definition,
            registered,
            outcomes,
        })
    }

    async fn deploy_one(
        &self,
        service: &Service,
        task_definition: &str,
        force: bool,
        progress: &ProgressFn,
        cancel: &CancellationToken,
    ) -> Result<(), HatchError> {
        progress(DeployProgress {
            service: service.name.clone(),
            stage: DeployStage::Updating,
        });
        self.backoff
            .retry(|| self.cloud.update_service(service, task_definition, force))
            .await?;
        info!(service = %service.name, task_definition, force, "service update requested");

        let wait = async {
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        return Err(ProviderError::Other {
                            operation: "DescribeServices".to_string(),
                            message: "deployment polling cancelled".to_string(),
                        });
                    }
                    () = tokio::time::sleep(self.poll_interval) => {}
                }
                let statuses = self
                    .backoff
                    .retry(|| self.cloud.describe_services(std::slice::from_ref(service)))
                    .await?;
                let Some(status) = statuses.into_iter().find(|s| s.service_name == service.name) else {
                    return Err(ProviderError::NotFound {
                        operation: "DescribeServices".to_string(),
                        message: format!("service {} not found", service.name),
                    });
                };
                if let RolloutState::Failed(reason) = &status.rollout {
                    return Err(ProviderError::Other {
                        operation: "deployment".to_string(),
                        message: reason.clone(),
                    });
                }
                if status.is_steady() && status.task_definition == task_definition {
                    return Ok(());
                }
                debug!(service = %service.name, running = status.running_count, desired = status.desired_count, "deployment in progress");
                progress(DeployProgress {
                    service: service.name.clone(),
                    stage: DeployStage::Rolling {
                        running: status.running_count,
                        desired: status.desired_count,
                    },
                });
            }
        };

        match tokio::time::timeout(self.timeout, wait).await {
            Ok(result) => result.map_err(HatchError::from),
            Err(_) => {
                warn!(service = %service.name, "deployment did not settle in time");
                Err(ProviderError::Other {
                    operation: "deployment".to_string(),
                    message: format!("timed out after {}s waiting for steady state", self.timeout.as_secs()),
                }
                .into())
            }
        }
    }
}

enum Store {
    Parameter(Arc<dyn ParameterProvider>),
    Secret(Arc<dyn SecretProvider>),
}

/// A pending decrypting lookup of one masked variable.
pub struct SecretFetch {
    region: String,
    key: String,
    source: String,
    store: Store,
}

impl SecretFetch {
    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn run(self) -> Result<String, ProviderError> {
        match self.store {
            Store::Parameter(parameters) => parameters
                .get_parameter(&self.region, &self.source, true)
                .await
                .map(|p| p.value),
            Store::Secret(secrets) => {
                let secret_id = SecretRef {
                    name: self.key.clone(),
                    value_from: self.source.clone(),
                }
                .secret_id()
                .to_string();
                secrets.get_secret(&self.region, &secret_id).await
            }
        }
    }
}

/// Editing context for one container of one task definition revision.
pub struct EnvEditor {
    parameters: Arc<dyn ParameterProvider>,
    secrets: Arc<dyn SecretProvider>,
    region: String,
    definition: TaskDefinition,
    container: String,
    original: BTreeMap<String, String>,
    entries: Vec<EnvEntry>,
}

impl EnvEditor {
    /// Loads the container's variables. Parameters are read without
    /// decryption; secrets are not fetched until revealed.
    pub async fn load(
        cloud: &dyn CloudProvider,
        parameters: Arc<dyn ParameterProvider>,
        secrets: Arc<dyn SecretProvider>,
        region: &str,
        task_definition: &str,
        container: &str,
    ) -> Result<Self, HatchError> {
        let definition = cloud.describe_task_definition(region, task_definition).await?;
        let container_def = definition
            .container(container)
            .ok_or_else(|| ValidationError::UnknownContainer(container.to_string()))?
            .clone();

        let mut entries: Vec<EnvEntry> = container_def
            .environment
            .iter()
            .map(|(key, value)| EnvEntry::plain(key, value))
            .collect();

        let lookups = container_def.secrets.iter().map(|secret| {
            let parameters = Arc::clone(&parameters);
            async move {
                let mut entry = EnvEntry {
                    key: secret.name.clone(),
                    origin: EnvOrigin::Secret,
                    value: None,
                    source: Some(secret.value_from.clone()),
                    secure: true,
                    revealed: false,
                    dirty: false,
                    error: None,
                };
                if secret.is_secrets_manager() {
                    return entry;
                }
                entry.origin = EnvOrigin::Parameter;
                match parameters.get_parameter(region, &secret.value_from, false).await {
                    Ok(parameter) => {
                        entry.secure = parameter.secure;
                        entry.revealed = !parameter.secure;
                        entry.value = (!parameter.secure).then_some(parameter.value);
                    }
                    Err(err) => {
                        debug!(parameter = %secret.value_from, error = %err, "parameter lookup failed");
                        entry.error = Some(err.to_string());
                    }
                }
                entry
            }
        });
        entries.extend(join_all(lookups).await);
        let entries = last_wins(entries);

        // A secret of the same name shadows the plain variable.
        let original = container_def
            .environment
            .iter()
            .filter(|(key, _)| entries.iter().any(|e| &e.key == key && e.origin == EnvOrigin::Plain))
            .cloned()
            .collect();
        Ok(Self {
            parameters,
            secrets,
            region: region.to_string(),
            definition,
            container: container.to_string(),
            original,
            entries,
        })
    }

    pub fn entries(&self) -> &[EnvEntry] {
        &self.entries
    }

    pub fn container(&self) -> &str {
        &self.container
    }

    pub fn task_definition(&self) -> &TaskDefinition {
        &self.definition
    }

    fn entry_mut(&mut self, key: &str) -> Result<&mut EnvEntry, ValidationError> {
        self.entries
            .iter_mut()
            .find(|e| e.key == key)
            .ok_or_else(|| ValidationError::UnknownKey(key.to_string()))
    }

    fn plain_mut(&mut self, key: &str) -> Result<&mut EnvEntry, ValidationError> {
        let entry = self.entry_mut(key)?;
        if entry.origin != EnvOrigin::Plain {
            return Err(ValidationError::NotEditable(key.to_string()));
        }
        Ok(entry)
    }

    /// Changes the value of a plain variable.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ValidationError> {
        let original = self.original.get(key).cloned();
        let entry = self.plain_mut(key)?;
        entry.value = Some(value.to_string());
        entry.dirty = original.as_deref() != Some(value);
        Ok(())
    }

    pub fn add(&mut self, key: &str, value: &str) -> Result<(), ValidationError> {
        if key.is_empty() {
            return Err(ValidationError::UnknownKey(String::new()));
        }
        if self.entries.iter().any(|e| e.key == key) {
            return Err(ValidationError::DuplicateKey(key.to_string()));
        }
        let mut entry = EnvEntry::plain(key, value);
        entry.dirty = self.original.get(key).map(String::as_str) != Some(value);
        self.entries.push(entry);
        Ok(())
    }

    pub fn remove(&mut self, key: &str) -> Result<(), ValidationError> {
        self.plain_mut(key)?;
        self.entries.retain(|e| e.key != key);
        Ok(())
    }

    /// Fetches and shows the real value of a masked entry.
    pub async fn reveal(&mut self, key: &str) -> Result<(), HatchError> {
        let Some(fetch) = self.prepare_reveal(key)? else {
            return Ok(());
        };
        let fetched = fetch.run().await;
        self.apply_reveal(key, fetched)
    }

    /// The store lookup behind [`EnvEditor::reveal`], detached from the
    /// editor so it can run in the background. `None` for plain entries.
    pub fn prepare_reveal(&self, key: &str) -> Result<Option<SecretFetch>, ValidationError> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.key == key)
            .ok_or_else(|| ValidationError::UnknownKey(key.to_string()))?;
        let Some(source) = entry.source.clone() else {
            return Ok(None);
        };
        let store = match entry.origin {
            EnvOrigin::Plain => return Ok(None),
            EnvOrigin::Parameter => Store::Parameter(Arc::clone(&self.parameters)),
            EnvOrigin::Secret => Store::Secret(Arc::clone(&self.secrets)),
        };
        Ok(Some(SecretFetch {
            region: self.region.clone(),
            key: entry.key.clone(),
            source,
            store,
        }))
    }

    /// Records the outcome of a [`SecretFetch`] on the entry it was made for.
    pub fn apply_reveal(&mut self, key: &str, fetched: Result<String, ProviderError>) -> Result<(), HatchError> {
        let entry = self.entry_mut(key)?;
        match fetched {
            Ok(value) => {
                entry.value = Some(value);
                entry.revealed = true;
                entry.error = None;
                Ok(())
            }
            Err(err) => {
                entry.error = Some(err.to_string());
                Err(err.into())
            }
        }
    }

    /// Masks a revealed entry again.
    pub fn hide(&mut self, key: &str) -> Result<(), ValidationError> {
        let entry = self.entry_mut(key)?;
        if entry.secure {
            entry.revealed = false;
        }
        Ok(())
    }

    fn current_plain(&self) -> Vec<(String, String)> {
        self.entries
            .iter()
            .filter(|e| e.origin == EnvOrigin::Plain)
            .map(|e| (e.key.clone(), e.value.clone().unwrap_or_default()))
            .collect()
    }

    /// Changes against the loaded revision, sorted by key.
    pub fn diff(&self) -> Vec<EnvChange> {
        let current: BTreeMap<String, String> = self.current_plain().into_iter().collect();
        let mut changes = Vec::new();
        for (key, value) in &current {
            match self.original.get(key) {
                None => changes.push(EnvChange::Added {
                    key: key.clone(),
                    value: value.clone(),
                }),
                Some(old) if old != value => changes.push(EnvChange::Modified {
                    key: key.clone(),
                    old: old.clone(),
                    new: value.clone(),
                }),
                Some(_) => {}
            }
        }
        for key in self.original.keys().filter(|k| !current.contains_key(*k)) {
            changes.push(EnvChange::Removed { key: key.clone() });
        }
        changes.sort_by(|a, b| a.key().cmp(b.key()));
        changes
    }

    pub fn is_dirty(&self) -> bool {
        !self.diff().is_empty()
    }

    /// Services that can be redeployed with this revision: those in the same
    /// cluster whose task definition shares its family.
    pub fn redeploy_candidates(&self, services: &[Service]) -> Vec<Service> {
        services
            .iter()
            .filter(|s| s.task_family() == self.definition.family)
            .cloned()
            .collect()
    }

    /// Validates a redeploy request and captures what to deploy.
    ///
    /// With no changes, `force` reuses the current revision and restarts the
    /// services; without `force` the request is rejected.
    pub fn plan_redeploy(&self, targets: Vec<Service>, force: bool) -> Result<RedeployPlan, ValidationError> {
        if targets.is_empty() {
            return Err(ValidationError::EmptyRedeploySelection);
        }
        let changes = self.diff();
        if changes.is_empty() && !force {
            return Err(ValidationError::NothingToRedeploy);
        }
        let environment = (!changes.is_empty()).then(|| self.current_plain());
        Ok(RedeployPlan {
            region: self.region.clone(),
            task_definition: self.definition.arn.clone(),
            container: self.container.clone(),
            environment,
            targets,
            force,
            changes,
        })
    }

    /// Makes a registered revision the new baseline for further edits.
    pub fn commit(&mut self, report: &RedeployReport) {
        if !report.registered {
            return;
        }
        self.definition.arn = report.task_definition.clone();
        self.original = self.current_plain().into_iter().collect();
        for entry in &mut self.entries {
            entry.dirty = false;
        }
    }

    /// Plans, executes and commits a redeploy.
    pub async fn redeploy(
        &mut self,
        redeployer: &Redeployer,
        targets: Vec<Service>,
        force: bool,
        progress: ProgressFn,
        cancel: CancellationToken,
    ) -> Result<RedeployReport, HatchError> {
        let plan = self.plan_redeploy(targets, force)?;
        let report = redeployer.execute(&plan, progress, cancel).await?;
        self.commit(&report);
        Ok(report)
    }
}

/// Keeps the last entry for every repeated key, in the order of those last occurrences.
fn last_wins(entries: Vec<EnvEntry>) -> Vec<EnvEntry> {
    let mut seen = std::collections::HashSet::new();
    let mut kept: Vec<EnvEntry> = entries.into_iter().rev().filter(|e| seen.insert(e.key.clone())).collect();
    kept.reverse();
    kept
}
