//! Error taxonomy for ecs-hatch.
//!
//! Every collaborator failure is classified into one of a handful of typed
//! errors so the UI can decide between retrying, showing a level-local
//! banner, aborting a session attempt, or terminating.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

/// A cloud-provider API call failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    /// Throttling, timeouts and dispatch failures. Retried with backoff.
    #[error("{operation} was throttled or timed out: {message}")]
    Transient { operation: String, message: String },

    #[error("permission denied for {operation}: {message}")]
    PermissionDenied { operation: String, message: String },

    #[error("{operation}: not found: {message}")]
    NotFound { operation: String, message: String },

    #[error("{operation} failed: {message}")]
    Other { operation: String, message: String },
}

impl ProviderError {
    /// Classifies a provider error from its service error code.
    ///
    /// Codes are matched by substring so the same table works for ECS,
    /// CloudWatch Logs, SSM and Secrets Manager.
    pub fn classify(operation: &str, code: Option<&str>, message: impl Into<String>) -> Self {
        let operation = operation.to_string();
        let message = message.into();
        let code = code.unwrap_or_default();

        if code.contains("Throttl")
            || code.contains("TooManyRequests")
            || code.contains("RequestLimitExceeded")
            || code.contains("ServiceUnavailable")
        {
            Self::Transient { operation, message }
        } else if code.contains("AccessDenied")
            || code.contains("Unauthorized")
            || code.contains("NotAuthorized")
            || code.contains("ExpiredToken")
        {
            Self::PermissionDenied { operation, message }
        } else if code.contains("NotFound") || code == "InvalidParameterException" && message.contains("not found") {
            Self::NotFound { operation, message }
        } else {
            Self::Other { operation, message }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    pub fn operation(&self) -> &str {
        match self {
            Self::Transient { operation, .. }
            | Self::PermissionDenied { operation, .. }
            | Self::NotFound { operation, .. }
            | Self::Other { operation, .. } => operation,
        }
    }
}

/// The target is not reachable through the remote-session infrastructure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectivityError {
    #[error("task {task_id} has no container instance (is it running on FARGATE?)")]
    NoHostInstance { task_id: String },

    #[error("instance {instance_id} is not registered with SSM")]
    NotRegistered { instance_id: String },
}

/// The local remote-session client cannot be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionLaunchError {
    #[error("`{binary}` was not found on PATH; install the AWS CLI and the Session Manager plugin")]
    PluginMissing { binary: String },

    #[error("failed to spawn the session client: {0}")]
    Spawn(String),
}

/// Why a session that was started ended in FAILED.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFailure {
    #[error("target instance is not connected to SSM")]
    InstanceUnreachable,

    #[error("permission denied by the session service")]
    PermissionDenied,

    #[error("session client exited with {}", code.map_or_else(|| "a signal".to_string(), |c| format!("status {c}")))]
    Unknown { code: Option<i32> },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Launch(#[from] SessionLaunchError),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error("a remote session is already active")]
    AlreadyActive,

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A request was rejected at the call site. State is never changed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("cannot enter {to} from {from}")]
    InvalidTransition { from: String, to: String },

    #[error("nothing is selected")]
    NothingSelected,

    #[error("the level is still loading")]
    StillLoading,

    #[error("no services selected for redeploy")]
    EmptyRedeploySelection,

    #[error("no changes to deploy (use force redeploy to restart with the current revision)")]
    NothingToRedeploy,

    #[error("variable {0} already exists")]
    DuplicateKey(String),

    #[error("variable {0} does not exist")]
    UnknownKey(String),

    #[error("variable {0} comes from a parameter or secret store and cannot be edited here")]
    NotEditable(String),

    #[error("container {0} is not part of the task definition")]
    UnknownContainer(String),

    #[error("host shell is not available for FARGATE tasks")]
    HostShellOnFargate,

    #[error("no CloudWatch log configuration found (the container must use the awslogs driver)")]
    NoLogSources,
}

/// Cache-boundary failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CacheError {
    /// A provider record was missing a required field.
    #[error("malformed {kind} record: missing {field}")]
    MalformedPayload { kind: &'static str, field: &'static str },

    /// Internal invariant violation. Fatal.
    #[error("cache invariant violated: {0}")]
    Corrupted(String),
}

/// Union of everything the core can report.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HatchError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error(transparent)]
    Connectivity(#[from] ConnectivityError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl HatchError {
    /// Only internal invariant violations terminate the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Cache(CacheError::Corrupted(_)))
    }
}

/// Bounded exponential backoff for transient provider errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Runs `call` until it succeeds, fails with a non-transient error, or
    /// the attempt budget is spent.
    pub async fn retry<T, F, Fut>(&self, mut call: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;
        loop {
            match call().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt + 1 < self.max_attempts => {
                    let delay = self.delay(attempt);
                    debug!(operation = err.operation(), attempt, ?delay, "transient provider error, backing off");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}
