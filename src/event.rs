//! Notifications delivered from background tasks to the UI event loop.
//!
//! Background work never touches `App` directly. It sends an [`AppEvent`]
//! over an unbounded channel that the event loop drains alongside terminal
//! input.

use tokio::sync::mpsc;

use crate::cache::{CacheKey, FetchResult};
use crate::env::{DeployProgress, EnvEditor, RedeployReport};
use crate::error::{HatchError, ProviderError, SessionError};
use crate::logs::DownloadReport;
use crate::model::{Action, LogSource};
use crate::session::SessionTarget;

pub type EventSender = mpsc::UnboundedSender<AppEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<AppEvent>;

pub enum AppEvent {
    /// A cache fetch for a navigation level finished.
    Loaded {
        key: CacheKey,
        result: FetchResult,
        /// Explicit refresh rather than first load
        refresh: bool,
    },
    /// Session target resolution finished.
    SessionResolved(Result<SessionTarget, SessionError>),
    /// Log sources for a log action were resolved from the task definition.
    LogSources {
        action: Action,
        task_arn: String,
        result: Result<Vec<LogSource>, HatchError>,
    },
    DownloadFinished(Result<DownloadReport, HatchError>),
    EnvLoaded(Result<EnvEditor, HatchError>),
    /// A masked variable was fetched for the editor of `task_definition`/`container`.
    EnvRevealed {
        task_definition: String,
        container: String,
        key: String,
        result: Result<String, ProviderError>,
    },
    Deploy(DeployProgress),
    DeployFinished(Result<RedeployReport, HatchError>),
}

impl std::fmt::Debug for AppEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Loaded { .. } => "Loaded",
            Self::SessionResolved(_) => "SessionResolved",
            Self::LogSources { .. } => "LogSources",
            Self::DownloadFinished(_) => "DownloadFinished",
            Self::EnvLoaded(_) => "EnvLoaded",
            Self::EnvRevealed { .. } => "EnvRevealed",
            Self::Deploy(_) => "Deploy",
            Self::DeployFinished(_) => "DeployFinished",
        };
        f.write_str(name)
    }
}

pub fn channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}
