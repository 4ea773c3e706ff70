//! Application state management module.
//!
//! `App` is owned by the UI event loop. Key presses and background
//! notifications mutate it; background work is spawned onto the runtime and
//! reports back through [`AppEvent`]s. Anything that needs the terminal
//! itself (remote sessions, secret reveals that block on the network) is
//! handed back to the loop as an [`AppCommand`].

use std::collections::BTreeMap;
use std::sync::Arc;

use crossterm::event::{KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::aws::AwsProvider;
use crate::cache::{CacheKey, Payload, ResourceCache};
use crate::config::Config;
use crate::env::{DeployStage, EnvEditor, EnvOrigin, ProgressFn, RedeployReport, Redeployer};
use crate::error::{HatchError, SessionError, ValidationError};
use crate::event::{AppEvent, EventSender};
use crate::logs::{self, DownloadRequest, LogStreamer, LogView, StreamUpdate};
use crate::model::{Action, LogSource, Service};
use crate::navigation::{LevelKind, NavItem, NavigationStack, PopOutcome};
use crate::prefetch::Prefetcher;
use crate::provider::{CloudProvider, LogProvider, ParameterProvider, SecretProvider};
use crate::session::{ProcessSpawner, SessionLauncher, SessionMode, SessionState, SessionTarget, TokioSpawner};

/// Batches buffered between the log poller and the UI before the poller waits.
const LOG_CHANNEL_CAPACITY: usize = 16;
const LOG_PAGE_SCROLL: usize = 20;

/// The collaborators the application talks to.
#[derive(Clone)]
pub struct Providers {
    pub cloud: Arc<dyn CloudProvider>,
    pub logs: Arc<dyn LogProvider>,
    pub parameters: Arc<dyn ParameterProvider>,
    pub secrets: Arc<dyn SecretProvider>,
    pub spawner: Arc<dyn ProcessSpawner>,
}

impl Providers {
    /// AWS-backed providers sharing one set of per-region SDK clients.
    pub fn aws(profile: Option<String>) -> Self {
        let aws = Arc::new(AwsProvider::new(profile));
        Self {
            cloud: aws.clone(),
            logs: aws.clone(),
            parameters: aws.clone(),
            secrets: aws,
            spawner: Arc::new(TokioSpawner),
        }
    }
}

/// Which screen has the keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Browse,
    /// Typing a filter for the top navigation level
    Filter,
    Logs,
    Env,
    EnvInput(EnvInput),
    RedeployTargets,
    Deploying,
    ConfirmExit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvInput {
    Edit { key: String },
    AddKey,
    AddValue { key: String },
}

/// Services offered for a redeploy and which ones are ticked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedeployTargets {
    pub candidates: Vec<Service>,
    pub chosen: Vec<bool>,
    pub cursor: usize,
    pub force: bool,
}

impl RedeployTargets {
    fn selected(&self) -> Vec<Service> {
        self.candidates
            .iter()
            .zip(&self.chosen)
            .filter(|(_, chosen)| **chosen)
            .map(|(service, _)| service.clone())
            .collect()
    }
}

/// Work the event loop performs on behalf of the app.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    None,
    Quit,
    /// Suspend the terminal and hand it to a remote session
    RunSession(SessionTarget),
}

pub struct App {
    config: Config,
    providers: Providers,
    nav: NavigationStack,
    cache: ResourceCache,
    prefetcher: Prefetcher,
    session: SessionLauncher,
    redeployer: Redeployer,
    events: EventSender,
    shutdown: CancellationToken,

    mode: Mode,
    show_help: bool,
    status: String,
    input: String,

    log_view: Option<LogView>,
    log_rx: Option<mpsc::Receiver<StreamUpdate>>,
    log_cancel: Option<CancellationToken>,

    env: Option<EnvEditor>,
    env_cursor: usize,
    targets: Option<RedeployTargets>,
    deploy_targets: Vec<Service>,
    deploy: BTreeMap<String, DeployStage>,
    deploy_cancel: CancellationToken,

    fatal: Option<HatchError>,
    running: bool,
}

impl App {
    /// Creates the application at the region level.
    ///
    /// `shutdown` is the process-wide shutdown token; every background task
    /// started by the app runs under a child of it.
    pub fn new(config: Config, providers: Providers, events: EventSender, shutdown: CancellationToken) -> Self {
        let cache = ResourceCache::new(Arc::clone(&providers.cloud), config.cache.clone());
        let prefetcher = Prefetcher::new(cache.clone(), &config.prefetch);
        let session = SessionLauncher::new(
            Arc::clone(&providers.spawner),
            &config.session,
            config.aws.profile.clone(),
        );
        let redeployer = Redeployer::new(Arc::clone(&providers.cloud), &config.deploy);

        Self {
            nav: NavigationStack::new(config.aws.regions()),
            cache,
            prefetcher,
            session,
            redeployer,
            events,
            deploy_cancel: shutdown.child_token(),
            shutdown,
            mode: Mode::Browse,
            show_help: false,
            status: "Select a region".to_string(),
            input: String::new(),
            log_view: None,
            log_rx: None,
            log_cancel: None,
            env: None,
            env_cursor: 0,
            targets: None,
            deploy_targets: Vec::new(),
            deploy: BTreeMap::new(),
            fatal: None,
            running: true,
            config,
            providers,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn nav(&self) -> &NavigationStack {
        &self.nav
    }

    pub fn mode(&self) -> &Mode {
        &self.mode
    }

    pub fn show_help(&self) -> bool {
        self.show_help
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
    }

    /// Text being typed in filter or env input mode.
    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn log_view(&self) -> Option<&LogView> {
        self.log_view.as_ref()
    }

    pub fn env(&self) -> Option<&EnvEditor> {
        self.env.as_ref()
    }

    pub fn env_cursor(&self) -> usize {
        self.env_cursor
    }

    pub fn targets(&self) -> Option<&RedeployTargets> {
        self.targets.as_ref()
    }

    pub fn deploy_progress(&self) -> &BTreeMap<String, DeployStage> {
        &self.deploy
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn running(&self) -> bool {
        self.running
    }

    /// The error that stopped the app, if it stopped on one.
    pub fn take_fatal(&mut self) -> Option<HatchError> {
        self.fatal.take()
    }

    /// Receiver of the active log stream, polled by the event loop.
    pub fn log_updates(&mut self) -> Option<&mut mpsc::Receiver<StreamUpdate>> {
        self.log_rx.as_mut()
    }

    /// Stops background work. Called once when the event loop exits.
    pub fn shutdown(&mut self) {
        self.running = false;
        self.prefetcher.cancel();
        self.stop_streaming();
        self.deploy_cancel.cancel();
    }

    pub fn handle_key(&mut self, key: KeyEvent) -> AppCommand {
        if key.kind != KeyEventKind::Press {
            return AppCommand::None;
        }
        if key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL) {
            return self.quit();
        }

        match self.mode.clone() {
            Mode::Browse => self.browse_key(key),
            Mode::Filter => {
                self.filter_key(key);
                AppCommand::None
            }
            Mode::Logs => {
                self.logs_key(key);
                AppCommand::None
            }
            Mode::Env => self.env_key(key),
            Mode::EnvInput(input) => {
                self.env_input_key(input, key);
                AppCommand::None
            }
            Mode::RedeployTargets => {
                self.targets_key(key);
                AppCommand::None
            }
            Mode::Deploying => {
                self.deploying_key(key);
                AppCommand::None
            }
            Mode::ConfirmExit => match key.code {
                KeyCode::Char('y' | 'Y' | 'q') | KeyCode::Enter => self.quit(),
                _ => {
                    self.mode = Mode::Browse;
                    AppCommand::None
                }
            },
        }
    }

    fn quit(&mut self) -> AppCommand {
        self.shutdown();
        AppCommand::Quit
    }

    fn browse_key(&mut self, key: KeyEvent) -> AppCommand {
        match key.code {
            KeyCode::Char('q') => return self.quit(),
            KeyCode::Char('?') => self.show_help = !self.show_help,
            KeyCode::Down | KeyCode::Char('j') => {
                self.nav.next();
                self.prefetch();
            }
            KeyCode::Up | KeyCode::Char('k') => {
                self.nav.previous();
                self.prefetch();
            }
            KeyCode::Enter | KeyCode::Right | KeyCode::Char('l') => return self.open_selected(),
            KeyCode::Esc | KeyCode::Left | KeyCode::Char('h') => self.go_back(),
            KeyCode::Char('r') => self.refresh(),
            KeyCode::Char('/') => {
                self.input = self.nav.top().filter().to_string();
                self.mode = Mode::Filter;
            }
            _ => {}
        }
        AppCommand::None
    }

    fn filter_key(&mut self, key: KeyEvent) {
        match key.code {
            KeyCode::Char(c) => self.input.push(c),
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Enter => {
                self.mode = Mode::Browse;
                return;
            }
            KeyCode::Esc => {
                self.input.clear();
                self.mode = Mode::Browse;
            }
            _ => return,
        }
        self.nav.set_filter(&self.input);
        self.prefetch();
    }

    fn go_back(&mut self) {
        if !self.nav.top().filter().is_empty() {
            self.input.clear();
            self.nav.set_filter("");
            return;
        }
        match self.nav.back() {
            PopOutcome::Popped => {
                self.status = self.nav.top().kind().title().to_string();
                self.prefetch();
            }
            PopOutcome::AtRoot => self.mode = Mode::ConfirmExit,
        }
    }

    fn refresh(&mut self) {
        match self.nav.reload() {
            Some(key) => {
                self.status = "Refreshing...".to_string();
                self.spawn_fetch(key, true);
            }
            None => self.status = "Nothing to refresh at this level".to_string(),
        }
    }

    fn prefetch(&mut self) {
        let keys = self
            .nav
            .likely_next(self.config.prefetch.concurrency)
            .into_iter()
            .filter_map(NavItem::child_key)
            .collect();
        self.prefetcher.prefetch(keys);
    }

    fn spawn_fetch(&self, key: CacheKey, refresh: bool) {
        let cache = self.cache.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = if refresh { cache.refresh(&key).await } else { cache.get(&key).await };
            let _ = events.send(AppEvent::Loaded { key, result, refresh });
        });
    }

    fn open_selected(&mut self) -> AppCommand {
        if self.nav.top().is_loading() {
            self.status = ValidationError::StillLoading.to_string();
            return AppCommand::None;
        }
        match self.nav.confirm().cloned() {
            Some(item) => self.descend(item),
            None => {
                self.status = ValidationError::NothingSelected.to_string();
                AppCommand::None
            }
        }
    }

    /// Enters the level below `item`, or runs it when it is an action.
    fn descend(&mut self, item: NavItem) -> AppCommand {
        let Some(kind) = self.nav.top().kind().child() else {
            return match item {
                NavItem::Action(action) => self.run_action(action),
                _ => AppCommand::None,
            };
        };

        if kind == LevelKind::Action {
            let Some(task) = self.nav.selection().task else {
                self.status = ValidationError::NothingSelected.to_string();
                return AppCommand::None;
            };
            let actions = Action::menu(&task, &self.config.logs.download_windows)
                .into_iter()
                .map(NavItem::Action)
                .collect();
            if let Err(err) = self.nav.push(kind, actions) {
                self.status = err.to_string();
            }
            return AppCommand::None;
        }

        let Some(key) = item.child_key() else {
            return AppCommand::None;
        };
        self.status = format!("{} / {}", item.display_name(), kind.title());
        if let Some(payload) = self.cache.peek(&key) {
            if let Err(err) = self.nav.push_cached(kind, key, NavItem::from_payload(&payload)) {
                self.status = err.to_string();
                return AppCommand::None;
            }
            return self.level_ready();
        }
        if let Err(err) = self.nav.push_loading(kind, key.clone()) {
            self.status = err.to_string();
            return AppCommand::None;
        }
        self.spawn_fetch(key, false);
        AppCommand::None
    }

    /// Called once the top level has its items.
    fn level_ready(&mut self) -> AppCommand {
        if let Some(item) = self.nav.auto_select() {
            debug!(item = %item.display_name(), level = %item.kind(), "auto-selected single item");
            return self.descend(item);
        }
        self.prefetch();
        AppCommand::None
    }

    fn run_action(&mut self, action: Action) -> AppCommand {
        let selection = self.nav.selection();
        let (Some(task), Some(container)) = (selection.task, selection.container) else {
            self.status = ValidationError::NothingSelected.to_string();
            return AppCommand::None;
        };
        info!(action = ?action, task = %task.id, container = %container.name, "running action");

        match action {
            Action::ContainerShell | Action::HostShell => {
                if self.session.state() != SessionState::Idle {
                    self.status = SessionError::AlreadyActive.to_string();
                    return AppCommand::None;
                }
                let mode = if action == Action::HostShell {
                    SessionMode::HostShell
                } else {
                    SessionMode::ContainerExec
                };
                let cloud = Arc::clone(&self.providers.cloud);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = SessionTarget::resolve(cloud.as_ref(), &task, Some(&container), mode).await;
                    let _ = events.send(AppEvent::SessionResolved(result));
                });
                self.status = "Resolving session target...".to_string();
            }
            Action::LiveLogs | Action::LiveLogsAllContainers | Action::DownloadLogs { .. } => {
                let only = (action != Action::LiveLogsAllContainers).then(|| container.name.clone());
                let cloud = Arc::clone(&self.providers.cloud);
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = cloud
                        .describe_task_definition(&task.region, &task.task_definition_arn)
                        .await
                        .map(|definition| {
                            definition
                                .log_sources(&task)
                                .into_iter()
                                .filter(|source| only.as_deref().map_or(true, |name| source.container == name))
                                .collect()
                        })
                        .map_err(HatchError::from);
                    let _ = events.send(AppEvent::LogSources {
                        action,
                        task_arn: task.arn.clone(),
                        result,
                    });
                });
                self.status = "Resolving log configuration...".to_string();
            }
            Action::EnvVars => {
                let providers = self.providers.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let result = EnvEditor::load(
                        providers.cloud.as_ref(),
                        providers.parameters,
                        providers.secrets,
                        &task.region,
                        &task.task_definition_arn,
                        &container.name,
                    )
                    .await;
                    let _ = events.send(AppEvent::EnvLoaded(result));
                });
                self.status = "Loading environment...".to_string();
            }
        }
        AppCommand::None
    }

    /// Applies a notification from a background task.
    pub fn handle_event(&mut self, event: AppEvent) -> AppCommand {
        match event {
            AppEvent::Loaded { key, result, refresh } => {
                let items = match &result {
                    Ok(payload) => Ok(NavItem::from_payload(payload)),
                    Err(err) if err.is_fatal() => {
                        warn!(error = %err, "fatal cache error");
                        self.fatal = Some(err.clone());
                        self.shutdown();
                        return AppCommand::Quit;
                    }
                    Err(err) => Err(err.to_string()),
                };
                if !self.nav.fill(&key, items) {
                    debug!(key = ?key.id(), "ignoring result for a level that is no longer on top");
                    return AppCommand::None;
                }
                match result {
                    Ok(_) if refresh => {
                        self.status = "Refreshed".to_string();
                        self.prefetch();
                    }
                    Ok(_) => return self.level_ready(),
                    Err(err) => self.status = err.to_string(),
                }
            }
            AppEvent::SessionResolved(Ok(target)) => return AppCommand::RunSession(target),
            AppEvent::SessionResolved(Err(err)) => {
                warn!(error = %err, "session target could not be resolved");
                if self.nav.top().kind() == LevelKind::Action {
                    self.nav.back();
                }
                self.status = format!("Cannot start session: {err}");
            }
            AppEvent::LogSources { action, task_arn, result } => match result {
                Ok(sources) if sources.is_empty() => self.status = ValidationError::NoLogSources.to_string(),
                Ok(sources) => match action {
                    Action::DownloadLogs { minutes } => self.start_download(sources, &task_arn, minutes),
                    _ => self.start_streaming(sources),
                },
                Err(err) => self.status = err.to_string(),
            },
            AppEvent::DownloadFinished(Ok(report)) => {
                self.status = match &report.truncated {
                    Some(reason) => format!(
                        "Saved {} events to {} (truncated: {reason})",
                        report.total,
                        report.path.display()
                    ),
                    None => format!("Saved {} events to {}", report.total, report.path.display()),
                };
            }
            AppEvent::DownloadFinished(Err(err)) => self.status = format!("Download failed: {err}"),
            AppEvent::EnvLoaded(Ok(editor)) => {
                self.status = format!(
                    "{} variables for {} ({})",
                    editor.entries().len(),
                    editor.container(),
                    editor.task_definition().arn
                );
                self.env = Some(editor);
                self.env_cursor = 0;
                self.mode = Mode::Env;
            }
            AppEvent::EnvLoaded(Err(err)) => self.status = format!("Cannot load environment: {err}"),
            AppEvent::EnvRevealed {
                task_definition,
                container,
                key,
                result,
            } => {
                let Some(editor) = self
                    .env
                    .as_mut()
                    .filter(|e| e.task_definition().arn == task_definition && e.container() == container)
                else {
                    debug!(key = %key, "ignoring secret for an editor that was closed");
                    return AppCommand::None;
                };
                self.status = match editor.apply_reveal(&key, result) {
                    Ok(()) => format!("Revealed {key}"),
                    Err(err) => format!("Cannot reveal {key}: {err}"),
                };
            }
            AppEvent::Deploy(progress) if progress.service.is_empty() => {
                if let DeployStage::Registered { task_definition } = progress.stage {
                    self.status = format!("Deploying {task_definition}");
                }
            }
            AppEvent::Deploy(progress) => {
                self.deploy.insert(progress.service, progress.stage);
            }
            AppEvent::DeployFinished(result) => self.finish_deploy(result),
        }
        AppCommand::None
    }

    /// Applies a message from the log poller. `None` means the poller is gone.
    pub fn handle_log_update(&mut self, update: Option<StreamUpdate>) {
        let Some(view) = self.log_view.as_mut() else {
            self.log_rx = None;
            return;
        };
        match update {
            Some(StreamUpdate::Batch(events)) => view.push_batch(events),
            Some(StreamUpdate::Failed(reason)) => {
                self.status = format!("Log streaming stopped: {reason}");
                view.stop(reason);
            }
            None => self.log_rx = None,
        }
    }

    fn start_streaming(&mut self, sources: Vec<LogSource>) {
        let containers = sources.iter().map(|s| s.container.clone()).collect();
        let streamer = match LogStreamer::new(
            Arc::clone(&self.providers.logs),
            sources,
            self.config.logs.poll_interval(),
            self.config.logs.backoff(),
        ) {
            Ok(streamer) => streamer,
            Err(err) => {
                self.status = err.to_string();
                return;
            }
        };

        self.stop_streaming();
        let (tx, rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let cancel = self.shutdown.child_token();
        streamer.spawn(tx, cancel.clone());
        self.log_view = Some(LogView::new(self.config.logs.buffer_capacity, containers));
        self.log_rx = Some(rx);
        self.log_cancel = Some(cancel);
        self.mode = Mode::Logs;
        self.status = "Streaming logs (f: level, c: container, Esc: back)".to_string();
    }

    fn stop_streaming(&mut self) {
        if let Some(cancel) = self.log_cancel.take() {
            cancel.cancel();
        }
        self.log_rx = None;
    }

    fn start_download(&mut self, sources: Vec<LogSource>, task_arn: &str, minutes: u32) {
        let Some(source) = sources.into_iter().next() else {
            self.status = ValidationError::NoLogSources.to_string();
            return;
        };
        let request = DownloadRequest::last_minutes(
            source,
            task_arn,
            minutes,
            self.config.logs.export_path(),
            self.config.logs.max_download_pages,
        );
        let provider = Arc::clone(&self.providers.logs);
        let backoff = self.config.logs.backoff();
        let events = self.events.clone();
        tokio::spawn(async move {
            let result = logs::download(provider.as_ref(), backoff, &request).await;
            let _ = events.send(AppEvent::DownloadFinished(result));
        });
        self.status = format!("Downloading the last {minutes} minutes of logs...");
    }

    fn logs_key(&mut self, key: KeyEvent) {
        let Some(view) = self.log_view.as_mut() else {
            self.mode = Mode::Browse;
            return;
        };
        let visible = view.visible().len();
        match key.code {
            KeyCode::Esc | KeyCode::Char('q') => {
                self.stop_streaming();
                self.log_view = None;
                self.mode = Mode::Browse;
            }
            KeyCode::Char('f') => {
                let next = view.level_filter().cycle();
                view.set_level_filter(next);
            }
            KeyCode::Char('c') => view.cycle_container_filter(),
            KeyCode::Up | KeyCode::Char('k') => view.scroll = (view.scroll + 1).min(visible.saturating_sub(1)),
            KeyCode::Down | KeyCode::Char('j') => view.scroll = view.scroll.saturating_sub(1),
            KeyCode::PageUp => view.scroll = (view.scroll + LOG_PAGE_SCROLL).min(visible.saturating_sub(1)),
            KeyCode::PageDown => view.scroll = view.scroll.saturating_sub(LOG_PAGE_SCROLL),
            KeyCode::End | KeyCode::Char('G') => view.scroll = 0,
            KeyCode::Char('?') => self.show_help = !self.show_help,
            _ => {}
        }
    }

    fn selected_env_key(&self) -> Option<(String, EnvOrigin, bool)> {
        let entry = self.env.as_ref()?.entries().get(self.env_cursor)?;
        Some((entry.key.clone(), entry.origin, entry.is_masked()))
    }

    fn env_key(&mut self, key: KeyEvent) -> AppCommand {
        let len = self.env.as_ref().map_or(0, |e| e.entries().len());
        match key.code {
            KeyCode::Esc | KeyCode::Char('q') => {
                if self.env.as_ref().is_some_and(EnvEditor::is_dirty) {
                    self.status = "Discarded unsaved environment changes".to_string();
                }
                self.env = None;
                self.mode = Mode::Browse;
            }
            KeyCode::Down | KeyCode::Char('j') if len > 0 => self.env_cursor = (self.env_cursor + 1) % len,
            KeyCode::Up | KeyCode::Char('k') if len > 0 => {
                self.env_cursor = if self.env_cursor == 0 { len - 1 } else { self.env_cursor - 1 };
            }
            KeyCode::Enter | KeyCode::Char('e') => match self.selected_env_key() {
                Some((key, EnvOrigin::Plain, _)) => {
                    self.input = self
                        .env
                        .as_ref()
                        .and_then(|e| e.entries().get(self.env_cursor))
                        .and_then(|entry| entry.value())
                        .unwrap_or_default()
                        .to_string();
                    self.mode = Mode::EnvInput(EnvInput::Edit { key });
                }
                Some((key, _, _)) => self.status = ValidationError::NotEditable(key).to_string(),
                None => {}
            },
            KeyCode::Char('a') => {
                self.input.clear();
                self.mode = Mode::EnvInput(EnvInput::AddKey);
            }
            KeyCode::Char('d') => {
                if let (Some((key, _, _)), Some(editor)) = (self.selected_env_key(), self.env.as_mut()) {
                    match editor.remove(&key) {
                        Ok(()) => {
                            self.status = format!("Removed {key}");
                            self.env_cursor = self.env_cursor.min(editor.entries().len().saturating_sub(1));
                        }
                        Err(err) => self.status = err.to_string(),
                    }
                }
            }
            KeyCode::Char('v') => match self.selected_env_key() {
                Some((key, _, true)) => self.reveal_env(&key),
                Some((key, _, false)) => {
                    if let Some(editor) = self.env.as_mut() {
                        if editor.hide(&key).is_ok() {
                            self.status = format!("Hid {key}");
                        }
                    }
                }
                None => {}
            },
            KeyCode::Char('r') => self.open_redeploy_targets(),
            KeyCode::Char('?') => self.show_help = !self.show_help,
            _ => {}
        }
        AppCommand::None
    }

    fn env_input_key(&mut self, input: EnvInput, key: KeyEvent) {
        match key.code {
            KeyCode::Char(c) => self.input.push(c),
            KeyCode::Backspace => {
                self.input.pop();
            }
            KeyCode::Esc => {
                self.input.clear();
                self.mode = Mode::Env;
            }
            KeyCode::Enter => {
                let value = std::mem::take(&mut self.input);
                self.mode = Mode::Env;
                let Some(editor) = self.env.as_mut() else {
                    return;
                };
                let result = match input {
                    EnvInput::Edit { key } => editor.set(&key, &value).map(|()| format!("Updated {key}")),
                    EnvInput::AddKey if value.trim().is_empty() => return,
                    EnvInput::AddKey => {
                        self.mode = Mode::EnvInput(EnvInput::AddValue {
                            key: value.trim().to_string(),
                        });
                        return;
                    }
                    EnvInput::AddValue { key } => editor.add(&key, &value).map(|()| format!("Added {key}")),
                };
                self.status = match result {
                    Ok(message) => message,
                    Err(err) => err.to_string(),
                };
            }
            _ => {}
        }
    }

    /// Fetches a masked variable in the background; the value arrives as
    /// [`AppEvent::EnvRevealed`].
    fn reveal_env(&mut self, key: &str) {
        let Some(editor) = self.env.as_ref() else {
            return;
        };
        let fetch = match editor.prepare_reveal(key) {
            Ok(Some(fetch)) => fetch,
            Ok(None) => return,
            Err(err) => {
                self.status = err.to_string();
                return;
            }
        };
        let task_definition = editor.task_definition().arn.clone();
        let container = editor.container().to_string();
        let events = self.events.clone();
        tokio::spawn(async move {
            let key = fetch.key().to_string();
            let result = fetch.run().await;
            let _ = events.send(AppEvent::EnvRevealed {
                task_definition,
                container,
                key,
                result,
            });
        });
        self.status = format!("Revealing {key}...");
    }

    fn open_redeploy_targets(&mut self) {
        let Some(editor) = self.env.as_ref() else {
            return;
        };
        let selection = self.nav.selection();
        let Some(current) = selection.service else {
            self.status = ValidationError::NothingSelected.to_string();
            return;
        };

        let siblings = selection
            .cluster
            .and_then(|cluster| self.cache.peek(&CacheKey::Services(cluster)))
            .and_then(|payload| match payload.as_ref() {
                Payload::Services(services) => Some(services.clone()),
                _ => None,
            })
            .unwrap_or_else(|| vec![current.clone()]);
        let mut candidates = editor.redeploy_candidates(&siblings);
        if !candidates.iter().any(|s| s.arn == current.arn) {
            candidates.insert(0, current.clone());
        }
        let chosen = candidates.iter().map(|s| s.arn == current.arn).collect();

        self.targets = Some(RedeployTargets {
            candidates,
            chosen,
            cursor: 0,
            force: !editor.is_dirty(),
        });
        self.mode = Mode::RedeployTargets;
    }

    fn targets_key(&mut self, key: KeyEvent) {
        let Some(targets) = self.targets.as_mut() else {
            self.mode = Mode::Env;
            return;
        };
        let len = targets.candidates.len();
        match key.code {
            KeyCode::Esc => {
                self.targets = None;
                self.mode = Mode::Env;
            }
            KeyCode::Down | KeyCode::Char('j') if len > 0 => targets.cursor = (targets.cursor + 1) % len,
            KeyCode::Up | KeyCode::Char('k') if len > 0 => {
                targets.cursor = if targets.cursor == 0 { len - 1 } else { targets.cursor - 1 };
            }
            KeyCode::Char(' ') => {
                if let Some(chosen) = targets.chosen.get_mut(targets.cursor) {
                    *chosen = !*chosen;
                }
            }
            KeyCode::Char('f') => targets.force = !targets.force,
            KeyCode::Enter => self.start_redeploy(),
            _ => {}
        }
    }

    fn start_redeploy(&mut self) {
        let (Some(editor), Some(targets)) = (self.env.as_ref(), self.targets.as_ref()) else {
            return;
        };
        let plan = match editor.plan_redeploy(targets.selected(), targets.force) {
            Ok(plan) => plan,
            Err(err) => {
                self.status = err.to_string();
                return;
            }
        };
        info!(
            targets = plan.targets.len(),
            changes = plan.changes.len(),
            force = plan.force,
            "starting redeploy"
        );

        self.deploy_targets = plan.targets.clone();
        self.deploy = plan
            .targets
            .iter()
            .map(|s| (s.name.clone(), DeployStage::Updating))
            .collect();
        self.deploy_cancel = self.shutdown.child_token();

        let redeployer = self.redeployer.clone();
        let events = self.events.clone();
        let progress_events = events.clone();
        let progress: ProgressFn = Arc::new(move |progress| {
            let _ = progress_events.send(AppEvent::Deploy(progress));
        });
        let cancel = self.deploy_cancel.clone();
        tokio::spawn(async move {
            let result = redeployer.execute(&plan, progress, cancel).await;
            let _ = events.send(AppEvent::DeployFinished(result));
        });

        self.targets = None;
        self.mode = Mode::Deploying;
        self.status = "Redeploying...".to_string();
    }

    fn deploying_key(&mut self, key: KeyEvent) {
        if matches!(key.code, KeyCode::Esc | KeyCode::Char('q')) {
            if self.deploy.values().any(|stage| !stage.is_finished()) {
                self.deploy_cancel.cancel();
                self.status = "Stopped watching the deployment; it continues in ECS".to_string();
            }
            self.mode = if self.env.is_some() { Mode::Env } else { Mode::Browse };
        }
    }

    fn finish_deploy(&mut self, result: Result<RedeployReport, HatchError>) {
        let report = match result {
            Ok(report) => report,
            Err(err) => {
                self.status = format!("Redeploy failed: {err}");
                return;
            }
        };
        if let Some(editor) = self.env.as_mut() {
            editor.commit(&report);
        }
        for service in std::mem::take(&mut self.deploy_targets) {
            self.cache.invalidate(&CacheKey::Tasks(service));
        }
        if let Some(cluster) = self.nav.selection().cluster {
            self.cache.invalidate(&CacheKey::Services(cluster));
        }

        let failed: Vec<&str> = report
            .outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.service.as_str())
            .collect();
        self.status = if failed.is_empty() {
            format!("{} service(s) steady on {}", report.outcomes.len(), report.task_definition)
        } else {
            format!(
                "{} of {} service(s) failed: {}",
                failed.len(),
                report.outcomes.len(),
                failed.join(", ")
            )
        };
    }

    /// Runs a remote session to completion. The caller has already handed
    /// the terminal over and restores it afterwards.
    pub async fn run_session(&mut self, target: &SessionTarget) {
        let outcome = match self.session.start(target).await {
            Ok(SessionState::Active) => self.session.wait(&self.shutdown).await,
            Ok(state) => state,
            Err(err) => {
                self.status = format!("Cannot start session: {err}");
                return;
            }
        };
        self.status = match &outcome {
            SessionState::Closed => format!("Session to {} closed", target.task.id),
            SessionState::Failed(failure) => format!("Session failed: {failure}"),
            other => format!("Session ended in {other:?}"),
        };
        self.session.reset();
    }
}
