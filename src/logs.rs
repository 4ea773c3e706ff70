//! Live log streaming, the bounded log view, and bulk downloads.
//!
//! The streamer polls every [`LogSource`] of a task once per iteration,
//! following each stream's forward token, and sends the merged batch over a
//! bounded channel. The UI keeps the received events in a [`LogView`], which
//! evicts the oldest events past its capacity and applies level and
//! container filters on read.

use chrono::{DateTime, Local, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Backoff, HatchError, ProviderError, ValidationError};
use crate::model::{short_id, LogSource};
use crate::provider::{LogProvider, LogQuery, RawLogEvent};

/// Events requested per live poll.
const LIVE_PAGE_LIMIT: i32 = 500;
/// Events requested per download page.
const DOWNLOAD_PAGE_LIMIT: i32 = 10_000;

/// Patterns tried in order; the first match decides the level.
static LEVEL_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\d{4}-\d{2}-\d{2}[T\s]+\d{2}:\d{2}:\d{2}(?:[,.]\d+)?\S*\s+(DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL|FATAL)\s+",
        r"\s(DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL|FATAL)\s",
        r"(?i)\[(DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL|FATAL)\]",
        r"(?i)\b(DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL|FATAL):",
        r"(?i)\b(DEBUG|INFO|WARN(?:ING)?|ERROR|CRITICAL|FATAL)\s+-",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
    Unknown,
}

impl LogLevel {
    pub const ALL: [LogLevel; 6] = [
        LogLevel::Debug,
        LogLevel::Info,
        LogLevel::Warning,
        LogLevel::Error,
        LogLevel::Critical,
        LogLevel::Unknown,
    ];

    /// Severity used by threshold filters. Unparsed lines rank with INFO.
    pub fn rank(self) -> u8 {
        match self {
            Self::Debug => 0,
            Self::Info | Self::Unknown => 1,
            Self::Warning => 2,
            Self::Error => 3,
            Self::Critical => 4,
        }
    }

    pub fn parse(message: &str) -> Self {
        LEVEL_PATTERNS
            .iter()
            .find_map(|re| re.captures(message))
            .and_then(|caps| caps.get(1))
            .map_or(Self::Unknown, |m| match m.as_str().to_uppercase().as_str() {
                "DEBUG" => Self::Debug,
                "INFO" => Self::Info,
                "WARN" | "WARNING" => Self::Warning,
                "ERROR" => Self::Error,
                "CRITICAL" | "FATAL" => Self::Critical,
                _ => Self::Unknown,
            })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warning => "WARNING",
            Self::Error => "ERROR",
            Self::Critical => "CRITICAL",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Minimum severity shown in the log view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LevelFilter {
    #[default]
    All,
    Debug,
    Info,
    Warning,
    Error,
}

impl LevelFilter {
    pub fn admits(self, level: LogLevel) -> bool {
        match self {
            Self::All | Self::Debug => true,
            Self::Info => level.rank() >= LogLevel::Info.rank(),
            Self::Warning => level.rank() >= LogLevel::Warning.rank(),
            Self::Error => level.rank() >= LogLevel::Error.rank(),
        }
    }

    pub fn cycle(self) -> Self {
        match self {
            Self::All => Self::Debug,
            Self::Debug => Self::Info,
            Self::Info => Self::Warning,
            Self::Warning => Self::Error,
            Self::Error => Self::All,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::All => "ALL",
            Self::Debug => "DEBUG+",
            Self::Info => "INFO+",
            Self::Warning => "WARNING+",
            Self::Error => "ERROR+",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ContainerFilter {
    #[default]
    All,
    Only(String),
}

impl ContainerFilter {
    pub fn admits(&self, container: &str) -> bool {
        match self {
            Self::All => true,
            Self::Only(name) => name == container,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEvent {
    /// Epoch milliseconds
    pub timestamp: i64,
    pub container: String,
    pub level: LogLevel,
    pub message: String,
    /// Forward token of the page this event arrived in
    pub token: Option<String>,
}

impl LogEvent {
    fn from_raw(raw: RawLogEvent, container: &str, token: Option<&str>) -> Self {
        let message = raw.message.unwrap_or_default().trim_end().to_string();
        Self {
            timestamp: raw.timestamp.unwrap_or_default(),
            container: container.to_string(),
            level: LogLevel::parse(&message),
            message,
            token: token.map(str::to_string),
        }
    }

    pub fn local_time(&self) -> Option<DateTime<Local>> {
        DateTime::<Utc>::from_timestamp_millis(self.timestamp).map(|t| t.with_timezone(&Local))
    }
}

/// Per-level event counts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LevelCounts(BTreeMap<LogLevel, usize>);

impl LevelCounts {
    pub fn add(&mut self, level: LogLevel) {
        *self.0.entry(level).or_default() += 1;
    }

    pub fn get(&self, level: LogLevel) -> usize {
        self.0.get(&level).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.0.values().sum()
    }
}

impl<'a> FromIterator<&'a LogEvent> for LevelCounts {
    fn from_iter<I: IntoIterator<Item = &'a LogEvent>>(iter: I) -> Self {
        let mut counts = Self::default();
        for event in iter {
            counts.add(event.level);
        }
        counts
    }
}

impl fmt::Display for LevelCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = LogLevel::ALL
            .iter()
            .map(|level| format!("{level}: {}", self.get(*level)))
            .collect();
        f.write_str(&parts.join(", "))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamStatus {
    Streaming,
    /// The poller stopped after an unrecoverable error
    Stopped(String),
}

/// Bounded buffer of received events plus the active filters.
#[derive(Debug, Clone)]
pub struct LogView {
    buffer: VecDeque<LogEvent>,
    capacity: usize,
    level_filter: LevelFilter,
    container_filter: ContainerFilter,
    containers: Vec<String>,
    status: StreamStatus,
    /// Lines scrolled up from the newest event; 0 follows the tail
    pub scroll: usize,
}

impl LogView {
    pub fn new(capacity: usize, containers: Vec<String>) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            level_filter: LevelFilter::default(),
            container_filter: ContainerFilter::default(),
            containers,
            status: StreamStatus::Streaming,
            scroll: 0,
        }
    }

    pub fn push_batch(&mut self, events: Vec<LogEvent>) {
        for event in events {
            if self.buffer.len() == self.capacity {
                self.buffer.pop_front();
            }
            self.buffer.push_back(event);
        }
    }

    pub fn stop(&mut self, reason: impl Into<String>) {
        self.status = StreamStatus::Stopped(reason.into());
    }

    pub fn status(&self) -> &StreamStatus {
        &self.status
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn containers(&self) -> &[String] {
        &self.containers
    }

    pub fn level_filter(&self) -> LevelFilter {
        self.level_filter
    }

    pub fn container_filter(&self) -> &ContainerFilter {
        &self.container_filter
    }

    pub fn set_level_filter(&mut self, filter: LevelFilter) {
        self.level_filter = filter;
        self.scroll = 0;
    }

    pub fn set_container_filter(&mut self, filter: ContainerFilter) {
        self.container_filter = filter;
        self.scroll = 0;
    }

    /// Cycles the container filter through All and each container.
    pub fn cycle_container_filter(&mut self) {
        let next = match &self.container_filter {
            ContainerFilter::All => self.containers.first().cloned().map(ContainerFilter::Only),
            ContainerFilter::Only(current) => self
                .containers
                .iter()
                .position(|c| c == current)
                .and_then(|i| self.containers.get(i + 1))
                .cloned()
                .map(ContainerFilter::Only),
        };
        self.set_container_filter(next.unwrap_or_default());
    }

    /// Buffered events that pass both filters, oldest first.
    pub fn visible(&self) -> Vec<&LogEvent> {
        self.buffer
            .iter()
            .filter(|e| self.level_filter.admits(e.level) && self.container_filter.admits(&e.container))
            .collect()
    }

    pub fn counts(&self) -> LevelCounts {
        self.buffer.iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamUpdate {
    Batch(Vec<LogEvent>),
    /// Terminal; the poller has stopped
    Failed(String),
}

#[derive(Debug, Clone, Default)]
struct StreamCursor {
    token: Option<String>,
    delivered: bool,
    /// Delivered a page without a forward token; it cannot be resumed
    exhausted: bool,
}

/// Polls the log streams of one task.
pub struct LogStreamer {
    provider: Arc<dyn LogProvider>,
    sources: Vec<LogSource>,
    cursors: Vec<StreamCursor>,
    poll_interval: Duration,
    backoff: Backoff,
}

impl LogStreamer {
    pub fn new(
        provider: Arc<dyn LogProvider>,
        sources: Vec<LogSource>,
        poll_interval: Duration,
        backoff: Backoff,
    ) -> Result<Self, ValidationError> {
        if sources.is_empty() {
            return Err(ValidationError::NoLogSources);
        }
        Ok(Self {
            provider,
            cursors: vec![StreamCursor::default(); sources.len()],
            sources,
            poll_interval,
            backoff,
        })
    }

    /// Current forward token of each source.
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.cursors.iter().map(|c| c.token.clone()).collect()
    }

    /// Fetches the next page of every source and merges them by timestamp.
    ///
    /// A source whose stream does not exist yet is skipped until it appears.
    /// Cursors only move once every source succeeded, so a failed poll can be
    /// repeated without losing events.
    pub async fn poll_once(&mut self) -> Result<Vec<LogEvent>, ProviderError> {
        let mut batch = Vec::new();
        let mut staged = self.cursors.clone();
        for (source, cursor) in self.sources.iter().zip(staged.iter_mut()) {
            if cursor.exhausted {
                continue;
            }
            let query = LogQuery {
                next_token: cursor.token.clone(),
                start_from_head: cursor.token.is_some(),
                limit: LIVE_PAGE_LIMIT,
                ..LogQuery::default()
            };
            let page = match self.backoff.retry(|| self.provider.get_log_events(source, &query)).await {
                Ok(page) => page,
                Err(ProviderError::NotFound { .. }) if !cursor.delivered => {
                    debug!(stream = %source.stream, "log stream not available yet");
                    continue;
                }
                Err(err) => return Err(err),
            };

            if page.events.is_empty() {
                continue;
            }
            let token = page.next_forward_token.clone();
            batch.extend(
                page.events
                    .into_iter()
                    .map(|raw| LogEvent::from_raw(raw, &source.container, token.as_deref())),
            );
            if token.is_some() {
                cursor.token = token;
            } else {
                warn!(stream = %source.stream, "page without a forward token, no longer polling this stream");
                cursor.exhausted = true;
            }
            cursor.delivered = true;
        }
        self.cursors = staged;
        // Stable: events of one container keep their stream order.
        batch.sort_by_key(|e| e.timestamp);
        Ok(batch)
    }

    /// Runs the poll loop until `cancel` fires, the receiver goes away, or
    /// an unrecoverable error is reported.
    pub fn spawn(mut self, tx: mpsc::Sender<StreamUpdate>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(sources = self.sources.len(), "log streaming started");
            while !cancel.is_cancelled() {
                match self.poll_once().await {
                    Ok(batch) if batch.is_empty() => {
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(self.poll_interval) => {}
                        }
                    }
                    Ok(batch) => {
                        if tx.send(StreamUpdate::Batch(batch)).await.is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(error = %err, "log streaming stopped");
                        let _ = tx.send(StreamUpdate::Failed(err.to_string())).await;
                        break;
                    }
                }
            }
            debug!("log streaming finished");
        })
    }
}

/// A bounded time-range download of one log stream.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub source: LogSource,
    pub task_arn: String,
    /// Epoch milliseconds
    pub start_ms: i64,
    pub end_ms: i64,
    pub dir: PathBuf,
    pub max_pages: usize,
}

impl DownloadRequest {
    /// Request covering the last `minutes` minutes.
    pub fn last_minutes(source: LogSource, task_arn: &str, minutes: u32, dir: PathBuf, max_pages: usize) -> Self {
        let end_ms = Utc::now().timestamp_millis();
        Self {
            source,
            task_arn: task_arn.to_string(),
            start_ms: end_ms - i64::from(minutes) * 60_000,
            end_ms,
            dir,
            max_pages,
        }
    }

    fn file_name(&self, now: DateTime<Local>) -> String {
        let task_id = short_id(&self.task_arn);
        let short: String = task_id.chars().take(8).collect();
        format!("ecs_logs_{}_{}_{}.log", self.source.container, short, now.format("%Y%m%d_%H%M%S"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub total: usize,
    pub counts: LevelCounts,
    pub pages: usize,
    /// Why the download stopped early, if it did
    pub truncated: Option<String>,
}

fn format_ms(ms: i64) -> String {
    Local
        .timestamp_millis_opt(ms)
        .single()
        .map_or_else(|| ms.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

/// Fetches every page in the requested window and writes it to a file.
///
/// A failure after the first page still writes what was fetched and reports
/// it as truncated.
pub async fn download(
    provider: &dyn LogProvider,
    backoff: Backoff,
    request: &DownloadRequest,
) -> Result<DownloadReport, HatchError> {
    let mut events: Vec<LogEvent> = Vec::new();
    let mut token: Option<String> = None;
    let mut pages = 0;
    let mut truncated = None;

    loop {
        if pages >= request.max_pages {
            truncated = Some(format!("stopped after {pages} pages"));
            break;
        }
        let query = LogQuery {
            next_token: token.clone(),
            start_time: Some(request.start_ms),
            end_time: Some(request.end_ms),
            start_from_head: true,
            limit: DOWNLOAD_PAGE_LIMIT,
        };
        let page = match backoff.retry(|| provider.get_log_events(&request.source, &query)).await {
            Ok(page) => page,
            Err(err) if pages == 0 => return Err(err.into()),
            Err(err) => {
                warn!(error = %err, pages, "log download interrupted");
                truncated = Some(err.to_string());
                break;
            }
        };
        pages += 1;
        let next = page.next_forward_token.clone();
        events.extend(
            page.events
                .into_iter()
                .map(|raw| LogEvent::from_raw(raw, &request.source.container, next.as_deref())),
        );
        if next.is_none() || next == token {
            break;
        }
        token = next;
    }

    let counts: LevelCounts = events.iter().collect();
    let path = request.dir.join(request.file_name(Local::now()));

    let mut contents = String::new();
    contents.push_str(&format!("# container: {}\n", request.source.container));
    contents.push_str(&format!("# task: {}\n", request.task_arn));
    contents.push_str(&format!(
        "# window: {} to {}\n",
        format_ms(request.start_ms),
        format_ms(request.end_ms)
    ));
    contents.push_str(&format!("# events: {}\n", events.len()));
    contents.push_str(&format!("# levels: {counts}\n"));
    if let Some(reason) = &truncated {
        contents.push_str(&format!("# WARNING: download truncated ({reason})\n"));
    }
    contents.push('\n');
    for event in &events {
        contents.push_str(&format_ms(event.timestamp));
        contents.push(' ');
        contents.push_str(&event.message);
        contents.push('\n');
    }

    let write = async {
        tokio::fs::create_dir_all(&request.dir).await?;
        tokio::fs::write(&path, contents).await
    };
    write.await.map_err(|err| ProviderError::Other {
        operation: "write log file".to_string(),
        message: format!("{}: {err}", path.display()),
    })?;

    info!(path = %path.display(), events = events.len(), pages, "logs downloaded");
    Ok(DownloadReport {
        path,
        total: events.len(),
        counts,
        pages,
        truncated,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn event(container: &str, level: LogLevel, timestamp: i64) -> LogEvent {
        LogEvent {
            timestamp,
            container: container.to_string(),
            level,
            message: format!("{level} at {timestamp}"),
            token: None,
        }
    }

    #[test]
    fn test_parse_levels() {
        assert_eq!(LogLevel::parse("2024-01-15 10:30:45,123 ERROR Something failed"), LogLevel::Error);
        assert_eq!(LogLevel::parse("app INFO started"), LogLevel::Info);
        assert_eq!(LogLevel::parse("[warn] disk almost full"), LogLevel::Warning);
        assert_eq!(LogLevel::parse("debug: cache miss"), LogLevel::Debug);
        assert_eq!(LogLevel::parse("CRITICAL - out of memory"), LogLevel::Critical);
        assert_eq!(LogLevel::parse("fatal: cannot continue"), LogLevel::Critical);
        assert_eq!(LogLevel::parse("GET /health 200"), LogLevel::Unknown);
    }

    #[test]
    fn test_level_filter_thresholds() {
        assert!(LevelFilter::All.admits(LogLevel::Debug));
        assert!(!LevelFilter::Info.admits(LogLevel::Debug));
        assert!(LevelFilter::Info.admits(LogLevel::Unknown));
        assert!(!LevelFilter::Warning.admits(LogLevel::Unknown));
        assert!(LevelFilter::Error.admits(LogLevel::Critical));
        assert!(!LevelFilter::Error.admits(LogLevel::Warning));
        assert_eq!(LevelFilter::Error.cycle(), LevelFilter::All);
    }

    #[test]
    fn test_view_evicts_oldest() {
        let mut view = LogView::new(3, vec!["app".into()]);
        view.push_batch((0..5).map(|i| event("app", LogLevel::Info, i)).collect());
        assert_eq!(view.len(), 3);
        assert_eq!(view.visible()[0].timestamp, 2);
    }

    #[test]
    fn test_view_filters_are_local() {
        let mut view = LogView::new(100, vec!["app".into(), "proxy".into()]);
        view.push_batch(vec![
            event("app", LogLevel::Debug, 1),
            event("proxy", LogLevel::Error, 2),
            event("app", LogLevel::Warning, 3),
        ]);
        view.set_level_filter(LevelFilter::Warning);
        assert_eq!(view.visible().len(), 2);
        view.cycle_container_filter();
        assert_eq!(view.container_filter(), &ContainerFilter::Only("app".into()));
        assert_eq!(view.visible().len(), 1);
        view.cycle_container_filter();
        view.cycle_container_filter();
        assert_eq!(view.container_filter(), &ContainerFilter::All);
        view.set_level_filter(LevelFilter::All);
        assert_eq!(view.visible().len(), 3);
        assert_eq!(view.len(), 3);
        assert_eq!(view.counts().get(LogLevel::Error), 1);
    }

    #[test]
    fn test_counts_display() {
        let counts: LevelCounts = [event("a", LogLevel::Info, 1), event("a", LogLevel::Info, 2)].iter().collect();
        assert_eq!(counts.total(), 2);
        assert_eq!(
            counts.to_string(),
            "DEBUG: 0, INFO: 2, WARNING: 0, ERROR: 0, CRITICAL: 0, UNKNOWN: 0"
        );
    }

    #[test]
    fn test_download_file_name() {
        let request = DownloadRequest {
            source: LogSource {
                container: "web".into(),
                group: "/ecs/web".into(),
                stream: "ecs/web/0123456789abcdef".into(),
                region: "eu-west-1".into(),
            },
            task_arn: "arn:aws:ecs:eu-west-1:1:task/prod/0123456789abcdef".into(),
            start_ms: 0,
            end_ms: 1,
            dir: PathBuf::from("/tmp"),
            max_pages: 10,
        };
        let now = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(request.file_name(now), "ecs_logs_web_01234567_20240309_140507.log");
    }
}
