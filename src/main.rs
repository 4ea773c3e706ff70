//! ecs-hatch - a terminal front end for reaching into running ECS tasks.
//!
//! Sets up tracing and the terminal, then runs the event loop that owns the
//! application state. Remote sessions temporarily hand the terminal to the
//! AWS CLI and take it back when the session ends.

use std::fs::OpenOptions;
use std::io::{self, Stdout};
use std::sync::Mutex;

use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{Event, EventStream};
use crossterm::execute;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen};
use futures::StreamExt;
use ratatui::backend::CrosstermBackend;
use ratatui::Terminal;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ecs_hatch::app::{App, AppCommand, Providers};
use ecs_hatch::cli::CliArgs;
use ecs_hatch::config::Config;
use ecs_hatch::event::{self, EventReceiver};
use ecs_hatch::logs::StreamUpdate;
use ecs_hatch::session::SessionTarget;
use ecs_hatch::ui;

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;

const LOG_FILE: &str = "ecs-hatch.log";
/// Redraw interval, so spinners and elapsed times move without input.
const TICK: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let mut config = Config::load().context("failed to load configuration")?;
    args.apply(&mut config);
    info!(regions = ?config.aws.regions, profile = ?config.aws.profile, "starting ecs-hatch");

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let (events_tx, mut events_rx) = event::channel();
    let providers = Providers::aws(config.aws.profile.clone());
    let mut app = App::new(config, providers, events_tx, shutdown.clone());

    run(&mut app, &mut events_rx, &shutdown).await
}

/// Logs go to `~/.ecs-hatch/ecs-hatch.log`; the terminal belongs to the UI.
fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let log_file = Config::config_dir().ok().and_then(|dir| {
        std::fs::create_dir_all(&dir).ok()?;
        OpenOptions::new().create(true).append(true).open(dir.join(LOG_FILE)).ok()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_ansi(false)
        .compact();
    let _ = match log_file {
        Some(file) => builder.with_writer(Mutex::new(file)).try_init(),
        None => builder.with_writer(io::sink).try_init(),
    };

    Ok(())
}

/// SIGTERM and SIGHUP cancel `shutdown`, which also terminates a running
/// session client. SIGINT is left alone: in raw mode it arrives as a key,
/// and during a session it belongs to the remote shell.
#[cfg(unix)]
fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    tokio::spawn(async move {
        tokio::select! {
            _ = terminate.recv() => info!("received SIGTERM"),
            _ = hangup.recv() => info!("received SIGHUP"),
        }
        shutdown.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn spawn_signal_handler(_shutdown: CancellationToken) -> Result<()> {
    Ok(())
}

async fn run(app: &mut App, events: &mut EventReceiver, shutdown: &CancellationToken) -> Result<()> {
    let mut terminal = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, events, shutdown).await;
    let restore_result = restore_terminal(&mut terminal);
    app.shutdown();

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => match app.take_fatal() {
            Some(fatal) => Err(anyhow::Error::new(fatal).context("ecs-hatch stopped on an internal error")),
            None => Ok(()),
        },
    }
}

fn init_terminal() -> Result<TuiTerminal> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok(terminal)
}

fn restore_terminal(terminal: &mut TuiTerminal) -> Result<()> {
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen).context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn next_log_update(app: &mut App) -> Option<StreamUpdate> {
    match app.log_updates() {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App,
    events: &mut EventReceiver,
    shutdown: &CancellationToken,
) -> Result<()> {
    let mut reader = EventStream::new();
    let mut ticker = interval(TICK);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        let command = tokio::select! {
            maybe_event = reader.next() => match maybe_event {
                Some(Ok(Event::Key(key))) => app.handle_key(key),
                Some(Ok(_)) => AppCommand::None,
                Some(Err(error)) => {
                    app.set_status(format!("terminal event error: {error}"));
                    AppCommand::None
                }
                None => {
                    warn!("terminal event stream closed");
                    break;
                }
            },
            Some(event) = events.recv() => app.handle_event(event),
            update = next_log_update(app) => {
                app.handle_log_update(update);
                AppCommand::None
            }
            _ = ticker.tick() => AppCommand::None,
            () = shutdown.cancelled() => {
                info!("shutting down");
                break;
            }
        };

        match command {
            AppCommand::None => {}
            AppCommand::Quit => break,
            AppCommand::RunSession(target) => {
                run_session(terminal, app, &target).await?;
                // The old reader may have consumed input meant for the session.
                reader = EventStream::new();
            }
        }
    }

    Ok(())
}

async fn run_session(terminal: &mut TuiTerminal, app: &mut App, target: &SessionTarget) -> Result<()> {
    suspend_terminal_for_subprocess(terminal)?;
    app.run_session(target).await;
    resume_terminal_after_subprocess(terminal)
}

fn suspend_terminal_for_subprocess(terminal: &mut TuiTerminal) -> Result<()> {
    disable_raw_mode().context("failed to disable raw mode for session")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen).context("failed to leave alternate screen for session")?;
    terminal.show_cursor().context("failed to show cursor for session")?;
    Ok(())
}

fn resume_terminal_after_subprocess(terminal: &mut TuiTerminal) -> Result<()> {
    enable_raw_mode().context("failed to re-enable raw mode after session")?;
    execute!(terminal.backend_mut(), EnterAlternateScreen).context("failed to re-enter alternate screen after session")?;
    terminal.clear().context("failed to clear terminal after session")?;
    Ok(())
}
