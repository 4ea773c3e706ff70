//! Frame rendering.
//!
//! Every frame is drawn from scratch out of the current [`App`] state: a
//! header with the breadcrumb trail, the view for the current mode, and a
//! footer with the status line and key hints. Dialogs and the help overlay
//! are drawn last so they sit on top.

use chrono::Utc;
use ratatui::{
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, Paragraph, Row, Table, TableState, Wrap},
    Frame,
};

use crate::app::{App, EnvInput, Mode};
use crate::env::{DeployStage, EnvOrigin};
use crate::logs::{ContainerFilter, LogLevel, StreamStatus};
use crate::model::short_id;
use crate::navigation::{Level, LevelKind, NavItem};
use crate::session::SessionState;

use super::theme::Theme;
use super::utils::{breadcrumbs, centered_rect, format_age, truncate_middle, truncate_text, validate_terminal_size};
use super::widgets::{render_checkbox_list, render_confirmation_dialog, render_input_field, spinner_frame};

pub fn render(f: &mut Frame, app: &App) {
    let theme = Theme::named(&app.config().ui.theme);
    let screen = f.area();

    if let Err(message) = validate_terminal_size(screen.width, screen.height) {
        let warning = Paragraph::new(message)
            .style(Style::default().fg(theme.error))
            .alignment(Alignment::Center)
            .wrap(Wrap { trim: true });
        f.render_widget(warning, screen);
        return;
    }

    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(4)])
        .split(screen);

    draw_header(f, chunks[0], app, &theme);

    let content = chunks[1];
    match app.mode() {
        Mode::Browse | Mode::Filter | Mode::ConfirmExit => draw_level(f, content, app.nav().top(), &theme),
        Mode::Logs => draw_logs(f, content, app, &theme),
        Mode::Env | Mode::EnvInput(_) => draw_env(f, content, app, &theme),
        Mode::RedeployTargets => draw_targets(f, content, app, &theme),
        Mode::Deploying => draw_deploy(f, content, app, &theme),
    }

    draw_footer(f, chunks[2], app, &theme);

    match app.mode() {
        Mode::Filter => render_input_field(f, content, "Filter (Enter: keep, Esc: clear)", app.input(), &theme),
        Mode::EnvInput(input) => {
            let label = match input {
                EnvInput::Edit { key } => format!("New value for {key}"),
                EnvInput::AddKey => "New variable name".to_string(),
                EnvInput::AddValue { key } => format!("Value for {key}"),
            };
            render_input_field(f, content, &label, app.input(), &theme);
        }
        Mode::ConfirmExit => render_confirmation_dialog(f, "Exit", "Leave ecs-hatch?", &theme),
        _ => {}
    }

    if app.show_help() {
        draw_help(f, screen, &theme);
    }
}

fn draw_header(f: &mut Frame, area: Rect, app: &App, theme: &Theme) {
    let mut spans = vec![Span::styled(
        "ecs-hatch",
        Style::default().fg(theme.primary).add_modifier(Modifier::BOLD),
    )];
    for crumb in breadcrumbs(app.nav()) {
        spans.push(Span::styled(" › ", Style::default().fg(theme.muted)));
        spans.push(Span::styled(
            truncate_text(&crumb, 40),
            Style::default().fg(theme.foreground),
        ));
    }
    spans.push(Span::styled(" › ", Style::default().fg(theme.muted)));
    spans.push(Span::styled(
        app.nav().top().kind().title(),
        Style::default().fg(theme.primary),
    ));

    let profile = app.config().aws.profile.as_deref().unwrap_or("default");
    let header = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("profile: {profile}"))
            .title_alignment(Alignment::Right)
            .border_style(Style::default().fg(theme.muted)),
    );
    f.render_widget(header, area);
}

fn draw_footer(f: &mut Frame, area: Rect, app: &App, theme: &Theme) {
    let status_style = if app.status().to_lowercase().contains("fail") || app.status().contains("error") {
        Style::default().fg(theme.error)
    } else {
        Style::default().fg(theme.foreground)
    };
    let mut status = vec![Span::styled(app.status().to_string(), status_style)];
    match app.session_state() {
        SessionState::Starting => status.push(Span::styled(
            format!("  {} session starting", spinner_frame()),
            Style::default().fg(theme.warning),
        )),
        SessionState::Active => status.push(Span::styled("  session active", Style::default().fg(theme.success))),
        _ => {}
    }

    let hints: &[(&str, &str)] = match app.mode() {
        Mode::Browse | Mode::ConfirmExit => &[
            ("↑↓/jk", "move"),
            ("Enter", "open"),
            ("Esc", "back"),
            ("/", "filter"),
            ("r", "refresh"),
            ("?", "help"),
            ("q", "quit"),
        ],
        Mode::Filter => &[("type", "filter"), ("Enter", "keep"), ("Esc", "clear")],
        Mode::Logs => &[
            ("f", "level"),
            ("c", "container"),
            ("↑↓/PgUp/PgDn", "scroll"),
            ("G", "follow"),
            ("Esc", "stop"),
        ],
        Mode::Env => &[
            ("e", "edit"),
            ("a", "add"),
            ("d", "delete"),
            ("v", "reveal"),
            ("r", "redeploy"),
            ("Esc", "back"),
        ],
        Mode::EnvInput(_) => &[("Enter", "apply"), ("Esc", "cancel")],
        Mode::RedeployTargets => &[("Space", "toggle"), ("f", "force"), ("Enter", "deploy"), ("Esc", "cancel")],
        Mode::Deploying => &[("Esc", "stop watching")],
    };

    let mut keys = Vec::new();
    for (key, action) in hints {
        keys.push(Span::styled(
            *key,
            Style::default().fg(theme.key).add_modifier(Modifier::BOLD),
        ));
        keys.push(Span::styled(format!(":{action}  "), Style::default().fg(theme.muted)));
    }

    let footer = Paragraph::new(vec![Line::from(status), Line::from(keys)])
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(theme.muted)));
    f.render_widget(footer, area);
}

fn draw_level(f: &mut Frame, area: Rect, level: &Level, theme: &Theme) {
    let area = match level.error() {
        Some(error) => {
            let parts = Layout::default()
                .direction(Direction::Vertical)
                .constraints([Constraint::Length(3), Constraint::Min(0)])
                .split(area);
            let banner = Paragraph::new(error.to_string())
                .style(Style::default().fg(theme.error))
                .wrap(Wrap { trim: true })
                .block(
                    Block::default()
                        .title("Error (r: retry)")
                        .borders(Borders::ALL)
                        .border_style(Style::default().fg(theme.error)),
                );
            f.render_widget(banner, parts[0]);
            parts[1]
        }
        None => area,
    };

    let visible = level.visible();
    let title = if level.filter().is_empty() {
        format!("{} ({})", level.kind().title(), visible.len())
    } else {
        format!(
            "{} ({}/{}) filter: {}",
            level.kind().title(),
            visible.len(),
            level.items().len(),
            level.filter()
        )
    };
    let block = Block::default()
        .title(title)
        .borders(Borders::ALL)
        .border_style(Style::default().fg(theme.primary));

    if level.is_loading() {
        let loading = Paragraph::new(format!("{} Loading {}...", spinner_frame(), level.kind().title().to_lowercase()))
            .style(Style::default().fg(theme.warning))
            .alignment(Alignment::Center)
            .block(block);
        f.render_widget(loading, area);
        return;
    }

    if visible.is_empty() {
        let empty = if level.filter().is_empty() {
            format!("No {} found", level.kind().title().to_lowercase())
        } else {
            "Nothing matches the filter".to_string()
        };
        let widget = Paragraph::new(empty)
            .style(Style::default().fg(theme.muted))
            .alignment(Alignment::Center)
            .block(block);
        f.render_widget(widget, area);
        return;
    }

    let now = Utc::now();
    let (header, widths) = columns(level.kind());
    let rows: Vec<Row> = visible.iter().map(|item| row(item, now)).collect();

    let table = Table::new(rows, widths)
        .header(
            Row::new(header.to_vec())
                .style(Style::default().fg(theme.key).add_modifier(Modifier::BOLD))
                .bottom_margin(1),
        )
        .block(block)
        .style(Style::default().fg(theme.foreground))
        .row_highlight_style(
            Style::default()
                .fg(theme.highlight_fg)
                .bg(theme.highlight_bg)
                .add_modifier(Modifier::BOLD),
        );

    let mut state = TableState::default();
    state.select(Some(level.cursor()));
    f.render_stateful_widget(table, area, &mut state);
}

fn columns(kind: LevelKind) -> (&'static [&'static str], Vec<Constraint>) {
    match kind {
        LevelKind::Region => (
            &["Region", "Name"],
            vec![Constraint::Percentage(30), Constraint::Percentage(70)],
        ),
        LevelKind::Cluster => (
            &["Cluster", "Region"],
            vec![Constraint::Percentage(70), Constraint::Percentage(30)],
        ),
        LevelKind::Service => (
            &["Service", "Running", "Task definition"],
            vec![Constraint::Percentage(40), Constraint::Percentage(15), Constraint::Percentage(45)],
        ),
        LevelKind::Task => (
            &["Task", "Status", "Launch", "Age", "Containers"],
            vec![
                Constraint::Percentage(40),
                Constraint::Percentage(15),
                Constraint::Percentage(15),
                Constraint::Percentage(15),
                Constraint::Percentage(15),
            ],
        ),
        LevelKind::Container => (
            &["Container", "Status", "Runtime id"],
            vec![Constraint::Percentage(40), Constraint::Percentage(20), Constraint::Percentage(40)],
        ),
        LevelKind::Action => (&["Action"], vec![Constraint::Percentage(100)]),
    }
}

fn row(item: &NavItem, now: chrono::DateTime<Utc>) -> Row<'static> {
    let cells = match item {
        NavItem::Region(r) => vec![r.id.clone(), r.name.clone()],
        NavItem::Cluster(c) => vec![c.name.clone(), c.region.clone()],
        NavItem::Service(s) => vec![
            s.name.clone(),
            format!("{}/{}", s.running_count, s.desired_count),
            short_id(&s.task_definition).to_string(),
        ],
        NavItem::Task(t) => vec![
            t.id.clone(),
            t.last_status.clone(),
            t.launch_type.to_string(),
            t.started_at.map_or_else(|| "-".to_string(), |at| format_age(at, now)),
            t.eligible_containers().count().to_string(),
        ],
        NavItem::Container(c) => vec![
            c.name.clone(),
            c.last_status.clone(),
            c.runtime_id
                .as_deref()
                .map_or_else(|| "-".to_string(), |id| truncate_middle(id, 24)),
        ],
        NavItem::Action(a) => vec![a.label()],
    };
    Row::new(cells)
}

fn draw_logs(f: &mut Frame, area: Rect, app: &App, theme: &Theme) {
    let Some(view) = app.log_view() else {
        draw_level(f, area, app.nav().top(), theme);
        return;
    };

    let counts = view.counts();
    let container = match view.container_filter() {
        ContainerFilter::All => "all".to_string(),
        ContainerFilter::Only(name) => name.clone(),
    };
    let state = match view.status() {
        StreamStatus::Streaming if view.scroll == 0 => format!("{} following", spinner_frame()),
        StreamStatus::Streaming => format!("paused at -{}", view.scroll),
        StreamStatus::Stopped(reason) => format!("stopped: {reason}"),
    };

    let mut summary = vec![Span::styled(
        format!("level {}  container {}  ", view.level_filter().label(), container),
        Style::default().fg(theme.primary),
    )];
    for level in [LogLevel::Error, LogLevel::Warning, LogLevel::Info, LogLevel::Debug] {
        summary.push(Span::styled(
            format!("{}:{} ", level.as_str(), counts.get(level)),
            Style::default().fg(theme.level_color(level)),
        ));
    }

    let visible = view.visible();
    let height = area.height.saturating_sub(3) as usize;
    let end = visible.len().saturating_sub(view.scroll);
    let start = end.saturating_sub(height);

    let show_timestamps = app.config().logs.show_timestamps;
    let mut lines = vec![Line::from(summary)];
    lines.extend(visible[start..end].iter().map(|event| {
        let mut spans = Vec::with_capacity(3);
        if show_timestamps {
            let time = event
                .local_time()
                .map_or_else(|| "--:--:--".to_string(), |t| t.format("%H:%M:%S").to_string());
            spans.push(Span::styled(format!("{time} "), Style::default().fg(theme.muted)));
        }
        spans.push(Span::styled(format!("[{}] ", event.container), Style::default().fg(theme.primary)));
        spans.push(Span::styled(event.message.clone(), Style::default().fg(theme.level_color(event.level))));
        Line::from(spans)
    }));

    let border = match view.status() {
        StreamStatus::Stopped(_) => theme.error,
        StreamStatus::Streaming => theme.primary,
    };
    let logs = Paragraph::new(lines).block(
        Block::default()
            .title(format!("Logs ({}/{}) {state}", visible.len(), counts.total()))
            .borders(Borders::ALL)
            .border_style(Style::default().fg(border)),
    );
    f.render_widget(logs, area);
}

fn draw_env(f: &mut Frame, area: Rect, app: &App, theme: &Theme) {
    let Some(editor) = app.env() else {
        let loading = Paragraph::new(format!("{} Loading environment...", spinner_frame()))
            .style(Style::default().fg(theme.warning))
            .alignment(Alignment::Center)
            .block(Block::default().title("Environment").borders(Borders::ALL));
        f.render_widget(loading, area);
        return;
    };

    let definition = editor.task_definition();
    let dirty = if editor.is_dirty() { " [modified]" } else { "" };
    let title = format!(
        "Environment of {} ({}:{}){dirty}",
        editor.container(),
        definition.family,
        definition.revision
    );

    let rows: Vec<Row> = editor
        .entries()
        .iter()
        .map(|entry| {
            let origin = match entry.origin {
                EnvOrigin::Plain => "plain",
                EnvOrigin::Parameter => "parameter",
                EnvOrigin::Secret => "secret",
            };
            let marker = if entry.dirty { "*" } else { " " };
            let style = if entry.error.is_some() {
                Style::default().fg(theme.error)
            } else {
                Style::default().fg(theme.origin_color(entry.origin))
            };
            Row::new(vec![
                format!("{marker}{}", entry.key),
                entry.display_value(),
                origin.to_string(),
            ])
            .style(style)
        })
        .collect();

    let table = Table::new(
        rows,
        [Constraint::Percentage(30), Constraint::Percentage(55), Constraint::Percentage(15)],
    )
    .header(
        Row::new(vec!["Name", "Value", "Source"])
            .style(Style::default().fg(theme.key).add_modifier(Modifier::BOLD))
            .bottom_margin(1),
    )
    .block(
        Block::default()
            .title(title)
            .borders(Borders::ALL)
            .border_style(Style::default().fg(if editor.is_dirty() { theme.warning } else { theme.primary })),
    )
    .row_highlight_style(
        Style::default()
            .fg(theme.highlight_fg)
            .bg(theme.highlight_bg)
            .add_modifier(Modifier::BOLD),
    );

    let mut state = TableState::default();
    if !editor.entries().is_empty() {
        state.select(Some(app.env_cursor()));
    }
    f.render_stateful_widget(table, area, &mut state);
}

fn draw_targets(f: &mut Frame, area: Rect, app: &App, theme: &Theme) {
    let Some(targets) = app.targets() else {
        return;
    };
    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(3)])
        .split(area);

    let items: Vec<(String, bool)> = targets
        .candidates
        .iter()
        .zip(&targets.chosen)
        .map(|(service, chosen)| {
            (
                format!("{}  ({})", service.name, short_id(&service.task_definition)),
                *chosen,
            )
        })
        .collect();
    render_checkbox_list(f, parts[0], "Redeploy services", &items, targets.cursor, theme);

    let force = if targets.force { "on" } else { "off" };
    let changes = app.env().map_or(0, |editor| editor.diff().len());
    let summary = Paragraph::new(format!("{changes} pending change(s), force new deployment: {force}"))
        .style(Style::default().fg(if targets.force { theme.warning } else { theme.foreground }))
        .block(Block::default().borders(Borders::ALL).border_style(Style::default().fg(theme.muted)));
    f.render_widget(summary, parts[1]);
}

fn draw_deploy(f: &mut Frame, area: Rect, app: &App, theme: &Theme) {
    let progress = app.deploy_progress();
    let rows: Vec<Row> = progress
        .iter()
        .map(|(service, stage)| {
            let label = if service.is_empty() { "(task definition)" } else { service.as_str() };
            let state = match stage {
                DeployStage::Registered { task_definition } => format!("registered {}", short_id(task_definition)),
                DeployStage::Updating => format!("{} updating service", spinner_frame()),
                DeployStage::Rolling { running, desired } => {
                    format!("{} rolling {running}/{desired}", spinner_frame())
                }
                DeployStage::Steady => "steady".to_string(),
                DeployStage::Failed(reason) => format!("failed: {reason}"),
            };
            Row::new(vec![label.to_string(), state]).style(Style::default().fg(theme.stage_color(stage)))
        })
        .collect();

    let finished = progress.values().filter(|stage| stage.is_finished()).count();
    let table = Table::new(rows, [Constraint::Percentage(35), Constraint::Percentage(65)])
        .header(
            Row::new(vec!["Service", "State"])
                .style(Style::default().fg(theme.key).add_modifier(Modifier::BOLD))
                .bottom_margin(1),
        )
        .block(
            Block::default()
                .title(format!("Redeploy ({finished}/{} finished)", progress.len()))
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.primary)),
        );
    f.render_widget(table, area);
}

fn help_section<'a>(title: &'a str, keys: &[(&'a str, &'a str)], theme: &Theme) -> Vec<Line<'a>> {
    let mut lines = vec![Line::from(Span::styled(
        title,
        Style::default().fg(theme.primary).add_modifier(Modifier::BOLD),
    ))];
    lines.extend(keys.iter().map(|(key, text)| {
        Line::from(vec![
            Span::styled(format!("  {key:<12}"), Style::default().fg(theme.key)),
            Span::raw(*text),
        ])
    }));
    lines.push(Line::from(""));
    lines
}

fn draw_help(f: &mut Frame, screen: Rect, theme: &Theme) {
    let area = centered_rect(screen, 64, 32);
    f.render_widget(Clear, area);

    let mut lines = help_section(
        "Navigation",
        &[
            ("↑/k ↓/j", "Move"),
            ("Enter/l", "Open the selected item"),
            ("Esc/h", "Back (clears the filter first)"),
            ("/", "Filter the current list"),
            ("r", "Refresh the current list"),
        ],
        theme,
    );
    lines.extend(help_section(
        "Logs",
        &[
            ("f", "Cycle minimum level"),
            ("c", "Cycle container"),
            ("PgUp/PgDn", "Scroll"),
            ("G/End", "Follow new events"),
            ("Esc", "Stop streaming"),
        ],
        theme,
    ));
    lines.extend(help_section(
        "Environment",
        &[
            ("e/Enter", "Edit value"),
            ("a / d", "Add / delete variable"),
            ("v", "Reveal or hide a secure value"),
            ("r", "Redeploy with changes"),
        ],
        theme,
    ));
    lines.extend(help_section("General", &[("?", "Toggle help"), ("q / Ctrl-C", "Quit")], theme));

    let help = Paragraph::new(lines).block(
        Block::default()
            .title("Help")
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.primary))
            .style(Style::default().bg(theme.background)),
    );
    f.render_widget(help, area);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::{Action, Region};
    use ratatui::backend::TestBackend;
    use ratatui::Terminal;

    fn buffer_text(terminal: &Terminal<TestBackend>) -> String {
        terminal
            .backend()
            .buffer()
            .content()
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn test_level_table_lists_regions() {
        let nav = crate::navigation::NavigationStack::new(vec![Region::new("us-east-1"), Region::new("eu-west-1")]);
        let mut terminal = Terminal::new(TestBackend::new(80, 20)).unwrap();
        terminal
            .draw(|f| draw_level(f, f.area(), nav.top(), &Theme::dark()))
            .unwrap();
        let text = buffer_text(&terminal);
        assert!(text.contains("us-east-1"));
        assert!(text.contains("eu-west-1"));
        assert!(text.contains("Regions (2)"));
    }

    #[test]
    fn test_loading_level_shows_spinner_text() {
        let mut nav = crate::navigation::NavigationStack::new(vec![Region::new("us-east-1")]);
        nav.push_loading(LevelKind::Cluster, crate::cache::CacheKey::Clusters("us-east-1".into()))
            .unwrap();
        let mut terminal = Terminal::new(TestBackend::new(80, 20)).unwrap();
        terminal
            .draw(|f| draw_level(f, f.area(), nav.top(), &Theme::dark()))
            .unwrap();
        assert!(buffer_text(&terminal).contains("Loading clusters..."));
    }

    #[test]
    fn test_error_banner_is_drawn_above_items() {
        let mut nav = crate::navigation::NavigationStack::new(vec![Region::new("us-east-1")]);
        nav.set_error("access denied");
        let mut terminal = Terminal::new(TestBackend::new(80, 20)).unwrap();
        terminal
            .draw(|f| draw_level(f, f.area(), nav.top(), &Theme::dark()))
            .unwrap();
        let text = buffer_text(&terminal);
        assert!(text.contains("access denied"));
        assert!(text.contains("us-east-1"));
    }

    #[test]
    fn test_action_rows_use_labels() {
        let item = NavItem::Action(Action::DownloadLogs { minutes: 120 });
        let (_, widths) = columns(item.kind());
        let table = Table::new(vec![row(&item, Utc::now())], widths);
        let mut terminal = Terminal::new(TestBackend::new(60, 5)).unwrap();
        terminal.draw(|f| f.render_widget(table, f.area())).unwrap();
        assert!(buffer_text(&terminal).contains("Download logs (last 2h)"));
    }

    #[test]
    fn test_help_overlay_lists_sections() {
        let mut terminal = Terminal::new(TestBackend::new(80, 40)).unwrap();
        terminal.draw(|f| draw_help(f, f.area(), &Theme::dark())).unwrap();
        let text = buffer_text(&terminal);
        assert!(text.contains("Navigation"));
        assert!(text.contains("Environment"));
    }
}
