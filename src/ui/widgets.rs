//! Small widgets shared by several views: spinner, dialogs, input line and
//! checkbox list.

use std::time::{SystemTime, UNIX_EPOCH};

use ratatui::{
    layout::{Alignment, Rect},
    style::{Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Clear, List, ListItem, ListState, Paragraph, Wrap},
    Frame,
};

use super::theme::Theme;
use super::utils::centered_rect;

const SPINNER_FRAMES: [&str; 10] = ["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"];
const SPINNER_FRAME_MS: u128 = 80;

/// Spinner frame for the current wall-clock time.
pub fn spinner_frame() -> &'static str {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    spinner_frame_at(millis)
}

fn spinner_frame_at(millis: u128) -> &'static str {
    let index = (millis / SPINNER_FRAME_MS) % SPINNER_FRAMES.len() as u128;
    SPINNER_FRAMES[index as usize]
}

/// Centered yes/no question.
pub fn render_confirmation_dialog(f: &mut Frame, title: &str, message: &str, theme: &Theme) {
    let area = centered_rect(f.area(), 50, 7);
    f.render_widget(Clear, area);

    let lines = vec![
        Line::from(""),
        Line::from(Span::styled(message, Style::default().fg(theme.foreground))),
        Line::from(""),
        Line::from(vec![
            Span::styled("y", Style::default().fg(theme.key).add_modifier(Modifier::BOLD)),
            Span::raw(": yes   "),
            Span::styled("n/Esc", Style::default().fg(theme.key).add_modifier(Modifier::BOLD)),
            Span::raw(": no"),
        ]),
    ];

    let dialog = Paragraph::new(lines)
        .alignment(Alignment::Center)
        .wrap(Wrap { trim: false })
        .block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.warning))
                .style(Style::default().bg(theme.background)),
        );
    f.render_widget(dialog, area);
}

/// Single-line text input drawn over the bottom of `parent`.
pub fn render_input_field(f: &mut Frame, parent: Rect, label: &str, value: &str, theme: &Theme) {
    let width = 70.min(parent.width.saturating_sub(4));
    let area = Rect {
        x: parent.x + parent.width.saturating_sub(width) / 2,
        y: parent.y + parent.height.saturating_sub(4),
        width,
        height: 3.min(parent.height),
    };
    f.render_widget(Clear, area);

    let widget = Paragraph::new(format!("{value}_"))
        .style(Style::default().fg(theme.foreground))
        .block(
            Block::default()
                .title(label)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.key))
                .style(Style::default().bg(theme.background)),
        );
    f.render_widget(widget, area);
}

/// List of `(label, checked)` rows with a highlighted cursor row.
pub fn render_checkbox_list(
    f: &mut Frame,
    area: Rect,
    title: &str,
    items: &[(String, bool)],
    cursor: usize,
    theme: &Theme,
) {
    let rows: Vec<ListItem> = items
        .iter()
        .map(|(label, checked)| {
            let mark = if *checked { "[x]" } else { "[ ]" };
            let style = if *checked {
                Style::default().fg(theme.success)
            } else {
                Style::default().fg(theme.foreground)
            };
            ListItem::new(format!("{mark} {label}")).style(style)
        })
        .collect();

    let list = List::new(rows)
        .block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.primary)),
        )
        .highlight_style(
            Style::default()
                .fg(theme.highlight_fg)
                .bg(theme.highlight_bg)
                .add_modifier(Modifier::BOLD),
        );

    let mut state = ListState::default();
    if !items.is_empty() {
        state.select(Some(cursor.min(items.len() - 1)));
    }
    f.render_stateful_widget(list, area, &mut state);
}
