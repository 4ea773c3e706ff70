//! Text and layout helpers shared by the views.

use chrono::{DateTime, Utc};
use ratatui::layout::Rect;

use crate::navigation::NavigationStack;

pub const MIN_TERMINAL_WIDTH: u16 = 60;
pub const MIN_TERMINAL_HEIGHT: u16 = 16;

/// Returns the message to show instead of the UI when the terminal is too small.
pub fn validate_terminal_size(width: u16, height: u16) -> Result<(), String> {
    if width < MIN_TERMINAL_WIDTH || height < MIN_TERMINAL_HEIGHT {
        Err(format!(
            "Terminal too small: need {MIN_TERMINAL_WIDTH}x{MIN_TERMINAL_HEIGHT}, have {width}x{height}"
        ))
    } else {
        Ok(())
    }
}

/// Cuts `text` to `max_width` characters, ending in "..." when shortened.
pub fn truncate_text(text: &str, max_width: usize) -> String {
    if text.chars().count() <= max_width {
        text.to_string()
    } else if max_width <= 3 {
        "...".to_string()
    } else {
        let kept: String = text.chars().take(max_width - 3).collect();
        format!("{kept}...")
    }
}

/// Keeps both ends of long identifiers such as ARNs.
pub fn truncate_middle(text: &str, max_width: usize) -> String {
    let len = text.chars().count();
    if len <= max_width {
        return text.to_string();
    }
    if max_width <= 5 {
        return "...".to_string();
    }
    let remaining = max_width - 3;
    let start_len = remaining / 2;
    let end_len = remaining - start_len;
    let start: String = text.chars().take(start_len).collect();
    let end: String = text.chars().skip(len - end_len).collect();
    format!("{start}...{end}")
}

pub fn centered_rect(parent: Rect, width: u16, height: u16) -> Rect {
    let width = width.min(parent.width);
    let height = height.min(parent.height);

    Rect {
        x: parent.x + (parent.width.saturating_sub(width)) / 2,
        y: parent.y + (parent.height.saturating_sub(height)) / 2,
        width,
        height,
    }
}

/// Names of the selected item at every level below the top, root first.
pub fn breadcrumbs(nav: &NavigationStack) -> Vec<String> {
    let levels = nav.levels();
    let below_top = levels.len().saturating_sub(1);
    levels[..below_top]
        .iter()
        .filter_map(|level| level.selected().map(|item| item.display_name()))
        .collect()
}

/// Compact age such as `42s`, `7m`, `3h12m` or `2d4h`.
pub fn format_age(since: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let secs = (now - since).num_seconds().max(0);
    match secs {
        s if s < 60 => format!("{s}s"),
        s if s < 3600 => format!("{}m", s / 60),
        s if s < 86_400 => format!("{}h{}m", s / 3600, (s % 3600) / 60),
        s => format!("{}d{}h", s / 86_400, (s % 86_400) / 3600),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::model::Region;
    use crate::navigation::{LevelKind, NavItem};
    use chrono::TimeZone;

    #[test]
    fn test_validate_terminal_size() {
        assert!(validate_terminal_size(80, 24).is_ok());
        assert!(validate_terminal_size(MIN_TERMINAL_WIDTH, MIN_TERMINAL_HEIGHT).is_ok());
        assert!(validate_terminal_size(59, 24).is_err());
        let err = validate_terminal_size(40, 10).unwrap_err();
        assert!(err.contains("40x10"));
    }

    #[test]
    fn test_truncate_text() {
        assert_eq!(truncate_text("Short", 10), "Short");
        assert_eq!(truncate_text("Hello, World!", 10), "Hello, ...");
        assert_eq!(truncate_text("Hello", 2), "...");
        assert_eq!(truncate_text("", 10), "");
    }

    #[test]
    fn test_truncate_text_counts_chars_not_bytes() {
        assert_eq!(truncate_text("ünïcödé", 7), "ünïcödé");
        assert_eq!(truncate_text("ünïcödé-text", 6), "ünï...");
    }

    #[test]
    fn test_truncate_middle() {
        assert_eq!(truncate_middle("Short", 10), "Short");
        assert_eq!(
            truncate_middle("arn:aws:ecs:us-east-1:123456:task/abc123", 20),
            "arn:aws:...sk/abc123"
        );
        assert_eq!(truncate_middle("Very long text", 5), "...");
    }

    #[test]
    fn test_centered_rect() {
        let parent = Rect::new(0, 0, 100, 50);
        assert_eq!(centered_rect(parent, 60, 30), Rect::new(20, 10, 60, 30));
        assert_eq!(centered_rect(Rect::new(0, 0, 50, 25), 100, 50), Rect::new(0, 0, 50, 25));
    }

    #[test]
    fn test_breadcrumbs_follow_selection() {
        let mut nav = NavigationStack::new(vec![Region::new("us-east-1"), Region::new("eu-west-1")]);
        assert!(breadcrumbs(&nav).is_empty());

        nav.next();
        nav.push(LevelKind::Cluster, Vec::<NavItem>::new()).unwrap();
        let crumbs = breadcrumbs(&nav);
        assert_eq!(crumbs.len(), 1);
        assert!(crumbs[0].starts_with("eu-west-1"));
    }

    #[test]
    fn test_format_age() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(format_age(start, start + chrono::Duration::seconds(42)), "42s");
        assert_eq!(format_age(start, start + chrono::Duration::minutes(7)), "7m");
        assert_eq!(format_age(start, start + chrono::Duration::minutes(192)), "3h12m");
        assert_eq!(format_age(start, start + chrono::Duration::hours(52)), "2d4h");
        assert_eq!(format_age(start + chrono::Duration::minutes(1), start), "0s");
    }
}
