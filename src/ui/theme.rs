//! Color palettes for the terminal UI.
//!
//! The palette is chosen by name from `[ui] theme` in the config file.
//! Unknown names fall back to the dark palette.

use ratatui::style::Color;

use crate::env::{DeployStage, EnvOrigin};
use crate::logs::LogLevel;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Theme {
    /// Titles, breadcrumbs and focused borders
    pub primary: Color,
    pub foreground: Color,
    pub background: Color,
    pub muted: Color,
    pub success: Color,
    pub warning: Color,
    pub error: Color,
    /// Key hints in the footer and help overlay
    pub key: Color,
    pub highlight_fg: Color,
    pub highlight_bg: Color,
}

impl Default for Theme {
    fn default() -> Self {
        Self::dark()
    }
}

impl Theme {
    pub fn dark() -> Self {
        Self {
            primary: Color::Cyan,
            foreground: Color::White,
            background: Color::Black,
            muted: Color::DarkGray,
            success: Color::Green,
            warning: Color::Yellow,
            error: Color::Red,
            key: Color::Yellow,
            highlight_fg: Color::Black,
            highlight_bg: Color::Cyan,
        }
    }

    pub fn light() -> Self {
        Self {
            primary: Color::Blue,
            foreground: Color::Black,
            background: Color::White,
            muted: Color::Gray,
            success: Color::Green,
            warning: Color::Magenta,
            error: Color::Red,
            key: Color::Blue,
            highlight_fg: Color::White,
            highlight_bg: Color::Blue,
        }
    }

    /// Palette for a config name, case-insensitive.
    pub fn named(name: &str) -> Self {
        match name.trim().to_lowercase().as_str() {
            "light" => Self::light(),
            _ => Self::dark(),
        }
    }

    pub fn level_color(&self, level: LogLevel) -> Color {
        match level {
            LogLevel::Debug => self.muted,
            LogLevel::Info => self.foreground,
            LogLevel::Warning => self.warning,
            LogLevel::Error | LogLevel::Critical => self.error,
            LogLevel::Unknown => self.foreground,
        }
    }

    pub fn stage_color(&self, stage: &DeployStage) -> Color {
        match stage {
            DeployStage::Steady => self.success,
            DeployStage::Failed(_) => self.error,
            DeployStage::Registered { .. } | DeployStage::Updating | DeployStage::Rolling { .. } => self.warning,
        }
    }

    pub fn origin_color(&self, origin: EnvOrigin) -> Color {
        match origin {
            EnvOrigin::Plain => self.foreground,
            EnvOrigin::Parameter => self.primary,
            EnvOrigin::Secret => self.warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_palettes() {
        assert_eq!(Theme::named("dark"), Theme::dark());
        assert_eq!(Theme::named("Light"), Theme::light());
        assert_eq!(Theme::named(" LIGHT "), Theme::light());
    }

    #[test]
    fn test_unknown_name_falls_back_to_dark() {
        assert_eq!(Theme::named("solarized"), Theme::dark());
        assert_eq!(Theme::named(""), Theme::dark());
    }

    #[test]
    fn test_error_levels_share_a_color() {
        let theme = Theme::dark();
        assert_eq!(theme.level_color(LogLevel::Error), theme.level_color(LogLevel::Critical));
        assert_eq!(theme.level_color(LogLevel::Warning), Color::Yellow);
        assert_eq!(theme.level_color(LogLevel::Debug), Color::DarkGray);
    }

    #[test]
    fn test_stage_colors() {
        let theme = Theme::dark();
        assert_eq!(theme.stage_color(&DeployStage::Steady), theme.success);
        assert_eq!(theme.stage_color(&DeployStage::Failed("boom".into())), theme.error);
        assert_eq!(
            theme.stage_color(&DeployStage::Rolling { running: 1, desired: 2 }),
            theme.warning
        );
    }
}
