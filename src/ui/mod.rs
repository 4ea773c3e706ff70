//! Terminal UI: palettes, shared widgets and the per-mode views.

mod render;
pub mod theme;
pub mod utils;
pub mod widgets;

pub use render::render;
pub use theme::Theme;
