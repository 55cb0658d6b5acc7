//! Colors shared by prompts, step lines and banners

use cliclack::ThemeState;
use console::Style;

/// What a piece of output means, mapped to one color
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Tone {
    /// Titles and the active prompt
    Accent,
    Success,
    Warning,
    Failure,
    Muted,
}

impl Tone {
    pub(crate) fn style(self) -> Style {
        match self {
            Self::Accent => Style::new().magenta(),
            Self::Success => Style::new().green(),
            Self::Warning => Style::new().yellow(),
            Self::Failure => Style::new().red(),
            Self::Muted => Style::new().dim(),
        }
    }
}

/// Tone of a prompt still in progress; `None` once submitted
fn prompt_tone(state: &ThemeState) -> Option<Tone> {
    match state {
        ThemeState::Active => Some(Tone::Accent),
        ThemeState::Error(_) => Some(Tone::Failure),
        ThemeState::Cancel => Some(Tone::Muted),
        ThemeState::Submit => None,
    }
}

/// Prompt theme in the stagehouse palette
#[derive(Debug, Clone, Default)]
pub struct StagehouseTheme;

impl cliclack::Theme for StagehouseTheme {
    fn bar_color(&self, state: &ThemeState) -> Style {
        prompt_tone(state).map_or_else(|| Tone::Accent.style().dim(), Tone::style)
    }

    fn state_symbol_color(&self, state: &ThemeState) -> Style {
        prompt_tone(state).unwrap_or(Tone::Success).style()
    }
}

/// Install the theme for every prompt of this process
pub fn init_theme() {
    cliclack::set_theme(StagehouseTheme);
}
