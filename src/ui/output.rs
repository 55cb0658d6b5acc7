//! Step and banner lines
//!
//! Every line has a fancy form (cliclack log) and a plain form with a
//! bracketed tag, picked by [`UiContext::use_fancy_output`].

use super::context::UiContext;
use super::theme::Tone;
use console::{style, StyledObject};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Level {
    Ok,
    Info,
    Warn,
    Fail,
}

impl Level {
    fn tone(self) -> Tone {
        match self {
            Self::Ok => Tone::Success,
            Self::Info => Tone::Accent,
            Self::Warn => Tone::Warning,
            Self::Fail => Tone::Failure,
        }
    }

    fn tag(self) -> StyledObject<&'static str> {
        let text = match self {
            Self::Ok => "[OK]",
            Self::Info => "[INFO]",
            Self::Warn => "[WARN]",
            Self::Fail => "[FAIL]",
        };
        self.tone().style().apply_to(text)
    }
}

fn step(ctx: &UiContext, level: Level, text: String) {
    if !ctx.use_fancy_output() {
        println!("  {} {}", level.tag(), text);
        return;
    }
    let _ = match level {
        Level::Ok => cliclack::log::success(text),
        Level::Info => cliclack::log::info(text),
        Level::Warn => cliclack::log::warning(text),
        Level::Fail => cliclack::log::error(text),
    };
}

fn outro(ctx: &UiContext, level: Level, message: &str) {
    let styled = level.tone().style().bold().apply_to(message);
    if ctx.use_fancy_output() {
        let _ = cliclack::outro(styled);
    } else {
        println!("{} {}", level.tag(), message);
    }
}

/// Title line of a command
pub fn intro(ctx: &UiContext, title: &str) {
    let title = Tone::Accent.style().bold().apply_to(title);
    if ctx.use_fancy_output() {
        let _ = cliclack::intro(title);
    } else {
        println!("{}", title);
    }
}

pub fn outro_success(ctx: &UiContext, message: &str) {
    outro(ctx, Level::Ok, message);
}

pub fn outro_warn(ctx: &UiContext, message: &str) {
    outro(ctx, Level::Warn, message);
}

/// Success line with a dimmed detail, e.g. a path
pub fn step_ok_detail(ctx: &UiContext, message: &str, detail: &str) {
    step(ctx, Level::Ok, format!("{} ({})", message, Tone::Muted.style().apply_to(detail)));
}

/// Warning line with what to do about it
pub fn step_warn_hint(ctx: &UiContext, message: &str, hint: &str) {
    step(ctx, Level::Warn, format!("{} - {}", message, Tone::Muted.style().apply_to(hint)));
}

pub fn step_error_detail(ctx: &UiContext, message: &str, detail: &str) {
    step(ctx, Level::Fail, format!("{}: {}", message, Tone::Failure.style().apply_to(detail)));
}

pub fn step_info(ctx: &UiContext, message: &str) {
    step(ctx, Level::Info, message.to_string());
}

/// Indented `key: value` line
pub fn key_value(ctx: &UiContext, key: &str, value: &str) {
    let key = if ctx.use_fancy_output() {
        Tone::Muted.style().apply_to(key)
    } else {
        style(key)
    };
    println!("  {}: {}", key, value);
}
