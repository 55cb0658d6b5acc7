//! Terminal output
//!
//! `cliclack` step lines and prompts, an `indicatif` bar for sync progress,
//! and plain line output in CI or when stderr is not a terminal.
//!
//! # Example
//!
//! ```rust,ignore
//! use stagehouse::ui::{self, SyncProgress, UiContext};
//!
//! let ctx = UiContext::detect();
//! ui::intro(&ctx, "Sync stages");
//!
//! let mut progress = SyncProgress::new(&ctx, 12);
//! progress.stage_done("a1b2c3-1700000000000", "copied", false);
//! progress.finish();
//!
//! ui::outro_success(&ctx, "12 stages synced");
//! ```

mod context;
mod output;
mod progress;
mod prompts;
mod theme;

pub use context::UiContext;
pub use output::{
    intro, key_value, outro_success, outro_warn, step_error_detail, step_info, step_ok_detail,
    step_warn_hint,
};
pub use progress::{SyncProgress, TaskSpinner};
pub use prompts::confirm;
pub use theme::{init_theme, StagehouseTheme};
