#![deny(clippy::all)]
//! Terminal output plumbing shared by every task in a run: stable prefix
//! colors, prefixed writers, and an output sink that keeps concurrent tasks
//! from interleaving mid-line.

mod color_selector;
mod logs;
mod output;
mod prefixed;

use std::sync::LazyLock;

use console::Style;

pub use crate::{
    color_selector::ColorSelector,
    logs::replay_logs,
    output::{OutputClient, OutputClientBehavior, OutputSink, OutputWriter},
    prefixed::{PrefixedUI, PrefixedWriter},
};

pub static GREY: LazyLock<Style> = LazyLock::new(|| Style::new().dim());
pub static BOLD: LazyLock<Style> = LazyLock::new(|| Style::new().bold());
pub static BOLD_GREY: LazyLock<Style> = LazyLock::new(|| Style::new().dim().bold());
pub static BOLD_GREEN: LazyLock<Style> = LazyLock::new(|| Style::new().green().bold());
pub static BOLD_RED: LazyLock<Style> = LazyLock::new(|| Style::new().red().bold());
pub static BOLD_YELLOW_REVERSE: LazyLock<Style> =
    LazyLock::new(|| Style::new().yellow().bold().reverse());
pub static MAGENTA: LazyLock<Style> = LazyLock::new(|| Style::new().magenta());
pub static YELLOW: LazyLock<Style> = LazyLock::new(|| Style::new().yellow());
pub static CYAN: LazyLock<Style> = LazyLock::new(|| Style::new().cyan());
pub static RED: LazyLock<Style> = LazyLock::new(|| Style::new().red());

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("cannot read logs: {0}")]
    CannotReadLogs(#[source] std::io::Error),
    #[error("cannot write logs: {0}")]
    CannotWriteLogs(#[source] std::io::Error),
}

/// Whether and how to color terminal output for this run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UI {
    pub should_strip_ansi: bool,
}

impl UI {
    pub fn new(should_strip_ansi: bool) -> Self {
        Self { should_strip_ansi }
    }

    pub fn infer() -> Self {
        Self {
            should_strip_ansi: !console::colors_enabled(),
        }
    }

    /// Applies a style unless this UI is stripping ANSI codes.
    pub fn apply(&self, styled: console::StyledObject<impl std::fmt::Display>) -> String {
        if self.should_strip_ansi {
            styled.force_styling(false).to_string()
        } else {
            styled.force_styling(true).to_string()
        }
    }
}

/// Styles a format string with one of the exported styles, respecting the
/// UI's ansi stripping.
#[macro_export]
macro_rules! color {
    ($ui:expr, $color:expr, $format_string:expr $(, $arg:expr)*) => {
        $ui.apply($color.apply_to(format!($format_string $(, $arg)*)))
    };
}

#[macro_export]
macro_rules! cprint {
    ($ui:expr, $color:expr, $format_string:expr $(, $arg:expr)*) => {
        print!("{}", $crate::color!($ui, $color, $format_string $(, $arg)*))
    };
}

#[macro_export]
macro_rules! cprintln {
    ($ui:expr, $color:expr, $format_string:expr $(, $arg:expr)*) => {
        println!("{}", $crate::color!($ui, $color, $format_string $(, $arg)*))
    };
}
