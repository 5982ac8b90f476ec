//! User-facing build narration sink.
//!
//! Every step reports progress through this narrow boundary instead of
//! printing directly. Headline progress goes through [`Ui::say`], supporting
//! detail through [`Ui::message`], and failures through [`Ui::error`]. The
//! build never reads anything back from the sink.

use std::io::{self, Write};

/// Message sink consumed by the build pipeline.
pub trait Ui: Send + Sync {
    /// Announces a new stage of the build.
    fn say(&self, message: &str);
    /// Reports supporting detail under the current stage.
    fn message(&self, message: &str);
    /// Reports an error. Rendering an error does not stop the build by
    /// itself; halting is the runner's decision.
    fn error(&self, message: &str);
}

/// Writes narration to the standard streams.
///
/// Stage and detail lines go to stdout, errors to stderr. Write failures are
/// ignored: a closed pipe must not take the build down.
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamUi;

impl Ui for StreamUi {
    fn say(&self, message: &str) {
        writeln!(io::stdout(), "==> {message}").ok();
    }

    fn message(&self, message: &str) {
        writeln!(io::stdout(), "    {message}").ok();
    }

    fn error(&self, message: &str) {
        writeln!(io::stderr(), "error: {message}").ok();
    }
}

/// Discards all narration. Useful for machine-driven builds and tests that
/// only assert on state.
#[derive(Clone, Copy, Debug, Default)]
pub struct SilentUi;

impl Ui for SilentUi {
    fn say(&self, _message: &str) {}

    fn message(&self, _message: &str) {}

    fn error(&self, _message: &str) {}
}
