//! Startup-script completion wait.

use std::time::Duration;

use super::{Step, StepAction, StepFuture};
use crate::context::{BuildContext, BuildError};
use crate::startup;

const INITIAL_POLL_INTERVAL: Duration = Duration::from_secs(2);
const MAX_POLL_INTERVAL: Duration = Duration::from_secs(30);

/// Polls the status metadata key maintained by the startup-script wrapper
/// until the guest reports `done`.
///
/// An `error` status or an API failure aborts immediately; an absent key
/// counts as not-done, since the wrapper may not have started yet. Poll
/// spacing backs off exponentially up to a cap, and cancellation is checked
/// between polls.
#[derive(Clone, Copy, Debug)]
pub struct WaitStartupScript {
    initial_interval: Duration,
    max_interval: Duration,
}

impl WaitStartupScript {
    /// Creates the step with explicit poll intervals, letting tests keep
    /// timeout scenarios fast.
    #[must_use]
    pub const fn with_intervals(initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            initial_interval,
            max_interval,
        }
    }
}

impl Default for WaitStartupScript {
    fn default() -> Self {
        Self {
            initial_interval: INITIAL_POLL_INTERVAL,
            max_interval: MAX_POLL_INTERVAL,
        }
    }
}

impl Step for WaitStartupScript {
    fn name(&self) -> &'static str {
        "wait-startup-script"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(name) = ctx.instance_name.clone() else {
                return ctx.fail(BuildError::MissingState {
                    what: "instance name for startup-script wait",
                });
            };
            let zone = ctx.config.zone.clone();

            ctx.ui
                .say("Waiting for the startup script to finish running...");
            let mut interval = self.initial_interval;
            loop {
                if ctx.cancel.is_cancelled() {
                    return ctx.fail(BuildError::Cancelled);
                }

                let polled = ctx
                    .backend
                    .get_instance_metadata(&zone, &name, startup::STATUS_KEY)
                    .await;
                let status = match polled {
                    Ok(status) => status,
                    Err(err) => return ctx.fail(BuildError::Backend(err)),
                };

                match status.as_deref() {
                    Some(startup::STATUS_DONE) => break,
                    Some(startup::STATUS_ERROR) => {
                        return ctx.fail(BuildError::StartupScript {
                            message: String::from("the guest reported an error status"),
                        });
                    }
                    _ => {
                        tracing::debug!(?interval, "startup script not done yet");
                        tokio::time::sleep(interval).await;
                        interval = (interval.saturating_mul(2)).min(self.max_interval);
                    }
                }
            }

            ctx.ui.message("Startup script has finished running.");
            StepAction::Continue
        })
    }
}
