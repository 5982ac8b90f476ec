//! Step sequencing with a cleanup guarantee.
//!
//! The runner's whole job is ordering: run steps forward until one halts,
//! the cancellation token fires, or the list ends; then clean up every step
//! that was entered, last-entered first, so dependent resources disappear
//! before the resources they depend on. Errors travel through the shared
//! context, never through the runner's return value.

use std::panic::AssertUnwindSafe;

use futures::FutureExt as _;
use tokio_util::sync::CancellationToken;

use super::{Step, StepAction};
use crate::context::{BuildContext, BuildError};

/// Runs `steps` in order against `ctx`, then unwinds cleanup in reverse
/// order of entry.
///
/// A step counts as entered the moment its forward action starts; a step
/// that panics is still cleaned up. Panics during cleanup are contained and
/// reported so the remaining unwind continues.
pub async fn run_steps(
    cancel: &CancellationToken,
    steps: &mut [Box<dyn Step>],
    ctx: &mut BuildContext,
) {
    let mut entered = 0_usize;

    for step in steps.iter_mut() {
        if cancel.is_cancelled() {
            ctx.fail(BuildError::Cancelled);
            break;
        }

        entered += 1;
        tracing::debug!(step = step.name(), "running step");
        let outcome = AssertUnwindSafe(step.run(ctx)).catch_unwind().await;
        match outcome {
            Ok(StepAction::Continue) => {}
            Ok(StepAction::Halt) => break,
            Err(payload) => {
                ctx.fail(BuildError::StepPanic {
                    step: step.name().to_owned(),
                    message: panic_message(payload.as_ref()),
                });
                break;
            }
        }
    }

    for step in steps.iter_mut().take(entered).rev() {
        tracing::debug!(step = step.name(), "cleaning up step");
        let outcome = AssertUnwindSafe(step.cleanup(ctx)).catch_unwind().await;
        if let Err(payload) = outcome {
            ctx.ui.error(&format!(
                "cleanup for {} panicked: {}",
                step.name(),
                panic_message(payload.as_ref())
            ));
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload.downcast_ref::<&str>().map_or_else(
        || {
            payload
                .downcast_ref::<String>()
                .cloned()
                .unwrap_or_else(|| String::from("unknown panic"))
        },
        |message| String::from(*message),
    )
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::steps::{CleanupFuture, ConditionalStep, StepFuture};
    use crate::test_support::{MockBackend, build_context};

    type EventLog = Arc<Mutex<Vec<String>>>;

    fn record(log: &EventLog, entry: String) {
        log.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(entry);
    }

    fn events(log: &EventLog) -> Vec<String> {
        log.lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Step double that appends run/cleanup events to a shared log.
    struct Probe {
        name: &'static str,
        action: StepAction,
        panic_on_run: bool,
        panic_on_cleanup: bool,
        log: EventLog,
    }

    impl Probe {
        fn new(name: &'static str, action: StepAction, log: &EventLog) -> Self {
            Self {
                name,
                action,
                panic_on_run: false,
                panic_on_cleanup: false,
                log: Arc::clone(log),
            }
        }

        fn panicking(name: &'static str, log: &EventLog) -> Self {
            Self {
                panic_on_run: true,
                ..Self::new(name, StepAction::Continue, log)
            }
        }
    }

    impl Step for Probe {
        fn name(&self) -> &'static str {
            self.name
        }

        fn run<'a>(&'a mut self, _ctx: &'a mut BuildContext) -> StepFuture<'a> {
            Box::pin(async move {
                record(&self.log, format!("run:{}", self.name));
                assert!(!self.panic_on_run, "probe panic requested");
                self.action
            })
        }

        fn cleanup<'a>(&'a mut self, _ctx: &'a mut BuildContext) -> CleanupFuture<'a> {
            Box::pin(async move {
                record(&self.log, format!("cleanup:{}", self.name));
                assert!(!self.panic_on_cleanup, "probe cleanup panic requested");
            })
        }
    }

    async fn run_probes(steps: Vec<Box<dyn Step>>) -> BuildContext {
        let mut ctx = build_context(MockBackend::default());
        let cancel = CancellationToken::new();
        let mut list = steps;
        run_steps(&cancel, &mut list, &mut ctx).await;
        ctx
    }

    #[tokio::test]
    async fn halt_unwinds_entered_steps_in_reverse() {
        let log = EventLog::default();
        let ctx = run_probes(vec![
            Box::new(Probe::new("first", StepAction::Continue, &log)),
            Box::new(Probe::new("second", StepAction::Halt, &log)),
            Box::new(Probe::new("third", StepAction::Continue, &log)),
        ])
        .await;

        assert_eq!(
            events(&log),
            vec!["run:first", "run:second", "cleanup:second", "cleanup:first"],
        );
        assert!(ctx.error.is_none(), "runner itself must not record errors");
    }

    #[tokio::test]
    async fn full_pass_still_unwinds_in_reverse() {
        let log = EventLog::default();
        run_probes(vec![
            Box::new(Probe::new("a", StepAction::Continue, &log)),
            Box::new(Probe::new("b", StepAction::Continue, &log)),
        ])
        .await;

        assert_eq!(events(&log), vec!["run:a", "run:b", "cleanup:b", "cleanup:a"]);
    }

    #[tokio::test]
    async fn panicking_step_is_cleaned_up() {
        let log = EventLog::default();
        let ctx = run_probes(vec![
            Box::new(Probe::new("first", StepAction::Continue, &log)),
            Box::new(Probe::panicking("second", &log)),
            Box::new(Probe::new("third", StepAction::Continue, &log)),
        ])
        .await;

        assert_eq!(
            events(&log),
            vec!["run:first", "run:second", "cleanup:second", "cleanup:first"],
        );
        assert!(
            matches!(ctx.error, Some(BuildError::StepPanic { ref step, .. }) if step == "second"),
            "unexpected error: {:?}",
            ctx.error
        );
    }

    #[tokio::test]
    async fn cleanup_panic_does_not_stop_the_unwind() {
        let log = EventLog::default();
        let mut poisoned = Probe::new("middle", StepAction::Continue, &log);
        poisoned.panic_on_cleanup = true;
        run_probes(vec![
            Box::new(Probe::new("first", StepAction::Continue, &log)),
            Box::new(poisoned),
            Box::new(Probe::new("last", StepAction::Halt, &log)),
        ])
        .await;

        assert_eq!(
            events(&log),
            vec![
                "run:first",
                "run:middle",
                "run:last",
                "cleanup:last",
                "cleanup:middle",
                "cleanup:first",
            ],
        );
    }

    #[tokio::test]
    async fn cancellation_stops_before_the_next_step() {
        let log = EventLog::default();
        let mut ctx = build_context(MockBackend::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut steps: Vec<Box<dyn Step>> =
            vec![Box::new(Probe::new("never", StepAction::Continue, &log))];
        run_steps(&cancel, &mut steps, &mut ctx).await;

        assert!(events(&log).is_empty(), "no step should have run");
        assert!(matches!(ctx.error, Some(BuildError::Cancelled)));
    }

    #[tokio::test]
    async fn disabled_conditional_step_is_a_no_op() {
        let log = EventLog::default();
        let ctx = run_probes(vec![
            Box::new(ConditionalStep::new(
                false,
                Box::new(Probe::panicking("disabled", &log)),
            )),
            Box::new(Probe::new("after", StepAction::Continue, &log)),
        ])
        .await;

        assert_eq!(events(&log), vec!["run:after", "cleanup:after"]);
        assert!(ctx.error.is_none());
    }

    #[tokio::test]
    async fn enabled_conditional_step_delegates() {
        let log = EventLog::default();
        run_probes(vec![Box::new(ConditionalStep::new(
            true,
            Box::new(Probe::new("inner", StepAction::Continue, &log)),
        ))])
        .await;

        assert_eq!(events(&log), vec!["run:inner", "cleanup:inner"]);
    }
}
