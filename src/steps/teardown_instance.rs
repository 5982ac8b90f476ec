//! Instance teardown before image capture.

use super::{CleanupFuture, Step, StepAction, StepFuture};
use crate::context::{BuildContext, BuildError};

/// Captures the serial console for diagnostics, then deletes the instance
/// so its boot disk can be imaged.
///
/// Clearing `instance_name` afterwards tells the create-instance cleanup
/// that there is nothing left for it to delete. The boot disk itself must
/// outlive the forward pass (the image is captured from it), so it is only
/// removed in cleanup.
#[derive(Clone, Copy, Debug, Default)]
pub struct TeardownInstance;

impl Step for TeardownInstance {
    fn name(&self) -> &'static str {
        "teardown-instance"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(name) = ctx.instance_name.clone() else {
                return ctx.fail(BuildError::MissingState {
                    what: "instance name for teardown",
                });
            };
            let zone = ctx.config.zone.clone();

            let captured = ctx.backend.get_serial_port_output(&zone, &name).await;
            match captured {
                Ok(contents) => ctx.instance_log = Some(contents),
                Err(err) => {
                    ctx.ui
                        .message(&format!("Could not capture serial console output: {err}"));
                }
            }

            ctx.ui.say("Deleting instance...");
            let deleted = match ctx.backend.delete_instance(&zone, &name).await {
                Ok(pending) => {
                    pending
                        .await_within(ctx.state_timeout, "instance deletion")
                        .await
                }
                Err(err) => Err(err),
            };
            if let Err(err) = deleted {
                return ctx.fail(BuildError::Backend(err));
            }

            ctx.ui.message("Instance has been deleted!");
            ctx.instance_name = None;
            StepAction::Continue
        })
    }

    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext) -> CleanupFuture<'a> {
        Box::pin(async move {
            let zone = ctx.config.zone.clone();
            let disk = ctx.config.disk_name().to_owned();

            ctx.ui.say("Deleting disk...");
            let deleted = match ctx.backend.delete_disk(&zone, &disk).await {
                Ok(pending) => {
                    pending
                        .await_within(ctx.state_timeout, "disk deletion")
                        .await
                }
                Err(err) => Err(err),
            };
            match deleted {
                Ok(()) => ctx.ui.message("Disk has been deleted!"),
                Err(err) => ctx.ui.error(&format!(
                    "Error deleting disk. Please delete it manually.\n\nName: {disk}\nError: {err}"
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockBackend, build_context};

    #[tokio::test]
    async fn captures_serial_log_then_deletes_and_clears_the_name() {
        let backend = MockBackend::default();
        backend.set_serial_output("boot log line");
        let mut ctx = build_context(backend.clone());
        ctx.instance_name = Some(String::from("kiln-test-instance"));

        let action = TeardownInstance.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert_eq!(ctx.instance_log.as_deref(), Some("boot log line"));
        assert!(ctx.instance_name.is_none());
        assert_eq!(backend.deleted_instances().len(), 1);
    }

    #[tokio::test]
    async fn serial_capture_failure_is_not_fatal() {
        let backend = MockBackend::default();
        backend.set_serial_error("serial port unavailable");
        let mut ctx = build_context(backend);
        ctx.instance_name = Some(String::from("kiln-test-instance"));

        let action = TeardownInstance.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert!(ctx.instance_log.is_none());
    }

    #[tokio::test]
    async fn cleanup_deletes_the_boot_disk() {
        let backend = MockBackend::default();
        let mut ctx = build_context(backend.clone());

        TeardownInstance.cleanup(&mut ctx).await;
        assert_eq!(
            backend.deleted_disks(),
            vec![(
                String::from("us-central1-a"),
                String::from("kiln-test-instance")
            )]
        );
    }
}
