//! Final image capture.

use super::{Step, StepAction, StepFuture};
use crate::backend::ImageSpec;
use crate::context::{BuildContext, BuildError};

/// Captures the retained boot disk as the build's output image.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateImage;

impl Step for CreateImage {
    fn name(&self) -> &'static str {
        "create-image"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            ctx.ui.say("Creating image...");

            let config = &ctx.config;
            let spec = ImageSpec {
                name: config.image_name().to_owned(),
                description: config.image_description.clone(),
                family: config.image_family.clone(),
                labels: config.image_labels.clone(),
                licenses: config.image_licenses.clone(),
                zone: config.zone.clone(),
                source_disk: config.disk_name().to_owned(),
            };

            let pending = ctx.backend.create_image(spec);
            match pending
                .await_within(ctx.state_timeout, "image creation")
                .await
            {
                Ok(image) => {
                    ctx.ui
                        .message(&format!("Image '{}' has been created!", image.name));
                    ctx.image = Some(image);
                    StepAction::Continue
                }
                Err(err) => ctx.fail(BuildError::Backend(err)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::backend::BackendError;
    use crate::test_support::{MockBackend, build_context};

    #[tokio::test]
    async fn stores_the_captured_image() {
        let backend = MockBackend::default();
        let mut ctx = build_context(backend.clone());

        let action = CreateImage.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert!(
            ctx.image
                .as_ref()
                .is_some_and(|image| image.name == "kiln-test-image")
        );

        let spec = backend
            .create_image_spec()
            .unwrap_or_else(|| panic!("no image spec recorded"));
        assert_eq!(spec.source_disk, "kiln-test-instance");
        assert_eq!(spec.zone, "us-central1-a");
    }

    #[tokio::test]
    async fn capture_failure_halts() {
        let backend = MockBackend::default();
        backend.set_create_image_result(Err(BackendError::Provider {
            message: String::from("disk busy"),
        }));
        let mut ctx = build_context(backend);

        let action = CreateImage.run(&mut ctx).await;
        assert_eq!(action, StepAction::Halt);
        assert!(ctx.image.is_none());
        assert!(ctx.error.is_some());
    }

    #[tokio::test]
    async fn capture_timeout_halts() {
        let backend = MockBackend::default();
        backend.set_create_image_never_completes();
        let mut ctx = build_context(backend);
        ctx.state_timeout = Duration::from_millis(10);

        let action = CreateImage.run(&mut ctx).await;
        assert_eq!(action, StepAction::Halt);
        assert!(matches!(
            ctx.error,
            Some(BuildError::Backend(BackendError::Timeout { .. }))
        ));
    }
}
