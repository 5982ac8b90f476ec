//! Pre-flight check that the target image name is free.

use super::{Step, StepAction, StepFuture};
use crate::context::{BuildContext, BuildError};

/// Halts the build immediately when an image with the configured name
/// already exists, before any billable resource is created.
///
/// The existence probe deliberately treats API errors as "does not exist";
/// a flaky lookup must not block a build that would otherwise succeed.
#[derive(Clone, Copy, Debug, Default)]
pub struct CheckExistingImage;

impl Step for CheckExistingImage {
    fn name(&self) -> &'static str {
        "check-existing-image"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            let name = ctx.config.image_name().to_owned();
            ctx.ui
                .say(&format!("Checking that image '{name}' does not exist..."));
            if ctx.backend.image_exists(&name).await {
                return ctx.fail(BuildError::ImageAlreadyExists { name });
            }
            StepAction::Continue
        })
    }
}
