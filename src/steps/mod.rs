//! Build pipeline steps.
//!
//! A step is the unit of orchestration: a forward action that either
//! continues or halts the pipeline, plus an always-invoked, best-effort
//! cleanup. The runner guarantees that cleanup runs for every step that was
//! entered, in reverse order of entry, no matter how the forward pass ended.

mod check_existing_image;
mod create_image;
mod create_instance;
mod create_ssh_key;
mod create_windows_password;
mod import_os_login;
mod instance_info;
mod runner;
mod start_tunnel;
mod teardown_instance;
mod wait_startup_script;

use std::future::Future;
use std::pin::Pin;

use crate::context::BuildContext;

pub use check_existing_image::CheckExistingImage;
pub use create_image::CreateImage;
pub use create_instance::CreateInstance;
pub use create_ssh_key::CreateSshKey;
pub use create_windows_password::CreateWindowsPassword;
pub use import_os_login::ImportOsLoginKey;
pub use instance_info::InstanceInfo;
pub use runner::run_steps;
pub use start_tunnel::StartTunnel;
pub use teardown_instance::TeardownInstance;
pub use wait_startup_script::WaitStartupScript;

/// Outcome of a step's forward action.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum StepAction {
    /// Advance to the next step.
    Continue,
    /// Stop forward progress and unwind.
    Halt,
}

/// Future returned by a step's forward action.
pub type StepFuture<'a> = Pin<Box<dyn Future<Output = StepAction> + Send + 'a>>;

/// Future returned by a step's cleanup.
pub type CleanupFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// One stage of the build pipeline.
pub trait Step: Send {
    /// Stable name used in narration and diagnostics.
    fn name(&self) -> &'static str;

    /// Performs the step's forward action. Errors are recorded through
    /// [`BuildContext::fail`], which also produces the halt action.
    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a>;

    /// Tears down whatever the forward action created. Invoked exactly once
    /// for every entered step; must be best-effort and report problems to
    /// the UI rather than failing the unwind.
    fn cleanup<'a>(&'a mut self, _ctx: &'a mut BuildContext) -> CleanupFuture<'a> {
        Box::pin(async {})
    }
}

/// Wraps a step so it only executes when `enabled` held at assembly time.
///
/// A disabled step continues the pipeline without side effects and its
/// cleanup does nothing, but it still occupies its slot in the unwind
/// bookkeeping so cleanup ordering stays uniform.
pub struct ConditionalStep {
    enabled: bool,
    inner: Box<dyn Step>,
}

impl ConditionalStep {
    /// Wraps `inner`, enabling it only when `enabled` is true.
    #[must_use]
    pub fn new(enabled: bool, inner: Box<dyn Step>) -> Self {
        Self { enabled, inner }
    }
}

impl Step for ConditionalStep {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        if self.enabled {
            self.inner.run(ctx)
        } else {
            let name = self.inner.name();
            Box::pin(async move {
                tracing::debug!(step = name, "step disabled, skipping");
                StepAction::Continue
            })
        }
    }

    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext) -> CleanupFuture<'a> {
        if self.enabled {
            self.inner.cleanup(ctx)
        } else {
            Box::pin(async {})
        }
    }
}
