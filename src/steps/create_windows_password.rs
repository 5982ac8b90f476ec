//! Windows password provisioning.

use chrono::Utc;

use super::{Step, StepAction, StepFuture};
use crate::backend::WindowsKeyRequest;
use crate::context::{BuildContext, BuildError};
use crate::keys::{DEFAULT_RSA_BITS, WindowsKey};

/// Minutes the published key remains valid on the agent side.
const KEY_EXPIRY_MINUTES: i64 = 5;

/// Obtains a WinRM password by running the agent's key-exchange protocol.
///
/// Whether the step has anything to do is only known once the source image
/// has been resolved, so the decision lives in the context
/// (`create_windows_password`) rather than in the assembly-time predicate.
/// The generated key is consumed by the exchange and never persisted.
#[derive(Clone, Copy, Debug)]
pub struct CreateWindowsPassword {
    bits: usize,
}

impl CreateWindowsPassword {
    /// Creates the step with an explicit key size. Production assembly uses
    /// [`Default`].
    #[must_use]
    pub const fn with_bits(bits: usize) -> Self {
        Self { bits }
    }
}

impl Default for CreateWindowsPassword {
    fn default() -> Self {
        Self {
            bits: DEFAULT_RSA_BITS,
        }
    }
}

impl Step for CreateWindowsPassword {
    fn name(&self) -> &'static str {
        "create-windows-password"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            if !ctx.create_windows_password {
                tracing::debug!("no Windows password needed, skipping");
                return StepAction::Continue;
            }
            let Some(instance) = ctx.instance_name.clone() else {
                return ctx.fail(BuildError::MissingState {
                    what: "instance name for password reset",
                });
            };

            ctx.ui.say("Creating Windows password...");
            let key = match WindowsKey::generate(self.bits) {
                Ok(key) => key,
                Err(err) => return ctx.fail(BuildError::Key(err)),
            };
            let request = WindowsKeyRequest {
                username: ctx.comm.username.clone(),
                email: ctx.config.account_email.clone(),
                expires_on: Utc::now() + chrono::Duration::minutes(KEY_EXPIRY_MINUTES),
                key,
            };

            let zone = ctx.config.zone.clone();
            let submitted = ctx
                .backend
                .reset_windows_password(&zone, &instance, request)
                .await;
            let pending = match submitted {
                Ok(pending) => pending,
                Err(err) => return ctx.fail(BuildError::Backend(err)),
            };

            let resolved = pending
                .await_within(ctx.state_timeout, "windows password reset")
                .await;
            match resolved {
                Ok(password) => {
                    ctx.ui.message("Created password.");
                    ctx.comm.password = Some(password);
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

    const TEST_BITS: usize = 512;

    #[tokio::test]
    async fn skips_when_no_password_is_needed() {
        let backend = MockBackend::default();
        let mut ctx = build_context(backend.clone());
        let mut step = CreateWindowsPassword::with_bits(TEST_BITS);

        let action = step.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert!(ctx.comm.password.is_none());
        assert!(backend.password_requests().is_empty());
    }

    #[tokio::test]
    async fn stores_the_returned_password() {
        let backend = MockBackend::default();
        backend.set_password_result(Ok(String::from("p@ssw0rd")));
        let mut ctx = build_context(backend.clone());
        ctx.create_windows_password = true;
        ctx.instance_name = Some(String::from("kiln-test-instance"));

        let action = CreateWindowsPassword::with_bits(TEST_BITS)
            .run(&mut ctx)
            .await;
        assert_eq!(action, StepAction::Continue);
        assert_eq!(ctx.comm.password.as_deref(), Some("p@ssw0rd"));
        assert_eq!(backend.password_requests().len(), 1);
    }

    #[tokio::test]
    async fn timeout_leaves_no_password_behind() {
        let backend = MockBackend::default();
        backend.set_password_never_completes();
        let mut ctx = build_context(backend);
        ctx.create_windows_password = true;
        ctx.instance_name = Some(String::from("kiln-test-instance"));
        ctx.state_timeout = Duration::from_millis(10);

        let action = CreateWindowsPassword::with_bits(TEST_BITS)
            .run(&mut ctx)
            .await;
        assert_eq!(action, StepAction::Halt);
        assert!(
            matches!(
                ctx.error,
                Some(BuildError::Backend(BackendError::Timeout { .. }))
            ),
            "unexpected error: {:?}",
            ctx.error
        );
        assert!(ctx.comm.password.is_none());
    }

    #[tokio::test]
    async fn missing_instance_name_is_an_error() {
        let mut ctx = build_context(MockBackend::default());
        ctx.create_windows_password = true;

        let action = CreateWindowsPassword::with_bits(TEST_BITS)
            .run(&mut ctx)
            .await;
        assert_eq!(action, StepAction::Halt);
        assert!(matches!(ctx.error, Some(BuildError::MissingState { .. })));
    }
}
