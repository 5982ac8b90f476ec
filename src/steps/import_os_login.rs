//! OS Login key registration.

use sha2::{Digest as _, Sha256};

use super::{Step, StepAction, StepFuture};
use crate::context::{BuildContext, BuildError};
use crate::steps::CleanupFuture;

/// Registers the generated public key under the building account's OS Login
/// profile and adopts the profile's POSIX username for the communicator.
///
/// Builds authenticating with a pre-existing private key or an agent carry
/// no public key material; the step then skips silently, matching the
/// behaviour of metadata-based key injection.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImportOsLoginKey;

impl Step for ImportOsLoginKey {
    fn name(&self) -> &'static str {
        "import-os-login-key"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            let Some(public_key) = ctx.ssh_public_key.clone() else {
                ctx.ui
                    .message("No public SSH key to import; skipping OS Login registration.");
                return StepAction::Continue;
            };
            let account = ctx.config.account_email.clone().unwrap_or_default();
            if account.is_empty() {
                return ctx.fail(BuildError::MissingState {
                    what: "account email for OS Login",
                });
            }

            ctx.ui.say("Importing SSH public key for OS Login...");
            let imported = ctx
                .backend
                .import_os_login_key(&account, &public_key)
                .await;
            let profile = match imported {
                Ok(profile) => profile,
                Err(err) => return ctx.fail(BuildError::Backend(err)),
            };

            let fingerprint = hex::encode(Sha256::digest(public_key.as_bytes()));
            tracing::debug!(%fingerprint, "imported OS Login key");
            ctx.ssh_key_fingerprint = Some(fingerprint);

            ctx.ui.message(&format!(
                "Using OS Login username: {}",
                profile.posix_username
            ));
            ctx.comm.username = profile.posix_username;
            StepAction::Continue
        })
    }

    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext) -> CleanupFuture<'a> {
        Box::pin(async move {
            let Some(fingerprint) = ctx.ssh_key_fingerprint.take() else {
                return;
            };
            let account = ctx.config.account_email.clone().unwrap_or_default();
            ctx.ui.say("Deleting SSH public key from OS Login...");
            if let Err(err) = ctx
                .backend
                .delete_os_login_key(&account, &fingerprint)
                .await
            {
                ctx.ui.error(&format!(
                    "Error deleting OS Login key {fingerprint}; please remove it manually: {err}"
                ));
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockBackend, build_context};

    fn os_login_context(backend: MockBackend) -> BuildContext {
        let mut ctx = build_context(backend);
        ctx.config.account_email = Some(String::from("builder@example.com"));
        ctx.ssh_public_key = Some(String::from("ssh-rsa AAAB kiln"));
        ctx
    }

    #[tokio::test]
    async fn imports_key_and_adopts_posix_username() {
        let backend = MockBackend::default();
        backend.set_os_login_username("builder_example_com");
        let mut ctx = os_login_context(backend.clone());

        let action = ImportOsLoginKey.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert_eq!(ctx.comm.username, "builder_example_com");
        assert!(ctx.ssh_key_fingerprint.is_some());
        assert_eq!(
            backend.imported_os_login_keys(),
            vec![String::from("ssh-rsa AAAB kiln")]
        );
    }

    #[tokio::test]
    async fn skips_without_public_key_material() {
        let backend = MockBackend::default();
        let mut ctx = os_login_context(backend.clone());
        ctx.ssh_public_key = None;

        let action = ImportOsLoginKey.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert!(ctx.error.is_none());
        assert!(backend.imported_os_login_keys().is_empty());
    }

    #[tokio::test]
    async fn cleanup_deletes_by_fingerprint_once() {
        let backend = MockBackend::default();
        let mut ctx = os_login_context(backend.clone());
        let mut step = ImportOsLoginKey;
        let action = step.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);

        step.cleanup(&mut ctx).await;
        assert!(ctx.ssh_key_fingerprint.is_none());
        assert_eq!(backend.deleted_os_login_keys().len(), 1);

        // A second cleanup has nothing left to delete.
        step.cleanup(&mut ctx).await;
        assert_eq!(backend.deleted_os_login_keys().len(), 1);
    }

    #[tokio::test]
    async fn cleanup_without_import_is_a_no_op() {
        let backend = MockBackend::default();
        let mut ctx = os_login_context(backend.clone());
        ImportOsLoginKey.cleanup(&mut ctx).await;
        assert!(backend.deleted_os_login_keys().is_empty());
    }
}
