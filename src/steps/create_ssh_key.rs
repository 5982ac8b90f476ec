//! In-process SSH keypair generation.

use super::{Step, StepAction, StepFuture};
use crate::context::{BuildContext, BuildError};
use crate::fsio;
use crate::keys::{self, DEFAULT_RSA_BITS};

/// Generates the RSA keypair later published to the instance.
///
/// The keys are scoped to this single instance, so there is nothing remote
/// to clean up. When a debug key path is configured the private key is also
/// written to disk for interactive troubleshooting.
#[derive(Clone, Copy, Debug)]
pub struct CreateSshKey {
    bits: usize,
}

impl CreateSshKey {
    /// Creates the step with an explicit key size. Production assembly uses
    /// [`Default`].
    #[must_use]
    pub const fn with_bits(bits: usize) -> Self {
        Self { bits }
    }
}

impl Default for CreateSshKey {
    fn default() -> Self {
        Self {
            bits: DEFAULT_RSA_BITS,
        }
    }
}

impl Step for CreateSshKey {
    fn name(&self) -> &'static str {
        "create-ssh-key"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            ctx.ui.say("Generating SSH keypair...");
            let pair = match keys::generate_ssh_keypair(&ctx.comm.username, self.bits) {
                Ok(pair) => pair,
                Err(err) => return ctx.fail(BuildError::Key(err)),
            };

            if let Some(path) = ctx.config.debug_key_path.clone() {
                ctx.ui
                    .message(&format!("Saving SSH private key to {path} for debugging"));
                if let Err(message) = fsio::write_string_ambient(&path, &pair.private_openssh) {
                    return ctx.fail(BuildError::Key(crate::keys::KeyError::Encode(format!(
                        "failed to write debug key to {path}: {message}"
                    ))));
                }
            }

            ctx.ssh_private_key = Some(pair.private_openssh);
            ctx.ssh_public_key = Some(pair.public_openssh);
            StepAction::Continue
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{MockBackend, build_context};

    #[tokio::test]
    async fn stores_both_key_halves_in_context() {
        let mut ctx = build_context(MockBackend::default());
        let mut step = CreateSshKey::with_bits(512);
        let action = step.run(&mut ctx).await;

        assert_eq!(action, StepAction::Continue);
        assert!(
            ctx.ssh_private_key
                .as_deref()
                .is_some_and(|key| key.contains("OPENSSH PRIVATE KEY")),
        );
        assert!(
            ctx.ssh_public_key
                .as_deref()
                .is_some_and(|key| key.starts_with("ssh-rsa ")),
        );
    }

    #[tokio::test]
    async fn dumps_private_key_when_debug_path_is_set() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let key_path = dir.path().join("debug_key.pem");
        let mut ctx = build_context(MockBackend::default());
        ctx.config.debug_key_path = Some(key_path.to_string_lossy().into_owned());

        let mut step = CreateSshKey::with_bits(512);
        let action = step.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);

        let written =
            std::fs::read_to_string(&key_path).unwrap_or_else(|err| panic!("read key: {err}"));
        assert_eq!(Some(written.as_str()), ctx.ssh_private_key.as_deref());
    }
}
