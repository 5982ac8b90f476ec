//! Shared state threaded through the build pipeline.
//!
//! The context replaces a loose key/value bag with named, typed fields: each
//! step reads only the fields it needs and writes only the fields it owns,
//! and that contract is visible in the type. Absence of a value (`None`) is a
//! normal, checkable condition, not an error.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendError, Image};
use crate::communicator::CommSettings;
use crate::config::{BuildConfig, ConfigError};
use crate::keys::KeyError;
use crate::steps::StepAction;
use crate::tunnel::TunnelError;
use crate::ui::Ui;

/// Errors that halt a build.
///
/// The first halting error wins: it is recorded in the context, rendered to
/// the UI, and later steps never run.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BuildError {
    /// A compute backend operation failed or timed out.
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Key material could not be generated or used.
    #[error(transparent)]
    Key(#[from] KeyError),
    /// The tunnel helper could not be launched or stopped.
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    /// The target image already exists; refusing to overwrite it.
    #[error("image '{name}' already exists; pick another image name or delete it first")]
    ImageAlreadyExists {
        /// Name of the conflicting image.
        name: String,
    },
    /// The instance never exposed a usable address.
    #[error("instance '{name}' has no usable IP address")]
    NoInstanceAddress {
        /// Name of the instance.
        name: String,
    },
    /// The guest reported that the startup script failed.
    #[error("startup script failed: {message}")]
    StartupScript {
        /// Status detail reported by the guest or the polling loop.
        message: String,
    },
    /// A step needed a value an earlier step never produced.
    #[error("build state is missing {what}")]
    MissingState {
        /// Name of the missing value.
        what: &'static str,
    },
    /// A step panicked; the panic was contained so cleanup could run.
    #[error("step {step} panicked: {message}")]
    StepPanic {
        /// Name of the step that panicked.
        step: String,
        /// Panic payload, when it carried a message.
        message: String,
    },
    /// The build was cancelled from outside.
    #[error("build cancelled")]
    Cancelled,
    /// The pipeline finished without an error but also without an image.
    /// This always indicates a bug in step sequencing.
    #[error("build finished without producing an image and without reporting an error")]
    NoImageProduced,
}

/// Mutable state shared by every step of one build.
pub struct BuildContext {
    /// Prepared build configuration.
    pub config: BuildConfig,
    /// Compute backend the steps drive.
    pub backend: Arc<dyn Backend>,
    /// Narration sink.
    pub ui: Arc<dyn Ui>,
    /// External cancellation signal, checked between steps and propagated
    /// into subprocesses.
    pub cancel: CancellationToken,
    /// Deadline applied to every awaited backend operation.
    pub state_timeout: Duration,
    /// Communicator parameters; several steps rewrite parts of these.
    pub comm: CommSettings,
    /// Name of the temporary instance once it exists; cleared again by
    /// teardown so cleanup does not delete twice.
    pub instance_name: Option<String>,
    /// Address the communicator should connect to.
    pub instance_ip: Option<String>,
    /// Generated OpenSSH private key.
    pub ssh_private_key: Option<String>,
    /// Generated OpenSSH public key.
    pub ssh_public_key: Option<String>,
    /// SHA-256 fingerprint of the OS Login key that was imported, kept for
    /// cleanup.
    pub ssh_key_fingerprint: Option<String>,
    /// Set when the source image turns out to be Windows and no WinRM
    /// password was configured.
    pub create_windows_password: bool,
    /// Image produced by the final capture step.
    pub image: Option<Image>,
    /// Serial console output captured before teardown.
    pub instance_log: Option<String>,
    /// First halting error, if any.
    pub error: Option<BuildError>,
}

impl BuildContext {
    /// Creates the context for one build.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the configured state timeout cannot be
    /// parsed.
    pub fn new(
        config: BuildConfig,
        backend: Arc<dyn Backend>,
        ui: Arc<dyn Ui>,
        cancel: CancellationToken,
    ) -> Result<Self, ConfigError> {
        let state_timeout = config.parsed_state_timeout()?;
        let comm = config.comm();
        Ok(Self {
            config,
            backend,
            ui,
            cancel,
            state_timeout,
            comm,
            instance_name: None,
            instance_ip: None,
            ssh_private_key: None,
            ssh_public_key: None,
            ssh_key_fingerprint: None,
            create_windows_password: false,
            image: None,
            instance_log: None,
            error: None,
        })
    }

    /// Records `error` as the build's halting error, renders it to the UI,
    /// and returns the halt action for the caller to propagate.
    ///
    /// Only the first halting error is kept.
    pub fn fail(&mut self, error: BuildError) -> StepAction {
        self.ui.error(&error.to_string());
        if self.error.is_none() {
            self.error = Some(error);
        }
        StepAction::Halt
    }
}
