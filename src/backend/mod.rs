//! Compute backend abstraction consumed by the build pipeline.
//!
//! The pipeline only ever talks to the cloud through this trait. Long-running
//! mutating operations hand back a [`Pending`] completion handle so the
//! calling step can race them against the configured state timeout; lookups
//! resolve in a single request and are exposed as plain futures.

mod pending;
mod types;

use std::future::Future;
use std::pin::Pin;

use thiserror::Error;

pub use pending::Pending;
pub use types::{Image, ImageSpec, InstanceSpec, OsLoginProfile, WindowsKeyRequest};

/// Future returned by single-request backend operations.
pub type BackendFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BackendError>> + Send + 'a>>;

/// Errors raised by compute backends.
///
/// A deadline elapsing inside [`Pending::await_within`] produces
/// [`BackendError::Timeout`]; from a step's point of view it is the same kind
/// of failure as a remote operation error.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum BackendError {
    /// Raised when a request is rejected before any remote work starts.
    #[error("invalid request: {0}")]
    Validation(String),
    /// Raised when an image lookup finds nothing.
    #[error("image '{name}' not found: {detail}")]
    ImageNotFound {
        /// Image name or family passed by the caller.
        name: String,
        /// Lookup detail, including the projects that were tried.
        detail: String,
    },
    /// Raised when an operation's deadline elapses before a result arrives.
    #[error("timed out waiting for {action}")]
    Timeout {
        /// Action being waited on.
        action: String,
    },
    /// Wrapper for failures reported by the cloud API.
    #[error("provider error: {message}")]
    Provider {
        /// Message returned by the provider.
        message: String,
    },
}

impl From<reqwest::Error> for BackendError {
    fn from(value: reqwest::Error) -> Self {
        Self::Provider {
            message: value.to_string(),
        }
    }
}

/// Interface to a GCE-style compute service.
///
/// Implementations must be cheap to clone internally: operations returning
/// [`Pending`] spawn a worker that outlives the borrow of `self`.
pub trait Backend: Send + Sync {
    /// Submits an instance creation request built from `spec`.
    ///
    /// An error from the returned future before a [`Pending`] is produced is
    /// an immediate error: the request never reached the point of starting
    /// asynchronous work (validation failure, zone or address lookup
    /// failure). The [`Pending`] resolves once the creation operation
    /// finishes server-side.
    fn run_instance<'a>(&'a self, spec: InstanceSpec) -> BackendFuture<'a, Pending<()>>;

    /// Submits deletion of an instance. Same immediate-versus-deferred error
    /// split as [`Backend::run_instance`].
    fn delete_instance<'a>(&'a self, zone: &'a str, name: &'a str)
    -> BackendFuture<'a, Pending<()>>;

    /// Submits deletion of a disk. Same immediate-versus-deferred error
    /// split as [`Backend::run_instance`].
    fn delete_disk<'a>(&'a self, zone: &'a str, name: &'a str) -> BackendFuture<'a, Pending<()>>;

    /// Captures a disk as a reusable image. All failures, including ones
    /// discovered at submission, are delivered through the returned handle.
    fn create_image(&self, spec: ImageSpec) -> Pending<Image>;

    /// Deletes an image by name. All failures are delivered through the
    /// returned handle.
    fn delete_image(&self, name: &str) -> Pending<()>;

    /// Polls an instance until its status equals `status` (for example
    /// `RUNNING`). The handle never completes on its own if the instance
    /// stays in another healthy state; callers race it against a deadline.
    fn wait_for_instance(&self, status: &str, zone: &str, name: &str) -> Pending<()>;

    /// Looks up a source image by name or family, trying the backend's own
    /// project followed by the well-known public image projects, in order.
    /// The first successful lookup wins.
    fn get_image<'a>(&'a self, name: &'a str, from_family: bool) -> BackendFuture<'a, Image>;

    /// Looks up an image in one specific project.
    fn get_image_from_project<'a>(
        &'a self,
        project: &'a str,
        name: &'a str,
        from_family: bool,
    ) -> BackendFuture<'a, Image>;

    /// Reports whether an image with this name exists in the backend's own
    /// project. Any API error is reported as `false`; the pre-flight
    /// existing-image check relies on this lenient direction, so
    /// implementations must not surface transport errors here.
    fn image_exists<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;

    /// Returns the instance's external (NAT) IPv4 address, if any.
    fn get_nat_ip<'a>(&'a self, zone: &'a str, name: &'a str)
    -> BackendFuture<'a, Option<String>>;

    /// Returns the instance's primary internal IPv4 address, if any.
    fn get_internal_ip<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, Option<String>>;

    /// Reads one instance metadata value. Absence of the key is a normal,
    /// checkable condition and maps to `None`.
    fn get_instance_metadata<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
        key: &'a str,
    ) -> BackendFuture<'a, Option<String>>;

    /// Fetches the instance's serial console output.
    fn get_serial_port_output<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, String>;

    /// Publishes RSA key material to the instance and waits for the agent to
    /// answer with an encrypted password. The [`Pending`] resolves to the
    /// decrypted plaintext. An error before the handle is produced means the
    /// key material never reached the instance.
    fn reset_windows_password<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
        request: WindowsKeyRequest,
    ) -> BackendFuture<'a, Pending<String>>;

    /// Registers an SSH public key under `account`'s OS Login profile and
    /// returns the resolved POSIX identity.
    fn import_os_login_key<'a>(
        &'a self,
        account: &'a str,
        public_key: &'a str,
    ) -> BackendFuture<'a, OsLoginProfile>;

    /// Removes a previously imported OS Login key by its SHA-256
    /// fingerprint.
    fn delete_os_login_key<'a>(
        &'a self,
        account: &'a str,
        fingerprint: &'a str,
    ) -> BackendFuture<'a, ()>;
}
