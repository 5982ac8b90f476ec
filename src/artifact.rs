//! Build output handle.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::backend::{Backend, BackendError, Image};

/// Durable result of a successful build.
///
/// The image itself lives with the cloud provider; this handle carries its
/// identity, a deferred destroy capability, and pass-through state data for
/// downstream consumers.
pub struct Artifact {
    image: Image,
    backend: Arc<dyn Backend>,
    state_data: Option<serde_json::Map<String, Value>>,
}

impl Artifact {
    /// Creates an artifact from the captured image.
    #[must_use]
    pub fn new(
        image: Image,
        backend: Arc<dyn Backend>,
        state_data: Option<serde_json::Map<String, Value>>,
    ) -> Self {
        Self {
            image,
            backend,
            state_data,
        }
    }

    /// Identifier of the produced image.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.image.name
    }

    /// The produced image.
    #[must_use]
    pub fn image(&self) -> &Image {
        &self.image
    }

    /// Looks up pass-through state data captured at build finalisation.
    ///
    /// Returns `None` for unknown keys, and for every key when no state
    /// data was captured at all; absence is not an error.
    #[must_use]
    pub fn state(&self, key: &str) -> Option<&Value> {
        self.state_data.as_ref().and_then(|data| data.get(key))
    }

    /// Deletes the image behind this artifact, waiting for the deletion to
    /// finish however long it takes.
    ///
    /// # Errors
    ///
    /// Propagates whatever the deletion operation reports.
    pub async fn destroy(&self) -> Result<(), BackendError> {
        self.backend
            .delete_image(&self.image.name)
            .wait("image deletion")
            .await
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "A disk image was created: {}", self.image.name)
    }
}

impl fmt::Debug for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Artifact")
            .field("image", &self.image.name)
            .finish_non_exhaustive()
    }
}
