//! Core library for the kiln image builder.
//!
//! kiln bakes reusable machine images: it provisions a temporary compute
//! instance from a declarative configuration, arranges SSH/WinRM access,
//! waits for in-guest provisioning signals, captures the instance's boot
//! disk as an image, and tears every temporary resource down again. The
//! heart of the crate is the step pipeline (create → configure → wait →
//! capture) with its reverse-order cleanup guarantee.

pub mod artifact;
pub mod backend;
pub mod builder;
pub mod communicator;
pub mod config;
pub mod context;
mod fsio;
pub mod gce;
pub mod keys;
pub mod startup;
pub mod steps;
pub mod test_support;
pub mod tunnel;
pub mod ui;

pub use artifact::Artifact;
pub use backend::{
    Backend, BackendError, BackendFuture, Image, ImageSpec, InstanceSpec, OsLoginProfile, Pending,
    WindowsKeyRequest,
};
pub use builder::Builder;
pub use communicator::{CommKind, CommSettings};
pub use config::{BuildConfig, ConfigError, IapSettings};
pub use context::{BuildContext, BuildError};
pub use gce::GceBackend;
pub use steps::{ConditionalStep, Step, StepAction};
pub use tunnel::{TunnelError, TunnelLauncher, TunnelProcess};
pub use ui::{SilentUi, StreamUi, Ui};
