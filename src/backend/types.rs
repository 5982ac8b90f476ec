//! Value objects exchanged with compute backends.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::keys::WindowsKey;

/// License URI fragment that marks an image as Windows.
const WINDOWS_LICENSE_MARKER: &str = "windows";

/// A machine image as reported by the compute service.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Image {
    /// Image name, unique within its project.
    pub name: String,
    /// Project that owns the image.
    pub project: String,
    /// Fully qualified resource link.
    pub self_link: String,
    /// Disk size of the image in gigabytes.
    pub size_gb: i64,
    /// License URIs attached to the image.
    pub licenses: Vec<String>,
}

impl Image {
    /// Reports whether any attached license marks this as a Windows image.
    /// The comparison is a case-sensitive substring match; an image without
    /// licenses is never Windows.
    #[must_use]
    pub fn is_windows(&self) -> bool {
        self.licenses
            .iter()
            .any(|license| license.contains(WINDOWS_LICENSE_MARKER))
    }
}

/// Parameters for capturing a disk as an image.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ImageSpec {
    /// Name for the new image.
    pub name: String,
    /// Free-form description.
    pub description: String,
    /// Optional image family the new image joins.
    pub family: Option<String>,
    /// Key/value labels to attach.
    pub labels: HashMap<String, String>,
    /// License URIs to attach.
    pub licenses: Vec<String>,
    /// Zone holding the source disk.
    pub zone: String,
    /// Name of the disk to capture.
    pub source_disk: String,
}

/// Parameters for launching the temporary build instance.
///
/// Built once per run from the static configuration plus generated values
/// such as the SSH public key and the merged metadata map.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct InstanceSpec {
    /// Instance name; must be unique within the zone.
    pub name: String,
    /// Target zone, for example `us-central1-a`.
    pub zone: String,
    /// Machine type name, for example `n1-standard-1`.
    pub machine_type: String,
    /// Resolved source image to boot from.
    pub image: Image,
    /// Name for the boot disk.
    pub disk_name: String,
    /// Boot disk size in gigabytes.
    pub disk_size_gb: i64,
    /// Boot disk type, for example `pd-standard`.
    pub disk_type: String,
    /// Network name or URL; may be empty when a subnetwork is given.
    pub network: String,
    /// Subnetwork name or URL; may be empty for auto-subnet networks.
    pub subnetwork: String,
    /// Project owning the network and subnetwork.
    pub network_project: String,
    /// Instance metadata, already merged (SSH keys, startup script, files).
    pub metadata: HashMap<String, String>,
    /// Network tags for firewall targeting.
    pub tags: Vec<String>,
    /// Key/value labels to attach to the instance.
    pub labels: HashMap<String, String>,
    /// OAuth scopes for the instance's service account.
    pub scopes: Vec<String>,
    /// Explicit service account email, when not using the default.
    pub service_account_email: Option<String>,
    /// When set, the instance runs without any service account unless an
    /// explicit email is given.
    pub disable_default_service_account: bool,
    /// Launch as a preemptible instance.
    pub preemptible: bool,
    /// Host maintenance policy, `MIGRATE` or `TERMINATE`.
    pub on_host_maintenance: String,
    /// Skip allocating an external IP entirely.
    pub omit_external_ip: bool,
    /// Name of a pre-allocated static external address to attach.
    pub static_address: Option<String>,
}

impl InstanceSpec {
    /// Validates the parts of the request that can be checked without
    /// talking to the provider.
    ///
    /// # Errors
    ///
    /// Returns [`super::BackendError::Validation`] naming the offending
    /// field.
    pub fn validate(&self) -> Result<(), super::BackendError> {
        if self.name.is_empty() {
            return Err(super::BackendError::Validation(String::from("name")));
        }
        if self.zone.is_empty() {
            return Err(super::BackendError::Validation(String::from("zone")));
        }
        if self.machine_type.is_empty() {
            return Err(super::BackendError::Validation(String::from(
                "machine_type",
            )));
        }
        if self.network.is_empty() && self.subnetwork.is_empty() {
            return Err(super::BackendError::Validation(String::from(
                "either a network or a subnetwork must be specified",
            )));
        }
        if self.omit_external_ip && self.static_address.is_some() {
            return Err(super::BackendError::Validation(String::from(
                "a static address cannot be attached when the external IP is omitted",
            )));
        }
        Ok(())
    }
}

/// Key material and identity for a Windows password reset.
///
/// The private half of the keypair stays in this process; only the base64
/// modulus and exponent travel to the instance. The value is consumed by the
/// reset operation and never serialised to disk.
#[derive(Debug)]
pub struct WindowsKeyRequest {
    /// Account to create or reset on the instance.
    pub username: String,
    /// Email recorded alongside the key, when known.
    pub email: Option<String>,
    /// Moment the published key stops being honoured by the agent.
    pub expires_on: DateTime<Utc>,
    /// Freshly generated RSA key used to decrypt the agent's answer.
    pub key: WindowsKey,
}

/// POSIX identity resolved from an OS Login profile.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OsLoginProfile {
    /// Username of the profile's primary POSIX account.
    pub posix_username: String,
}
