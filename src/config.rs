//! Build configuration loading via `ortho-config`.
//!
//! Values merge defaults, configuration files, environment variables, and
//! CLI flags. A loaded configuration is raw until [`BuildConfig::prepare`]
//! fills generated names and derived defaults; the pipeline only ever sees
//! prepared configurations.

use std::collections::HashMap;
use std::time::Duration;

use ortho_config::OrthoConfig;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

use crate::communicator::{CommKind, CommSettings};

/// Host maintenance policy that live-migrates the instance.
pub const MAINTENANCE_MIGRATE: &str = "MIGRATE";
/// Host maintenance policy that terminates the instance.
pub const MAINTENANCE_TERMINATE: &str = "TERMINATE";

/// OAuth scopes granted to the build instance when none are configured.
const DEFAULT_SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/userinfo.email",
    "https://www.googleapis.com/auth/compute",
    "https://www.googleapis.com/auth/devstorage.full_control",
];

const DEFAULT_DISK_SIZE_GB: i64 = 10;
const MAX_IMAGE_FAMILY_LEN: usize = 63;

/// Declarative description of one image build, derived from environment
/// variables, configuration files, and CLI flags.
#[derive(Clone, Debug, Deserialize, OrthoConfig, PartialEq)]
#[ortho_config(prefix = "KILN")]
pub struct BuildConfig {
    /// Project that will own the temporary instance and the final image.
    pub project_id: String,
    /// Zone to launch the temporary instance in, for example
    /// `us-central1-a`.
    pub zone: String,
    /// Region hosting the zone. Derived from the zone when unset.
    pub region: Option<String>,
    /// Bearer token used to authenticate against the compute API.
    pub auth_token: Option<String>,
    /// Service account key file passed to the tunnel helper for `gcloud`
    /// authentication.
    pub account_file: Option<String>,
    /// Email of the account performing the build; required for OS Login and
    /// recorded with published Windows keys.
    pub account_email: Option<String>,
    /// Source image to boot the temporary instance from. Takes precedence
    /// over `source_image_family` when both are set.
    pub source_image: Option<String>,
    /// Source image family; resolves to its latest non-deprecated image.
    pub source_image_family: Option<String>,
    /// Project owning the source image, when not one of the well-known
    /// public image projects.
    pub source_image_project: Option<String>,
    /// Name for the image this build produces. Defaults to a timestamped
    /// `kiln-` name.
    pub image_name: Option<String>,
    /// Description attached to the produced image.
    #[ortho_config(default = "Created by kiln".to_owned())]
    pub image_description: String,
    /// Image family the produced image joins.
    pub image_family: Option<String>,
    /// Key/value labels for the produced image.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub image_labels: HashMap<String, String>,
    /// Licenses to attach to the produced image.
    #[serde(default)]
    pub image_licenses: Vec<String>,
    /// Name for the temporary instance. Defaults to a unique `kiln-` name.
    pub instance_name: Option<String>,
    /// Name for the boot disk. Defaults to the instance name.
    pub disk_name: Option<String>,
    /// Boot disk size in gigabytes. Defaults to 10.
    pub disk_size_gb: Option<i64>,
    /// Boot disk type. Defaults to `pd-standard`.
    #[ortho_config(default = "pd-standard".to_owned())]
    pub disk_type: String,
    /// Machine type for the temporary instance.
    #[ortho_config(default = "n1-standard-1".to_owned())]
    pub machine_type: String,
    /// Metadata applied to the temporary instance.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub metadata: HashMap<String, String>,
    /// Metadata whose values are loaded from local files at launch time.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub metadata_files: HashMap<String, String>,
    /// Network name or URL. Defaults to `default` when no subnetwork is
    /// given.
    pub network: Option<String>,
    /// Subnetwork name or URL; required for custom-subnet networks.
    pub subnetwork: Option<String>,
    /// Project owning the network. Defaults to `project_id`.
    pub network_project_id: Option<String>,
    /// Launch the instance without any external IP.
    #[serde(default)]
    pub omit_external_ip: bool,
    /// Connect to the instance's internal IP instead of its external one.
    #[serde(default)]
    pub use_internal_ip: bool,
    /// Name of a pre-allocated static external address to attach.
    pub address: Option<String>,
    /// Launch a preemptible instance.
    #[serde(default)]
    pub preemptible: bool,
    /// Host maintenance policy; `MIGRATE` or `TERMINATE`. Preemptible
    /// instances require `TERMINATE`.
    pub on_host_maintenance: Option<String>,
    /// Network tags for firewall targeting.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Key/value labels for the temporary instance.
    #[serde(default)]
    #[ortho_config(skip_cli)]
    pub labels: HashMap<String, String>,
    /// OAuth scopes for the instance's service account.
    #[serde(default)]
    #[ortho_config(cli_short = 'j')]
    pub scopes: Vec<String>,
    /// Service account to attach to the instance.
    pub service_account_email: Option<String>,
    /// When set and no explicit email is given, launch without any service
    /// account.
    #[serde(default)]
    pub disable_default_service_account: bool,
    /// Script to run inside the instance before the image is captured.
    pub startup_script_file: Option<String>,
    /// Whether to wrap the startup script so its completion can be observed
    /// from outside. Defaults to wrapping whenever a script is configured.
    pub wrap_startup_script: Option<bool>,
    /// How long to wait on instance state changes, in `time.Duration` style
    /// (`90s`, `5m`, `1h30m`). Defaults to `5m`.
    #[ortho_config(default = "5m".to_owned(), cli_short = 'q')]
    pub state_timeout: String,
    /// Register the build's SSH key through OS Login instead of instance
    /// metadata.
    #[serde(default)]
    pub use_os_login: bool,
    /// When set, the generated SSH private key is also written to this path
    /// for interactive debugging.
    pub debug_key_path: Option<String>,
    /// Remote-command transport: `ssh`, `winrm`, or `none`.
    #[ortho_config(default = "ssh".to_owned(), cli_short = 'y')]
    pub communicator: String,
    /// Login username for the SSH transport.
    #[ortho_config(default = "kiln".to_owned(), cli_short = 'F')]
    pub ssh_username: String,
    /// Login username for the WinRM transport.
    #[ortho_config(default = "Administrator".to_owned())]
    pub winrm_username: String,
    /// Pre-set WinRM password. When absent on a Windows build, a password
    /// reset is performed against the instance.
    #[ortho_config(cli_short = 'J')]
    pub winrm_password: Option<String>,
    /// Route the communicator through an IAP tunnel.
    #[serde(default)]
    #[ortho_config(cli_short = 'K')]
    pub use_iap: bool,
    /// Local port for the tunnel listener. Picked from a free port in the
    /// 8000-9000 range when unset.
    #[ortho_config(cli_short = 'Q')]
    pub iap_localhost_port: Option<u16>,
    /// Interpreter line for the generated tunnel helper script.
    #[ortho_config(default = "/bin/sh".to_owned())]
    pub iap_hashbang: String,
    /// File extension for the generated tunnel helper script.
    #[ortho_config(default = ".sh".to_owned())]
    pub iap_ext: String,
    /// Seconds to watch the tunnel helper for startup errors. Defaults to
    /// 30 for SSH and 40 for WinRM.
    #[ortho_config(cli_short = 'X')]
    pub iap_tunnel_launch_wait: Option<u64>,
}

/// Tunnel settings resolved from a prepared configuration.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IapSettings {
    /// Whether the tunnel is in use at all.
    pub enabled: bool,
    /// Fixed local port, when the operator chose one.
    pub local_port: Option<u16>,
    /// Interpreter line for the helper script.
    pub hashbang: String,
    /// File extension for the helper script.
    pub ext: String,
    /// Seconds to watch the helper for startup errors.
    pub launch_wait: u64,
}

/// Metadata for a configuration field, used to generate actionable error
/// messages.
struct FieldMetadata {
    description: &'static str,
    env_var: &'static str,
    toml_key: &'static str,
}

impl FieldMetadata {
    const fn new(
        description: &'static str,
        env_var: &'static str,
        toml_key: &'static str,
    ) -> Self {
        Self {
            description,
            env_var,
            toml_key,
        }
    }
}

impl BuildConfig {
    fn require_field(value: &str, metadata: &FieldMetadata) -> Result<(), ConfigError> {
        if value.trim().is_empty() {
            return Err(ConfigError::MissingField(format!(
                "missing {}: set {} or add {} to kiln.toml",
                metadata.description, metadata.env_var, metadata.toml_key
            )));
        }
        Ok(())
    }

    /// Loads configuration using the `ortho-config` derive. Values merge
    /// defaults, configuration files, environment variables, and CLI flags
    /// in that order of precedence.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the loader fails to merge
    /// sources.
    pub fn load_from_sources() -> Result<Self, ConfigError> {
        Self::load().map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads configuration without attempting to parse CLI arguments.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when the merge fails.
    pub fn load_without_cli_args() -> Result<Self, ConfigError> {
        Self::load_from_iter([std::ffi::OsString::from("kiln")])
            .map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Fills generated names and derived defaults, then validates.
    ///
    /// Generated values (image name, instance name) are materialised here so
    /// every later read within one build observes the same name.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid field.
    pub fn prepare(mut self) -> Result<Self, ConfigError> {
        if self
            .image_name
            .as_deref()
            .is_none_or(|name| name.trim().is_empty())
        {
            self.image_name = Some(format!("kiln-{}", chrono::Utc::now().timestamp()));
        }
        if self
            .instance_name
            .as_deref()
            .is_none_or(|name| name.trim().is_empty())
        {
            self.instance_name = Some(format!("kiln-{}", Uuid::new_v4().simple()));
        }
        if self.disk_name.is_none() {
            self.disk_name = self.instance_name.clone();
        }
        if self.disk_size_gb.is_none() {
            self.disk_size_gb = Some(DEFAULT_DISK_SIZE_GB);
        }
        if self.network.as_deref().unwrap_or_default().is_empty()
            && self.subnetwork.as_deref().unwrap_or_default().is_empty()
        {
            self.network = Some(String::from("default"));
        }
        if self.network_project_id.is_none() {
            self.network_project_id = Some(self.project_id.clone());
        }
        if self.region.is_none() {
            self.region = self
                .zone
                .rsplit_once('-')
                .map(|(region, _suffix)| region.to_owned());
        }
        if self.preemptible {
            match self.on_host_maintenance.as_deref() {
                None => self.on_host_maintenance = Some(MAINTENANCE_TERMINATE.to_owned()),
                Some(MAINTENANCE_TERMINATE) => {}
                Some(_) => {
                    return Err(ConfigError::Invalid(String::from(
                        "on_host_maintenance must be TERMINATE for preemptible instances",
                    )));
                }
            }
        } else if self.on_host_maintenance.is_none() {
            self.on_host_maintenance = Some(MAINTENANCE_MIGRATE.to_owned());
        }
        if self.scopes.is_empty() {
            self.scopes = DEFAULT_SCOPES
                .iter()
                .map(|scope| (*scope).to_owned())
                .collect();
        }

        self.validate()?;
        Ok(self)
    }

    /// Performs semantic validation on a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] describing the first invalid field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        Self::require_field(
            &self.project_id,
            &FieldMetadata::new("project ID", "KILN_PROJECT_ID", "project_id"),
        )?;
        Self::require_field(&self.zone, &FieldMetadata::new("zone", "KILN_ZONE", "zone"))?;

        if self.source_image.as_deref().unwrap_or_default().is_empty()
            && self
                .source_image_family
                .as_deref()
                .unwrap_or_default()
                .is_empty()
        {
            return Err(ConfigError::MissingField(String::from(
                "a source_image or source_image_family must be specified",
            )));
        }

        if let Some(family) = self.image_family.as_deref()
            && !family.is_empty()
        {
            validate_image_family(family)?;
        }

        match self.on_host_maintenance.as_deref() {
            None | Some(MAINTENANCE_MIGRATE | MAINTENANCE_TERMINATE) => {}
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "on_host_maintenance must be MIGRATE or TERMINATE, got '{other}'"
                )));
            }
        }

        if self.omit_external_ip && !self.use_internal_ip {
            return Err(ConfigError::Invalid(String::from(
                "use_internal_ip must be true when omit_external_ip is true",
            )));
        }
        if self.omit_external_ip && self.address.is_some() {
            return Err(ConfigError::Invalid(String::from(
                "an address cannot be specified when omit_external_ip is true",
            )));
        }
        if self.disable_default_service_account
            && self
                .service_account_email
                .as_deref()
                .is_some_and(|email| !email.is_empty())
        {
            return Err(ConfigError::Invalid(String::from(
                "service_account_email cannot be set when disable_default_service_account is true",
            )));
        }
        if self.use_os_login
            && self
                .account_email
                .as_deref()
                .unwrap_or_default()
                .is_empty()
        {
            return Err(ConfigError::MissingField(String::from(
                "account_email is required when use_os_login is true",
            )));
        }
        if CommKind::parse(&self.communicator).is_none() {
            return Err(ConfigError::Invalid(format!(
                "communicator must be ssh, winrm, or none, got '{}'",
                self.communicator
            )));
        }
        parse_duration(&self.state_timeout)?;
        Ok(())
    }

    /// Parses the configured state timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] for malformed durations.
    pub fn parsed_state_timeout(&self) -> Result<Duration, ConfigError> {
        parse_duration(&self.state_timeout)
    }

    /// Name of the image this build produces. Empty before
    /// [`BuildConfig::prepare`].
    #[must_use]
    pub fn image_name(&self) -> &str {
        self.image_name.as_deref().unwrap_or_default()
    }

    /// Name of the temporary instance. Empty before
    /// [`BuildConfig::prepare`].
    #[must_use]
    pub fn instance_name(&self) -> &str {
        self.instance_name.as_deref().unwrap_or_default()
    }

    /// Name of the boot disk. Empty before [`BuildConfig::prepare`].
    #[must_use]
    pub fn disk_name(&self) -> &str {
        self.disk_name.as_deref().unwrap_or_default()
    }

    /// Boot disk size in gigabytes.
    #[must_use]
    pub fn disk_size(&self) -> i64 {
        self.disk_size_gb.unwrap_or(DEFAULT_DISK_SIZE_GB)
    }

    /// Project owning the network resources.
    #[must_use]
    pub fn network_project(&self) -> &str {
        self.network_project_id
            .as_deref()
            .unwrap_or(&self.project_id)
    }

    /// Region hosting the configured zone.
    #[must_use]
    pub fn region(&self) -> &str {
        self.region.as_deref().unwrap_or_default()
    }

    /// Whether the startup script, if any, is wrapped for observation.
    #[must_use]
    pub fn wrap_startup_script(&self) -> bool {
        self.wrap_startup_script.unwrap_or(true)
    }

    /// Whether this build waits on a startup-script completion signal.
    #[must_use]
    pub fn waits_on_startup_script(&self) -> bool {
        self.startup_script_file
            .as_deref()
            .is_some_and(|path| !path.is_empty())
            && self.wrap_startup_script()
    }

    /// Communicator settings derived from this configuration.
    #[must_use]
    pub fn comm(&self) -> CommSettings {
        let kind = CommKind::parse(&self.communicator).unwrap_or(CommKind::Ssh);
        match kind {
            CommKind::Winrm => CommSettings::new(
                kind,
                self.winrm_username.clone(),
                self.winrm_password.clone(),
            ),
            CommKind::Ssh | CommKind::None => {
                CommSettings::new(kind, self.ssh_username.clone(), None)
            }
        }
    }

    /// IAP tunnel settings derived from this configuration.
    #[must_use]
    pub fn iap(&self) -> IapSettings {
        let default_wait = match CommKind::parse(&self.communicator) {
            Some(CommKind::Winrm) => 40,
            _ => 30,
        };
        IapSettings {
            enabled: self.use_iap,
            local_port: self.iap_localhost_port,
            hashbang: self.iap_hashbang.clone(),
            ext: self.iap_ext.clone(),
            launch_wait: self.iap_tunnel_launch_wait.unwrap_or(default_wait),
        }
    }
}

fn validate_image_family(family: &str) -> Result<(), ConfigError> {
    if family.len() > MAX_IMAGE_FAMILY_LEN {
        return Err(ConfigError::Invalid(String::from(
            "image_family must not be longer than 63 characters",
        )));
    }
    let starts_ok = family
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_lowercase());
    let body_ok = family
        .chars()
        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '-');
    let ends_ok = !family.ends_with('-');
    if !(starts_ok && body_ok && ends_ok) {
        return Err(ConfigError::Invalid(String::from(
            "image_family must start with a lowercase letter, contain only lowercase \
             letters, digits and dashes, and must not end with a dash",
        )));
    }
    Ok(())
}

/// Parses a `time.Duration`-style string such as `90s`, `5m`, or `1h30m`.
fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ConfigError::Parse(String::from(
            "state_timeout must not be empty",
        )));
    }

    let mut total = Duration::ZERO;
    let mut digits = String::new();
    let mut unit = String::new();
    let mut saw_component = false;

    for ch in trimmed.chars() {
        if ch.is_ascii_digit() {
            if !unit.is_empty() {
                total = total.saturating_add(duration_component(trimmed, &digits, &unit)?);
                saw_component = true;
                digits.clear();
                unit.clear();
            }
            digits.push(ch);
        } else {
            if digits.is_empty() {
                return Err(ConfigError::Parse(format!("invalid duration '{trimmed}'")));
            }
            unit.push(ch);
        }
    }
    if !digits.is_empty() {
        total = total.saturating_add(duration_component(trimmed, &digits, &unit)?);
        saw_component = true;
    }
    if !saw_component {
        return Err(ConfigError::Parse(format!("invalid duration '{trimmed}'")));
    }
    Ok(total)
}

fn duration_component(whole: &str, digits: &str, unit: &str) -> Result<Duration, ConfigError> {
    let amount: u64 = digits
        .parse()
        .map_err(|_| ConfigError::Parse(format!("invalid duration '{whole}'")))?;
    match unit {
        "ms" => Ok(Duration::from_millis(amount)),
        "s" => Ok(Duration::from_secs(amount)),
        "m" => Ok(Duration::from_secs(amount.saturating_mul(60))),
        "h" => Ok(Duration::from_secs(amount.saturating_mul(3600))),
        _ => Err(ConfigError::Parse(format!(
            "invalid duration unit in '{whole}'"
        ))),
    }
}

/// Errors raised during configuration loading and validation.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum ConfigError {
    /// Indicates a required configuration field is empty or missing.
    #[error("missing configuration field: {0}")]
    MissingField(String),
    /// Indicates a field carries a value the build cannot use.
    #[error("invalid configuration: {0}")]
    Invalid(String),
    /// Surfaces errors from the `ortho-config` loader.
    #[error("configuration parsing failed: {0}")]
    Parse(String),
}

impl From<ortho_config::OrthoError> for ConfigError {
    fn from(value: ortho_config::OrthoError) -> Self {
        Self::Parse(value.to_string())
    }
}
