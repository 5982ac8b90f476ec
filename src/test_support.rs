//! Test doubles shared by unit and integration tests.
//!
//! [`MockBackend`] stands in for the compute service: every operation
//! returns a scripted result and records its arguments for assertion. The
//! module ships in the library (not behind `cfg(test)`) so integration
//! tests can drive the full pipeline against it.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

use crate::backend::{
    Backend, BackendError, BackendFuture, Image, ImageSpec, InstanceSpec, OsLoginProfile, Pending,
    WindowsKeyRequest,
};
use crate::config::BuildConfig;
use crate::context::BuildContext;
use crate::ui::{SilentUi, Ui};

/// Builds an [`Image`] with sensible defaults for tests.
#[must_use]
pub fn stub_image(name: &str, licenses: Vec<String>) -> Image {
    Image {
        name: name.to_owned(),
        project: String::from("test-project"),
        self_link: format!(
            "https://compute.googleapis.com/compute/v1/projects/test-project/global/images/{name}"
        ),
        size_gb: 10,
        licenses,
    }
}

/// Returns an unprepared configuration with only the required fields set.
#[must_use]
pub fn raw_config() -> BuildConfig {
    BuildConfig {
        project_id: String::from("test-project"),
        zone: String::from("us-central1-a"),
        region: None,
        auth_token: Some(String::from("test-token")),
        account_file: None,
        account_email: None,
        source_image: Some(String::from("debian-12")),
        source_image_family: None,
        source_image_project: None,
        image_name: None,
        image_description: String::from("Created by kiln"),
        image_family: None,
        image_labels: std::collections::HashMap::new(),
        image_licenses: Vec::new(),
        instance_name: None,
        disk_name: None,
        disk_size_gb: None,
        disk_type: String::from("pd-standard"),
        machine_type: String::from("n1-standard-1"),
        metadata: std::collections::HashMap::new(),
        metadata_files: std::collections::HashMap::new(),
        network: None,
        subnetwork: None,
        network_project_id: None,
        omit_external_ip: false,
        use_internal_ip: false,
        address: None,
        preemptible: false,
        on_host_maintenance: None,
        tags: Vec::new(),
        labels: std::collections::HashMap::new(),
        scopes: Vec::new(),
        service_account_email: None,
        disable_default_service_account: false,
        startup_script_file: None,
        wrap_startup_script: None,
        state_timeout: String::from("5m"),
        use_os_login: false,
        debug_key_path: None,
        communicator: String::from("ssh"),
        ssh_username: String::from("kiln"),
        winrm_username: String::from("Administrator"),
        winrm_password: None,
        use_iap: false,
        iap_localhost_port: None,
        iap_hashbang: String::from("/bin/sh"),
        iap_ext: String::from(".sh"),
        iap_tunnel_launch_wait: None,
    }
}

/// Returns a prepared configuration with deterministic resource names.
///
/// # Panics
///
/// Panics when the fixed test configuration fails to validate, which would
/// be a bug in the test fixture itself.
#[must_use]
pub fn test_config() -> BuildConfig {
    let mut config = raw_config();
    config.image_name = Some(String::from("kiln-test-image"));
    config.instance_name = Some(String::from("kiln-test-instance"));
    config
        .prepare()
        .unwrap_or_else(|err| panic!("test configuration failed to prepare: {err}"))
}

/// Builds a ready-to-use context around a mock backend and a silent UI.
///
/// # Panics
///
/// Panics when the fixed test configuration fails to validate.
#[must_use]
pub fn build_context(backend: MockBackend) -> BuildContext {
    BuildContext::new(
        test_config(),
        Arc::new(backend),
        Arc::new(SilentUi),
        CancellationToken::new(),
    )
    .unwrap_or_else(|err| panic!("test context failed to build: {err}"))
}

/// Narration sink that records everything for assertion.
#[derive(Clone, Default)]
pub struct RecordingUi {
    lines: Arc<Mutex<Vec<(String, String)>>>,
}

impl RecordingUi {
    fn push(&self, kind: &str, message: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((kind.to_owned(), message.to_owned()));
    }

    /// Every recorded line as `(kind, message)` pairs, in order.
    #[must_use]
    pub fn lines(&self) -> Vec<(String, String)> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Messages recorded through [`Ui::error`].
    #[must_use]
    pub fn errors(&self) -> Vec<String> {
        self.lines()
            .into_iter()
            .filter(|(kind, _)| kind == "error")
            .map(|(_, message)| message)
            .collect()
    }
}

impl Ui for RecordingUi {
    fn say(&self, message: &str) {
        self.push("say", message);
    }

    fn message(&self, message: &str) {
        self.push("message", message);
    }

    fn error(&self, message: &str) {
        self.push("error", message);
    }
}

/// How a scripted asynchronous operation should behave.
#[derive(Clone, Debug)]
enum OpScript<T> {
    /// Complete with this result.
    Complete(Result<T, BackendError>),
    /// Fail before any asynchronous work starts.
    Immediate(BackendError),
    /// Never complete; the caller's timeout must fire.
    Never,
}

#[derive(Debug, Default)]
struct Recorded {
    run_instance_spec: Option<InstanceSpec>,
    create_image_spec: Option<ImageSpec>,
    image_requests: Vec<(String, bool)>,
    deleted_instances: Vec<(String, String)>,
    deleted_disks: Vec<(String, String)>,
    deleted_images: Vec<String>,
    imported_os_login_keys: Vec<String>,
    deleted_os_login_keys: Vec<String>,
    password_requests: Vec<String>,
}

struct Inner {
    image_exists: bool,
    get_image: Result<Image, BackendError>,
    run_instance: OpScript<()>,
    wait_for_instance: OpScript<()>,
    nat_ip: Option<String>,
    internal_ip: Option<String>,
    metadata_values: VecDeque<Option<String>>,
    metadata_default: Option<String>,
    metadata_error: Option<String>,
    serial_output: Result<String, BackendError>,
    password: OpScript<String>,
    create_image: Option<OpScript<Image>>,
    delete_image: Result<(), BackendError>,
    os_login_username: String,
    recorded: Recorded,
}

impl Default for Inner {
    fn default() -> Self {
        Self {
            image_exists: false,
            get_image: Ok(stub_image("debian-12", Vec::new())),
            run_instance: OpScript::Complete(Ok(())),
            wait_for_instance: OpScript::Complete(Ok(())),
            nat_ip: Some(String::from("203.0.113.10")),
            internal_ip: Some(String::from("10.128.0.2")),
            metadata_values: VecDeque::new(),
            metadata_default: None,
            metadata_error: None,
            serial_output: Ok(String::new()),
            password: OpScript::Complete(Ok(String::from("generated-password"))),
            create_image: None,
            delete_image: Ok(()),
            os_login_username: String::from("kiln_user"),
            recorded: Recorded::default(),
        }
    }
}

/// Scripted compute backend recording every call.
#[derive(Clone, Default)]
pub struct MockBackend {
    inner: Arc<Mutex<Inner>>,
}

impl MockBackend {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Scripts the result of the image existence probe.
    pub fn set_image_exists(&self, exists: bool) {
        self.lock().image_exists = exists;
    }

    /// Scripts the source image lookup result.
    pub fn set_get_image(&self, result: Result<Image, BackendError>) {
        self.lock().get_image = result;
    }

    /// Makes instance creation fail before any asynchronous work starts.
    pub fn set_run_instance_immediate_error(&self, message: &str) {
        self.lock().run_instance = OpScript::Immediate(BackendError::Validation(message.to_owned()));
    }

    /// Scripts the eventual result of instance creation.
    pub fn set_run_instance_result(&self, result: Result<(), BackendError>) {
        self.lock().run_instance = OpScript::Complete(result);
    }

    /// Makes instance creation hang until the caller's timeout fires.
    pub fn set_run_instance_never_completes(&self) {
        self.lock().run_instance = OpScript::Never;
    }

    /// Makes the readiness wait hang until the caller's timeout fires.
    pub fn set_wait_for_instance_never_completes(&self) {
        self.lock().wait_for_instance = OpScript::Never;
    }

    /// Scripts the external IP lookup.
    pub fn set_nat_ip(&self, ip: Option<String>) {
        self.lock().nat_ip = ip;
    }

    /// Scripts the internal IP lookup.
    pub fn set_internal_ip(&self, ip: Option<String>) {
        self.lock().internal_ip = ip;
    }

    /// Queues one metadata poll answer; queued answers are consumed in
    /// order before the default applies.
    pub fn push_metadata_value(&self, value: Option<String>) {
        self.lock().metadata_values.push_back(value);
    }

    /// Sets the metadata answer returned once the queue is drained.
    pub fn set_metadata_default(&self, value: Option<String>) {
        self.lock().metadata_default = value;
    }

    /// Makes every metadata poll fail.
    pub fn set_metadata_error(&self, message: &str) {
        self.lock().metadata_error = Some(message.to_owned());
    }

    /// Scripts the serial console contents.
    pub fn set_serial_output(&self, contents: &str) {
        self.lock().serial_output = Ok(contents.to_owned());
    }

    /// Makes the serial console lookup fail.
    pub fn set_serial_error(&self, message: &str) {
        self.lock().serial_output = Err(BackendError::Provider {
            message: message.to_owned(),
        });
    }

    /// Scripts the eventual result of the password reset.
    pub fn set_password_result(&self, result: Result<String, BackendError>) {
        self.lock().password = OpScript::Complete(result);
    }

    /// Makes the password reset hang until the caller's timeout fires.
    pub fn set_password_never_completes(&self) {
        self.lock().password = OpScript::Never;
    }

    /// Scripts the eventual result of image capture. By default the mock
    /// fabricates an image from the submitted spec.
    pub fn set_create_image_result(&self, result: Result<Image, BackendError>) {
        self.lock().create_image = Some(OpScript::Complete(result));
    }

    /// Makes image capture hang until the caller's timeout fires.
    pub fn set_create_image_never_completes(&self) {
        self.lock().create_image = Some(OpScript::Never);
    }

    /// Scripts the result of image deletion.
    pub fn set_delete_image_result(&self, result: Result<(), BackendError>) {
        self.lock().delete_image = result;
    }

    /// Sets the POSIX username resolved by OS Login imports.
    pub fn set_os_login_username(&self, username: &str) {
        self.lock().os_login_username = username.to_owned();
    }

    /// Instance spec submitted to `run_instance`, if any.
    #[must_use]
    pub fn run_instance_spec(&self) -> Option<InstanceSpec> {
        self.lock().recorded.run_instance_spec.clone()
    }

    /// Image spec submitted to `create_image`, if any.
    #[must_use]
    pub fn create_image_spec(&self) -> Option<ImageSpec> {
        self.lock().recorded.create_image_spec.clone()
    }

    /// Source image lookups as `(name, from_family)` pairs.
    #[must_use]
    pub fn image_requests(&self) -> Vec<(String, bool)> {
        self.lock().recorded.image_requests.clone()
    }

    /// Deleted instances as `(zone, name)` pairs, in call order.
    #[must_use]
    pub fn deleted_instances(&self) -> Vec<(String, String)> {
        self.lock().recorded.deleted_instances.clone()
    }

    /// Deleted disks as `(zone, name)` pairs, in call order.
    #[must_use]
    pub fn deleted_disks(&self) -> Vec<(String, String)> {
        self.lock().recorded.deleted_disks.clone()
    }

    /// Deleted image names, in call order.
    #[must_use]
    pub fn deleted_images(&self) -> Vec<String> {
        self.lock().recorded.deleted_images.clone()
    }

    /// Public keys imported through OS Login.
    #[must_use]
    pub fn imported_os_login_keys(&self) -> Vec<String> {
        self.lock().recorded.imported_os_login_keys.clone()
    }

    /// Fingerprints deleted through OS Login.
    #[must_use]
    pub fn deleted_os_login_keys(&self) -> Vec<String> {
        self.lock().recorded.deleted_os_login_keys.clone()
    }

    /// Usernames submitted for password resets.
    #[must_use]
    pub fn password_requests(&self) -> Vec<String> {
        self.lock().recorded.password_requests.clone()
    }

    fn pending_from<T: Send + 'static>(script: OpScript<T>) -> Result<Pending<T>, BackendError> {
        match script {
            OpScript::Complete(result) => Ok(Pending::ready(result)),
            OpScript::Immediate(err) => Err(err),
            OpScript::Never => Ok(Pending::never()),
        }
    }
}

impl Backend for MockBackend {
    fn run_instance<'a>(&'a self, spec: InstanceSpec) -> BackendFuture<'a, Pending<()>> {
        Box::pin(async move {
            spec.validate()?;
            let mut inner = self.lock();
            inner.recorded.run_instance_spec = Some(spec);
            Self::pending_from(inner.run_instance.clone())
        })
    }

    fn delete_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, Pending<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner
                .recorded
                .deleted_instances
                .push((zone.to_owned(), name.to_owned()));
            Ok(Pending::ready(Ok(())))
        })
    }

    fn delete_disk<'a>(&'a self, zone: &'a str, name: &'a str) -> BackendFuture<'a, Pending<()>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner
                .recorded
                .deleted_disks
                .push((zone.to_owned(), name.to_owned()));
            Ok(Pending::ready(Ok(())))
        })
    }

    fn create_image(&self, spec: ImageSpec) -> Pending<Image> {
        let mut inner = self.lock();
        let script = inner.create_image.clone().unwrap_or_else(|| {
            OpScript::Complete(Ok(Image {
                name: spec.name.clone(),
                project: String::from("test-project"),
                self_link: format!(
                    "https://compute.googleapis.com/compute/v1/projects/test-project/global/images/{}",
                    spec.name
                ),
                size_gb: 10,
                licenses: spec.licenses.clone(),
            }))
        });
        inner.recorded.create_image_spec = Some(spec);
        match script {
            OpScript::Complete(result) => Pending::ready(result),
            OpScript::Immediate(err) => Pending::ready(Err(err)),
            OpScript::Never => Pending::never(),
        }
    }

    fn delete_image(&self, name: &str) -> Pending<()> {
        let mut inner = self.lock();
        inner.recorded.deleted_images.push(name.to_owned());
        Pending::ready(inner.delete_image.clone())
    }

    fn wait_for_instance(&self, _status: &str, _zone: &str, _name: &str) -> Pending<()> {
        match self.lock().wait_for_instance.clone() {
            OpScript::Complete(result) => Pending::ready(result),
            OpScript::Immediate(err) => Pending::ready(Err(err)),
            OpScript::Never => Pending::never(),
        }
    }

    fn get_image<'a>(&'a self, name: &'a str, from_family: bool) -> BackendFuture<'a, Image> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner
                .recorded
                .image_requests
                .push((name.to_owned(), from_family));
            inner.get_image.clone()
        })
    }

    fn get_image_from_project<'a>(
        &'a self,
        _project: &'a str,
        name: &'a str,
        from_family: bool,
    ) -> BackendFuture<'a, Image> {
        self.get_image(name, from_family)
    }

    fn image_exists<'a>(&'a self, _name: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move { self.lock().image_exists })
    }

    fn get_nat_ip<'a>(
        &'a self,
        _zone: &'a str,
        _name: &'a str,
    ) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.lock().nat_ip.clone()) })
    }

    fn get_internal_ip<'a>(
        &'a self,
        _zone: &'a str,
        _name: &'a str,
    ) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.lock().internal_ip.clone()) })
    }

    fn get_instance_metadata<'a>(
        &'a self,
        _zone: &'a str,
        _name: &'a str,
        _key: &'a str,
    ) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move {
            let mut inner = self.lock();
            if let Some(message) = inner.metadata_error.clone() {
                return Err(BackendError::Provider { message });
            }
            match inner.metadata_values.pop_front() {
                Some(value) => Ok(value),
                None => Ok(inner.metadata_default.clone()),
            }
        })
    }

    fn get_serial_port_output<'a>(
        &'a self,
        _zone: &'a str,
        _name: &'a str,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move { self.lock().serial_output.clone() })
    }

    fn reset_windows_password<'a>(
        &'a self,
        _zone: &'a str,
        _name: &'a str,
        request: WindowsKeyRequest,
    ) -> BackendFuture<'a, Pending<String>> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner.recorded.password_requests.push(request.username);
            Self::pending_from(inner.password.clone())
        })
    }

    fn import_os_login_key<'a>(
        &'a self,
        _account: &'a str,
        public_key: &'a str,
    ) -> BackendFuture<'a, OsLoginProfile> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner
                .recorded
                .imported_os_login_keys
                .push(public_key.to_owned());
            Ok(OsLoginProfile {
                posix_username: inner.os_login_username.clone(),
            })
        })
    }

    fn delete_os_login_key<'a>(
        &'a self,
        _account: &'a str,
        fingerprint: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let mut inner = self.lock();
            inner
                .recorded
                .deleted_os_login_keys
                .push(fingerprint.to_owned());
            Ok(())
        })
    }
}
