//! Temporary build instance creation.

use std::collections::HashMap;

use super::{CleanupFuture, Step, StepAction, StepFuture};
use crate::backend::{BackendError, Image, InstanceSpec};
use crate::communicator::CommKind;
use crate::config::BuildConfig;
use crate::context::{BuildContext, BuildError};
use crate::fsio;
use crate::startup;

/// Launches the instance whose disk the build will capture.
///
/// The forward action resolves the source image, merges instance metadata
/// (SSH keys, startup script wrapping, metadata files), submits the creation
/// request, and races the resulting operation against the state timeout.
/// Cleanup deletes the instance and its boot disk, in that order, and only
/// reports failures; a half-created instance must never block the unwind.
#[derive(Clone, Copy, Debug, Default)]
pub struct CreateInstance;

/// Builds the merged metadata map for the new instance.
///
/// SSH keys are merged with any operator-provided `ssh-keys` entry, the
/// startup script is wrapped for observation when enabled, Windows images
/// have their status seeded as done (wrapping is not supported there), and
/// metadata files are read last so they can override nothing by accident.
fn build_instance_metadata(
    config: &BuildConfig,
    image: &Image,
    ssh_username: &str,
    ssh_public_key: Option<&str>,
) -> Result<HashMap<String, String>, String> {
    const SSH_META_KEY: &str = "ssh-keys";

    let mut metadata = config.metadata.clone();

    if let Some(public_key) = ssh_public_key.filter(|key| !key.is_empty()) {
        let trimmed = public_key.trim_end_matches('\n');
        let mut entry = format!("{ssh_username}:{trimmed} {ssh_username}");
        if let Some(existing) = metadata.get(SSH_META_KEY) {
            entry = format!("{entry}\n{existing}");
        }
        metadata.insert(SSH_META_KEY.to_owned(), entry);
    }

    let mut script = metadata
        .get(startup::SCRIPT_KEY)
        .cloned()
        .unwrap_or_default();
    if let Some(path) = config.startup_script_file.as_deref().filter(|p| !p.is_empty()) {
        script = fsio::read_to_string_ambient(path)
            .map_err(|err| format!("failed to read startup script {path}: {err}"))?;
    }
    metadata.insert(startup::SCRIPT_KEY.to_owned(), script.clone());

    if !script.is_empty() && config.wrap_startup_script() {
        metadata.insert(
            startup::SCRIPT_KEY.to_owned(),
            startup::LINUX_WRAPPER.to_owned(),
        );
        metadata.insert(startup::WRAPPED_SCRIPT_KEY.to_owned(), script);
        metadata.insert(
            startup::STATUS_KEY.to_owned(),
            startup::STATUS_NOT_DONE.to_owned(),
        );
    }

    if image.is_windows() {
        // Startup script observation is not supported on Windows guests;
        // report it as already finished so nothing waits on it.
        metadata.insert(
            startup::SCRIPT_KEY.to_owned(),
            startup::WINDOWS_WRAPPER.to_owned(),
        );
        metadata.insert(
            startup::STATUS_KEY.to_owned(),
            startup::STATUS_DONE.to_owned(),
        );
    }

    if config.use_os_login {
        metadata.insert(startup::ENABLE_OS_LOGIN_KEY.to_owned(), String::from("TRUE"));
    }

    for (key, path) in &config.metadata_files {
        let contents = fsio::read_to_string_ambient(path)
            .map_err(|err| format!("failed to read metadata file {path}: {err}"))?;
        metadata.insert(key.clone(), contents);
    }

    Ok(metadata)
}

async fn resolve_source_image(ctx: &BuildContext) -> Result<Image, BackendError> {
    let config = &ctx.config;
    let (name, from_family) = match config.source_image.as_deref().filter(|s| !s.is_empty()) {
        Some(image) => (image, false),
        None => (
            config
                .source_image_family
                .as_deref()
                .unwrap_or_default(),
            true,
        ),
    };
    match config
        .source_image_project
        .as_deref()
        .filter(|p| !p.is_empty())
    {
        Some(project) => {
            ctx.backend
                .get_image_from_project(project, name, from_family)
                .await
        }
        None => ctx.backend.get_image(name, from_family).await,
    }
}

impl Step for CreateInstance {
    fn name(&self) -> &'static str {
        "create-instance"
    }

    fn run<'a>(&'a mut self, ctx: &'a mut BuildContext) -> StepFuture<'a> {
        Box::pin(async move {
            let resolved = resolve_source_image(ctx).await;
            let source_image = match resolved {
                Ok(image) => image,
                Err(err) => return ctx.fail(BuildError::Backend(err)),
            };
            ctx.ui.say(&format!("Using image: {}", source_image.name));

            if source_image.is_windows()
                && ctx.comm.kind == CommKind::Winrm
                && ctx.comm.password.is_none()
            {
                ctx.create_windows_password = true;
            }

            let metadata = match build_instance_metadata(
                &ctx.config,
                &source_image,
                &ctx.comm.username,
                ctx.ssh_public_key.as_deref(),
            ) {
                Ok(metadata) => metadata,
                Err(message) => {
                    return ctx.fail(BuildError::Backend(BackendError::Validation(message)));
                }
            };

            ctx.ui.say("Creating instance...");
            let config = &ctx.config;
            let name = config.instance_name().to_owned();
            let spec = InstanceSpec {
                name: name.clone(),
                zone: config.zone.clone(),
                machine_type: config.machine_type.clone(),
                image: source_image,
                disk_name: config.disk_name().to_owned(),
                disk_size_gb: config.disk_size(),
                disk_type: config.disk_type.clone(),
                network: config.network.clone().unwrap_or_default(),
                subnetwork: config.subnetwork.clone().unwrap_or_default(),
                network_project: config.network_project().to_owned(),
                metadata,
                tags: config.tags.clone(),
                labels: config.labels.clone(),
                scopes: config.scopes.clone(),
                service_account_email: config.service_account_email.clone(),
                disable_default_service_account: config.disable_default_service_account,
                preemptible: config.preemptible,
                on_host_maintenance: config.on_host_maintenance.clone().unwrap_or_default(),
                omit_external_ip: config.omit_external_ip,
                static_address: config.address.clone(),
            };

            let submitted = ctx.backend.run_instance(spec).await;
            let pending = match submitted {
                Ok(pending) => pending,
                Err(err) => return ctx.fail(BuildError::Backend(err)),
            };

            ctx.ui
                .message("Waiting for creation operation to complete...");
            if let Err(err) = pending
                .await_within(ctx.state_timeout, "instance creation")
                .await
            {
                return ctx.fail(BuildError::Backend(err));
            }

            ctx.ui.message("Instance has been created!");
            ctx.instance_name = Some(name);
            StepAction::Continue
        })
    }

    fn cleanup<'a>(&'a mut self, ctx: &'a mut BuildContext) -> CleanupFuture<'a> {
        Box::pin(async move {
            let Some(name) = ctx.instance_name.clone().filter(|n| !n.is_empty()) else {
                return;
            };
            let zone = ctx.config.zone.clone();
            let timeout = ctx.state_timeout;

            ctx.ui.say("Deleting instance...");
            let deleted = match ctx.backend.delete_instance(&zone, &name).await {
                Ok(pending) => pending.await_within(timeout, "instance deletion").await,
                Err(err) => Err(err),
            };
            match deleted {
                Ok(()) => ctx.ui.message("Instance has been deleted!"),
                Err(err) => ctx.ui.error(&format!(
                    "Error deleting instance. Please delete it manually.\n\nName: {name}\nError: {err}"
                )),
            }
            ctx.instance_name = None;

            // Deleting the instance leaves the boot disk behind.
            let disk = ctx.config.disk_name().to_owned();
            ctx.ui.say("Deleting disk...");
            let disk_deleted = match ctx.backend.delete_disk(&zone, &disk).await {
                Ok(pending) => pending.await_within(timeout, "disk deletion").await,
                Err(err) => Err(err),
            };
            match disk_deleted {
                Ok(()) => ctx.ui.message("Disk has been deleted!"),
                Err(err) => ctx.ui.error(&format!(
                    "Error deleting disk. Please delete it manually.\n\nName: {disk}\nError: {err}"
                )),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::test_support::{MockBackend, build_context, stub_image};

    #[tokio::test]
    async fn creates_instance_and_records_its_name() {
        let backend = MockBackend::default();
        let mut ctx = build_context(backend.clone());
        ctx.ssh_public_key = Some(String::from("ssh-rsa KEY kiln"));
        let mut step = CreateInstance;

        let action = step.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert_eq!(ctx.instance_name.as_deref(), Some("kiln-test-instance"));

        let spec = backend
            .run_instance_spec()
            .unwrap_or_else(|| panic!("no instance spec recorded"));
        assert_eq!(spec.zone, "us-central1-a");
        assert!(
            spec.metadata
                .get("ssh-keys")
                .is_some_and(|keys| keys.contains("ssh-rsa KEY kiln")),
            "ssh key missing from metadata: {:?}",
            spec.metadata
        );
    }

    #[tokio::test]
    async fn windows_image_without_password_requests_a_reset() {
        let backend = MockBackend::default();
        backend.set_get_image(Ok(stub_image(
            "win-2019",
            vec![String::from(
                "projects/windows-cloud/global/licenses/windows-server",
            )],
        )));
        let mut ctx = build_context(backend);
        ctx.config.communicator = String::from("winrm");
        ctx.comm = ctx.config.comm();

        let action = CreateInstance.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert!(ctx.create_windows_password);
    }

    #[tokio::test]
    async fn windows_image_with_password_skips_the_reset() {
        let backend = MockBackend::default();
        backend.set_get_image(Ok(stub_image(
            "win-2019",
            vec![String::from(
                "projects/windows-cloud/global/licenses/windows-server",
            )],
        )));
        let mut ctx = build_context(backend);
        ctx.config.communicator = String::from("winrm");
        ctx.config.winrm_password = Some(String::from("hunter2"));
        ctx.comm = ctx.config.comm();

        let action = CreateInstance.run(&mut ctx).await;
        assert_eq!(action, StepAction::Continue);
        assert!(!ctx.create_windows_password);
    }

    #[tokio::test]
    async fn immediate_error_halts_without_an_instance_name() {
        let backend = MockBackend::default();
        backend.set_run_instance_immediate_error("zone lookup failed");
        let mut ctx = build_context(backend);

        let action = CreateInstance.run(&mut ctx).await;
        assert_eq!(action, StepAction::Halt);
        assert!(ctx.error.is_some());
        assert!(ctx.instance_name.is_none());
    }

    #[tokio::test]
    async fn channel_error_halts_without_an_instance_name() {
        let backend = MockBackend::default();
        backend.set_run_instance_result(Err(BackendError::Provider {
            message: String::from("quota exceeded"),
        }));
        let mut ctx = build_context(backend);

        let action = CreateInstance.run(&mut ctx).await;
        assert_eq!(action, StepAction::Halt);
        assert!(ctx.error.is_some());
        assert!(ctx.instance_name.is_none());
    }

    #[tokio::test]
    async fn silent_operation_times_out() {
        let backend = MockBackend::default();
        backend.set_run_instance_never_completes();
        let mut ctx = build_context(backend);
        ctx.state_timeout = Duration::from_millis(20);

        let action = CreateInstance.run(&mut ctx).await;
        assert_eq!(action, StepAction::Halt);
        assert!(
            matches!(
                ctx.error,
                Some(BuildError::Backend(BackendError::Timeout { .. }))
            ),
            "unexpected error: {:?}",
            ctx.error
        );
        assert!(ctx.instance_name.is_none());
    }

    #[tokio::test]
    async fn cleanup_deletes_instance_then_disk() {
        let backend = MockBackend::default();
        let mut ctx = build_context(backend.clone());
        ctx.instance_name = Some(String::from("kiln-test-instance"));

        CreateInstance.cleanup(&mut ctx).await;
        assert_eq!(
            backend.deleted_instances(),
            vec![(String::from("us-central1-a"), String::from("kiln-test-instance"))]
        );
        assert_eq!(
            backend.deleted_disks(),
            vec![(String::from("us-central1-a"), String::from("kiln-test-instance"))]
        );
        assert!(ctx.instance_name.is_none());
    }

    #[tokio::test]
    async fn cleanup_without_instance_deletes_nothing() {
        let backend = MockBackend::default();
        let mut ctx = build_context(backend.clone());

        CreateInstance.cleanup(&mut ctx).await;
        assert!(backend.deleted_instances().is_empty());
        assert!(backend.deleted_disks().is_empty());
    }

    #[test]
    fn metadata_merges_operator_ssh_keys() {
        let mut raw = crate::test_support::raw_config();
        raw.metadata
            .insert(String::from("ssh-keys"), String::from("op:ssh-rsa OLD op"));
        let config = raw
            .prepare()
            .unwrap_or_else(|err| panic!("prepare: {err}"));
        let image = stub_image("debian-12", Vec::new());

        let metadata =
            build_instance_metadata(&config, &image, "kiln", Some("ssh-rsa NEW kiln\n"))
                .unwrap_or_else(|err| panic!("metadata: {err}"));
        let keys = metadata
            .get("ssh-keys")
            .unwrap_or_else(|| panic!("ssh-keys missing"));
        assert!(keys.starts_with("kiln:ssh-rsa NEW kiln kiln\n"), "keys: {keys}");
        assert!(keys.ends_with("op:ssh-rsa OLD op"), "keys: {keys}");
    }

    #[test]
    fn metadata_without_public_key_is_untouched() {
        let config = crate::test_support::test_config();
        let image = stub_image("debian-12", Vec::new());
        let metadata = build_instance_metadata(&config, &image, "kiln", None)
            .unwrap_or_else(|err| panic!("metadata: {err}"));
        assert!(!metadata.contains_key("ssh-keys"));
    }

    #[test]
    fn startup_script_is_wrapped_by_default() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let script_path = dir.path().join("setup.sh");
        std::fs::write(&script_path, "echo hello")
            .unwrap_or_else(|err| panic!("write script: {err}"));

        let mut config = crate::test_support::test_config();
        config.startup_script_file = Some(script_path.to_string_lossy().into_owned());
        let image = stub_image("debian-12", Vec::new());

        let metadata = build_instance_metadata(&config, &image, "kiln", None)
            .unwrap_or_else(|err| panic!("metadata: {err}"));
        assert_eq!(
            metadata.get(crate::startup::SCRIPT_KEY).map(String::as_str),
            Some(crate::startup::LINUX_WRAPPER)
        );
        assert_eq!(
            metadata
                .get(crate::startup::WRAPPED_SCRIPT_KEY)
                .map(String::as_str),
            Some("echo hello")
        );
        assert_eq!(
            metadata.get(crate::startup::STATUS_KEY).map(String::as_str),
            Some(crate::startup::STATUS_NOT_DONE)
        );
    }

    #[test]
    fn unwrapped_startup_script_is_stored_verbatim() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let script_path = dir.path().join("setup.sh");
        std::fs::write(&script_path, "echo hello")
            .unwrap_or_else(|err| panic!("write script: {err}"));

        let mut config = crate::test_support::test_config();
        config.startup_script_file = Some(script_path.to_string_lossy().into_owned());
        config.wrap_startup_script = Some(false);
        let image = stub_image("debian-12", Vec::new());

        let metadata = build_instance_metadata(&config, &image, "kiln", None)
            .unwrap_or_else(|err| panic!("metadata: {err}"));
        assert_eq!(
            metadata.get(crate::startup::SCRIPT_KEY).map(String::as_str),
            Some("echo hello")
        );
        assert!(!metadata.contains_key(crate::startup::WRAPPED_SCRIPT_KEY));
    }

    #[test]
    fn windows_image_seeds_status_done() {
        let config = crate::test_support::test_config();
        let image = stub_image(
            "win",
            vec![String::from("projects/windows-cloud/global/licenses/win")],
        );
        let metadata = build_instance_metadata(&config, &image, "kiln", None)
            .unwrap_or_else(|err| panic!("metadata: {err}"));
        assert_eq!(
            metadata.get(crate::startup::STATUS_KEY).map(String::as_str),
            Some(crate::startup::STATUS_DONE)
        );
    }

    #[test]
    fn metadata_files_are_inlined() {
        let dir = tempfile::tempdir().unwrap_or_else(|err| panic!("tempdir: {err}"));
        let file_path = dir.path().join("user-data.yaml");
        std::fs::write(&file_path, "#cloud-config")
            .unwrap_or_else(|err| panic!("write file: {err}"));

        let mut config = crate::test_support::test_config();
        config.metadata_files.insert(
            String::from("user-data"),
            file_path.to_string_lossy().into_owned(),
        );
        let image = stub_image("debian-12", Vec::new());

        let metadata = build_instance_metadata(&config, &image, "kiln", None)
            .unwrap_or_else(|err| panic!("metadata: {err}"));
        assert_eq!(
            metadata.get("user-data").map(String::as_str),
            Some("#cloud-config")
        );
    }
}
