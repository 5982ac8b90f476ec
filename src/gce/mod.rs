//! GCE-style compute backend speaking the provider's REST API.
//!
//! Long-running mutations submit a request, receive an operation resource,
//! and poll it to completion from an operation-local worker. Authentication
//! is a bearer token taken from configuration; exchanging service-account
//! key files for tokens is the operator's concern.

mod image;
mod instance;
mod oslogin;
mod password;
mod types;

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::de::DeserializeOwned;

use crate::backend::{
    Backend, BackendError, BackendFuture, Image, ImageSpec, InstanceSpec, OsLoginProfile, Pending,
    WindowsKeyRequest,
};
use crate::config::BuildConfig;
use types::{Operation, WireErrorEnvelope};

/// Default public endpoint of the compute API.
const DEFAULT_COMPUTE_BASE: &str = "https://compute.googleapis.com/compute/v1";
/// Default public endpoint of the OS Login API.
const DEFAULT_OSLOGIN_BASE: &str = "https://oslogin.googleapis.com/v1";
/// Spacing between operation and status polls.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Compute backend for one project.
#[derive(Clone)]
pub struct GceBackend {
    http: reqwest::Client,
    project: String,
    token: String,
    compute_base: String,
    oslogin_base: String,
    poll_interval: Duration,
}

impl GceBackend {
    /// Constructs a backend from a prepared configuration.
    ///
    /// # Errors
    ///
    /// Returns [`BackendError::Validation`] when no auth token is
    /// configured.
    pub fn new(config: &BuildConfig) -> Result<Self, BackendError> {
        let token = config
            .auth_token
            .clone()
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| {
                BackendError::Validation(String::from(
                    "an auth_token is required to reach the compute API",
                ))
            })?;
        Ok(Self {
            http: reqwest::Client::new(),
            project: config.project_id.clone(),
            token,
            compute_base: DEFAULT_COMPUTE_BASE.to_owned(),
            oslogin_base: DEFAULT_OSLOGIN_BASE.to_owned(),
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Overrides the API endpoints, for tests and private deployments.
    #[must_use]
    pub fn with_endpoints(mut self, compute_base: &str, oslogin_base: &str) -> Self {
        self.compute_base = compute_base.trim_end_matches('/').to_owned();
        self.oslogin_base = oslogin_base.trim_end_matches('/').to_owned();
        self
    }

    pub(crate) fn project_url(&self, suffix: &str) -> String {
        format!("{}/projects/{}/{suffix}", self.compute_base, self.project)
    }

    pub(crate) async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, BackendError> {
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        Self::decode(response).await
    }

    pub(crate) async fn post_json<T: DeserializeOwned, B: serde::Serialize + Sync>(
        &self,
        url: &str,
        body: &B,
    ) -> Result<T, BackendError> {
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(body)
            .send()
            .await?;
        Self::decode(response).await
    }

    pub(crate) async fn delete_json<T: DeserializeOwned>(
        &self,
        url: &str,
    ) -> Result<T, BackendError> {
        let response = self
            .http
            .delete(url)
            .bearer_auth(&self.token)
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, BackendError> {
        let status = response.status();
        let body = response.bytes().await?;
        if status.is_success() {
            return serde_json::from_slice(&body).map_err(|err| BackendError::Provider {
                message: format!("failed to decode API response: {err}"),
            });
        }
        let message = serde_json::from_slice::<WireErrorEnvelope>(&body).map_or_else(
            |_| String::from_utf8_lossy(&body).into_owned(),
            |envelope| envelope.error.message,
        );
        Err(BackendError::Provider {
            message: format!("{status}: {message}"),
        })
    }

    /// Polls a zone-scoped operation until it is done, surfacing any error
    /// the operation carries.
    pub(crate) async fn wait_zone_operation(
        &self,
        zone: &str,
        name: &str,
    ) -> Result<(), BackendError> {
        let url = self.project_url(&format!("zones/{zone}/operations/{name}"));
        self.wait_operation(&url).await
    }

    /// Polls a global operation until it is done.
    pub(crate) async fn wait_global_operation(&self, name: &str) -> Result<(), BackendError> {
        let url = self.project_url(&format!("global/operations/{name}"));
        self.wait_operation(&url).await
    }

    async fn wait_operation(&self, url: &str) -> Result<(), BackendError> {
        loop {
            let operation: Operation = self.get_json(url).await?;
            if operation.status == "DONE" {
                return match operation.error {
                    Some(errors) => Err(BackendError::Provider {
                        message: errors.joined(),
                    }),
                    None => Ok(()),
                };
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

impl Backend for GceBackend {
    fn run_instance<'a>(&'a self, spec: InstanceSpec) -> BackendFuture<'a, Pending<()>> {
        Box::pin(async move { instance::run_instance(self, spec).await })
    }

    fn delete_instance<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, Pending<()>> {
        Box::pin(async move {
            let url = self.project_url(&format!("zones/{zone}/instances/{name}"));
            let operation: Operation = self.delete_json(&url).await?;
            let backend = self.clone();
            let zone_owned = zone.to_owned();
            Ok(Pending::spawn(async move {
                backend
                    .wait_zone_operation(&zone_owned, &operation.name)
                    .await
            }))
        })
    }

    fn delete_disk<'a>(&'a self, zone: &'a str, name: &'a str) -> BackendFuture<'a, Pending<()>> {
        Box::pin(async move {
            let url = self.project_url(&format!("zones/{zone}/disks/{name}"));
            let operation: Operation = self.delete_json(&url).await?;
            let backend = self.clone();
            let zone_owned = zone.to_owned();
            Ok(Pending::spawn(async move {
                backend
                    .wait_zone_operation(&zone_owned, &operation.name)
                    .await
            }))
        })
    }

    fn create_image(&self, spec: ImageSpec) -> Pending<Image> {
        let backend = self.clone();
        Pending::spawn(async move { image::create_image(&backend, spec).await })
    }

    fn delete_image(&self, name: &str) -> Pending<()> {
        let backend = self.clone();
        let name_owned = name.to_owned();
        Pending::spawn(async move { image::delete_image(&backend, &name_owned).await })
    }

    fn wait_for_instance(&self, status: &str, zone: &str, name: &str) -> Pending<()> {
        let backend = self.clone();
        let target = status.to_owned();
        let zone_owned = zone.to_owned();
        let name_owned = name.to_owned();
        Pending::spawn(async move {
            instance::wait_for_status(&backend, &target, &zone_owned, &name_owned).await
        })
    }

    fn get_image<'a>(&'a self, name: &'a str, from_family: bool) -> BackendFuture<'a, Image> {
        Box::pin(async move { image::get_image(self, name, from_family).await })
    }

    fn get_image_from_project<'a>(
        &'a self,
        project: &'a str,
        name: &'a str,
        from_family: bool,
    ) -> BackendFuture<'a, Image> {
        Box::pin(async move { image::get_image_from_project(self, project, name, from_family).await })
    }

    fn image_exists<'a>(&'a self, name: &'a str) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            // Any lookup failure counts as "does not exist". The pre-flight
            // check depends on this lenient reading.
            image::get_image_from_project(self, &self.project, name, false)
                .await
                .is_ok()
        })
    }

    fn get_nat_ip<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move { instance::nat_ip(self, zone, name).await })
    }

    fn get_internal_ip<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move { instance::internal_ip(self, zone, name).await })
    }

    fn get_instance_metadata<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
        key: &'a str,
    ) -> BackendFuture<'a, Option<String>> {
        Box::pin(async move { instance::metadata_value(self, zone, name, key).await })
    }

    fn get_serial_port_output<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
    ) -> BackendFuture<'a, String> {
        Box::pin(async move { instance::serial_output(self, zone, name, 1).await })
    }

    fn reset_windows_password<'a>(
        &'a self,
        zone: &'a str,
        name: &'a str,
        request: WindowsKeyRequest,
    ) -> BackendFuture<'a, Pending<String>> {
        Box::pin(async move { password::reset_windows_password(self, zone, name, request).await })
    }

    fn import_os_login_key<'a>(
        &'a self,
        account: &'a str,
        public_key: &'a str,
    ) -> BackendFuture<'a, OsLoginProfile> {
        Box::pin(async move { oslogin::import_key(self, account, public_key).await })
    }

    fn delete_os_login_key<'a>(
        &'a self,
        account: &'a str,
        fingerprint: &'a str,
    ) -> BackendFuture<'a, ()> {
        Box::pin(async move { oslogin::delete_key(self, account, fingerprint).await })
    }
}
