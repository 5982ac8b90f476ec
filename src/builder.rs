//! Build assembly and execution.
//!
//! The builder turns a prepared configuration into the ordered step list,
//! runs it through the step runner, and converts the final context into an
//! [`Artifact`] or the first halting error.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::artifact::Artifact;
use crate::backend::Backend;
use crate::config::BuildConfig;
use crate::context::{BuildContext, BuildError};
use crate::steps::{
    CheckExistingImage, ConditionalStep, CreateImage, CreateInstance, CreateSshKey,
    CreateWindowsPassword, ImportOsLoginKey, InstanceInfo, StartTunnel, Step, TeardownInstance,
    WaitStartupScript, run_steps,
};
use crate::tunnel::native_launcher;
use crate::ui::Ui;

/// Orchestrates one image build.
pub struct Builder {
    config: BuildConfig,
    rsa_bits: usize,
}

impl Builder {
    /// Prepares the configuration and creates a builder for it.
    ///
    /// # Errors
    ///
    /// Returns [`crate::config::ConfigError`] when the configuration is
    /// invalid.
    pub fn new(config: BuildConfig) -> Result<Self, crate::config::ConfigError> {
        Ok(Self {
            config: config.prepare()?,
            rsa_bits: crate::keys::DEFAULT_RSA_BITS,
        })
    }

    /// Overrides the size of generated RSA keys.
    ///
    /// This is primarily used by tests, where full-size key generation
    /// dominates the runtime.
    #[must_use]
    pub const fn with_rsa_bits(mut self, bits: usize) -> Self {
        self.rsa_bits = bits;
        self
    }

    /// The prepared configuration this builder runs with.
    #[must_use]
    pub fn config(&self) -> &BuildConfig {
        &self.config
    }

    /// Assembles the step list for this configuration.
    ///
    /// Conditional stages are decided here, once: OS Login registration,
    /// the IAP tunnel, and the startup-script wait only join the pipeline
    /// when the configuration calls for them.
    fn assemble_steps(&self) -> Vec<Box<dyn Step>> {
        let config = &self.config;
        vec![
            Box::new(CheckExistingImage),
            Box::new(CreateSshKey::with_bits(self.rsa_bits)),
            Box::new(ConditionalStep::new(
                config.use_os_login,
                Box::new(ImportOsLoginKey),
            )),
            Box::new(CreateInstance),
            Box::new(CreateWindowsPassword::with_bits(self.rsa_bits)),
            Box::new(InstanceInfo),
            Box::new(ConditionalStep::new(
                config.iap().enabled,
                Box::new(StartTunnel::new(native_launcher())),
            )),
            Box::new(ConditionalStep::new(
                config.waits_on_startup_script(),
                Box::new(WaitStartupScript::default()),
            )),
            Box::new(TeardownInstance),
            Box::new(CreateImage),
        ]
    }

    /// Runs the build to completion.
    ///
    /// # Errors
    ///
    /// Returns the first halting error, or [`BuildError::NoImageProduced`]
    /// when the pipeline ends without either an image or an error; the
    /// latter always indicates a sequencing bug and is logged as such.
    pub async fn run(
        &self,
        backend: Arc<dyn Backend>,
        ui: Arc<dyn Ui>,
        cancel: CancellationToken,
    ) -> Result<Artifact, BuildError> {
        let mut ctx = BuildContext::new(
            self.config.clone(),
            Arc::clone(&backend),
            ui,
            cancel.clone(),
        )?;
        let mut steps = self.assemble_steps();

        run_steps(&cancel, &mut steps, &mut ctx).await;

        if let Some(error) = ctx.error.take() {
            return Err(error);
        }
        let Some(image) = ctx.image.take() else {
            tracing::warn!("pipeline finished without an image or an error");
            return Err(BuildError::NoImageProduced);
        };

        let mut data = serde_json::Map::new();
        data.insert(
            String::from("image_name"),
            Value::String(image.name.clone()),
        );
        data.insert(
            String::from("image_self_link"),
            Value::String(image.self_link.clone()),
        );
        data.insert(
            String::from("project_id"),
            Value::String(self.config.project_id.clone()),
        );
        data.insert(
            String::from("zone"),
            Value::String(self.config.zone.clone()),
        );
        if let Some(ip) = ctx.instance_ip.take() {
            data.insert(String::from("instance_ip"), Value::String(ip));
        }
        if let Some(log) = ctx.instance_log.take() {
            data.insert(String::from("instance_log"), Value::String(log));
        }

        Ok(Artifact::new(image, backend, Some(data)))
    }
}
