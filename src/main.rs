//! Binary entry point for the kiln CLI.

use std::io::{self, Write};
use std::process;
use std::sync::Arc;

use clap::Parser;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use kiln::{
    Artifact, BuildConfig, BuildError, Builder, ConfigError, GceBackend, SilentUi, StreamUi, Ui,
};

mod cli;

use cli::{BuildCommand, Cli};

#[derive(Debug, Error)]
enum CliError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Build(#[from] BuildError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match dispatch(cli).await {
        Ok(code) => code,
        Err(err) => {
            report_error(&err);
            1
        }
    };

    process::exit(exit_code);
}

async fn dispatch(cli: Cli) -> Result<i32, CliError> {
    match cli {
        Cli::Build(command) => build_command(command).await,
    }
}

async fn build_command(args: BuildCommand) -> Result<i32, CliError> {
    let mut config = BuildConfig::load_without_cli_args()?;
    apply_overrides(&mut config, &args);

    let builder = Builder::new(config)?;
    let backend =
        GceBackend::new(builder.config()).map_err(|err| CliError::Backend(err.to_string()))?;

    let ui: Arc<dyn Ui> = if args.quiet {
        Arc::new(SilentUi)
    } else {
        Arc::new(StreamUi)
    };

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    let artifact = builder.run(Arc::new(backend), Arc::clone(&ui), cancel).await?;
    report_artifact(&ui, &artifact);
    Ok(0)
}

fn apply_overrides(config: &mut BuildConfig, args: &BuildCommand) {
    if let Some(image_name) = args.image_name.clone() {
        config.image_name = Some(image_name);
    }
    if let Some(zone) = args.zone.clone() {
        config.zone = zone;
        // The region was derived from the old zone; rederive it.
        config.region = None;
    }
    if let Some(source_image) = args.source_image.clone() {
        config.source_image = Some(source_image);
    }
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received, cancelling the build");
            cancel.cancel();
        }
    });
}

fn report_artifact(ui: &Arc<dyn Ui>, artifact: &Artifact) {
    ui.say(&artifact.to_string());
    writeln!(io::stdout(), "{}", artifact.id()).ok();
}

fn report_error(err: &CliError) {
    write_error(io::stderr(), err);
}

fn write_error(mut target: impl Write, err: &CliError) {
    writeln!(target, "{err}").ok();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_args() -> BuildCommand {
        BuildCommand {
            image_name: None,
            zone: None,
            source_image: None,
            quiet: true,
        }
    }

    #[test]
    fn overrides_replace_config_values() {
        let mut config = kiln::test_support::raw_config();
        let mut args = build_args();
        args.image_name = Some(String::from("golden-image"));
        args.zone = Some(String::from("europe-west1-b"));

        apply_overrides(&mut config, &args);
        assert_eq!(config.image_name.as_deref(), Some("golden-image"));
        assert_eq!(config.zone, "europe-west1-b");
        assert!(config.region.is_none());
    }

    #[test]
    fn write_error_renders_the_message() {
        let mut buf = Vec::new();
        let err = CliError::Backend(String::from("token rejected"));
        write_error(&mut buf, &err);
        let rendered = String::from_utf8(buf).unwrap_or_else(|err| panic!("utf8: {err}"));
        assert!(rendered.contains("token rejected"), "rendered: {rendered}");
    }
}
