//! Command-line interface definitions for the `kiln` binary.
//!
//! This module centralises the clap parser structures so both the main
//! binary and the build script can reuse them when generating the manual
//! page.

use clap::Parser;

/// Top-level CLI for the `kiln` binary.
#[derive(Debug, Parser)]
#[command(
    name = "kiln",
    about = "Bake reusable machine images from temporary cloud instances",
    arg_required_else_help = true
)]
pub(crate) enum Cli {
    /// Run one image build from the merged configuration.
    #[command(name = "build", about = "Provision, configure, and capture an image")]
    Build(BuildCommand),
}

/// Arguments for the `kiln build` subcommand.
#[derive(Debug, Parser)]
pub(crate) struct BuildCommand {
    /// Override the name of the produced image for this run.
    #[arg(long, value_name = "NAME")]
    pub(crate) image_name: Option<String>,
    /// Override the target zone for this run.
    #[arg(long, value_name = "ZONE")]
    pub(crate) zone: Option<String>,
    /// Override the source image for this run.
    #[arg(long, value_name = "IMAGE")]
    pub(crate) source_image: Option<String>,
    /// Suppress build narration; only errors are printed.
    #[arg(long)]
    pub(crate) quiet: bool,
}
