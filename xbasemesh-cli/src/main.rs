//! XBaseMesh CLI - build X-Plane 12 base-mesh DSF tiles from DEM rasters.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "xbasemesh",
    version,
    about = "Build X-Plane 12 base-mesh DSF tiles from arbitrary DEM rasters"
)]
struct Cli {
    /// Config file (defaults to xbasemesh.ini in the working directory).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Tool-paths JSON file (overrides config and the default location).
    #[arg(long, global = true)]
    tool_paths: Option<PathBuf>,

    /// Emit machine-readable JSON lines for diagnostics and summaries.
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Build DSF tiles from DEM inputs.
    Build(commands::build::BuildArgs),
    /// Rebuild selected tiles with patch DEMs.
    Patch(commands::patch::PatchArgs),
    /// Validate DSFs in an existing scenery tree.
    Validate(commands::validate::ValidateArgs),
    /// Manage the normalization cache.
    Cache(commands::cache::CacheArgs),
    /// Show resolved tool commands and versions.
    Tools(commands::tools::ToolsArgs),
}

fn main() {
    let cli = Cli::parse();
    let common = commands::common::Common {
        config: cli.config,
        tool_paths: cli.tool_paths,
        json_logs: cli.json_logs,
    };

    let code = match cli.command {
        Command::Build(args) => commands::build::run(&common, args),
        Command::Patch(args) => commands::patch::run(&common, args),
        Command::Validate(args) => commands::validate::run(&common, args),
        Command::Cache(args) => commands::cache::run(&common, args),
        Command::Tools(args) => commands::tools::run(&common, args),
    };
    std::process::exit(code);
}
