mod commands;
mod progress;
mod summary;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meridian", about = "Volumetric template registration tool")]
#[command(version)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register every volume in a directory to a common template
    Register(commands::register::RegisterArgs),
    /// Register a single volume to a template
    RegisterOne(commands::register_one::RegisterOneArgs),
    /// Build or select a template from a directory of volumes
    Template(commands::template::TemplateArgs),
    /// Print a default configuration file
    Config(commands::config::ConfigArgs),
    /// Show NIfTI header metadata
    Info(commands::info::InfoArgs),
    /// Compute the Jacobian determinant map of a deformation field
    Jacobian(commands::jacobian::JacobianArgs),
    /// Deform a volume with a saved displacement field
    ApplyField(commands::apply_field::ApplyFieldArgs),
    /// Invert a saved displacement field
    InvertField(commands::invert_field::InvertFieldArgs),
    /// Compose two saved displacement fields into one
    ComposeFields(commands::compose_fields::ComposeFieldsArgs),
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match &cli.command {
        Commands::Register(args) => commands::register::run(args),
        Commands::RegisterOne(args) => commands::register_one::run(args),
        Commands::Template(args) => commands::template::run(args),
        Commands::Config(args) => commands::config::run(args),
        Commands::Info(args) => commands::info::run(args),
        Commands::Jacobian(args) => commands::jacobian::run(args),
        Commands::ApplyField(args) => commands::apply_field::run(args),
        Commands::InvertField(args) => commands::invert_field::run(args),
        Commands::ComposeFields(args) => commands::compose_fields::run(args),
    }
}
