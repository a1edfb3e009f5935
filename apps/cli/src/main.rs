mod commands;

use clap::{Parser, Subcommand};
use rhizome::config::LOG_ENV;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rhizome")]
#[command(about = "Incremental static site builder", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the site, regenerating only what changed
    Build {
        #[arg(long, short)]
        input: Option<PathBuf>,

        #[arg(long, short)]
        output: Option<PathBuf>,

        /// Configuration profile from `[profiles.<name>]`
        #[arg(long)]
        profile: Option<String>,

        /// Number of render workers
        #[arg(long, short)]
        jobs: Option<usize>,

        /// Ignore the cache and rebuild every unit
        #[arg(long)]
        force: bool,
    },
    /// Rebuild whenever a source changes
    Watch {
        #[arg(long, short)]
        input: Option<PathBuf>,

        #[arg(long, short)]
        output: Option<PathBuf>,

        #[arg(long)]
        profile: Option<String>,

        #[arg(long, short)]
        jobs: Option<usize>,
    },
    /// Remove the build cache
    Clean {
        #[arg(long, short)]
        input: Option<PathBuf>,

        /// Remove the output directory as well
        #[arg(long)]
        output: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| match cli.verbose {
        0 => EnvFilter::new("rhizome=warn"),
        1 => EnvFilter::new("rhizome=info"),
        _ => EnvFilter::new("rhizome=debug"),
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .without_time()
        .init();

    let result = match cli.command {
        Commands::Build {
            input,
            output,
            profile,
            jobs,
            force,
        } => commands::build_site(&commands::BuildOptions {
            input,
            output,
            profile,
            jobs,
            force,
        }),
        Commands::Watch {
            input,
            output,
            profile,
            jobs,
        } => commands::watch_site(&commands::BuildOptions {
            input,
            output,
            profile,
            jobs,
            force: false,
        }),
        Commands::Clean { input, output } => commands::clean_site(input.as_deref(), output),
    };

    match result {
        Ok(code) => code,
        Err(error) => {
            eprintln!("Error: {error}");
            ExitCode::FAILURE
        }
    }
}
