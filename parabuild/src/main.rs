//! parabuild CLI
//!
//! # Usage
//!
//! ```bash
//! # Build everything a manifest describes
//! parabuild build parabuild.build.toml --jobs 8
//!
//! # Show the compile and link commands without running them
//! parabuild plan parabuild.build.toml
//!
//! # Run an arbitrary task list
//! parabuild run tasks.json --keep-going
//!
//! # Find the C and C++ compilers
//! parabuild detect
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use parabuild::commands::{self, Overrides};
use parabuild_ipc::DEFAULT_MAX_PAYLOAD;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "parabuild")]
#[command(about = "Parallel C/C++ build runner", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Worker processes to run in parallel
    #[arg(short, long, global = true)]
    jobs: Option<usize>,

    /// Keep running tasks after one fails
    #[arg(short, long, global = true)]
    keep_going: bool,

    /// Drop a worker silent for this many seconds (0 disables)
    #[arg(long, global = true, value_name = "SECS")]
    liveness_timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the tasks listed in a JSON file
    Run {
        /// JSON array of tasks
        tasks: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Compile and link the binaries of a manifest
    Build {
        /// Build manifest
        #[arg(default_value = "parabuild.build.toml")]
        manifest: PathBuf,
    },

    /// Print the commands a build would run, as JSON
    Plan {
        /// Build manifest
        #[arg(default_value = "parabuild.build.toml")]
        manifest: PathBuf,
    },

    /// Find a working C and C++ compiler
    Detect {
        /// Only the C compiler
        #[arg(long)]
        cc: bool,

        /// Only the C++ compiler
        #[arg(long)]
        cxx: bool,
    },

    /// Configuration management
    #[command(subcommand)]
    Config(ConfigCommands),

    /// Internal command run by worker processes (hidden)
    #[command(hide = true)]
    #[command(name = "internal-worker")]
    InternalWorker {
        #[arg(long, default_value_t = DEFAULT_MAX_PAYLOAD)]
        max_frame_bytes: usize,
    },
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Show the effective settings
    Show,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();

    // Workers load no settings and stay quiet unless asked.
    if let Commands::InternalWorker { max_frame_bytes } = cli.command {
        init_logging(cli.verbose, "warn");
        return commands::internal_worker(max_frame_bytes);
    }

    let overrides = Overrides {
        jobs: cli.jobs,
        keep_going: cli.keep_going,
        liveness_timeout: cli.liveness_timeout,
    };
    let settings = commands::load_settings(&overrides)?;
    init_logging(cli.verbose, &settings.log_level);

    match cli.command {
        Commands::Run { tasks, json } => commands::run(&tasks, &settings, cli.verbose, json),
        Commands::Build { manifest } => commands::build(&manifest, &settings, cli.verbose),
        Commands::Plan { manifest } => commands::print_plan(&manifest, &settings),
        Commands::Detect { cc, cxx } => commands::detect(cc, cxx),
        Commands::Config(ConfigCommands::Show) => commands::show_config(&settings),
        Commands::InternalWorker { .. } => unreachable!("handled above"),
    }
}

fn init_logging(verbose: bool, level: &str) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = if verbose {
        EnvFilter::new("parabuild=debug,info")
    } else {
        EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("parabuild={},warn", level)))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}
