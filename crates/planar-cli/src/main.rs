//! Planar Command-Line Interface
//!
//! Ships per-plane imaging jobs to a remote batch cluster.
//!
//! ```text
//! planar send /mnt/lab/run1/suite2p --host login1.cluster.org --username alice \
//!     --remote-root /groups/lab
//! ```

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{command, script, send, version};

/// Planar - per-plane job dispatch to remote batch clusters
#[derive(Parser)]
#[command(name = "planar")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy every plane of a save folder to the cluster and submit one job per plane
    Send {
        /// Local save folder containing plane0, plane1, ...
        save_folder: PathBuf,

        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Cluster login host
        #[arg(long)]
        host: Option<String>,

        /// SSH port
        #[arg(long)]
        port: Option<u16>,

        /// Login name
        #[arg(short, long)]
        username: Option<String>,

        /// Login password
        #[arg(long, env = "PLANAR_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// Root on the cluster that mirrors the local root
        #[arg(long)]
        remote_root: Option<String>,

        /// Local root used when a descriptor has no save_path0
        #[arg(long)]
        local_root: Option<PathBuf>,

        /// Cores requested per plane
        #[arg(short, long)]
        n_cores: Option<u32>,

        /// Conda environment activated on the cluster
        #[arg(long)]
        env_name: Option<String>,

        /// Memory units per started gigabyte of binary data
        #[arg(long)]
        mem_multiplier: Option<u32>,

        /// Extra scheduler arguments, passed through verbatim
        #[arg(long, allow_hyphen_values = true)]
        scheduler_args: Option<String>,

        /// Scheduler submission program
        #[arg(long)]
        submit_command: Option<String>,

        /// Job-name prefix
        #[arg(long)]
        job_name: Option<String>,

        /// known_hosts file used to verify the cluster's host key
        #[arg(long)]
        known_hosts: Option<PathBuf>,

        /// Print the dispatch report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the bootstrap script staged on the cluster
    Script {
        /// Conda environment to activate
        #[arg(long, default_value = "suite2p")]
        env_name: String,

        /// Command run with the descriptor path
        #[arg(long)]
        entry_point: Option<String>,

        /// Write the script to this directory instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Preview the submission command for one plane
    Command {
        /// Plane index
        #[arg(short, long)]
        plane: u32,

        /// Size of the plane's binary in bytes
        #[arg(short, long)]
        size: u64,

        /// Remote descriptor path
        #[arg(long)]
        ops_path: String,

        /// Remote home directory
        #[arg(long, default_value = "~")]
        home: String,

        /// YAML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_target(false)
        .init();

    // Execute command
    let result = match cli.command {
        Commands::Send {
            save_folder,
            config,
            host,
            port,
            username,
            password,
            remote_root,
            local_root,
            n_cores,
            env_name,
            mem_multiplier,
            scheduler_args,
            submit_command,
            job_name,
            known_hosts,
            json,
        } => {
            let overrides = send::Overrides {
                host,
                port,
                username,
                password,
                remote_root,
                local_root,
                n_cores,
                env_name,
                mem_multiplier,
                scheduler_args,
                submit_command,
                job_name,
            };
            send::execute(
                &save_folder,
                config.as_deref(),
                overrides,
                known_hosts,
                json,
            )
            .await
        }

        Commands::Script {
            env_name,
            entry_point,
            output,
        } => script::execute(&env_name, entry_point.as_deref(), output.as_deref()).await,

        Commands::Command {
            plane,
            size,
            ops_path,
            home,
            config,
        } => command::execute(plane, size, &ops_path, &home, config.as_deref()),

        Commands::Version => {
            version::execute();
            Ok(())
        }
    };

    // Handle errors
    if let Err(e) = result {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}
