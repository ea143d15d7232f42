//! kiln - container-native build runner

use clap::{Parser, Subcommand};
use kiln_config::{BuildSpec, DEFAULT_BUILD_FILE};
use kiln_core::{version, BuildWorker, Lifecycle, Phase};
use kiln_engine::DockerEngine;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "Container-native build runner", long_about = None)]
struct Cli {
    /// Build file
    #[arg(short = 'f', long = "file", global = true, default_value = DEFAULT_BUILD_FILE)]
    file: PathBuf,

    /// Container engine URI
    #[arg(long, global = true, default_value = "unix:///var/run/docker.sock")]
    uri: String,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse the build file and resolve the run configuration
    Configure,

    /// Create the run network and start service containers
    Setup,

    /// Run the build steps (setup and teardown included)
    Build,

    /// Build artifact images
    Artifacts {
        /// Artifact names (all if not specified)
        names: Vec<String>,
    },

    /// Push artifact images to their registries
    Publish {
        /// Artifact names (all if not specified)
        names: Vec<String>,
    },

    /// Remove everything a run created
    Teardown,

    /// Write a starter build file for the current directory
    Init,

    /// Print the version resolved from the repository
    AppVersion,

    /// Print a `variables:` entry from the build file
    Var {
        /// Variable name
        key: String,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    // Commands that need neither the build file nor an engine
    match &cli.command {
        Some(Commands::Init) => return init(&cli.file),
        Some(Commands::AppVersion) => {
            let cwd = std::env::current_dir()?;
            println!("{}", version::resolve(&cwd).version());
            return Ok(());
        }
        Some(Commands::Var { key }) => {
            let spec = BuildSpec::load(&cli.file)?;
            println!("{}", spec.variable(key)?);
            return Ok(());
        }
        _ => {}
    }

    let spec = BuildSpec::load(&cli.file)?;

    let engine = DockerEngine::new(&cli.uri).await?;
    let worker = BuildWorker::new(Arc::new(engine));
    let mut lifecycle = Lifecycle::new(Box::new(worker));

    // First interrupt requests a graceful abort
    let abort = lifecycle.abort_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupt received. Aborting...");
            abort.abort();
        }
    });

    match cli.command {
        None => lifecycle.run(spec).await?,
        Some(Commands::Configure) => lifecycle.run_target(spec, Phase::Configure, &[]).await?,
        Some(Commands::Setup) => lifecycle.run_target(spec, Phase::Setup, &[]).await?,
        Some(Commands::Build) => lifecycle.run_target(spec, Phase::Build, &[]).await?,
        Some(Commands::Artifacts { names }) => {
            lifecycle.run_target(spec, Phase::Artifacts, &names).await?
        }
        Some(Commands::Publish { names }) => {
            lifecycle.run_target(spec, Phase::Publish, &names).await?
        }
        Some(Commands::Teardown) => lifecycle.run_target(spec, Phase::Teardown, &[]).await?,
        Some(Commands::Init) | Some(Commands::AppVersion) | Some(Commands::Var { .. }) => {
            unreachable!() // handled above
        }
    }

    Ok(())
}

/// Write a starter build file, refusing to overwrite an existing one
fn init(path: &Path) -> anyhow::Result<()> {
    if path.exists() {
        anyhow::bail!("{} already exists", path.display());
    }
    let cwd = std::env::current_dir()?;
    let name = cwd
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "app".to_string());

    kiln_config::write_starter_build_file(path, &name)?;
    println!("Wrote {}", path.display());
    Ok(())
}
