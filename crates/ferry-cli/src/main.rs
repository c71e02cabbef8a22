//! Ferry CLI - run fy scripts in isolated contexts.

mod session;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use session::{Session, SessionOptions};

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Run fy scripts and modules in isolated contexts")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Bridge configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Per-action timeout in milliseconds (0 disables it)
    #[arg(long, global = true)]
    timeout_ms: Option<u64>,

    /// Directory modules and named scripts are looked up in
    #[arg(long, global = true)]
    root: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate a script and print its completion value
    Eval {
        /// Script source
        code: String,

        /// Arguments visible to the script as `argv`
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Evaluate a module file, including everything it imports
    Run {
        /// Path to the module (.fy file)
        module: PathBuf,

        /// Arguments visible to the module as `argv`
        #[arg(trailing_var_arg = true)]
        args: Vec<String>,
    },

    /// Import a module by specifier for its side effects
    Import {
        /// Module specifier, resolved against the root directory
        specifier: String,
    },

    /// Run a named script from the root directory
    Load {
        /// Script name (with or without the .fy extension)
        name: String,
    },

    /// Evaluate a script in several workers at once
    Workers {
        /// Script source, run once in every worker
        code: String,

        /// Number of workers to spawn
        #[arg(short = 'n', long, default_value = "2")]
        count: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::from_default_env()
            .add_directive(tracing::Level::DEBUG.into())
    } else {
        tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // Helper to format ferry-core errors with recovery hints
    let format_error = |err: anyhow::Error| -> anyhow::Error {
        if let Some(ferry_err) = err.downcast_ref::<ferry_core::Error>() {
            anyhow::anyhow!("{}", ferry_err.with_hint())
        } else {
            err
        }
    };

    let options = SessionOptions {
        config: cli.config,
        timeout_ms: cli.timeout_ms,
        root: cli.root,
    };

    match cli.command {
        Commands::Eval { code, args } => {
            let session = Session::start(&options, args).await.map_err(format_error)?;
            session.eval(code).await.map_err(format_error)?;
        }

        Commands::Run { module, args } => {
            session::run_module(&options, &module, args)
                .await
                .map_err(format_error)?;
        }

        Commands::Import { specifier } => {
            let session = Session::start(&options, Vec::new()).await.map_err(format_error)?;
            session.import(specifier).await.map_err(format_error)?;
        }

        Commands::Load { name } => {
            let session = Session::start(&options, Vec::new()).await.map_err(format_error)?;
            session.load(name).await.map_err(format_error)?;
        }

        Commands::Workers { code, count } => {
            if count == 0 {
                anyhow::bail!("--count must be at least 1");
            }
            let session = Session::start(&options, Vec::new()).await.map_err(format_error)?;
            session.workers(code, count).await.map_err(format_error)?;
        }
    }

    Ok(())
}
