use clap::{Parser, Subcommand};
use dockbridge_core::{
    CommandSpec, DeployConfig, DeployReport, ExecutionOutcome, Termination, DEFAULT_CONFIG_FILE,
};
use dockbridge_runner::{
    cancel_pair, write_starter_dockerfile, ComposeFile, DockerOrchestrator, ProcessConfig,
    ProcessRunner,
};
use std::path::{Path, PathBuf};
use std::process;
use tracing::info;

#[derive(Parser)]
#[command(name = "dockbridge")]
#[command(about = "Build images and run compose stacks through the docker CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Deployment config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Print results as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that docker and compose are installed
    Check,

    /// Build the project image
    Build {
        /// Image tag (defaults to <project>:latest)
        #[arg(short, long)]
        tag: Option<String>,

        /// Dockerfile path (defaults to the configured one)
        #[arg(short = 'f', long)]
        dockerfile: Option<String>,

        /// Build context (defaults to the configured one)
        #[arg(short, long)]
        context: Option<String>,
    },

    /// Push an image, optionally under a registry prefix
    Push {
        /// Image to push (defaults to <project>:latest)
        image: Option<String>,

        /// Registry prefix (defaults to the configured one)
        #[arg(short, long)]
        registry: Option<String>,
    },

    /// Start compose services
    Up {
        /// Stay attached instead of running detached
        #[arg(long)]
        attached: bool,
    },

    /// Stop compose services
    Down {
        /// Also remove named volumes
        #[arg(short = 'v', long)]
        volumes: bool,
    },

    /// Show compose service status
    Ps,

    /// Show compose logs
    Logs {
        /// Only this service
        service: Option<String>,
    },

    /// Stop and remove all containers, then prune
    Cleanup {
        /// Also remove images
        #[arg(long)]
        images: bool,

        /// Also remove volumes
        #[arg(long)]
        volumes: bool,
    },

    /// Check, build, and start the stack
    Deploy,

    /// Write a config file, a compose file, and a Dockerfile if missing
    Init {
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Run any shell command line with a deadline
    Exec {
        /// Complete shell command line
        command: String,

        /// Deadline in seconds; 0 disables it
        #[arg(short, long, default_value = "0")]
        timeout: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Init { force } = cli.command {
        return init_project(&cli.config, force);
    }

    let config = DeployConfig::load_or_default(&cli.config)
        .map_err(|e| anyhow::anyhow!("Failed to load config {}: {}", cli.config.display(), e))?;

    let (canceller, token) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling running command");
            canceller.cancel();
        }
    });
    let runner = ProcessRunner::new(ProcessConfig::default()).with_cancel_token(token);

    if let Commands::Exec { command, timeout } = &cli.command {
        let spec = CommandSpec::new(command.clone()).with_timeout_secs(*timeout);
        let outcome = runner.run(&spec).await;
        print_outcome(&outcome, cli.json)?;
        process::exit(exec_exit_code(&outcome));
    }

    let mut orchestrator = DockerOrchestrator::new(runner, config);
    let report = match cli.command {
        Commands::Check => orchestrator.check_environment().await,
        Commands::Build {
            tag,
            dockerfile,
            context,
        } => {
            let config = orchestrator.config();
            let tag = tag.unwrap_or_else(|| config.image_tag());
            let dockerfile = dockerfile.unwrap_or_else(|| config.dockerfile_path.clone());
            let context = context.unwrap_or_else(|| config.build_context.clone());
            orchestrator.build_image(&dockerfile, &tag, &context).await
        }
        Commands::Push { image, registry } => {
            let config = orchestrator.config();
            let image = image.unwrap_or_else(|| config.image_tag());
            let registry = registry.or_else(|| config.registry_url.clone());
            orchestrator.push_image(&image, registry.as_deref()).await
        }
        Commands::Up { attached } => orchestrator.compose_up(!attached).await,
        Commands::Down { volumes } => orchestrator.compose_down(volumes).await,
        Commands::Ps => orchestrator.compose_ps().await,
        Commands::Logs { service } => orchestrator.compose_logs(service.as_deref()).await,
        Commands::Cleanup { images, volumes } => orchestrator.cleanup(images, volumes).await,
        Commands::Deploy => orchestrator.deploy().await,
        Commands::Init { .. } | Commands::Exec { .. } => unreachable!("handled above"),
    };

    print_report(&report, cli.json)?;
    if !report.is_success() {
        process::exit(1);
    }

    Ok(())
}

fn init_project(config_path: &Path, force: bool) -> anyhow::Result<()> {
    let config = DeployConfig::default();
    let compose_path = Path::new(&config.compose_file_path);

    for path in [config_path, compose_path] {
        if path.exists() && !force {
            eprintln!("Error: {} already exists", path.display());
            eprintln!("Use --force to overwrite it.");
            process::exit(1);
        }
    }

    config.save(config_path)?;
    println!("✓ Created config at {}", config_path.display());

    let compose = if config.services.is_empty() {
        ComposeFile::default_stack()
    } else {
        ComposeFile::new(config.services.clone())
    };
    compose.write_to(compose_path)?;
    println!("✓ Created compose file at {}", compose_path.display());

    if write_starter_dockerfile(&config.dockerfile_path)? {
        println!("✓ Created Dockerfile at {}", config.dockerfile_path);
    }
    Ok(())
}

/// `timeout(1)` conventions for anything that is not a plain exit.
fn exec_exit_code(outcome: &ExecutionOutcome) -> i32 {
    match outcome.termination {
        Termination::Exited { code } => code,
        Termination::TimedOut => 124,
        Termination::Cancelled => 130,
        Termination::LaunchFailed { .. } | Termination::CaptureFailed { .. } => 125,
    }
}

fn print_outcome(outcome: &ExecutionOutcome, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(outcome)?);
        return Ok(());
    }

    print!("{}", outcome.output);
    if !outcome.output.is_empty() && !outcome.output.ends_with('\n') {
        println!();
    }
    eprintln!("{} ({}ms)", format_termination(&outcome.termination), outcome.duration_ms);
    Ok(())
}

fn print_report(report: &DeployReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!("Operation: {}", report.operation);
    println!("Status: {}", report.status.as_str());

    for (idx, outcome) in report.outcomes.iter().enumerate() {
        println!("\n  {}. {}", idx + 1, outcome.command);
        println!("     Result: {}", format_termination(&outcome.termination));
        if !outcome.output.trim().is_empty() {
            println!("     Output:");
            for line in outcome.output.trim_end().lines() {
                println!("       {}", line);
            }
        }
        println!("     Duration: {}ms", outcome.duration_ms);
    }
    Ok(())
}

fn format_termination(termination: &Termination) -> String {
    match termination {
        Termination::Exited { code } => format!("exited with code {}", code),
        Termination::TimedOut => "timed out".to_string(),
        Termination::Cancelled => "cancelled".to_string(),
        Termination::LaunchFailed { reason } => format!("could not start: {}", reason),
        Termination::CaptureFailed { reason } => format!("capture failed: {}", reason),
    }
}
