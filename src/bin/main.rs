//! Runner Pool CLI

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use runner_pool::config::{self, resolve_runner_version};
use runner_pool::image::{build_args, ImageProvisioner};
use runner_pool::{shutdown, Controller, DockerRuntime, Result, Settings};
use tracing_subscriber::filter::{Directive, EnvFilter};

#[derive(Parser)]
#[command(name = "runner-pool")]
#[command(about = "Keeps a fixed-size pool of self-hosted CI runner containers alive")]
#[command(version)]
struct Cli {
    /// Path to the JSON configuration document
    #[arg(
        short,
        long,
        global = true,
        env = "LOCAL_RUNNER_CONTROLLER_CONFIG_PATH",
        default_value = "config.json"
    )]
    config: PathBuf,

    /// Default log level for this crate; RUST_LOG directives still apply
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the controller until SIGINT/SIGTERM (default)
    Run,
    /// Validate the configuration and print the derived pool settings
    Check,
    /// Build the worker image unconditionally
    Build,
}

fn init_logging(level: &str) {
    let mut filter = EnvFilter::from_default_env();
    match format!("runner_pool={}", level).parse::<Directive>() {
        Ok(directive) => filter = filter.add_directive(directive),
        Err(e) => eprintln!("Ignoring invalid log level {:?}: {}", level, e),
    }

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => cmd_run(&cli.config).await,
        Commands::Check => cmd_check(&cli.config),
        Commands::Build => cmd_build(&cli.config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            if e.is_startup_fatal() {
                tracing::error!(error = %e, "Startup failed");
            } else {
                tracing::error!(error = %e, "Controller stopped");
            }
            ExitCode::FAILURE
        }
    }
}

async fn cmd_run(config: &Path) -> Result<()> {
    let settings = Settings::load(config)?;
    tracing::info!(config = %config.display(), host = %settings.container_host, "Configuration loaded");

    let runtime = Arc::new(DockerRuntime::connect(&settings.container_host)?);
    let controller = Controller::start(settings, runtime).await?;
    let signal = shutdown::termination_signal()?;
    controller.run(signal).await
}

fn cmd_check(config: &Path) -> Result<()> {
    let settings = Settings::load(config)?;
    let spec = &settings.runner;

    println!("Runner target: {}", spec.target);
    println!("  Auth:        {}", if spec.auth.is_app() { "app" } else { "token" });
    println!("  Labels:      {}", spec.labels.join(","));
    println!("  Image:       {}", spec.image_reference());
    println!("  Dockerfile:  {}", settings.dockerfiles_dir.join(spec.dockerfile_name()).display());
    println!("  Limit:       {}", settings.pool.limit());
    println!("  Runtime:     {}", settings.container_host);
    match settings.drain_timeout {
        Some(timeout) => println!("  Drain:       {}s timeout", timeout.as_secs()),
        None => println!("  Drain:       unbounded"),
    }
    Ok(())
}

async fn cmd_build(config: &Path) -> Result<()> {
    let mut settings = Settings::load(config)?;
    let http = config::http_client()?;
    settings.runner.version = resolve_runner_version(&http, &settings.runner.version).await;

    let runtime = Arc::new(DockerRuntime::connect(&settings.container_host)?);
    let spec = &settings.runner;
    let reference = spec.image_reference();

    ImageProvisioner::new(runtime)
        .build(
            &settings.dockerfiles_dir,
            &reference,
            &spec.dockerfile_name(),
            build_args(&spec.version),
        )
        .await?;

    println!("Built {}", reference);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV: &str = "LOCAL_RUNNER_CONTROLLER_CONFIG_PATH";

    #[test]
    fn test_config_path_precedence() {
        std::env::remove_var(ENV);
        let cli = Cli::try_parse_from(["runner-pool"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("config.json"));
        assert!(cli.command.is_none());

        std::env::set_var(ENV, "/etc/runner-pool/env.json");
        let cli = Cli::try_parse_from(["runner-pool", "check"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("/etc/runner-pool/env.json"));
        assert!(matches!(cli.command, Some(Commands::Check)));

        let cli = Cli::try_parse_from(["runner-pool", "--config", "flag.json", "run"]).unwrap();
        assert_eq!(cli.config, PathBuf::from("flag.json"));
        std::env::remove_var(ENV);
    }

    #[test]
    fn test_log_level_flag() {
        let cli = Cli::try_parse_from(["runner-pool", "build", "--log-level", "debug"]).unwrap();
        assert_eq!(cli.log_level, "debug");
        assert!(matches!(cli.command, Some(Commands::Build)));
    }
}
