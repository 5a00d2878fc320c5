//! shellvisor command line
//!
//! Usage:
//!   shellvisor serve --bind 0.0.0.0:9527 --executable docker
//!   shellvisor run --config shellvisor.toml --task "count the files in /etc" --workers 4

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shellvisor::agent::{run_batch, TaskSettings};
use shellvisor::config::AppConfig;
use shellvisor::model::OllamaModel;
use shellvisor::sandbox::{serve, DockerCli, ServerConfig};
use shellvisor::telemetry::{init_tracing, shutdown_tracing};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(version, about = "LLM shell agents in remote sandboxes")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// OTLP collector endpoint for span export (e.g., http://localhost:4317)
    #[arg(long, global = true, env = "SHELLVISOR_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the sandbox server
    Serve {
        #[arg(long, default_value = "0.0.0.0:9527")]
        bind: SocketAddr,

        /// Docker-compatible CLI used to manage containers
        #[arg(long, env = "SHELLVISOR_DOCKER_EXECUTABLE", default_value = "docker")]
        executable: String,
    },

    /// Run agent tasks against a sandbox server
    Run {
        /// TOML configuration file
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,

        /// Overrides `[sandbox].server_url`
        #[arg(long)]
        server_url: Option<String>,

        /// Overrides `[sandbox].image`
        #[arg(long)]
        image: Option<String>,

        /// Overrides `[model].model`
        #[arg(long, short = 'm')]
        model: Option<String>,

        /// Task to solve; repeat for a batch
        #[arg(long = "task", short = 't', required = true)]
        tasks: Vec<String>,

        /// Tasks run concurrently
        #[arg(long, short = 'w', default_value_t = 1)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_tracing("shellvisor", cli.otlp_endpoint.as_deref(), cli.log_json) {
        eprintln!("shellvisor: failed to initialize tracing: {e}");
        std::process::exit(1);
    }

    let result = match cli.command {
        Command::Serve { bind, executable } => serve_command(bind, executable).await,
        Command::Run {
            config,
            server_url,
            image,
            model,
            tasks,
            workers,
        } => run_command(config, server_url, image, model, tasks, workers).await,
    };

    shutdown_tracing();
    if let Err(e) = result {
        eprintln!("shellvisor: {e}");
        std::process::exit(1);
    }
}

async fn serve_command(bind: SocketAddr, executable: String) -> Result<(), BoxError> {
    let runtime = Arc::new(DockerCli::new(executable.clone()));
    serve(&ServerConfig { bind, executable }, runtime).await?;
    Ok(())
}

async fn run_command(
    config_path: Option<PathBuf>,
    server_url: Option<String>,
    image: Option<String>,
    model: Option<String>,
    tasks: Vec<String>,
    workers: usize,
) -> Result<(), BoxError> {
    let mut config = match config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    if let Some(url) = server_url {
        config.sandbox.server_url = url;
    }
    if let Some(image) = image {
        config.sandbox.container.image = image;
    }
    if let Some(model) = model {
        config.model.model = model;
    }
    if config.sandbox.container.image.is_empty() {
        return Err("no sandbox image configured (set [sandbox].image or pass --image)".into());
    }

    let settings = TaskSettings {
        model: Arc::new(OllamaModel::new(config.model.clone())?),
        agent: Arc::new(config.agent.clone()),
        client: config.sandbox.client_config(),
        startup_command: config.sandbox.startup_command.clone(),
    };

    let mut failed = 0;
    for report in run_batch(settings, tasks, workers).await {
        if report.status == "error" || report.status == "panic" {
            failed += 1;
        }
        println!("{}", serde_json::to_string(&report)?);
    }

    if failed > 0 {
        return Err(format!("{failed} task(s) did not finish").into());
    }
    Ok(())
}
