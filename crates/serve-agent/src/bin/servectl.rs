//! Command-line front end for servectl

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use serve_agent::{init_logging, ApiResponse, AppContext, ServeApi};
use serve_core::{ExecOptions, ServeConfig};
use serve_lifecycle::{EnvType, ServiceDescriptor};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "servectl")]
#[command(about = "Remote execution and model-serving lifecycle control")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", env = "SERVECTL_CONFIG")]
    config: Option<PathBuf>,

    /// Log level (overrides the configuration file)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Output format
    #[arg(short, long, value_enum, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    /// Plain text where it makes sense, YAML otherwise
    Text,
    /// Pretty-printed JSON response
    Json,
    /// YAML response
    Yaml,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers
    Servers,
    /// Run a shell command on a server
    Exec {
        server: String,

        /// Per-invocation timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Working directory on the server
        #[arg(long)]
        cwd: Option<String>,

        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        command: Vec<String>,
    },
    /// Check connectivity and latency
    Ping { server: String },
    /// List accelerators
    Gpus { server: String },
    /// List processes using accelerators
    #[command(name = "gpu-procs")]
    GpuProcs { server: String },
    /// Terminate processes (SIGTERM, then SIGKILL)
    #[command(name = "gpu-kill")]
    GpuKill {
        server: String,

        #[arg(required = true)]
        pids: Vec<u32>,
    },
    /// Memory, disk and accelerator totals
    Sysinfo { server: String },
    /// Start a service in the background
    Start(ServiceArgs),
    /// Stop a service and everything it spawned
    Stop(ServiceArgs),
    /// Report whether a service is running
    Status(ServiceArgs),
    /// Show the tail of a service log
    Logs {
        #[command(flatten)]
        service: ServiceArgs,

        /// Number of lines
        #[arg(short = 'n', long)]
        lines: Option<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EnvArg {
    System,
    Conda,
    Venv,
}

impl From<EnvArg> for EnvType {
    fn from(env: EnvArg) -> Self {
        match env {
            EnvArg::System => EnvType::System,
            EnvArg::Conda => EnvType::Conda,
            EnvArg::Venv => EnvType::Venv,
        }
    }
}

#[derive(Args)]
struct ServiceArgs {
    /// Server id
    server: String,

    /// Service id
    #[arg(long)]
    id: String,

    /// Start command, as typed in a shell
    #[arg(long = "cmd", value_name = "COMMAND")]
    command: String,

    #[arg(long, value_enum, default_value = "system")]
    env_type: EnvArg,

    /// Conda environment name or venv directory
    #[arg(long)]
    env_name: Option<String>,

    #[arg(long)]
    port: Option<u16>,

    #[arg(long)]
    log_path: Option<String>,

    /// Last known pid
    #[arg(long)]
    pid: Option<u32>,

    #[arg(long)]
    model_path: Option<String>,
}

impl ServiceArgs {
    fn descriptor(&self) -> ServiceDescriptor {
        let mut descriptor = ServiceDescriptor::new(&self.id, &self.server, &self.command);
        if let Some(env_name) = &self.env_name {
            descriptor = descriptor.with_env(self.env_type.into(), env_name);
        }
        if let Some(port) = self.port {
            descriptor = descriptor.with_port(port);
        }
        if let Some(log_path) = &self.log_path {
            descriptor = descriptor.with_log_path(log_path);
        }
        if let Some(pid) = self.pid {
            descriptor = descriptor.with_pid(pid);
        }
        if let Some(model_path) = &self.model_path {
            descriptor = descriptor.with_model_path(model_path);
        }
        descriptor
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ServeConfig::load(cli.config.as_deref())?;
    if let Some(level) = &cli.log_level {
        config.logging.level = level.clone();
    }
    init_logging(&config.logging)?;
    debug!(servers = config.servers.len(), "Configuration loaded");

    let context = Arc::new(AppContext::new(config)?);
    let api = ServeApi::new(Arc::clone(&context));

    let success = run(&api, cli.command, cli.output).await?;
    context.shutdown().await;

    if !success {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(api: &ServeApi, command: Commands, format: OutputFormat) -> Result<bool> {
    match command {
        Commands::Servers => emit(&api.list_servers(), format),
        Commands::Exec {
            server,
            timeout_ms,
            cwd,
            command,
        } => {
            let mut options = ExecOptions::new();
            if let Some(timeout_ms) = timeout_ms {
                options = options.with_timeout_ms(timeout_ms);
            }
            if let Some(cwd) = cwd {
                options = options.with_working_dir(cwd);
            }
            let response = api.execute(&server, &command.join(" "), &options).await;
            if format == OutputFormat::Text {
                if let Some(result) = &response.data {
                    print!("{}", result.stdout);
                    eprint!("{}", result.stderr);
                    return Ok(response.success);
                }
            }
            emit(&response, format)
        }
        Commands::Ping { server } => emit(&api.test_connection(&server).await, format),
        Commands::Gpus { server } => emit(&api.list_accelerators(&server).await, format),
        Commands::GpuProcs { server } => emit(&api.list_accelerator_processes(&server).await, format),
        Commands::GpuKill { server, pids } => {
            info!(server = %server, pids = ?pids, "Killing accelerator processes");
            emit(&api.kill_accelerator_processes(&server, &pids).await, format)
        }
        Commands::Sysinfo { server } => emit(&api.system_info(&server).await, format),
        Commands::Start(service) => emit(&api.start_service(&service.descriptor()).await, format),
        Commands::Stop(service) => emit(&api.stop_service(&service.descriptor()).await, format),
        Commands::Status(service) => emit(&api.service_status(&service.descriptor()).await, format),
        Commands::Logs { service, lines } => {
            let response = api.service_logs(&service.descriptor(), lines).await;
            if format == OutputFormat::Text {
                if let Some(log) = &response.data {
                    print!("{}", log);
                    return Ok(response.success);
                }
            }
            emit(&response, format)
        }
    }
}

/// Print `response` and report whether it succeeded
fn emit<T: Serialize>(response: &ApiResponse<T>, format: OutputFormat) -> Result<bool> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(response)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(response)?),
        OutputFormat::Text => {
            if let Some(data) = &response.data {
                print!("{}", serde_yaml::to_string(data)?);
            }
            if let Some(error) = &response.error {
                eprintln!("Error: {}", error);
            }
        }
    }
    Ok(response.success)
}
