//! Flotilla CLI entrypoint.

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod bus;
mod commands;
mod config;
mod handlers;

use commands::{Commands, LogFormat, OutputFormat};

#[derive(Parser)]
#[command(name = "flotilla")]
#[command(author, version, about = "Route tasks and workflows across remote agents", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Result output format
    #[arg(long, global = true, value_enum, default_value_t = OutputFormat::Table)]
    output: OutputFormat,

    /// Log line format; the level is taken from RUST_LOG
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Validate { config } => handlers::validate(&config)?,
        Commands::Agents { config, probe } => handlers::agents(&config, probe, cli.output).await?,
        Commands::Serve { config } => handlers::serve(&config).await?,
        Commands::Task {
            config,
            capability,
            payload,
            priority,
            timeout_secs,
            retries,
            queue,
        } => {
            let request = handlers::TaskRequest {
                capability,
                payload,
                priority,
                timeout_secs,
                retries,
                queue,
            };
            handlers::run_task(&config, request, cli.output).await?
        }
        Commands::Workflow { config, workflow } => {
            handlers::run_workflow(&config, &workflow, cli.output).await?
        }
        Commands::Schema => handlers::schema()?,
    }

    Ok(())
}
