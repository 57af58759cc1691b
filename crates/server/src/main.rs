use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use switchyard_core::{Payload, PipelineSpec};
use switchyard_server::{echo, HttpListener, LifecycleSupervisor, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "switchyard")]
#[command(about = "Compose HTTP services into pipelines and supervise their lifecycle", long_about = None)]
struct Args {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "SWITCHYARD_JSON_LOGS")]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the echo service under a lifecycle supervisor
    Serve {
        /// Path to service configuration file
        #[arg(short, long, default_value = "service.toml")]
        config: PathBuf,

        /// Host to bind to (overrides the configuration file)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides the configuration file)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a pipeline once and print the outputs of its sink services
    Run {
        /// Path to pipeline definition
        #[arg(short, long, default_value = "pipeline.toml")]
        pipeline: PathBuf,

        /// Initial JSON object fed to every source service
        #[arg(short, long, default_value = "{}")]
        input: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    match args.command {
        Command::Serve { config, host, port } => serve(config, host, port),
        Command::Run { pipeline, input } => run_pipeline(pipeline, &input),
    }
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "switchyard=info,switchyard_core=info,switchyard_server=info,tower_http=debug".into());

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn serve(config_path: PathBuf, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = ServiceConfig::load(&config_path)?;
    if let Some(host) = host {
        config.host = host;
    }
    if let Some(port) = port {
        config.port = port;
    }

    tracing::info!("Starting service {} on {}", config.name, config.address());

    let listener = HttpListener::new(echo::router(config.name.clone()));
    let report = LifecycleSupervisor::new(config, listener)
        .run_forever()
        .context("Service failed to start")?;

    if report.is_failure() {
        bail!("Service {} exited with failure: {:?}", report.service, report.exit);
    }

    Ok(())
}

#[tokio::main]
async fn run_pipeline(pipeline_path: PathBuf, input: &str) -> Result<()> {
    let initial: Payload =
        serde_json::from_str(input).context("Initial input must be a JSON object")?;

    let mut composer = PipelineSpec::load(&pipeline_path)
        .context("Failed to load pipeline")?
        .into_composer()
        .context("Failed to build pipeline")?;

    composer
        .schedule(initial)
        .await
        .context("Pipeline run failed")?;

    let outputs: serde_json::Map<String, serde_json::Value> = composer
        .collect_final_outputs()
        .into_iter()
        .map(|(node, output)| (node.0, serde_json::Value::Object(output)))
        .collect();

    println!("{}", serde_json::to_string_pretty(&outputs)?);

    Ok(())
}
