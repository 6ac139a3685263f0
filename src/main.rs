use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use flowlet::agent::Agent;
use flowlet::config::AgentConfig;
use flowlet::executor::runner;
use flowlet::resource::ComputeResource;
use flowlet::shutdown::install_shutdown_handler;

#[derive(Parser, Debug)]
#[command(name = "flowlet")]
#[command(about = "Worker-side execution agent for distributed dataflow fragments")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent server
    Serve {
        /// Base working directory for staged files and dataset shards
        #[arg(long, default_value = "/tmp/flowlet")]
        dir: PathBuf,

        /// Host to listen on
        #[arg(long, default_value = "0.0.0.0")]
        host: String,

        /// Port to listen on for gRPC
        #[arg(long, default_value = "45326")]
        port: u16,

        /// Declared CPU core capacity
        #[arg(long, default_value = "16")]
        cpu_count: i32,

        /// Declared memory capacity in MB
        #[arg(long, default_value = "32768")]
        memory_mb: i64,

        /// Declared GPU unit capacity
        #[arg(long, default_value = "0")]
        gpu_count: i32,
    },

    /// Run one instruction set read from stdin (spawned by the agent itself)
    Execute {
        /// Label for the fragment, used in logs only
        #[arg(long, default_value = "")]
        note: String,
    },
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Command::Serve {
            dir,
            host,
            port,
            cpu_count,
            memory_mb,
            gpu_count,
        } => {
            tracing_subscriber::fmt().with_env_filter(env_filter()).init();

            let listen_addr: SocketAddr = format!("{host}:{port}").parse()?;
            let config = AgentConfig {
                capacity: ComputeResource::new(cpu_count, memory_mb, gpu_count),
                ..AgentConfig::new(dir, listen_addr)
            };

            tracing::info!(
                listen_addr = %config.listen_addr,
                base_dir = %config.base_dir.display(),
                cpu_count = config.capacity.cpu_count,
                memory_mb = config.capacity.memory_mb,
                gpu_count = config.capacity.gpu_count,
                "Starting flowlet agent"
            );

            let shutdown = install_shutdown_handler();
            Agent::new(config).run(shutdown).await?;
        }
        Command::Execute { note } => {
            // stdout carries fragment data; diagnostics go to stderr.
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(std::io::stderr)
                .init();

            runner::run(&note).await?;
        }
    }

    Ok(())
}
