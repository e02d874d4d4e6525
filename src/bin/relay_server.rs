use std::{error::Error, sync::mpsc};

use clap::Parser;
use log::info;
use relay::{RemoteError, Request, Runtime, RpcServer, RuntimeConfig, ServerConfig};

/// Serves an echo service over every registered protocol.
#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Listen for new connection at address
    #[arg(long, env = "RELAY_ADDR", default_value = "127.0.0.1:8000")]
    address: String,
    /// Service name the echo methods are served under
    #[arg(long, default_value = "echo")]
    service: String,
    /// Naming URL to advertise the service at, e.g. file:///var/lib/relay
    #[arg(long, env = "RELAY_NAMING")]
    naming: Option<String>,
    /// Worker threads; defaults to the number of CPUs
    #[arg(long)]
    workers: Option<usize>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let runtime = Runtime::new(RuntimeConfig::from_env()?);
    let mut config = ServerConfig::from_env()?;
    if let Some(workers) = cli.workers {
        config = config.workers(workers);
    }

    let mut builder = RpcServer::builder(cli.address)
        .config(config)
        .register(&cli.service, "Echo", |req: &Request| -> Result<Vec<u8>, RemoteError> {
            Ok(req.payload.clone())
        })
        .register(&cli.service, "Len", |req: &Request| -> Result<Vec<u8>, RemoteError> {
            Ok(req.payload.len().to_string().into_bytes())
        });
    if let Some(naming) = cli.naming {
        builder = builder.advertise(naming);
    }
    let server = builder.start(&runtime)?;

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv()?;

    info!("interrupted; stopping");
    server.shutdown();
    runtime.shutdown();
    Ok(())
}
