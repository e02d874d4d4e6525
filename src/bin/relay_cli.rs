use std::{
    error::Error,
    io::{self, BufRead, Write},
    time::Duration,
};

use clap::Parser;
use relay::{CallOptions, ClientConfig, MethodDescriptor, Runtime, RpcClient, balance::LoadBalanceKind};

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Naming URL of the providers, e.g. list://127.0.0.1:8000
    naming: String,
    /// Service to call
    #[arg(long, default_value = "echo")]
    service: String,
    /// Method to call
    #[arg(long, default_value = "Echo")]
    method: String,
    /// Wire protocol id (1 standard, 2 nshead-json, 4 push, 5 dubbo)
    #[arg(long)]
    protocol: Option<u32>,
    /// Load balancing strategy
    #[arg(long)]
    balance: Option<LoadBalanceKind>,
    /// Per-call timeout in milliseconds
    #[arg(long)]
    timeout_ms: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let mut config = ClientConfig::from_env()?;
    if let Some(protocol) = cli.protocol {
        config = config.protocol(protocol);
    }
    if let Some(kind) = cli.balance {
        config = config.load_balance(kind);
    }
    if let Some(ms) = cli.timeout_ms {
        config = config.timeout(Duration::from_millis(ms));
    }

    let runtime = Runtime::shared();
    let client = RpcClient::builder(cli.naming).config(config).build(runtime)?;
    client.on_push(&cli.service, |push| {
        println!("push {}: {}", push.method, String::from_utf8_lossy(&push.payload));
    });
    let method = MethodDescriptor::new(cli.service, cli.method);

    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout().lock();
    loop {
        let mut line = String::default();

        write!(&mut stdout, "> ")?;
        stdout.flush()?;
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line == ".exit" {
            break;
        }

        match client.invoke(&method, line.as_bytes().to_vec(), CallOptions::new()) {
            Ok(response) => writeln!(
                &mut stdout,
                "[{}] {}",
                response.log_id,
                String::from_utf8_lossy(&response.payload)
            )?,
            Err(e) => eprintln!("call failed: {e}"),
        }
    }

    client.shutdown();
    Ok(())
}
