//! Echo demo client: issues calls against a running echo server.

use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use wirecall::{BackendKind, ClientChannel, ClientOptions, ReactorOptions, Scheduler};

#[derive(Parser, Debug)]
#[command(name = "echo_client")]
#[command(about = "Echo demo client", long_about = None)]
struct Args {
    /// Server address
    #[arg(short, long, default_value = "127.0.0.1:8890")]
    addr: String,

    /// Message to send
    #[arg(short, long, default_value = "ping")]
    message: String,

    /// Number of calls to issue
    #[arg(short = 'n', long, default_value_t = 1)]
    count: usize,

    /// Reactor backend
    #[arg(short = 'b', long, value_enum, default_value = "poll")]
    backend: BackendKind,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let scheduler = Scheduler::start(args.backend, 1, &ReactorOptions::default())?;
    let channel = ClientChannel::connect(
        args.addr.parse()?,
        &ClientOptions::default(),
        scheduler.executor(),
    )?;

    for i in 0..args.count {
        let response: String = channel.call_timeout(
            "EchoService",
            "Echo",
            &args.message,
            Duration::from_secs(10),
        )?;
        info!(call = i, %response, "completed");
    }

    channel.close();
    scheduler.shutdown();
    Ok(())
}
