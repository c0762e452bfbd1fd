//! Echo demo server: registers `EchoService.Echo` and serves forever.

use tracing::info;
use tracing_subscriber::EnvFilter;

use wirecall::{Config, RpcServer, ServerOptions, ServiceRegistry};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let mut registry = ServiceRegistry::new();
    registry.register("EchoService", "Echo", |message: String| {
        info!(%message, "echo request");
        format!("[Echo]{message}")
    });

    let options = ServerOptions {
        listen: config.listen.parse()?,
        backend: config.backend,
        workers: config.workers,
        socket_buffer_size: config.socket_buffer_size,
        max_payload_len: config.max_payload_len,
        task_queue_capacity: config.task_queue_capacity,
    };

    info!(
        listen = %options.listen,
        backend = ?options.backend,
        workers = options.workers,
        "starting echo server"
    );
    let handle = RpcServer::new(options, registry).start()?;
    handle.wait();
    Ok(())
}
