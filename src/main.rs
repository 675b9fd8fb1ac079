//! framed-echo: `<EOF>`-framed request/response over a completion port.
//!
//! Two modes:
//! - `serve`: accept connections and echo each framed request back
//! - `send`: deliver one message to a server and print its reply
//!
//! Configuration comes from CLI arguments or a TOML file.

use framed_echo::client::Client;
use framed_echo::config::{Config, Mode};
use framed_echo::endpoint::Endpoint;
use framed_echo::runtime::CompletionPort;
use framed_echo::server::{Echo, Server};
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        mode = ?config.mode,
        workers = config.workers,
        receive_buffer_size = config.receive_buffer_size,
        max_message_size = config.max_message_size,
        unterminated = ?config.unterminated,
        "Starting framed-echo"
    );

    let port = CompletionPort::new(config.port_config())?;

    match config.mode {
        Mode::Serve => run_server(&config, &port),
        Mode::Send => run_client(&config, &port),
    }
}

/// Serve until the process is terminated.
fn run_server(config: &Config, port: &CompletionPort) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = Endpoint::resolve(&config.listen)?;
    let server = Server::bind(port.handle(), &endpoint, config.server_settings())?;
    server.serve(Echo)?;
    Ok(())
}

/// Send the configured message and print the reply.
fn run_client(config: &Config, port: &CompletionPort) -> Result<(), Box<dyn std::error::Error>> {
    let endpoint = Endpoint::resolve(&config.server)?;
    let client = Client::new(port.handle(), config.client_settings());
    let reply = client.exchange(&endpoint, config.message.as_bytes())?;
    println!("{}", String::from_utf8_lossy(&reply));
    Ok(())
}
