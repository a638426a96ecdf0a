//! mcprobe: send memcached text protocol requests and print the replies
//!
//! Each positional argument is one request (escapes decoded); without
//! arguments the whole of stdin is sent as a single request.

use mcprobe::escape::{normalize_newlines, unescape};
use mcprobe::{Config, MemcachedClient};
use std::io::{self, Read, Write};
use tracing::{error, info};
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
        .with_writer(io::stderr)
        .init();

    info!(
        endpoint = %config.client.endpoint,
        recv_chunk_size = config.client.recv_chunk_size,
        connect_timeout = ?config.client.connect_timeout,
        requests = config.requests.len(),
        "Starting mcprobe"
    );

    let requests = if config.requests.is_empty() {
        let mut input = Vec::new();
        io::stdin().read_to_end(&mut input)?;
        vec![normalize_newlines(&input)]
    } else {
        config.requests.iter().map(|r| unescape(r)).collect()
    };

    let mut client = MemcachedClient::from_config(&config.client);
    let mut stdout = io::stdout();

    for request in &requests {
        match client.execute(request, config.quiet) {
            Ok(reply) => {
                // echoing already printed the reply
                if config.quiet {
                    stdout.write_all(reply.as_bytes())?;
                    stdout.flush()?;
                }
            }
            Err(e) => {
                error!(error = %e, "Request failed");
                client.disconnect();
                return Err(e.into());
            }
        }
    }

    client.disconnect();
    Ok(())
}
