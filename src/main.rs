//! flashio demo server
//!
//! A line-oriented server on top of the engine: `PING` is answered with
//! `PONG`, `QUIT` closes the connection and every other line is echoed.

use flashio::{Connection, ConnectionOptions, Handler, IoConfig, Server, ServerConfig};
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Longest line the server accepts before dropping the client
const MAX_LINE: usize = 64 * 1024;

/// Server configuration
struct Config {
    /// Host to bind to
    host: String,
    /// Port to listen on
    port: u16,
    /// Number of dispatcher threads
    dispatchers: Option<usize>,
    /// Core callback worker threads
    workers: Option<usize>,
    /// Idle timeout in seconds
    idle_timeout: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: flashio::DEFAULT_HOST.to_string(),
            port: flashio::DEFAULT_PORT,
            dispatchers: None,
            workers: None,
            idle_timeout: None,
        }
    }
}

/// Returns the value following a flag, or exits with an error.
fn value_of(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

/// Parses a numeric flag value, or exits with an error.
fn number_of<T: std::str::FromStr>(value: &str, flag: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("Error: invalid value for {flag}: {value}");
        std::process::exit(1);
    })
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--host" | "-h" => {
                    config.host = value_of(&args, i, "--host");
                    i += 2;
                }
                "--port" | "-p" => {
                    config.port = number_of(&value_of(&args, i, "--port"), "--port");
                    i += 2;
                }
                "--dispatchers" | "-d" => {
                    config.dispatchers =
                        Some(number_of(&value_of(&args, i, "--dispatchers"), "--dispatchers"));
                    i += 2;
                }
                "--workers" | "-w" => {
                    config.workers = Some(number_of(&value_of(&args, i, "--workers"), "--workers"));
                    i += 2;
                }
                "--idle-timeout" => {
                    config.idle_timeout = Some(number_of(
                        &value_of(&args, i, "--idle-timeout"),
                        "--idle-timeout",
                    ));
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("flashio version {}", flashio::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }

    fn server_config(&self) -> ServerConfig {
        let mut io = IoConfig::default();
        if let Some(dispatchers) = self.dispatchers {
            io = io.with_dispatchers(dispatchers);
        }
        if let Some(workers) = self.workers {
            let max_workers = io.max_worker_threads.max(workers);
            io = io.with_workers(workers, max_workers);
        }

        let mut connection = ConnectionOptions::default();
        if let Some(seconds) = self.idle_timeout {
            connection = connection.with_idle_timeout(Duration::from_secs(seconds));
        }

        ServerConfig::new(self.host.clone(), self.port)
            .with_io(io)
            .with_connection(connection)
    }
}

fn print_help() {
    println!(
        r#"
flashio - A Non-Blocking Network I/O Engine (demo line server)

USAGE:
    flashio [OPTIONS]

OPTIONS:
    -h, --host <HOST>            Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>            Port to listen on (default: 8090)
    -d, --dispatchers <N>        Dispatcher threads (default: CPU count)
    -w, --workers <N>            Core callback worker threads (default: 2)
        --idle-timeout <SECS>    Close connections idle this long
    -v, --version                Print version information
        --help                   Print this help message

EXAMPLES:
    flashio                          # Start on 127.0.0.1:8090
    flashio --port 9000              # Start on port 9000
    flashio --idle-timeout 30        # Drop clients quiet for 30s

CONNECTING:
    $ nc 127.0.0.1 8090
    PING
    PONG
    hello
    hello
"#
    );
}

fn print_banner(server: &Server) {
    println!(
        r#"
flashio v{} - Non-Blocking Network I/O Engine
──────────────────────────────────────────────────────────────
Server started on {}
Ready to accept connections.

Use Ctrl+C to shutdown gracefully.
"#,
        flashio::VERSION,
        server.local_addr()
    );
}

/// Per-connection handler of the demo protocol
struct LineServer {
    lines: u64,
}

impl Handler for LineServer {
    fn on_connect(&mut self, connection: &Connection) -> flashio::Result<()> {
        info!(peer = %connection.peer_addr(), "Client connected");
        Ok(())
    }

    fn on_data(&mut self, connection: &Connection) -> flashio::Result<()> {
        let line = connection.read_string_by_delimiter("\r\n", MAX_LINE)?;
        self.lines += 1;
        match line.as_str() {
            "PING" => {
                connection.write("PONG\r\n")?;
            }
            "QUIT" => {
                connection.write("BYE\r\n")?;
                connection.close()?;
            }
            _ => {
                connection.write_str(&line)?;
                connection.write("\r\n")?;
            }
        }
        Ok(())
    }

    fn on_disconnect(&mut self, connection: &Connection) -> flashio::Result<()> {
        info!(
            peer = %connection.peer_addr(),
            lines = self.lines,
            "Client disconnected"
        );
        Ok(())
    }
}

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments
    let config = Config::from_args();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let server = Server::bind(config.server_config(), || LineServer { lines: 0 })?;
    print_banner(&server);
    server.start()?;

    // Wait for Ctrl+C
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    if let Err(e) = runtime.block_on(signal::ctrl_c()) {
        warn!("Failed to listen for Ctrl+C: {}", e);
    }
    info!("Shutdown signal received, stopping server...");

    server.shutdown();
    let stats = server.stats();
    info!(
        connections = stats.connections_opened.load(std::sync::atomic::Ordering::Relaxed),
        "Server shutdown complete"
    );
    Ok(())
}
