//! sockpool command line: an echo server and a one-shot client.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use sockpool::logging::{LogFormat, init_logging};
use sockpool::{Address, Config, EchoHandler, Server, dial};
use std::io::Write;
use std::path::PathBuf;
use std::thread;
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "sockpool", version, about = "Connection registry echo server and client")]
struct Cli {
    /// Log level filter (RUST_LOG takes precedence)
    #[arg(long, global = true, env = "SOCKPOOL_LOG_LEVEL")]
    log_level: Option<String>,

    /// Log output format: pretty or json
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// TOML configuration file
    #[arg(long, global = true, env = "SOCKPOOL_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run an echo server until SIGINT or SIGTERM
    Serve {
        /// Address to listen on (`unix:<path>` or `<host>:<port>`)
        #[arg(long, value_parser = parse_address)]
        listen: Option<Address>,

        /// Maximum number of registered connections
        #[arg(long)]
        capacity: Option<usize>,

        /// listen(2) backlog
        #[arg(long)]
        backlog: Option<i32>,
    },

    /// Send one message, half-close, and print the reply
    Send {
        /// Address to connect to
        #[arg(long, value_parser = parse_address)]
        connect: Address,

        /// Message to send
        message: String,
    },
}

fn parse_address(text: &str) -> Result<Address, String> {
    Address::resolve(text).map_err(|err| err.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => Config::default(),
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    init_logging(&config.logging).context("failed to initialize logging")?;

    match cli.command {
        Commands::Serve {
            listen,
            capacity,
            backlog,
        } => {
            if let Some(listen) = listen {
                config.server.listen = listen;
            }
            if let Some(capacity) = capacity {
                config.pool.capacity = capacity;
            }
            if let Some(backlog) = backlog {
                config.server.backlog = backlog;
            }
            serve(&config)
        }
        Commands::Send { connect, message } => send(&connect, &message),
    }
}

fn serve(config: &Config) -> Result<()> {
    config.validate().context("invalid configuration")?;
    let server = Server::bind(&config.server, &config.pool)
        .with_context(|| format!("failed to listen on {}", config.server.listen))?;
    let stop = server.stop_token();

    let mut signals = Signals::new([SIGINT, SIGTERM]).context("failed to install signal handlers")?;
    let signal_handle = signals.handle();
    let watcher = {
        let stop = stop.clone();
        thread::spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "stop requested");
                stop.stop();
            }
        })
    };

    let address = server.local_address()?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "listening on {address}")?;
    stdout.flush()?;
    drop(stdout);

    let result = server.run(EchoHandler::default(), &stop);
    signal_handle.close();
    if watcher.join().is_err() {
        tracing::warn!("signal watcher panicked");
    }

    let stats = result.context("server failed")?;
    info!(
        accepted = stats.accepted,
        rejected = stats.rejected,
        closed = stats.closed,
        "server finished"
    );
    Ok(())
}

fn send(address: &Address, message: &str) -> Result<()> {
    let connection =
        dial::connect(address).with_context(|| format!("failed to connect to {address}"))?;
    connection
        .write_all(message.as_bytes())
        .context("failed to send message")?;
    connection
        .shutdown_write()
        .context("failed to half-close connection")?;

    let mut reply = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = connection.read(&mut buf).context("failed to read reply")?;
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
    }

    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&reply)?;
    writeln!(stdout)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn serve_flags_parse() {
        let cli = Cli::try_parse_from([
            "sockpool",
            "--log-format",
            "json",
            "serve",
            "--listen",
            "unix:/tmp/x.sock",
            "--capacity",
            "7",
        ])
        .unwrap();
        assert_eq!(cli.log_format, Some(LogFormat::Json));
        match cli.command {
            Commands::Serve {
                listen, capacity, ..
            } => {
                assert_eq!(listen, Some(Address::unix("/tmp/x.sock")));
                assert_eq!(capacity, Some(7));
            }
            Commands::Send { .. } => panic!("expected serve"),
        }
    }

    #[test]
    fn send_requires_connect() {
        assert!(Cli::try_parse_from(["sockpool", "send", "hi"]).is_err());
    }

    #[test]
    fn bad_address_is_rejected_by_parser() {
        assert!(Cli::try_parse_from(["sockpool", "send", "--connect", "unix:", "hi"]).is_err());
    }
}
