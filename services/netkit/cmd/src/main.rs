//! Netkit binary.
//!
//! Runs one session manager (TCP or WebSocket, server or client), logs its
//! traffic and reports, and sends every stdin line to all connections.

use anyhow::Context;
use bytes::Bytes;
use clap::Parser;
use netkit_session::{Direction, RelayMode, Report, SessionManager, Target, Transfer};
use netkit_wire::xml::check_well_formed;
use netkit_wire::{BytesEncoder, Encoder, JsonEncoder, TextEncoder, WsFrame, WsPacket, XmlEncoder};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod logging;

use config::{parse_relay, Framing, NetkitConfig, Role, Transport};
use logging::NetkitLogFormatter;

/// TCP/WebSocket session manager
#[derive(Parser, Debug)]
#[command(name = "netkit", version, about = "TCP and WebSocket session manager")]
struct Args {
    /// Configuration file path
    #[arg(long, default_value = "netkit.yaml")]
    config: PathBuf,

    /// Server or client
    #[arg(long, value_enum)]
    role: Option<Role>,

    /// tcp or ws
    #[arg(long, value_enum)]
    transport: Option<Transport>,

    /// TCP framing
    #[arg(long, value_enum)]
    framing: Option<Framing>,

    /// Custom text delimiter, e.g. "\r\n"
    #[arg(long)]
    delimiter: Option<String>,

    /// Listen (server) or remote (client) address, e.g. 127.0.0.1:7000
    #[arg(long)]
    address: Option<String>,

    /// WebSocket request path
    #[arg(long)]
    path: Option<String>,

    /// Heartbeat interval, e.g. 1s
    #[arg(long)]
    heartbeat: Option<humantime::Duration>,

    /// Stopped connection retention, e.g. 30s
    #[arg(long)]
    retention: Option<humantime::Duration>,

    /// none, echo or broadcast
    #[arg(long, value_parser = parse_relay)]
    relay: Option<RelayMode>,

    /// Echo every frame at the connection level
    #[arg(long)]
    echo: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    /// Flags take precedence over file and environment
    fn apply(&self, config: &mut NetkitConfig) {
        if let Some(role) = self.role {
            config.role = role;
        }
        if let Some(transport) = self.transport {
            config.transport = transport;
        }
        if let Some(framing) = self.framing {
            config.framing = framing;
        }
        if let Some(delimiter) = &self.delimiter {
            config.delimiter = Some(unescape(delimiter));
        }
        if let Some(address) = &self.address {
            config.address = address.clone();
        }
        if let Some(path) = &self.path {
            config.path = path.clone();
        }
        if let Some(heartbeat) = self.heartbeat {
            config.heartbeat_ms = heartbeat.as_millis() as u64;
        }
        if let Some(retention) = self.retention {
            config.retention_secs = retention.as_secs();
        }
        if let Some(relay) = self.relay {
            config.relay = relay;
        }
        if self.echo {
            config.echo = true;
        }
    }
}

/// Turn `\r`, `\n`, `\t` and `\0` escapes into characters
fn unescape(value: &str) -> String {
    value
        .replace("\\r", "\r")
        .replace("\\n", "\n")
        .replace("\\t", "\t")
        .replace("\\0", "\0")
}

/// Convert a stdin line into the manager's value type
type LineParser<T> = fn(&str) -> anyhow::Result<T>;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let env_filter = EnvFilter::new("info")
        .add_directive(format!("netkit={}", args.log_level).parse()?)
        .add_directive(format!("netkit_actor={}", args.log_level).parse()?)
        .add_directive(format!("netkit_session={}", args.log_level).parse()?)
        .add_directive(format!("netkit_wire={}", args.log_level).parse()?);

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_ansi(true)
        .event_format(NetkitLogFormatter::new("netkit"))
        .init();

    info!("Starting netkit v{}", env!("CARGO_PKG_VERSION"));

    let mut config = NetkitConfig::load_from_file(&args.config)?;
    args.apply(&mut config);
    info!(
        "Configuration: role={:?}, transport={:?}, framing={:?}, address={}, relay={:?}",
        config.role, config.transport, config.framing, config.address, config.relay
    );

    let address = netkit_session::resolve(&config.address)
        .await
        .with_context(|| format!("resolving {}", config.address))?;
    let settings = config.manager_config();

    match config.transport {
        Transport::Ws => {
            let manager = match config.role {
                Role::Server => SessionManager::websocket_server(address, settings),
                Role::Client => SessionManager::websocket_client(address, &config.path, settings),
            };
            run(manager, |line| Ok(WsPacket::from(WsFrame::text(line)))).await
        }
        Transport::Tcp => {
            let delimiter = config.delimiter.clone();
            match config.framing {
                Framing::Lines | Framing::Null => {
                    let encoder = match (&delimiter, config.framing) {
                        (Some(delimiter), _) => TextEncoder::new(delimiter.as_str())?,
                        (None, Framing::Null) => TextEncoder::null_terminated(),
                        (None, _) => TextEncoder::lines(),
                    };
                    run(tcp(config.role, address, encoder, settings), |line| {
                        Ok(line.to_string())
                    })
                    .await
                }
                Framing::Bytes => {
                    let encoder = match &delimiter {
                        Some(delimiter) => BytesEncoder::new(delimiter.clone().into_bytes())?,
                        None => BytesEncoder::lines(),
                    };
                    run(tcp(config.role, address, encoder, settings), |line| {
                        Ok(Bytes::copy_from_slice(line.as_bytes()))
                    })
                    .await
                }
                Framing::Json => {
                    let encoder = JsonEncoder::<serde_json::Value>::new();
                    run(tcp(config.role, address, encoder, settings), |line| {
                        Ok(serde_json::from_str(line)?)
                    })
                    .await
                }
                Framing::Xml => {
                    run(tcp(config.role, address, XmlEncoder::new(), settings), |line| {
                        check_well_formed(line.as_bytes())?;
                        Ok(line.to_string())
                    })
                    .await
                }
            }
        }
    }
}

fn tcp<E: Encoder>(
    role: Role,
    address: std::net::SocketAddr,
    encoder: E,
    settings: netkit_session::ManagerConfig,
) -> SessionManager<E> {
    match role {
        Role::Server => SessionManager::tcp_server(address, encoder, settings),
        Role::Client => SessionManager::tcp_client(address, encoder, settings),
    }
}

/// Run `manager` until Ctrl-C or SIGTERM
async fn run<E: Encoder>(manager: SessionManager<E>, parse: LineParser<E::Item>) -> anyhow::Result<()> {
    let _traffic = manager.subscribe_typed::<Transfer<E::Item>, _>(|_, transfer| {
        if transfer.direction == Direction::Incoming {
            info!(
                component = "traffic",
                "{} -> {:?} ({} bytes)", transfer.connection.remote, transfer.value, transfer.bytes
            );
        }
        Ok(())
    });
    let _reports = manager.subscribe_typed::<Report, _>(|_, report| {
        if report.connected + report.disconnected + report.traffic.messages_received > 0 {
            info!(component = "report", "{}", report);
        }
        Ok(())
    });

    manager.start().await?;
    if let Some(local) = manager.local_addr() {
        info!("{} listening on {}", manager.name(), local);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    loop {
        #[cfg(unix)]
        let terminate = sigterm.recv();
        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received interrupt, shutting down");
                break;
            }
            _ = terminate => {
                info!("Received SIGTERM, shutting down");
                break;
            }
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.is_empty() => {}
                Ok(Some(line)) => match parse(&line) {
                    Ok(value) => {
                        let sent = manager.send(value, Target::All);
                        info!("Queued input for {} connection(s)", sent);
                    }
                    Err(err) => warn!("Ignoring input: {:#}", err),
                },
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!("Failed to read stdin: {}", err);
                    stdin_open = false;
                }
            },
        }
    }

    manager.stop().await?;
    info!("Netkit stopped");
    Ok(())
}
