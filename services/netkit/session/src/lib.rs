//! TCP and WebSocket connections plus server/client session managers for netkit.
//!
//! - **Connection**: one socket with a reader task (accumulation buffer, frame
//!   extraction) and a writer task, publishing status, transfers and errors
//! - **Protocol**: per-connection hooks; the WebSocket upgrade is one of them
//! - **SessionManager**: actor that accepts (server) or dials (client)
//!   connections, relays traffic, cleans up stopped connections and reports
//!   throughput on every heartbeat
//!
//! ## Example
//!
//! ```rust,no_run
//! use netkit_session::{ManagerConfig, RelayMode, SessionManager, Target};
//! use netkit_wire::TextEncoder;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ManagerConfig {
//!     relay: RelayMode::Echo,
//!     ..ManagerConfig::named("echo")
//! };
//! let server = SessionManager::tcp_server("0.0.0.0:7000".parse()?, TextEncoder::lines(), config);
//! server.start().await?;
//! server.send("welcome".to_string(), Target::All);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod error;
pub mod manager;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod stats;
pub mod transport;

// Re-export main types
pub use connection::{Connection, ConnectionInfo, ConnectionOptions, Direction, Transfer};
pub use error::TransportError;
pub use manager::{ManagerConfig, Mode, RelayMode, SessionManager, Target};
pub use pool::BufferPool;
pub use protocol::{
    Disposition, PlainFactory, PlainProtocol, Protocol, ProtocolFactory, WsClientFactory,
    WsClientProtocol, WsServerFactory, WsServerProtocol,
};
pub use registry::{SessionRegistry, Tracked};
pub use stats::{ConnectionStats, Report, ReportWindow, StatsSnapshot};
pub use transport::{connect_tcp, connect_with_timeout, listen_tcp, resolve};
