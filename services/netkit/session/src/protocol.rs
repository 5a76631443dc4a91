//! Per-connection protocol hooks.
//!
//! A protocol sees every decoded packet before the application does. It can
//! queue replies (written ahead of application sends), swallow the packet, or
//! ask for a graceful shutdown. Application sends are held back until the
//! protocol reports it is ready, which is how the WebSocket upgrade gates
//! traffic.

use netkit_wire::websocket::handshake;
use netkit_wire::{OpCode, WsFrame, WsPacket};
use tracing::debug;

use crate::connection::ConnectionInfo;
use crate::error::TransportError;

/// What the connection does with a packet after the hook ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Publish it to the application
    Deliver,
    /// Handled by the protocol, not published
    Consume,
    /// Write pending replies, then close the connection
    Shutdown,
}

/// Hook object owned by one connection's reader
pub trait Protocol<T>: Send + 'static {
    /// Called once before the first read; packets pushed to `replies` are written first
    fn on_open(
        &mut self,
        _info: &ConnectionInfo,
        _replies: &mut Vec<T>,
    ) -> Result<(), TransportError> {
        Ok(())
    }

    /// Inspect one decoded packet
    fn on_packet(
        &mut self,
        info: &ConnectionInfo,
        packet: &T,
        replies: &mut Vec<T>,
    ) -> Result<Disposition, TransportError>;

    /// Whether application sends may be written yet
    fn is_ready(&self) -> bool {
        true
    }
}

/// Builds a protocol for every new connection
pub trait ProtocolFactory<T>: Send + Sync + 'static {
    /// Protocol for the connection described by `info`
    fn create(&self, info: &ConnectionInfo) -> Box<dyn Protocol<T>>;
}

/// Delivers everything untouched
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainProtocol;

impl<T: Send + 'static> Protocol<T> for PlainProtocol {
    fn on_packet(
        &mut self,
        _info: &ConnectionInfo,
        _packet: &T,
        _replies: &mut Vec<T>,
    ) -> Result<Disposition, TransportError> {
        Ok(Disposition::Deliver)
    }
}

/// Factory for [`PlainProtocol`]
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainFactory;

impl<T: Send + 'static> ProtocolFactory<T> for PlainFactory {
    fn create(&self, _info: &ConnectionInfo) -> Box<dyn Protocol<T>> {
        Box::new(PlainProtocol)
    }
}

/// Answers pings and close frames once the upgrade is done
fn control_frame(
    info: &ConnectionInfo,
    frame: &WsFrame,
    replies: &mut Vec<WsPacket>,
) -> Disposition {
    match frame.opcode {
        OpCode::Ping => {
            replies.push(WsFrame::pong(frame.payload.clone()).into());
            Disposition::Consume
        }
        OpCode::Pong => Disposition::Consume,
        OpCode::Close => {
            debug!(
                "Close frame from {} (code {:?})",
                info.remote,
                frame.close_code()
            );
            replies.push(WsFrame::close(frame.close_code(), "").into());
            Disposition::Shutdown
        }
        _ => Disposition::Deliver,
    }
}

/// Server side of the WebSocket upgrade
#[derive(Debug, Default)]
pub struct WsServerProtocol {
    upgraded: bool,
}

impl WsServerProtocol {
    /// Protocol waiting for an upgrade request
    pub fn new() -> Self {
        Self::default()
    }
}

impl Protocol<WsPacket> for WsServerProtocol {
    fn on_packet(
        &mut self,
        info: &ConnectionInfo,
        packet: &WsPacket,
        replies: &mut Vec<WsPacket>,
    ) -> Result<Disposition, TransportError> {
        match packet {
            WsPacket::Handshake(request) => {
                if self.upgraded {
                    return Err(TransportError::Handshake(
                        "upgrade request after handshake".to_string(),
                    ));
                }
                let response = handshake::respond(request)?;
                replies.push(WsPacket::Handshake(response));
                self.upgraded = true;
                debug!("Upgraded connection from {}", info.remote);
                Ok(Disposition::Consume)
            }
            WsPacket::Frame(_) if !self.upgraded => Err(TransportError::Handshake(
                "frame received before upgrade".to_string(),
            )),
            WsPacket::Frame(frame) => Ok(control_frame(info, frame, replies)),
        }
    }

    fn is_ready(&self) -> bool {
        self.upgraded
    }
}

/// Client side of the WebSocket upgrade
#[derive(Debug)]
pub struct WsClientProtocol {
    path: String,
    key: String,
    upgraded: bool,
}

impl WsClientProtocol {
    /// Protocol that requests an upgrade of `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            key: handshake::generate_key(),
            upgraded: false,
        }
    }

    /// Key sent in the upgrade request
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Protocol<WsPacket> for WsClientProtocol {
    fn on_open(
        &mut self,
        info: &ConnectionInfo,
        replies: &mut Vec<WsPacket>,
    ) -> Result<(), TransportError> {
        let request = handshake::client_request(&info.remote.to_string(), &self.path, &self.key);
        replies.push(WsPacket::Handshake(request));
        Ok(())
    }

    fn on_packet(
        &mut self,
        info: &ConnectionInfo,
        packet: &WsPacket,
        replies: &mut Vec<WsPacket>,
    ) -> Result<Disposition, TransportError> {
        match packet {
            WsPacket::Handshake(_) if self.upgraded => Err(TransportError::Handshake(
                "unexpected upgrade response".to_string(),
            )),
            WsPacket::Handshake(response) => {
                handshake::verify_response(response, &self.key)?;
                self.upgraded = true;
                debug!("Upgrade accepted by {}", info.remote);
                Ok(Disposition::Consume)
            }
            WsPacket::Frame(_) if !self.upgraded => Err(TransportError::Handshake(
                "frame received before upgrade".to_string(),
            )),
            WsPacket::Frame(frame) => Ok(control_frame(info, frame, replies)),
        }
    }

    fn is_ready(&self) -> bool {
        self.upgraded
    }
}

/// Factory for [`WsServerProtocol`]
#[derive(Debug, Clone, Copy, Default)]
pub struct WsServerFactory;

impl ProtocolFactory<WsPacket> for WsServerFactory {
    fn create(&self, _info: &ConnectionInfo) -> Box<dyn Protocol<WsPacket>> {
        Box::new(WsServerProtocol::new())
    }
}

/// Factory for [`WsClientProtocol`]
#[derive(Debug, Clone)]
pub struct WsClientFactory {
    path: String,
}

impl WsClientFactory {
    /// Request upgrades of `path`
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

impl ProtocolFactory<WsPacket> for WsClientFactory {
    fn create(&self, _info: &ConnectionInfo) -> Box<dyn Protocol<WsPacket>> {
        Box::new(WsClientProtocol::new(self.path.clone()))
    }
}
