//! Network transport abstraction.
//!
//! Defines the `Transport` trait covering the request/response path and
//! the bulk block-transfer socket, allowing different implementations
//! (UDP, mock). Inbound traffic is not polled through the trait: every
//! implementation delivers received datagrams as [`crate::events::Event`]s
//! on the client's channel.

use std::net::SocketAddr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to bind {addr}: {message}")]
    BindFailed { addr: String, message: String },

    #[error("send to {dest} failed: {message}")]
    SendFailed { dest: SocketAddr, message: String },

    #[error("block socket is not open")]
    SocketClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Outbound half of the network stack.
pub trait Transport {
    /// Send a request on the control path, addressed to a resource on the
    /// peer. Responses arrive asynchronously as `Event::Control`.
    fn send_request(
        &mut self,
        dest: SocketAddr,
        uri: &str,
        payload: &[u8],
    ) -> Result<(), TransportError>;

    /// Bind the bulk block socket on the given local port. Inbound
    /// datagrams arrive as `Event::Datagram`.
    fn open_block_socket(&mut self, port: u16) -> Result<(), TransportError>;

    /// Close the block socket. No-op when not open.
    fn close_block_socket(&mut self);

    fn block_socket_open(&self) -> bool;

    /// Send a datagram from the block socket.
    fn send_block(&mut self, dest: SocketAddr, payload: &[u8]) -> Result<(), TransportError>;
}
