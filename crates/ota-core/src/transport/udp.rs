//! UDP transport backed by `std::net`.
//!
//! Each bound socket gets a reader thread that forwards datagrams into
//! the client's event channel. Reader threads poll with a short receive
//! timeout so closing the block socket takes effect promptly.

use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::traits::{Transport, TransportError};
use crate::events::Event;

const READ_POLL: Duration = Duration::from_millis(250);
const MAX_DATAGRAM: usize = 1536;

struct BlockSocket {
    socket: UdpSocket,
    shutdown: Arc<AtomicBool>,
}

/// Production transport: one long-lived control socket plus an
/// on-demand block socket.
pub struct UdpTransport {
    tx: Sender<Event>,
    control: UdpSocket,
    block: Option<BlockSocket>,
}

impl UdpTransport {
    /// Bind the control socket and start its reader.
    pub fn bind(control_addr: SocketAddr, tx: Sender<Event>) -> Result<Self, TransportError> {
        let control = UdpSocket::bind(control_addr).map_err(|e| TransportError::BindFailed {
            addr: control_addr.to_string(),
            message: e.to_string(),
        })?;
        let reader = control
            .try_clone()
            .map_err(TransportError::Io)?;
        spawn_reader(reader, tx.clone(), Arc::new(AtomicBool::new(false)), false);
        Ok(Self {
            tx,
            control,
            block: None,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.control.local_addr()?)
    }
}

fn spawn_reader(socket: UdpSocket, tx: Sender<Event>, shutdown: Arc<AtomicBool>, block: bool) {
    if let Err(e) = socket.set_read_timeout(Some(READ_POLL)) {
        warn!(error = %e, "failed to set socket read timeout");
    }
    thread::spawn(move || {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            match socket.recv_from(&mut buf) {
                Ok((len, src)) => {
                    let payload = buf[..len].to_vec();
                    let event = if block {
                        Event::Datagram { src, payload }
                    } else {
                        Event::Control { src, payload }
                    };
                    if tx.send(event).is_err() {
                        break;
                    }
                }
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "socket read error, reader exiting");
                    break;
                }
            }
        }
    });
}

impl Transport for UdpTransport {
    fn send_request(
        &mut self,
        dest: SocketAddr,
        uri: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        trace!(dest = %dest, uri = uri, len = payload.len(), "sending request");
        self.control
            .send_to(payload, dest)
            .map_err(|e| TransportError::SendFailed {
                dest,
                message: e.to_string(),
            })?;
        Ok(())
    }

    fn open_block_socket(&mut self, port: u16) -> Result<(), TransportError> {
        if self.block.is_some() {
            return Ok(());
        }
        let local = self.control.local_addr()?;
        let addr = SocketAddr::new(
            if local.is_ipv6() {
                "::".parse().unwrap()
            } else {
                "0.0.0.0".parse().unwrap()
            },
            port,
        );
        let socket = UdpSocket::bind(addr).map_err(|e| TransportError::BindFailed {
            addr: addr.to_string(),
            message: e.to_string(),
        })?;
        debug!(port = port, "block socket open");
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader = socket.try_clone().map_err(TransportError::Io)?;
        spawn_reader(reader, self.tx.clone(), Arc::clone(&shutdown), true);
        self.block = Some(BlockSocket { socket, shutdown });
        Ok(())
    }

    fn close_block_socket(&mut self) {
        if let Some(block) = self.block.take() {
            block.shutdown.store(true, Ordering::SeqCst);
            debug!("block socket closed");
        }
    }

    fn block_socket_open(&self) -> bool {
        self.block.is_some()
    }

    fn send_block(&mut self, dest: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        let block = self.block.as_ref().ok_or(TransportError::SocketClosed)?;
        block
            .socket
            .send_to(payload, dest)
            .map_err(|e| TransportError::SendFailed {
                dest,
                message: e.to_string(),
            })?;
        Ok(())
    }
}
