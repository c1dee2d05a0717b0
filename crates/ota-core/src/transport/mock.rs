//! Mock transport for testing the state machine.

use std::net::SocketAddr;

use super::traits::{Transport, TransportError};

/// Records every outbound send; tests inject inbound traffic by feeding
/// events straight into the client.
#[derive(Default)]
pub struct MockTransport {
    /// Captured control-path requests: (dest, uri, payload).
    pub requests: Vec<(SocketAddr, String, Vec<u8>)>,
    /// Captured block-socket sends: (dest, payload).
    pub blocks: Vec<(SocketAddr, Vec<u8>)>,
    /// Port the block socket was last opened on.
    pub socket_port: Option<u16>,
    /// Make `open_block_socket` fail.
    pub fail_open: bool,
    /// Make every send fail.
    pub fail_send: bool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Command code of the most recent control request, if any.
    pub fn last_request_cmd(&self) -> Option<u8> {
        self.requests.last().and_then(|(_, _, p)| p.first().copied())
    }

    /// Command codes of all control requests, in order.
    pub fn request_cmds(&self) -> Vec<u8> {
        self.requests
            .iter()
            .filter_map(|(_, _, p)| p.first().copied())
            .collect()
    }

    pub fn clear(&mut self) {
        self.requests.clear();
        self.blocks.clear();
    }
}

impl Transport for MockTransport {
    fn send_request(
        &mut self,
        dest: SocketAddr,
        uri: &str,
        payload: &[u8],
    ) -> Result<(), TransportError> {
        if self.fail_send {
            return Err(TransportError::SendFailed {
                dest,
                message: "injected failure".into(),
            });
        }
        self.requests.push((dest, uri.to_string(), payload.to_vec()));
        Ok(())
    }

    fn open_block_socket(&mut self, port: u16) -> Result<(), TransportError> {
        if self.fail_open {
            return Err(TransportError::BindFailed {
                addr: format!("0.0.0.0:{port}"),
                message: "injected failure".into(),
            });
        }
        self.socket_port = Some(port);
        Ok(())
    }

    fn close_block_socket(&mut self) {
        self.socket_port = None;
    }

    fn block_socket_open(&self) -> bool {
        self.socket_port.is_some()
    }

    fn send_block(&mut self, dest: SocketAddr, payload: &[u8]) -> Result<(), TransportError> {
        if self.socket_port.is_none() {
            return Err(TransportError::SocketClosed);
        }
        if self.fail_send {
            return Err(TransportError::SendFailed {
                dest,
                message: "injected failure".into(),
            });
        }
        self.blocks.push((dest, payload.to_vec()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:5683".parse().unwrap()
    }

    #[test]
    fn test_mock_captures_requests() {
        let mut mock = MockTransport::new();
        mock.send_request(addr(), "ota/server", &[0x02, 0xAA]).unwrap();
        mock.send_request(addr(), "ota/server", &[0x04]).unwrap();
        assert_eq!(mock.request_cmds(), vec![0x02, 0x04]);
        assert_eq!(mock.last_request_cmd(), Some(0x04));
    }

    #[test]
    fn test_mock_block_socket_gate() {
        let mut mock = MockTransport::new();
        assert!(mock.send_block(addr(), &[1]).is_err());
        mock.open_block_socket(61630).unwrap();
        assert_eq!(mock.socket_port, Some(61630));
        mock.send_block(addr(), &[1]).unwrap();
        assert_eq!(mock.blocks.len(), 1);
        mock.close_block_socket();
        assert!(!mock.block_socket_open());
    }

    #[test]
    fn test_mock_injected_failures() {
        let mut mock = MockTransport::new();
        mock.fail_open = true;
        assert!(mock.open_block_socket(61630).is_err());
        mock.fail_open = false;
        mock.fail_send = true;
        assert!(mock.send_request(addr(), "ota/server", &[0]).is_err());
    }
}
