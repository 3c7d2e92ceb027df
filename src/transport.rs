use std::io::{ErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

/// TCP port of the SCPI raw socket service on DS1000Z-series scopes.
pub const DEFAULT_PORT: u16 = 5555;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(10),
            write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid instrument address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Timed out after {0:?} waiting for the instrument")]
    Timeout(Duration),

    #[error("Connection closed by the instrument")]
    ConnectionClosed,
}

/// Byte-level connection to one instrument endpoint.
///
/// `read` hands back whatever is currently available, up to the buffer
/// size; `Ok(0)` means the peer closed the connection.
pub trait Transport {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    fn close(&mut self) -> Result<(), TransportError>;
}

#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    peer: SocketAddr,
    read_timeout: Duration,
    write_timeout: Duration,
}

impl TcpTransport {
    /// Open a TCP connection to `address` ("host" or "host:port",
    /// defaulting to port 5555).
    pub fn connect(address: &str, config: &ConnectionConfig) -> Result<Self, TransportError> {
        let peer = resolve_address(address)?;
        let stream = TcpStream::connect_timeout(&peer, config.connect_timeout)?;
        stream.set_read_timeout(Some(config.read_timeout))?;
        stream.set_write_timeout(Some(config.write_timeout))?;
        stream.set_nodelay(true)?;
        log::debug!("Connected to {}", peer);

        Ok(Self {
            stream,
            peer,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

impl Transport for TcpTransport {
    fn write_all(&mut self, buf: &[u8]) -> Result<(), TransportError> {
        match self.stream.write_all(buf) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(TransportError::Timeout(self.write_timeout))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        match self.stream.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                Err(TransportError::Timeout(self.read_timeout))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) -> Result<(), TransportError> {
        log::debug!("Closing connection to {}", self.peer);
        self.stream.shutdown(Shutdown::Both)?;
        Ok(())
    }
}

/// Resolve "host" or "host:port" into a socket address, appending the
/// default SCPI port when none is given.
pub(crate) fn resolve_address(address: &str) -> Result<SocketAddr, TransportError> {
    let address = address.trim();
    if address.is_empty() {
        return Err(TransportError::InvalidAddress {
            address: address.to_string(),
            reason: "address is empty".to_string(),
        });
    }

    let resolved = match address.to_socket_addrs() {
        Ok(candidates) => candidates.collect::<Vec<_>>(),
        Err(_) => (address, DEFAULT_PORT)
            .to_socket_addrs()
            .map_err(|e| TransportError::InvalidAddress {
                address: address.to_string(),
                reason: e.to_string(),
            })?
            .collect(),
    };

    resolved
        .into_iter()
        .next()
        .ok_or_else(|| TransportError::InvalidAddress {
            address: address.to_string(),
            reason: "no usable socket address".to_string(),
        })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_appends_default_port() {
        let addr = resolve_address("127.0.0.1").unwrap();
        assert_eq!(addr.port(), DEFAULT_PORT);
    }

    #[test]
    fn test_resolve_keeps_explicit_port() {
        let addr = resolve_address("127.0.0.1:5025").unwrap();
        assert_eq!(addr.port(), 5025);
    }

    #[test]
    fn test_resolve_rejects_empty_address() {
        assert!(matches!(
            resolve_address("  "),
            Err(TransportError::InvalidAddress { .. })
        ));
    }

    #[test]
    fn test_resolve_rejects_garbage() {
        assert!(resolve_address("not an address").is_err());
    }

    #[test]
    fn test_write_timeout_reports_write_deadline() {
        use std::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let config = ConnectionConfig {
            connect_timeout: Duration::from_secs(1),
            read_timeout: Duration::from_secs(7),
            write_timeout: Duration::from_millis(50),
        };
        let mut transport = TcpTransport::connect(&address, &config).unwrap();
        // The peer stays connected but never reads, so the socket
        // buffers fill up and a write eventually stalls.
        let _peer = listener.accept().unwrap();

        let chunk = vec![0u8; 1 << 20];
        let mut outcome = Ok(());
        for _ in 0..256 {
            outcome = transport.write_all(&chunk);
            if outcome.is_err() {
                break;
            }
        }
        assert!(matches!(
            outcome,
            Err(TransportError::Timeout(deadline)) if deadline == config.write_timeout
        ));
    }

    #[test]
    fn test_scripted_transport_fragments_reads() {
        use testing::{ScriptedTransport, Step};

        let mut transport = ScriptedTransport::new(vec![
            Step::Read(b"ab".to_vec()),
            Step::Read(b"c".to_vec()),
        ]);
        let mut buf = [0u8; 8];
        assert_eq!(transport.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"ab");
        assert_eq!(transport.read(&mut buf).unwrap(), 1);
        assert_eq!(&buf[..1], b"c");
        assert!(matches!(
            transport.read(&mut buf),
            Err(TransportError::Timeout(_))
        ));
    }
}
