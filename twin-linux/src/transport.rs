//! Blocking TCP implementation of the link transport.

use std::io::{ErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use twin_core::{Clock, SystemClock, Transport, TransportError};

pub struct TcpTransport {
    stream: TcpStream,
    clock: SystemClock,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        Ok(Self {
            stream,
            clock: SystemClock::new(),
        })
    }
}

impl Clock for TcpTransport {
    fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    fn delay_ms(&self, ms: u32) {
        self.clock.delay_ms(ms)
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.stream.write_all(bytes)?;
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, TransportError> {
        // A zero read timeout means "block forever" to the OS; never ask for it.
        let timeout = Duration::from_millis(u64::from(timeout_ms.max(1)));
        self.stream.set_read_timeout(Some(timeout))?;
        match self.stream.read(buf) {
            Ok(0) if !buf.is_empty() => Err(TransportError::Closed),
            Ok(n) => Ok(n),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(0),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    fn pair() -> (TcpTransport, TcpTransport) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        (TcpTransport::new(client).unwrap(), TcpTransport::new(server).unwrap())
    }

    #[test]
    fn bytes_cross_the_socket() {
        let (mut a, mut b) = pair();
        a.send(b"frame").unwrap();
        let mut buf = [0u8; 16];
        let mut got = Vec::new();
        while got.len() < 5 {
            let n = b.receive(&mut buf, 200).unwrap();
            got.extend_from_slice(&buf[..n]);
        }
        assert_eq!(got, b"frame");
    }

    #[test]
    fn idle_receive_is_a_timeout_not_an_error() {
        let (_a, mut b) = pair();
        let mut buf = [0u8; 16];
        assert_eq!(b.receive(&mut buf, 20).unwrap(), 0);
    }

    #[test]
    fn peer_close_is_reported() {
        let (a, mut b) = pair();
        drop(a);
        let mut buf = [0u8; 16];
        assert!(matches!(b.receive(&mut buf, 200), Err(TransportError::Closed)));
    }
}
