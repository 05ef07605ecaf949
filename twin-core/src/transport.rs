//! Transport contract injected into the link, plus the byte ring shared between an
//! interrupt-style producer and the polling consumer, and an in-memory loopback pair.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Millisecond time source and delay primitive. Wraps at `u32::MAX`; compare with `wrapping_sub`.
pub trait Clock {
    fn now_ms(&self) -> u32;
    fn delay_ms(&self, ms: u32);
}

/// Wall clock counting from construction.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u32 {
        self.epoch.elapsed().as_millis() as u32
    }

    fn delay_ms(&self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms as u64));
    }
}

/// Any duplex byte link: inter-controller serial link, TCP socket, or loopback.
pub trait Transport: Clock {
    /// Queue `bytes` for transmission, all or nothing.
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Block up to `timeout_ms` for at least one byte, then return what is available
    /// (up to `buf.len()`). `Ok(0)` means the timeout elapsed with nothing received.
    fn receive(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, TransportError>;
}

impl<T: Clock + ?Sized> Clock for Box<T> {
    fn now_ms(&self) -> u32 {
        (**self).now_ms()
    }

    fn delay_ms(&self, ms: u32) {
        (**self).delay_ms(ms)
    }
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        (**self).send(bytes)
    }

    fn receive(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, TransportError> {
        (**self).receive(buf, timeout_ms)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("transmit buffer full: {requested} bytes requested, {free} free")]
    Overflow { requested: usize, free: usize },
    #[error("link closed")]
    Closed,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

// ── Byte ring ────────────────────────────────────────────────────────────────

/// Bounded single-producer/single-consumer byte queue.
///
/// One slot is always left empty so that `read == write` means empty and
/// `write + 1 == read` means full; usable capacity is `size - 1`.
#[derive(Debug, Clone)]
pub struct ByteRing {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RingError {
    #[error("ring overflow: {requested} bytes requested, {free} free")]
    Overflow { requested: usize, free: usize },
}

impl ByteRing {
    /// `size` is the storage size; at least 2 so one byte is usable.
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size.max(2)].into_boxed_slice(),
            read: 0,
            write: 0,
        }
    }

    /// Usable capacity (storage size - 1).
    pub fn capacity(&self) -> usize {
        self.buf.len() - 1
    }

    pub fn len(&self) -> usize {
        (self.write + self.buf.len() - self.read) % self.buf.len()
    }

    pub fn free(&self) -> usize {
        self.capacity() - self.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read == self.write
    }

    pub fn is_full(&self) -> bool {
        (self.write + 1) % self.buf.len() == self.read
    }

    pub fn push(&mut self, byte: u8) -> Result<(), RingError> {
        if self.is_full() {
            return Err(RingError::Overflow {
                requested: 1,
                free: 0,
            });
        }
        self.buf[self.write] = byte;
        self.write = (self.write + 1) % self.buf.len();
        Ok(())
    }

    /// Push every byte of `bytes` or none of them.
    pub fn push_slice(&mut self, bytes: &[u8]) -> Result<(), RingError> {
        let free = self.free();
        if bytes.len() > free {
            return Err(RingError::Overflow {
                requested: bytes.len(),
                free,
            });
        }
        for &b in bytes {
            self.buf[self.write] = b;
            self.write = (self.write + 1) % self.buf.len();
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Option<u8> {
        if self.is_empty() {
            return None;
        }
        let b = self.buf[self.read];
        self.read = (self.read + 1) % self.buf.len();
        Some(b)
    }

    /// Move up to `out.len()` bytes out of the ring. Returns the count moved.
    pub fn pop_into(&mut self, out: &mut [u8]) -> usize {
        let mut n = 0;
        while n < out.len() {
            match self.pop() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn clear(&mut self) {
        self.read = 0;
        self.write = 0;
    }
}

// ── Loopback ─────────────────────────────────────────────────────────────────

/// Default storage size for each direction of a loopback pair.
pub const DEFAULT_LOOPBACK_SIZE: usize = 4096;

#[derive(Debug)]
struct Pipe {
    ring: Mutex<ByteRing>,
    ready: Condvar,
}

impl Pipe {
    fn new(size: usize) -> Self {
        Self {
            ring: Mutex::new(ByteRing::new(size)),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ByteRing> {
        self.ring.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One end of an in-memory duplex link. Receivers park on a condition variable
/// until bytes arrive or the timeout elapses; nothing spins.
#[derive(Debug, Clone)]
pub struct LoopbackTransport {
    tx: Arc<Pipe>,
    rx: Arc<Pipe>,
    clock: SystemClock,
}

/// Two connected ends; bytes sent on one are received on the other.
pub fn loopback_pair(size: usize) -> (LoopbackTransport, LoopbackTransport) {
    let a_to_b = Arc::new(Pipe::new(size));
    let b_to_a = Arc::new(Pipe::new(size));
    let clock = SystemClock::new();
    (
        LoopbackTransport {
            tx: a_to_b.clone(),
            rx: b_to_a.clone(),
            clock,
        },
        LoopbackTransport {
            tx: b_to_a,
            rx: a_to_b,
            clock,
        },
    )
}

impl Clock for LoopbackTransport {
    fn now_ms(&self) -> u32 {
        self.clock.now_ms()
    }

    fn delay_ms(&self, ms: u32) {
        self.clock.delay_ms(ms)
    }
}

impl Transport for LoopbackTransport {
    fn send(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut ring = self.tx.lock();
        ring.push_slice(bytes).map_err(|RingError::Overflow { requested, free }| {
            TransportError::Overflow { requested, free }
        })?;
        drop(ring);
        self.tx.ready.notify_all();
        Ok(())
    }

    fn receive(&mut self, buf: &mut [u8], timeout_ms: u32) -> Result<usize, TransportError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let ring = self.rx.lock();
        let (mut ring, _) = self
            .rx
            .ready
            .wait_timeout_while(ring, Duration::from_millis(timeout_ms as u64), |r| r.is_empty())
            .unwrap_or_else(|e| e.into_inner());
        Ok(ring.pop_into(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_reserves_one_slot() {
        let mut ring = ByteRing::new(8);
        assert_eq!(ring.capacity(), 7);
        assert!(ring.push_slice(&[1, 2, 3, 4, 5, 6, 7]).is_ok());
        assert!(ring.is_full());
        assert_eq!(
            ring.push(8),
            Err(RingError::Overflow {
                requested: 1,
                free: 0
            })
        );
        assert_eq!(ring.len(), 7);
    }

    #[test]
    fn ring_push_slice_is_all_or_nothing() {
        let mut ring = ByteRing::new(8);
        ring.push_slice(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(
            ring.push_slice(&[6, 7, 8]),
            Err(RingError::Overflow {
                requested: 3,
                free: 2
            })
        );
        assert_eq!(ring.len(), 5);
    }

    #[test]
    fn ring_wraps_in_order() {
        let mut ring = ByteRing::new(4);
        let mut out = Vec::new();
        for round in 0..10u8 {
            ring.push_slice(&[round, round.wrapping_add(100)]).unwrap();
            out.push(ring.pop().unwrap());
            out.push(ring.pop().unwrap());
        }
        let expected: Vec<u8> = (0..10u8).flat_map(|r| [r, r + 100]).collect();
        assert_eq!(out, expected);
        assert!(ring.is_empty());
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn ring_pop_into_partial() {
        let mut ring = ByteRing::new(16);
        ring.push_slice(b"abcdef").unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(ring.pop_into(&mut buf), 4);
        assert_eq!(&buf, b"abcd");
        assert_eq!(ring.pop_into(&mut buf), 2);
        assert_eq!(&buf[..2], b"ef");
    }

    #[test]
    fn loopback_delivers_both_ways() {
        let (mut a, mut b) = loopback_pair(64);
        a.send(b"ping").unwrap();
        let mut buf = [0u8; 16];
        let n = b.receive(&mut buf, 50).unwrap();
        assert_eq!(&buf[..n], b"ping");
        b.send(b"pong").unwrap();
        let n = a.receive(&mut buf, 50).unwrap();
        assert_eq!(&buf[..n], b"pong");
    }

    #[test]
    fn loopback_receive_times_out_empty() {
        let (mut a, _b) = loopback_pair(64);
        let mut buf = [0u8; 16];
        let start = Instant::now();
        assert_eq!(a.receive(&mut buf, 20).unwrap(), 0);
        assert!(start.elapsed() >= Duration::from_millis(15));
    }

    #[test]
    fn loopback_send_overflow_is_reported() {
        let (mut a, _b) = loopback_pair(8);
        a.send(&[0; 7]).unwrap();
        assert!(matches!(
            a.send(&[1]),
            Err(TransportError::Overflow {
                requested: 1,
                free: 0
            })
        ));
    }

    #[test]
    fn loopback_wakes_parked_receiver() {
        let (mut a, mut b) = loopback_pair(64);
        let handle = std::thread::spawn(move || {
            let mut buf = [0u8; 8];
            let n = b.receive(&mut buf, 2000).unwrap();
            buf[..n].to_vec()
        });
        std::thread::sleep(Duration::from_millis(10));
        a.send(b"hi").unwrap();
        assert_eq!(handle.join().unwrap(), b"hi");
    }
}
