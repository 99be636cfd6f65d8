//! In-memory transports for unit tests.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use super::{DatagramTransport, StreamTransport};

/// Everything a mock transport observed.
#[derive(Debug, Default)]
pub(crate) struct MockLog {
    pub written: Vec<u8>,
    pub write_calls: usize,
    pub read_calls: usize,
    pub read_timeouts: Vec<Option<Duration>>,
    pub write_timeouts: Vec<Option<Duration>>,
    pub sent: Vec<(Vec<u8>, SocketAddr)>,
    pub shutdown: bool,
}

/// A scripted byte stream.
///
/// Reads pop chunks from `reads`; an exhausted script reports `WouldBlock`
/// (a timeout) unless `eof_when_drained` is set. Writes take their outcome
/// from `writes` first; `Ok(n)` accepts at most `n` bytes.
#[derive(Debug, Default)]
pub(crate) struct MockStream {
    pub id: usize,
    pub reads: VecDeque<io::Result<Vec<u8>>>,
    pub eof_when_drained: bool,
    pub writes: VecDeque<io::Result<usize>>,
    pub write_error: Option<io::ErrorKind>,
    pub log: Arc<Mutex<MockLog>>,
}

impl MockStream {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            ..Default::default()
        }
    }

    pub fn with_chunks<I>(chunks: I) -> Self
    where
        I: IntoIterator<Item = Vec<u8>>,
    {
        Self {
            reads: chunks.into_iter().map(Ok).collect(),
            ..Default::default()
        }
    }

    pub fn failing_writes(id: usize, kind: io::ErrorKind) -> Self {
        Self {
            id,
            write_error: Some(kind),
            ..Default::default()
        }
    }

    pub fn log(&self) -> Arc<Mutex<MockLog>> {
        Arc::clone(&self.log)
    }
}

fn next_chunk(
    reads: &mut VecDeque<io::Result<Vec<u8>>>,
    eof_when_drained: bool,
    buf: &mut [u8],
) -> io::Result<usize> {
    match reads.pop_front() {
        Some(Ok(mut chunk)) => {
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            if n < chunk.len() {
                reads.push_front(Ok(chunk.split_off(n)));
            }
            Ok(n)
        }
        Some(Err(e)) => Err(e),
        None if eof_when_drained => Ok(0),
        None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no scripted data")),
    }
}

impl Read for MockStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.log.lock().read_calls += 1;
        next_chunk(&mut self.reads, self.eof_when_drained, buf)
    }
}

impl Write for MockStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut log = self.log.lock();
        log.write_calls += 1;
        let n = match self.writes.pop_front() {
            Some(Ok(n)) => n.min(buf.len()),
            Some(Err(e)) => return Err(e),
            None => match self.write_error {
                Some(kind) => return Err(io::Error::new(kind, "scripted write failure")),
                None => buf.len(),
            },
        };
        log.written.extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl StreamTransport for MockStream {
    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.log.lock().read_timeouts.push(timeout);
        Ok(())
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.log.lock().write_timeouts.push(timeout);
        Ok(())
    }

    fn peer_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 9000)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 10_000 + self.id as u16)))
    }

    fn shutdown(&self) -> io::Result<()> {
        self.log.lock().shutdown = true;
        Ok(())
    }
}

/// A scripted datagram socket.
///
/// The first `send_interrupts` sends and `recv_interrupts` receives fail with
/// `Interrupted`.
#[derive(Debug, Default)]
pub(crate) struct MockDatagram {
    pub datagrams: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    pub send_interrupts: Mutex<usize>,
    pub recv_interrupts: Mutex<usize>,
    pub log: Arc<Mutex<MockLog>>,
}

impl MockDatagram {
    pub fn with_datagrams<I>(datagrams: I) -> Self
    where
        I: IntoIterator<Item = (Vec<u8>, SocketAddr)>,
    {
        Self {
            datagrams: Mutex::new(datagrams.into_iter().collect()),
            ..Default::default()
        }
    }

    pub fn log(&self) -> Arc<Mutex<MockLog>> {
        Arc::clone(&self.log)
    }
}

fn take_interrupt(remaining: &Mutex<usize>) -> io::Result<()> {
    let mut remaining = remaining.lock();
    if *remaining == 0 {
        return Ok(());
    }
    *remaining -= 1;
    Err(io::ErrorKind::Interrupted.into())
}

impl DatagramTransport for MockDatagram {
    fn send_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        take_interrupt(&self.send_interrupts)?;
        let mut log = self.log.lock();
        log.write_calls += 1;
        log.sent.push((buf.to_vec(), addr));
        Ok(buf.len())
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        take_interrupt(&self.recv_interrupts)?;
        match self.datagrams.lock().pop_front() {
            Some((data, from)) => {
                // Oversized datagrams are truncated, as with a real socket.
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(io::Error::new(io::ErrorKind::WouldBlock, "no scripted data")),
        }
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.log.lock().read_timeouts.push(timeout);
        Ok(())
    }

    fn set_write_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.log.lock().write_timeouts.push(timeout);
        Ok(())
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(SocketAddr::from(([127, 0, 0, 1], 9100)))
    }
}
