//! Time and byte-stream seams shared by the broker client and the control server.

use std::{
    io::{self, Read, Write},
    net::{Shutdown, SocketAddr, SocketAddrV4, TcpListener, TcpStream},
    sync::OnceLock,
    thread,
    time::{Duration, Instant},
};

use log::debug;

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
    fn sleep_ms(&self, ms: u64);
}

/// Milliseconds since the first call in this process.
pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_millis() as u64
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }
}

/// Connected byte stream. `read` never blocks waiting for data that is not yet
/// `available`.
pub trait Stream: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;
    fn flush(&mut self) -> io::Result<()>;
    fn available(&mut self) -> io::Result<usize>;
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn is_connected(&mut self) -> bool;
    fn close(&mut self);
}

pub trait Connector: Send {
    type Stream: Stream;

    fn connect(&mut self, addr: SocketAddrV4, timeout: Duration) -> io::Result<Self::Stream>;
}

/// Non-blocking accept: `Ok(None)` when no client is waiting.
pub trait Listener: Send {
    type Stream: Stream;

    fn accept(&mut self) -> io::Result<Option<Self::Stream>>;
}

/// Creates the control listener on demand so it can be dropped while the link is down.
pub trait Bind: Send {
    type Listener: Listener;

    fn bind(&mut self) -> io::Result<Self::Listener>;
}

pub struct TcpTransport {
    stream: TcpStream,
    open: bool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        stream.set_nonblocking(false)?;
        stream.set_write_timeout(Some(Duration::from_secs(5)))?;
        Ok(Self { stream, open: true })
    }
}

impl Stream for TcpTransport {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).inspect_err(|_| self.open = false)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.stream.flush()
    }

    fn available(&mut self) -> io::Result<usize> {
        if !self.open {
            return Ok(0);
        }

        let mut peek_buf = [0_u8; 1024];
        self.stream.set_nonblocking(true)?;
        let peeked = self.stream.peek(&mut peek_buf);
        self.stream.set_nonblocking(false)?;

        match peeked {
            Ok(0) => {
                self.open = false;
                Ok(0)
            }
            Ok(count) => Ok(count),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) => {
                self.open = false;
                Err(err)
            }
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let ready = self.available()?;
        if ready == 0 || buf.is_empty() {
            return Ok(0);
        }
        let limit = ready.min(buf.len());
        self.stream.read(&mut buf[..limit])
    }

    fn is_connected(&mut self) -> bool {
        if self.open {
            let _ = self.available();
        }
        self.open
    }

    fn close(&mut self) {
        if self.open {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.open = false;
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Stream = TcpTransport;

    fn connect(&mut self, addr: SocketAddrV4, timeout: Duration) -> io::Result<TcpTransport> {
        debug!("tcp connect to {addr} (timeout {}ms)", timeout.as_millis());
        let stream = TcpStream::connect_timeout(&SocketAddr::V4(addr), timeout)?;
        TcpTransport::new(stream)
    }
}

pub struct TcpControlListener {
    listener: TcpListener,
}

impl TcpControlListener {
    pub fn bind(addr: SocketAddr) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }
}

impl Listener for TcpControlListener {
    type Stream = TcpTransport;

    fn accept(&mut self) -> io::Result<Option<TcpTransport>> {
        match self.listener.accept() {
            Ok((stream, peer)) => {
                debug!("control client connected from {peer}");
                TcpTransport::new(stream).map(Some)
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err),
        }
    }
}

/// Binds the control listener on a fixed socket address.
#[derive(Debug, Clone, Copy)]
pub struct TcpBind {
    pub addr: SocketAddr,
}

impl Bind for TcpBind {
    type Listener = TcpControlListener;

    fn bind(&mut self) -> io::Result<TcpControlListener> {
        TcpControlListener::bind(self.addr)
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use super::*;

    fn accept_within(listener: &mut TcpControlListener, ms: u64) -> TcpTransport {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            if let Some(stream) = listener.accept().unwrap() {
                return stream;
            }
            assert!(Instant::now() < deadline, "no client accepted");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn available_within(stream: &mut TcpTransport, ms: u64) -> usize {
        let deadline = Instant::now() + Duration::from_millis(ms);
        loop {
            let ready = stream.available().unwrap();
            if ready > 0 || Instant::now() >= deadline {
                return ready;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn monotonic_clock_does_not_go_backwards() {
        let clock = SystemClock;
        let first = clock.now_ms();
        clock.sleep_ms(2);
        assert!(clock.now_ms() >= first + 1);
    }

    #[test]
    fn loopback_exchange_over_tcp_transport() {
        let mut listener =
            TcpControlListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
        assert!(listener.accept().unwrap().is_none());

        let port = listener.local_addr().unwrap().port();
        let mut client = TcpConnector
            .connect(
                SocketAddrV4::new(Ipv4Addr::LOCALHOST, port),
                Duration::from_secs(1),
            )
            .unwrap();
        let mut server = accept_within(&mut listener, 1000);

        client.write_all(b"ping").unwrap();
        client.flush().unwrap();
        assert_eq!(available_within(&mut server, 1000), 4);

        let mut buf = [0_u8; 16];
        let read = server.read(&mut buf).unwrap();
        assert_eq!(&buf[..read], b"ping");
        assert_eq!(server.available().unwrap(), 0);
        assert_eq!(server.read(&mut buf).unwrap(), 0);

        client.close();
        assert!(!client.is_connected());
    }
}
