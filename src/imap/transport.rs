//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Tidemap.
//
// Tidemap is free software: you can  redistribute it and/or modify it under the
// terms of  the GNU General Public  License as published by  the Free Software
// Foundation, either version  3 of the License, or (at  your option) any later
// version.
//
// Tidemap is distributed  in the hope that  it will be useful,  but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Tidemap. If not, see <http://www.gnu.org/licenses/>.

//! The byte stream underneath a connection.
//!
//! A `Transport` wraps one socket which is put into non-blocking mode. Reads
//! and writes each take the stream lock only for one non-blocking attempt and
//! release it while waiting with `poll()`, so one thread can be blocked
//! reading while another writes, as happens during IDLE and on the client
//! when the reader thread runs alongside issuing threads.
//!
//! The stream can be upgraded to TLS in place exactly once. Any bytes that
//! were read past the upgrade point (and are sitting in some buffer above the
//! transport) are handed back and replayed into the handshake.

use std::fmt;
use std::io::{self, Cursor, Read, Write};
use std::mem;
use std::net::TcpStream;
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crossbeam::atomic::AtomicCell;
use nix::poll::{poll, PollFd, PollFlags};
use openssl::ssl::{
    ErrorCode, HandshakeError, SslAcceptor, SslConnector, SslStream,
};

pub trait Socket: Read + Write + AsRawFd + Send + 'static {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()>;
}

impl Socket for TcpStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        TcpStream::set_nonblocking(self, nonblocking)
    }
}

impl Socket for UnixStream {
    fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        UnixStream::set_nonblocking(self, nonblocking)
    }
}

/// The raw socket, preceded by bytes that were already read off it once.
struct Replay {
    buffered: Cursor<Vec<u8>>,
    socket: Box<dyn Socket>,
}

impl Read for Replay {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if (self.buffered.position() as usize) < self.buffered.get_ref().len()
        {
            self.buffered.read(buf)
        } else {
            self.socket.read(buf)
        }
    }
}

impl Write for Replay {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.socket.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.socket.flush()
    }
}

impl Replay {
    fn unread(&mut self, mut data: Vec<u8>) {
        let pos = self.buffered.position() as usize;
        data.extend_from_slice(&self.buffered.get_ref()[pos..]);
        self.buffered = Cursor::new(data);
    }
}

enum Layer {
    Plain(Replay),
    Tls(SslStream<Replay>),
    /// A TLS handshake failed after the plain stream was given up.
    Broken,
}

/// What an individual non-blocking operation reported.
enum Attempt<T> {
    Done(T),
    Wait(PollFlags),
}

impl Layer {
    fn try_read(&mut self, buf: &mut [u8]) -> io::Result<Attempt<usize>> {
        match *self {
            Layer::Plain(ref mut replay) => match replay.read(buf) {
                Ok(n) => Ok(Attempt::Done(n)),
                Err(e) if io::ErrorKind::WouldBlock == e.kind() => {
                    Ok(Attempt::Wait(PollFlags::POLLIN))
                }
                Err(e) => Err(e),
            },
            Layer::Tls(ref mut ssl) => match ssl.ssl_read(buf) {
                Ok(n) => Ok(Attempt::Done(n)),
                Err(e) => ssl_attempt(e),
            },
            Layer::Broken => Err(broken()),
        }
    }

    fn try_write(&mut self, buf: &[u8]) -> io::Result<Attempt<usize>> {
        match *self {
            Layer::Plain(ref mut replay) => match replay.write(buf) {
                Ok(n) => Ok(Attempt::Done(n)),
                Err(e) if io::ErrorKind::WouldBlock == e.kind() => {
                    Ok(Attempt::Wait(PollFlags::POLLOUT))
                }
                Err(e) => Err(e),
            },
            Layer::Tls(ref mut ssl) => match ssl.ssl_write(buf) {
                Ok(n) => Ok(Attempt::Done(n)),
                Err(e) => ssl_attempt(e),
            },
            Layer::Broken => Err(broken()),
        }
    }

    fn take_plain(&mut self) -> io::Result<Replay> {
        match mem::replace(self, Layer::Broken) {
            Layer::Plain(replay) => Ok(replay),
            other => {
                *self = other;
                Err(io::Error::new(
                    io::ErrorKind::Other,
                    "TLS already active",
                ))
            }
        }
    }
}

fn ssl_attempt(e: openssl::ssl::Error) -> io::Result<Attempt<usize>> {
    match e.code() {
        ErrorCode::WANT_READ => Ok(Attempt::Wait(PollFlags::POLLIN)),
        ErrorCode::WANT_WRITE => Ok(Attempt::Wait(PollFlags::POLLOUT)),
        ErrorCode::ZERO_RETURN => Ok(Attempt::Done(0)),
        ErrorCode::SYSCALL if e.io_error().is_none() => Ok(Attempt::Done(0)),
        _ => Err(e
            .into_io_error()
            .unwrap_or_else(|e| io::Error::new(io::ErrorKind::Other, e))),
    }
}

fn broken() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "TLS handshake failed")
}

struct Shared {
    layer: Mutex<Layer>,
    fd: RawFd,
    read_timeout: AtomicCell<Option<Duration>>,
    write_timeout: AtomicCell<Option<Duration>>,
}

impl Shared {
    fn wait(
        &self,
        flags: PollFlags,
        timeout: Option<Duration>,
    ) -> io::Result<()> {
        let mut fds = [PollFd::new(self.fd, flags | PollFlags::POLLERR)];
        let millis = timeout.map_or(-1, |t| {
            t.as_millis().min(i32::MAX as u128) as nix::libc::c_int
        });
        handle_poll_result(poll(&mut fds, millis))
    }
}

fn handle_poll_result(
    result: Result<nix::libc::c_int, nix::Error>,
) -> io::Result<()> {
    match result {
        Ok(0) => {
            Err(io::Error::new(io::ErrorKind::TimedOut, "Socket timed out"))
        }
        Ok(_) => Ok(()),
        Err(nix::Error::Sys(nix::errno::Errno::EINTR)) => Ok(()),
        Err(e) => Err(nix_to_io(e)),
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    match e.as_errno() {
        Some(errno) => io::Error::from_raw_os_error(errno as i32),
        None => io::Error::new(io::ErrorKind::Other, e),
    }
}

/// A handle on a connection's byte stream.
///
/// Cloning produces another handle on the same stream.
#[derive(Clone)]
pub struct Transport(Arc<Shared>);

impl fmt::Debug for Transport {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Transport(fd={})", self.0.fd)
    }
}

impl Transport {
    pub fn new(socket: Box<dyn Socket>) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();
        Ok(Transport(Arc::new(Shared {
            layer: Mutex::new(Layer::Plain(Replay {
                buffered: Cursor::new(Vec::new()),
                socket,
            })),
            fd,
            read_timeout: AtomicCell::new(None),
            write_timeout: AtomicCell::new(None),
        })))
    }

    pub fn reader(&self) -> Reader {
        Reader(Arc::clone(&self.0))
    }

    pub fn writer(&self) -> Writer {
        Writer(Arc::clone(&self.0))
    }

    /// Set how long any single read may wait for data. `None` waits forever.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.0.read_timeout.store(timeout);
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.0.write_timeout.store(timeout);
    }

    pub fn is_tls(&self) -> bool {
        matches!(*self.0.layer.lock().unwrap(), Layer::Tls(_))
    }

    /// A human-readable description of the negotiated TLS parameters.
    pub fn tls_description(&self) -> Option<String> {
        match *self.0.layer.lock().unwrap() {
            Layer::Tls(ref ssl) => Some(format!(
                "{} {}",
                ssl.ssl().version_str(),
                ssl.ssl()
                    .current_cipher()
                    .map(|c| c.name())
                    .unwrap_or("(no cipher)"),
            )),
            _ => None,
        }
    }

    /// Shut the socket down in both directions, waking any blocked reader.
    pub fn shutdown(&self) {
        let _ = nix::sys::socket::shutdown(
            self.0.fd,
            nix::sys::socket::Shutdown::Both,
        );
    }

    /// Perform the server side of a TLS handshake in place.
    ///
    /// `unread` holds bytes already taken off the stream beyond the point
    /// where TLS begins. They are fed to the handshake before anything else.
    pub fn start_tls_server(
        &self,
        acceptor: &SslAcceptor,
        unread: Vec<u8>,
    ) -> io::Result<()> {
        let mut layer = self.0.layer.lock().unwrap();
        let mut replay = layer.take_plain()?;
        replay.unread(unread);

        let ssl = self.complete_handshake(acceptor.accept(replay))?;
        *layer = Layer::Tls(ssl);
        Ok(())
    }

    /// Perform the client side of a TLS handshake in place.
    pub fn start_tls_client(
        &self,
        connector: &SslConnector,
        domain: &str,
        unread: Vec<u8>,
    ) -> io::Result<()> {
        let mut layer = self.0.layer.lock().unwrap();
        let mut replay = layer.take_plain()?;
        replay.unread(unread);

        let ssl = self.complete_handshake(connector.connect(domain, replay))?;
        *layer = Layer::Tls(ssl);
        Ok(())
    }

    fn complete_handshake(
        &self,
        mut result: Result<SslStream<Replay>, HandshakeError<Replay>>,
    ) -> io::Result<SslStream<Replay>> {
        loop {
            match result {
                Ok(ssl) => return Ok(ssl),
                Err(HandshakeError::WouldBlock(mid)) => {
                    let flags = if ErrorCode::WANT_WRITE == mid.error().code()
                    {
                        PollFlags::POLLOUT
                    } else {
                        PollFlags::POLLIN
                    };
                    self.0.wait(flags, self.0.read_timeout.load())?;
                    result = mid.handshake();
                }
                Err(HandshakeError::SetupFailure(e)) => {
                    return Err(io::Error::new(io::ErrorKind::Other, e))
                }
                Err(HandshakeError::Failure(mid)) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("TLS handshake failed: {}", mid.error()),
                    ))
                }
            }
        }
    }
}

/// The read half of a `Transport`.
pub struct Reader(Arc<Shared>);

impl Read for Reader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let attempt = self.0.layer.lock().unwrap().try_read(buf);
            match attempt {
                Ok(Attempt::Done(n)) => return Ok(n),
                Ok(Attempt::Wait(flags)) => {
                    self.0.wait(flags, self.0.read_timeout.load())?
                }
                Err(e) if io::ErrorKind::Interrupted == e.kind() => (),
                Err(e) => return Err(e),
            }
        }
    }
}

/// The write half of a `Transport`.
pub struct Writer(Arc<Shared>);

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        loop {
            let attempt = self.0.layer.lock().unwrap().try_write(buf);
            match attempt {
                Ok(Attempt::Done(n)) => return Ok(n),
                Ok(Attempt::Wait(flags)) => {
                    self.0.wait(flags, self.0.write_timeout.load())?
                }
                Err(e) if io::ErrorKind::Interrupted == e.kind() => (),
                Err(e) => return Err(e),
            }
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match *self.0.layer.lock().unwrap() {
            Layer::Plain(ref mut replay) => replay.flush(),
            Layer::Tls(ref mut ssl) => ssl.get_mut().flush(),
            Layer::Broken => Err(broken()),
        }
    }
}
