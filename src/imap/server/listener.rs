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

//! Accepting connections.

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use super::conn::{Connection, ConnectionConfig};
use super::session::Session;
use crate::imap::transport::Transport;
use crate::support::log_prefix::LogPrefix;

/// Creates a fresh session for each accepted connection.
pub type SessionFactory = dyn Fn() -> Box<dyn Session> + Send + Sync;

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// How a listener's connections start out.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListenMode {
    /// Cleartext, with STARTTLS if the configuration has an acceptor.
    Plain,
    /// TLS from the first byte.
    ImplicitTls,
}

/// Accept connections forever, serving each on its own thread.
///
/// Returns only when `accept` fails with an error that is not transient.
pub fn run_listener(
    listener: TcpListener,
    mode: ListenMode,
    config: ConnectionConfig,
    factory: Arc<SessionFactory>,
) -> io::Result<()> {
    if ListenMode::ImplicitTls == mode && config.acceptor.is_none() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "implicit TLS listener requires TLS configuration",
        ));
    }

    info!(
        "Listening on {} ({:?})",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "?".to_owned()),
        mode
    );

    let mut backoff = MIN_BACKOFF;
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => {
                backoff = MIN_BACKOFF;
                stream
            }
            Err(e) if is_transient(&e) => {
                warn!("Accept failed, retrying in {:?}: {}", backoff, e);
                thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
                continue;
            }
            Err(e) => {
                error!("Accept failed, stopping listener: {}", e);
                return Err(e);
            }
        };

        let config = config.clone();
        let factory = Arc::clone(&factory);
        let spawned = thread::Builder::new()
            .name("imap-conn".to_owned())
            .spawn(move || serve_connection(stream, mode, config, &*factory));
        if let Err(e) = spawned {
            error!("Unable to spawn connection thread: {}", e);
        }
    }
}

fn is_transient(e: &io::Error) -> bool {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => true,
        _ => matches!(
            e.raw_os_error(),
            Some(nix::libc::EMFILE)
                | Some(nix::libc::ENFILE)
                | Some(nix::libc::ENOBUFS)
                | Some(nix::libc::ENOMEM)
        ),
    }
}

fn serve_connection(
    stream: TcpStream,
    mode: ListenMode,
    config: ConnectionConfig,
    factory: &SessionFactory,
) {
    let log_prefix = LogPrefix::new("imap".to_owned());
    match stream.peer_addr() {
        Ok(peer) => log_prefix.set_peer(peer.to_string()),
        Err(e) => warn!("Unable to determine peer address: {}", e),
    }

    let _ = stream.set_nodelay(true);
    let transport = match Transport::new(Box::new(stream)) {
        Ok(transport) => transport,
        Err(e) => {
            warn!("{} Unable to set up connection: {}", log_prefix, e);
            return;
        }
    };

    if let (ListenMode::ImplicitTls, Some(acceptor)) =
        (mode, config.acceptor.as_ref())
    {
        transport.set_read_timeout(Some(config.unauthenticated_timeout));
        transport.set_write_timeout(Some(config.write_timeout));
        if let Err(e) = transport.start_tls_server(acceptor, Vec::new()) {
            warn!("{} TLS handshake failed: {}", log_prefix, e);
            return;
        }
        log_prefix.set_tls();
    }

    // Errors are logged by the connection itself.
    let _ = Connection::new(factory(), transport, config, log_prefix).run();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn transient_errors() {
        assert!(is_transient(&io::Error::from(
            io::ErrorKind::ConnectionAborted
        )));
        assert!(is_transient(&io::Error::from_raw_os_error(
            nix::libc::EMFILE
        )));
        assert!(!is_transient(&io::Error::from_raw_os_error(
            nix::libc::EBADF
        )));
    }
}
