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

use std::net::TcpListener;
use std::path::Path;
use std::sync::Arc;
use std::thread;

use log::{error, info, warn};
use openssl::ssl::{SslAcceptor, SslFiletype, SslMethod};

use crate::imap::server::{
    run_listener, ConnectionConfig, ListenMode, Session, SessionFactory,
    SessionFeatures,
};
use crate::memstore::MemStore;
use crate::support::system_config::{SystemConfig, TlsConfig};

// Need to use a this and not die! so that errors go to syslog/etc
macro_rules! fatal {
    ($ex:ident, $($stuff:tt)*) => {{
        error!($($stuff)*);
        crate::support::sysexits::$ex.exit()
    }}
}

pub fn serve(system_config: SystemConfig, system_root: impl AsRef<Path>) {
    let system_root = system_root.as_ref();
    let mut config = ConnectionConfig::new(&system_config.imap);
    config.acceptor = system_config
        .tls
        .as_ref()
        .map(|tls| create_ssl_acceptor(tls, system_root));
    config.insecure_auth = system_config.server.insecure_auth;
    config.debug_trace = system_config.server.debug_trace;

    if config.debug_trace {
        warn!(
            "debug_trace is enabled; passwords and message content will be \
             written to standard error"
        );
    }
    if config.insecure_auth {
        warn!("insecure_auth is enabled; passwords may be sent in the clear");
    }

    let mut listeners = Vec::new();
    if let Some(ref addr) = system_config.server.listen {
        listeners.push((bind(addr), ListenMode::Plain));
    }
    if let Some(ref addr) = system_config.server.listen_tls {
        if config.acceptor.is_none() {
            fatal!(EX_CONFIG, "listen_tls requires a [tls] section");
        }
        listeners.push((bind(addr), ListenMode::ImplicitTls));
    }
    if listeners.is_empty() {
        fatal!(EX_CONFIG, "Neither listen nor listen_tls is configured");
    }

    let store = Arc::new(MemStore::new(&system_config.users));
    if 0 == store.num_users() {
        warn!("No users are configured; nobody will be able to log in");
    }
    info!("Serving {} user(s) from memory", store.num_users());

    let factory: Arc<SessionFactory> = Arc::new(move || {
        Box::new(store.session(SessionFeatures::all())) as Box<dyn Session>
    });

    let handles = listeners
        .into_iter()
        .map(|(listener, mode)| {
            let config = config.clone();
            let factory = Arc::clone(&factory);
            thread::Builder::new()
                .name("imap-listener".to_owned())
                .spawn(move || run_listener(listener, mode, config, factory))
                .unwrap_or_else(|e| {
                    fatal!(EX_OSERR, "Unable to start listener thread: {}", e)
                })
        })
        .collect::<Vec<_>>();

    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => (),
            Ok(Err(e)) => fatal!(EX_OSERR, "Listener failed: {}", e),
            Err(_) => fatal!(EX_SOFTWARE, "Listener thread panicked"),
        }
    }
}

pub fn check_config(system_config: &SystemConfig, system_root: &Path) {
    if let Some(ref tls) = system_config.tls {
        create_ssl_acceptor(tls, system_root);
        info!("TLS configuration OK");
    } else if system_config.server.listen_tls.is_some() {
        fatal!(EX_CONFIG, "listen_tls requires a [tls] section");
    } else {
        warn!("No [tls] section; STARTTLS will not be offered");
    }

    for user in &system_config.users {
        if user.password.is_empty() {
            warn!("User {} has an empty password", user.name);
        }
    }

    info!(
        "Configuration OK: {} user(s), listening on {}",
        system_config.users.len(),
        system_config
            .server
            .listen
            .iter()
            .chain(system_config.server.listen_tls.iter())
            .cloned()
            .collect::<Vec<_>>()
            .join(", ")
    );
}

fn bind(addr: &str) -> TcpListener {
    TcpListener::bind(addr).unwrap_or_else(|e| {
        fatal!(EX_UNAVAILABLE, "Unable to listen on {}: {}", addr, e)
    })
}

fn create_ssl_acceptor(tls: &TlsConfig, system_root: &Path) -> SslAcceptor {
    let mut acceptor =
        match SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()) {
            Ok(a) => a,
            Err(e) => fatal!(
                EX_SOFTWARE,
                "Failed to initialise OpenSSL acceptor: {}",
                e
            ),
        };

    let private_key_path = system_root.join(&tls.private_key);
    if let Err(e) =
        acceptor.set_private_key_file(&private_key_path, SslFiletype::PEM)
    {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS private key from '{}': {}",
            private_key_path.display(),
            e
        );
    }

    let certificate_path = system_root.join(&tls.certificate_chain);
    if let Err(e) = acceptor.set_certificate_chain_file(&certificate_path) {
        fatal!(
            EX_CONFIG,
            "Unable to load TLS certificate chain from '{}': {}",
            certificate_path.display(),
            e
        );
    }

    if let Err(e) = acceptor.check_private_key() {
        fatal!(EX_CONFIG, "TLS key seems to be invalid: {}", e);
    }

    acceptor.build()
}
