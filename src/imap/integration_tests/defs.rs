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

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use regex::Regex;

use crate::imap::client::{self, Client, ClientOptions};
use crate::imap::server::{
    Connection, ConnectionConfig, Session, SessionFeatures,
};
use crate::imap::transport::Transport;
use crate::memstore::{MemSession, MemStore};
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::UserConfig;

pub use crate::test_data::SIMPLE_MESSAGE;

pub struct Setup {
    store: Arc<MemStore>,
}

pub fn set_up() -> Setup {
    crate::init_test_log();

    Setup {
        store: Arc::new(MemStore::new(&[
            UserConfig {
                name: "azure".to_owned(),
                password: "hunter2".to_owned(),
            },
            UserConfig {
                name: "bleu".to_owned(),
                password: "swordfish".to_owned(),
            },
        ])),
    }
}

/// The configuration most tests use: cleartext, but with login allowed.
pub fn test_config() -> ConnectionConfig {
    ConnectionConfig {
        insecure_auth: true,
        write_timeout: Duration::from_secs(10),
        ..ConnectionConfig::default()
    }
}

impl Setup {
    fn spawn_server(
        &self,
        name: &'static str,
        config: ConnectionConfig,
        features: SessionFeatures,
    ) -> UnixStream {
        self.spawn_session(name, config, Box::new(self.session(features)))
    }

    fn spawn_session(
        &self,
        name: &'static str,
        config: ConnectionConfig,
        session: Box<dyn Session>,
    ) -> UnixStream {
        let (server_sock, client_sock) = UnixStream::pair().unwrap();

        thread::Builder::new()
            .name(format!("server-{}", name))
            .spawn(move || {
                let transport = Transport::new(Box::new(server_sock)).unwrap();
                // Errors are logged by the connection itself
                let _ = Connection::new(
                    session,
                    transport,
                    config,
                    LogPrefix::new(name.to_owned()),
                )
                .run();
            })
            .unwrap();

        client_sock
            .set_read_timeout(Some(Duration::from_secs(30)))
            .unwrap();
        client_sock
    }

    /// A store session that has not been attached to a connection.
    pub fn session(&self, features: SessionFeatures) -> MemSession {
        self.store.session(features)
    }

    /// Serve `session` instead of a plain store session.
    pub fn connect_session(
        &self,
        name: &'static str,
        session: Box<dyn Session>,
    ) -> RawClient {
        RawClient::new(self.spawn_session(name, test_config(), session))
    }

    pub fn connect(&self, name: &'static str) -> RawClient {
        self.connect_with(name, test_config(), SessionFeatures::all())
    }

    pub fn connect_with(
        &self,
        name: &'static str,
        config: ConnectionConfig,
        features: SessionFeatures,
    ) -> RawClient {
        RawClient::new(self.spawn_server(name, config, features))
    }

    /// Connect without reading anything, for tests that need the socket
    /// itself.
    pub fn connect_socket(
        &self,
        name: &'static str,
        config: ConnectionConfig,
    ) -> UnixStream {
        self.spawn_server(name, config, SessionFeatures::all())
    }

    pub fn connect_client(&self, name: &'static str) -> Client {
        self.connect_client_with(name, test_config(), ClientOptions::default())
    }

    pub fn connect_client_with(
        &self,
        name: &'static str,
        config: ConnectionConfig,
        options: ClientOptions,
    ) -> Client {
        let sock = self.spawn_server(name, config, SessionFeatures::all());
        Client::new(Box::new(sock), options).unwrap()
    }
}

/// Speaks the protocol by hand.
pub struct RawClient {
    read: BufReader<UnixStream>,
    write: UnixStream,
}

impl RawClient {
    pub fn new(sock: UnixStream) -> Self {
        RawClient {
            write: sock.try_clone().unwrap(),
            read: BufReader::new(sock),
        }
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        self.write.write_all(data).unwrap();
    }

    /// Read one response line, with any literals inline, as text.
    pub fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        client::read_logical_line(&mut self.read, &mut line).unwrap();
        String::from_utf8(line).unwrap()
    }

    /// Whether the server has closed the connection.
    pub fn at_eof(&mut self) -> bool {
        self.read.fill_buf().map_or(true, |b| b.is_empty())
    }

    /// Read lines through the one tagged `tag`, returning all of them.
    pub fn read_through(&mut self, tag: &str) -> Vec<String> {
        let prefix = format!("{} ", tag);
        let mut lines = Vec::new();
        loop {
            let line = self.read_line();
            let done = line.starts_with(&prefix);
            lines.push(line);
            if done {
                return lines;
            }
        }
    }

    /// Send `tag command` and return every line through its completion.
    pub fn command(&mut self, tag: &str, command: &str) -> Vec<String> {
        self.write_raw(format!("{} {}\r\n", tag, command).as_bytes());
        self.read_through(tag)
    }

    /// Like `command`, but assert that it succeeds.
    pub fn ok_command(&mut self, tag: &str, command: &str) -> Vec<String> {
        let lines = self.command(tag, command);
        assert_tagged(&lines, tag, "OK");
        lines
    }

    pub fn skip_greeting(&mut self) {
        let greeting = self.read_line();
        assert!(greeting.starts_with("* OK "), "Bad greeting: {}", greeting);
    }

    pub fn expect_line(&mut self, pat: &str) -> String {
        let line = self.read_line();
        assert_like(pat, &line);
        line
    }
}

pub fn assert_like(pat: &str, line: &str) {
    assert!(
        Regex::new(pat).unwrap().is_match(line),
        "Expected\n\
         match: {:?}\n\
         Got:   {:?}\n",
        pat,
        line
    );
}

pub fn assert_tagged(lines: &[String], tag: &str, cond: &str) {
    let last = lines.last().map(String::as_str).unwrap_or_default();
    assert!(
        last.starts_with(&format!("{} {} ", tag, cond)),
        "Expected {} {}, got:\n{}",
        tag,
        cond,
        lines.join("\n")
    );
}

/// Whether any line in `lines` matches `pat`.
pub fn has_line(lines: &[String], pat: &str) -> bool {
    let re = Regex::new(pat).unwrap();
    lines.iter().any(|l| re.is_match(l))
}

pub fn quick_log_in(client: &mut RawClient) {
    client.skip_greeting();
    client.ok_command("L1", "LOGIN azure hunter2");
}

pub fn quick_create(client: &mut RawClient, mailbox: &str) {
    client.ok_command("C1", &format!("CREATE {}", mailbox));
}

pub fn quick_select(client: &mut RawClient, mailbox: &str) -> Vec<String> {
    client.ok_command("S1", &format!("SELECT {}", mailbox))
}

pub fn quick_append(client: &mut RawClient, mailbox: &str, message: &[u8]) {
    client.write_raw(
        format!("A1 APPEND {} {{{}+}}\r\n", mailbox, message.len()).as_bytes(),
    );
    client.write_raw(message);
    client.write_raw(b"\r\n");
    let lines = client.read_through("A1");
    assert_tagged(&lines, "A1", "OK");
}
