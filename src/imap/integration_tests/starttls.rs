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

use std::io::{self, BufReader, Read, Write};
use std::os::unix::net::UnixStream;

use super::defs::*;
use crate::imap::client::{self, ClientOptions};
use crate::imap::server::ConnectionConfig;
use crate::test_data::{ssl_acceptor, ssl_connector};

fn tls_config() -> ConnectionConfig {
    ConnectionConfig {
        acceptor: Some(ssl_acceptor()),
        insecure_auth: false,
        ..test_config()
    }
}

#[test]
fn login_disabled_until_tls() {
    let setup = set_up();
    let mut client = setup.connect_with(
        "tlsldis",
        tls_config(),
        crate::imap::server::SessionFeatures::all(),
    );

    let greeting = client.read_line();
    assert_like(r"STARTTLS", &greeting);
    assert_like(r"LOGINDISABLED", &greeting);
    assert!(!greeting.contains("AUTH=PLAIN"));

    let lines = client.command("L1", "LOGIN azure hunter2");
    assert_tagged(&lines, "L1", "NO");
    assert_like(r"PRIVACYREQUIRED", lines.last().unwrap());

    let lines = client.command("A1", "AUTHENTICATE PLAIN");
    assert_tagged(&lines, "A1", "NO");
}

#[test]
fn starttls_without_acceptor() {
    let setup = set_up();
    let mut client = setup.connect("tlsnoac");
    let greeting = client.read_line();
    assert!(!greeting.contains("STARTTLS"));

    let lines = client.command("S1", "STARTTLS");
    assert_tagged(&lines, "S1", "BAD");
    client.ok_command("N1", "NOOP");
}

#[test]
fn client_upgrades_with_starttls() {
    let setup = set_up();
    let client = setup.connect_client_with(
        "tlsclnt",
        tls_config(),
        ClientOptions::default(),
    );

    assert!(client.has_capability("STARTTLS"));
    assert!(client.has_capability("LOGINDISABLED"));
    assert!(client.tls_description().is_none());

    client.starttls(ssl_connector(), "localhost").unwrap();
    assert!(client.tls_description().is_some());

    client.login("azure", "hunter2").unwrap().wait().unwrap();
    client.noop().unwrap().wait().unwrap();

    let caps = client.capability().unwrap().wait().unwrap();
    assert!(!caps.has("STARTTLS"));
    assert!(caps.has("IDLE"));

    client.logout().unwrap().wait().unwrap();
}

/// Sends the STARTTLS command in the same write as the TLS ClientHello and
/// hides the plaintext lines from the TLS layer.
#[derive(Debug)]
struct Pipelined {
    sock: UnixStream,
    prefix: Option<Vec<u8>>,
    skip_lines: usize,
}

impl Read for Pipelined {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.skip_lines > 0 {
            let mut byte = [0u8];
            self.sock.read_exact(&mut byte)?;
            if b'\n' == byte[0] {
                self.skip_lines -= 1;
            }
        }

        self.sock.read(buf)
    }
}

impl Write for Pipelined {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.prefix.take() {
            Some(mut data) => {
                data.extend_from_slice(buf);
                self.sock.write_all(&data)?;
                Ok(buf.len())
            }
            None => self.sock.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sock.flush()
    }
}

#[test]
fn starttls_keeps_pipelined_handshake() {
    let setup = set_up();
    let sock = setup.connect_socket("tlspipe", tls_config());

    let shim = Pipelined {
        sock,
        prefix: Some(b"S1 STARTTLS\r\n".to_vec()),
        // The greeting and the STARTTLS completion
        skip_lines: 2,
    };
    let tls = ssl_connector().connect("localhost", shim).unwrap();
    let mut tls = BufReader::new(tls);

    tls.get_mut()
        .write_all(b"L1 LOGIN azure hunter2\r\nN1 NOOP\r\n")
        .unwrap();

    let mut line = Vec::new();
    client::read_logical_line(&mut tls, &mut line).unwrap();
    assert_like(r"^L1 OK ", &String::from_utf8_lossy(&line));
    client::read_logical_line(&mut tls, &mut line).unwrap();
    assert_like(r"^N1 OK ", &String::from_utf8_lossy(&line));
}

#[test]
fn starttls_twice() {
    let setup = set_up();
    let client = setup.connect_client_with(
        "tlstwic",
        tls_config(),
        ClientOptions::default(),
    );

    client.starttls(ssl_connector(), "localhost").unwrap();
    let result = client.issue(|lex| lex.verbatim("STARTTLS")).unwrap().wait();
    assert_matches!(Err(client::Error::Bad(_)), result);
}
