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

use super::defs::*;
use crate::imap::server::{ConnectionConfig, SessionFeatures};

#[test]
fn small_non_synchronising_literals() {
    let setup = set_up();
    let mut client = setup.connect("7888smal");
    client.skip_greeting();

    client.write_raw(b"L1 LOGIN {5+}\r\nazure {7+}\r\nhunter2\r\n");
    let lines = client.read_through("L1");
    assert_tagged(&lines, "L1", "OK");
}

#[test]
fn synchronising_literal_gets_continuation() {
    let setup = set_up();
    let mut client = setup.connect("7888sync");
    client.skip_greeting();

    client.write_raw(b"L1 LOGIN {5}\r\n");
    client.expect_line(r"^\+ ");
    client.write_raw(b"azure hunter2\r\n");
    let lines = client.read_through("L1");
    assert_tagged(&lines, "L1", "OK");
}

#[test]
fn oversized_literal_minus_is_rejected_and_discarded() {
    let setup = set_up();
    let mut client = setup.connect("7888big-");
    quick_log_in(&mut client);

    let body = vec![b'x'; 5000];
    client.write_raw(b"A1 APPEND INBOX {5000+}\r\n");
    client.write_raw(&body);
    client.write_raw(b"\r\n");
    client.expect_line(r"^A1 BAD \[CLIENTBUG\]");

    // None of the literal was taken as commands
    client.ok_command("N1", "NOOP");
    let lines = client.ok_command("S1", "STATUS INBOX (MESSAGES)");
    assert!(has_line(&lines, r"MESSAGES 0"));
}

#[test]
fn literal_over_append_limit() {
    let setup = set_up();
    let mut client = setup.connect_with(
        "7888limt",
        ConnectionConfig {
            append_limit: 100,
            ..test_config()
        },
        SessionFeatures::all(),
    );
    quick_log_in(&mut client);

    let lines = client.ok_command("C1", "CAPABILITY");
    assert!(has_line(&lines, "APPENDLIMIT=100"));

    // No continuation; the client must not send the literal
    client.write_raw(b"A1 APPEND INBOX {200}\r\n");
    client.expect_line(r"^A1 NO \[TOOBIG\]");
    client.ok_command("N1", "NOOP");

    // Non-synchronising literals are consumed and thrown away
    client.write_raw(b"A2 APPEND INBOX {150+}\r\n");
    client.write_raw(&[b'y'; 150]);
    client.write_raw(b"\r\n");
    client.expect_line(r"^A2 NO \[TOOBIG\]");
    client.ok_command("N2", "NOOP");

    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
}

#[test]
fn large_literal_plus() {
    let setup = set_up();
    let mut client = setup.connect_with(
        "7888big+",
        ConnectionConfig {
            literal_plus: true,
            ..test_config()
        },
        SessionFeatures::all(),
    );
    let greeting = client.read_line();
    assert_like(r"LITERAL\+", &greeting);
    client.ok_command("L1", "LOGIN azure hunter2");

    let mut message = SIMPLE_MESSAGE.to_vec();
    message.extend(std::iter::repeat(b'z').take(8000));
    quick_append(&mut client, "INBOX", &message);

    let lines = client.ok_command("S1", "STATUS INBOX (MESSAGES SIZE)");
    assert!(has_line(
        &lines,
        &format!(r"MESSAGES 1 SIZE {}\)", message.len())
    ));
}

#[test]
fn literal_length_beyond_u32_is_rejected() {
    let setup = set_up();
    let mut client = setup.connect("7888ovfl");
    quick_log_in(&mut client);

    // Synchronising: no continuation is sent, so the command simply ends
    client.write_raw(b"A1 APPEND INBOX {99999999999}\r\n");
    client.expect_line(r"^A1 BAD \[CLIENTBUG\] Literal length out of range");
    client.ok_command("N1", "NOOP");

    // Non-synchronising: the data cannot be skipped, so nothing after it
    // may be taken as a command
    client.write_raw(b"A2 APPEND INBOX {99999999999+}\r\nA3 NOOP\r\n");
    client.expect_line(r"^A2 BAD \[CLIENTBUG\] Literal length out of range");
    client.expect_line(r"^\* BYE ");
    assert!(client.at_eof());

    let mut other = setup.connect("7888ovf2");
    quick_log_in(&mut other);
    let lines = other.ok_command("S1", "STATUS INBOX (MESSAGES)");
    assert!(has_line(&lines, r"MESSAGES 0"));
}
