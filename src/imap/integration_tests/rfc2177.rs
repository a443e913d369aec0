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

#[test]
fn idle_reports_changes_as_they_happen() {
    let setup = set_up();
    let mut idler = setup.connect("2177idlr");
    let mut other = setup.connect("2177othr");
    quick_log_in(&mut idler);
    quick_log_in(&mut other);

    quick_append(&mut other, "INBOX", SIMPLE_MESSAGE);
    quick_select(&mut idler, "INBOX");
    quick_select(&mut other, "INBOX");

    idler.write_raw(b"I1 IDLE\r\n");
    idler.expect_line(r"^\+ ");

    quick_append(&mut other, "INBOX", SIMPLE_MESSAGE);
    idler.expect_line(r"^\* 2 EXISTS$");

    other.ok_command("T1", "STORE 1 +FLAGS.SILENT (\\Flagged)");
    idler.expect_line(r"^\* 1 FETCH \(UID 1 FLAGS \(\\Flagged\)\)$");

    other.ok_command("T2", "STORE 2 +FLAGS.SILENT (\\Deleted)");
    idler.expect_line(r"^\* 2 FETCH \(UID 2 FLAGS \(\\Deleted\)\)$");
    other.ok_command("E1", "EXPUNGE");
    idler.expect_line(r"^\* 2 EXPUNGE$");

    idler.write_raw(b"DONE\r\n");
    idler.expect_line(r"^I1 OK ");

    let lines = idler.ok_command("F1", "FETCH 1:* (UID)");
    assert_eq!(2, lines.len(), "Unexpected: {:?}", lines);
}

#[test]
fn idle_while_authenticated() {
    let setup = set_up();
    let mut client = setup.connect("2177auth");
    quick_log_in(&mut client);

    client.write_raw(b"I1 IDLE\r\n");
    client.expect_line(r"^\+ ");
    client.write_raw(b"DONE\r\n");
    client.expect_line(r"^I1 OK ");
}

#[test]
fn idle_requires_done() {
    let setup = set_up();
    let mut client = setup.connect("2177done");
    quick_log_in(&mut client);
    quick_select(&mut client, "INBOX");

    client.write_raw(b"I1 IDLE\r\n");
    client.expect_line(r"^\+ ");
    client.write_raw(b"NOOP\r\n");
    client.expect_line(r"^I1 BAD \[CLIENTBUG\]");

    client.ok_command("N1", "NOOP");
}

#[test]
fn idle_not_allowed_before_login() {
    let setup = set_up();
    let mut client = setup.connect("2177nolg");
    client.skip_greeting();

    let lines = client.command("I1", "IDLE");
    assert_tagged(&lines, "I1", "BAD");
}
