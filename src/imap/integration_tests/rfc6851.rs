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
use crate::imap::server::SessionFeatures;

#[test]
fn move_reports_copyuid_then_expunges() {
    let setup = set_up();
    let mut client = setup.connect("6851move");
    let mut other = setup.connect("6851othr");
    quick_log_in(&mut client);
    quick_log_in(&mut other);

    quick_create(&mut client, "Archive");
    for _ in 0..3 {
        quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    }
    quick_select(&mut client, "INBOX");
    quick_select(&mut other, "INBOX");

    let lines = client.ok_command("M1", "MOVE 1:2 Archive");
    assert_eq!(4, lines.len(), "Unexpected: {:?}", lines);
    assert_like(r"^\* OK \[COPYUID \d+ 1:2 1:2\] ", &lines[0]);
    assert_eq!("* 2 EXPUNGE", lines[1]);
    assert_eq!("* 1 EXPUNGE", lines[2]);

    let lines = client.ok_command("F1", "FETCH 1:* (UID)");
    assert!(has_line(&lines, r"^\* 1 FETCH \(UID 3\)$"));

    let lines = client.ok_command("S1", "STATUS Archive (MESSAGES UIDNEXT)");
    assert!(has_line(&lines, r"MESSAGES 2 UIDNEXT 3"));

    // The other session only learns of the expunges when allowed to
    let lines = other.ok_command("N1", "NOOP");
    assert!(has_line(&lines, r"^\* 2 EXPUNGE$"));
    assert!(has_line(&lines, r"^\* 1 EXPUNGE$"));
}

#[test]
fn uid_move_and_missing_destination() {
    let setup = set_up();
    let mut client = setup.connect("6851uidm");
    quick_log_in(&mut client);

    quick_create(&mut client, "Archive");
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    quick_select(&mut client, "INBOX");

    let lines = client.command("M1", "MOVE 1 Nowhere");
    assert_tagged(&lines, "M1", "NO");
    assert_like(r"TRYCREATE", lines.last().unwrap());

    let lines = client.ok_command("M2", "UID MOVE 2 Archive");
    assert!(has_line(&lines, r"^\* OK \[COPYUID \d+ 2 1\] "));
    assert!(has_line(&lines, r"^\* 2 EXPUNGE$"));

    // Nothing matches; no COPYUID and no expunges
    let lines = client.ok_command("M3", "UID MOVE 7 Archive");
    assert_eq!(1, lines.len(), "Unexpected: {:?}", lines);
}

#[test]
fn copy_keeps_source() {
    let setup = set_up();
    let mut client = setup.connect("6851copy");
    quick_log_in(&mut client);

    quick_create(&mut client, "Archive");
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    quick_select(&mut client, "INBOX");
    client.ok_command("T1", "STORE 1 +FLAGS.SILENT (\\Flagged)");

    let lines = client.ok_command("C2", "COPY 1 Archive");
    assert_like(r"^C2 OK \[COPYUID \d+ 1 1\] ", lines.last().unwrap());

    let lines = client.ok_command("F1", "FETCH 1 (UID)");
    assert!(has_line(&lines, r"^\* 1 FETCH \(UID 1\)$"));

    client.ok_command("S2", "EXAMINE Archive");
    let lines = client.ok_command("F2", "FETCH 1 (FLAGS)");
    assert!(has_line(&lines, r"^\* 1 FETCH \(FLAGS \(\\Flagged\)\)$"));
}

#[test]
fn move_requires_feature() {
    let setup = set_up();
    let mut client = setup.connect_with(
        "6851nomv",
        test_config(),
        SessionFeatures::all() - SessionFeatures::MOVE,
    );
    quick_log_in(&mut client);

    let lines = client.ok_command("C1", "CAPABILITY");
    assert!(!has_line(&lines, "MOVE"));

    quick_select(&mut client, "INBOX");
    let lines = client.command("M1", "MOVE 1 INBOX");
    assert_tagged(&lines, "M1", "BAD");
}
