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
fn capabilities_follow_state() {
    let setup = set_up();
    let mut client = setup.connect("3501capa");

    let greeting = client.read_line();
    assert_like(
        r"^\* OK \[CAPABILITY IMAP4rev2 .*\] Tidemap ready$",
        &greeting,
    );

    let lines = client.ok_command("C1", "CAPABILITY");
    assert!(has_line(&lines, "AUTH=PLAIN"));
    assert!(has_line(&lines, "LITERAL-"));
    assert!(!has_line(&lines, "IDLE"));

    let lines = client.ok_command("L1", "LOGIN azure hunter2");
    assert_like(r"^L1 OK \[CAPABILITY .*IDLE.*\]", lines.last().unwrap());

    let lines = client.ok_command("C2", "CAPABILITY");
    for cap in &["UIDPLUS", "MOVE", "NAMESPACE", "ESEARCH", "APPENDLIMIT="] {
        assert!(has_line(&lines, cap), "Missing {}", cap);
    }
    assert!(!has_line(&lines, "AUTH=PLAIN"));
}

#[test]
fn login_failures() {
    let setup = set_up();
    let mut client = setup.connect("3501lgnf");
    client.skip_greeting();

    let lines = client.command("L1", "LOGIN azure swordfish");
    assert_tagged(&lines, "L1", "NO");
    assert_like(r"AUTHENTICATIONFAILED", lines.last().unwrap());

    let lines = client.command("L2", "LOGIN nobody hunter2");
    assert_tagged(&lines, "L2", "NO");

    let lines = client.command("S1", "SELECT INBOX");
    assert_tagged(&lines, "S1", "BAD");
    assert_like(r"CLIENTBUG", lines.last().unwrap());

    client.ok_command("L3", "LOGIN bleu swordfish");
    let lines = client.command("L4", "LOGIN bleu swordfish");
    assert_tagged(&lines, "L4", "BAD");
}

#[test]
fn malformed_commands() {
    let setup = set_up();
    let mut client = setup.connect("3501malf");
    quick_log_in(&mut client);

    let lines = client.command("X1", "FROBNICATE");
    assert_tagged(&lines, "X1", "BAD");

    let lines = client.command("X2", "FETCH");
    assert_tagged(&lines, "X2", "BAD");

    // Still usable afterwards
    client.ok_command("X3", "NOOP");
}

#[test]
fn mailbox_management() {
    let setup = set_up();
    let mut client = setup.connect("3501mgmt");
    quick_log_in(&mut client);

    quick_create(&mut client, "Archive");
    client.ok_command("C2", "CREATE Archive/2020");

    let lines = client.command("C3", "CREATE Archive");
    assert_tagged(&lines, "C3", "NO");
    assert_like(r"ALREADYEXISTS", lines.last().unwrap());

    let lines = client.ok_command("L1", "LIST \"\" *");
    assert!(has_line(&lines, r#"^\* LIST \(.*\) "/" INBOX$"#));
    assert!(has_line(&lines, r#"^\* LIST \(\\HasChildren\) "/" Archive$"#));
    assert!(has_line(
        &lines,
        r#"^\* LIST \(\\HasNoChildren\) "/" Archive/2020$"#
    ));

    let lines = client.ok_command("L2", "LIST \"\" %");
    assert!(!has_line(&lines, "Archive/2020"));

    let lines = client.ok_command("L3", "LIST \"\" \"\"");
    assert!(has_line(&lines, r#"^\* LIST \(\\Noselect\) "/" """#));

    client.ok_command("R1", "RENAME Archive Old");
    let lines = client.ok_command("L4", "LIST \"\" *");
    assert!(has_line(&lines, "Old/2020"));
    assert!(!has_line(&lines, "Archive"));

    let lines = client.command("R2", "RENAME INBOX Elsewhere");
    assert_tagged(&lines, "R2", "NO");

    client.ok_command("S1", "SUBSCRIBE Old");
    let lines = client.ok_command("L5", "LIST (SUBSCRIBED) \"\" *");
    assert_eq!(2, lines.len(), "Unexpected: {:?}", lines);
    assert!(has_line(&lines, r"\\Subscribed.*Old$"));
    client.ok_command("S2", "UNSUBSCRIBE Old");

    client.ok_command("D1", "DELETE Old/2020");
    let lines = client.command("D2", "DELETE Old/2020");
    assert_tagged(&lines, "D2", "NO");
    assert_like(r"NONEXISTENT", lines.last().unwrap());

    let lines = client.command("D3", "DELETE INBOX");
    assert_tagged(&lines, "D3", "NO");
}

#[test]
fn status_counts() {
    let setup = set_up();
    let mut client = setup.connect("3501stat");
    quick_log_in(&mut client);

    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);

    let lines =
        client.ok_command("S1", "STATUS INBOX (MESSAGES UIDNEXT UNSEEN SIZE)");
    assert!(has_line(
        &lines,
        &format!(
            r"^\* STATUS INBOX \(MESSAGES 2 UIDNEXT 3 UNSEEN 2 SIZE {}\)$",
            2 * SIMPLE_MESSAGE.len()
        )
    ));

    let lines = client.command("S2", "STATUS Nowhere (MESSAGES)");
    assert_tagged(&lines, "S2", "NO");
}

#[test]
fn select_fetch_store_expunge() {
    let setup = set_up();
    let mut client = setup.connect("3501sfse");
    quick_log_in(&mut client);

    client.write_raw(
        format!(
            "A1 APPEND INBOX (\\Flagged) {{{}+}}\r\n",
            SIMPLE_MESSAGE.len()
        )
        .as_bytes(),
    );
    client.write_raw(SIMPLE_MESSAGE);
    client.write_raw(b"\r\n");
    let lines = client.read_through("A1");
    assert_like(r"^A1 OK \[APPENDUID \d+ 1\]", lines.last().unwrap());
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);

    let lines = quick_select(&mut client, "INBOX");
    assert!(has_line(&lines, r"^\* 2 EXISTS$"));
    assert!(has_line(&lines, r"^\* OK \[UIDVALIDITY \d+\]"));
    assert!(has_line(&lines, r"^\* OK \[UIDNEXT 3\]"));
    assert!(has_line(&lines, r"^\* FLAGS \("));
    assert!(has_line(&lines, r"^\* OK \[PERMANENTFLAGS \(.*\\\*\)\]"));
    assert_like(r"^S1 OK \[READ-WRITE\]", lines.last().unwrap());

    let lines = client.ok_command("F1", "FETCH 1:* (UID FLAGS)");
    assert!(has_line(&lines, r"^\* 1 FETCH \(UID 1 FLAGS \(\\Flagged\)\)$"));
    assert!(has_line(&lines, r"^\* 2 FETCH \(UID 2 FLAGS \(\)\)$"));

    let lines = client.ok_command("F2", "FETCH 2 BODY.PEEK[HEADER]");
    assert!(has_line(
        &lines,
        r"(?s)^\* 2 FETCH \(BODY\[HEADER\] \{\d+\}.*Subject: Lunch"
    ));
    assert!(!has_line(&lines, "Seen"));

    let lines = client.ok_command("F3", "FETCH 2 BODY[]");
    assert!(has_line(&lines, r"\\Seen"));
    assert!(has_line(&lines, "noon"));

    let lines = client.ok_command("U1", "UID FETCH 2 (FLAGS)");
    assert!(has_line(&lines, r"^\* 2 FETCH \(UID 2 FLAGS \(\\Seen\)\)$"));

    let lines = client.ok_command("T1", "STORE 1 +FLAGS (\\Deleted $Junk)");
    assert!(has_line(&lines, r"^\* 1 FETCH \(FLAGS \(.*\\Deleted.*\)\)$"));
    assert!(has_line(&lines, r"^\* FLAGS \(.*\$Junk"));

    let lines = client.ok_command("T2", "STORE 2 +FLAGS.SILENT (\\Answered)");
    assert_eq!(1, lines.len());

    let lines = client.ok_command("E1", "EXPUNGE");
    assert!(has_line(&lines, r"^\* 1 EXPUNGE$"));

    let lines = client.ok_command("F4", "FETCH 1 (UID)");
    assert!(has_line(&lines, r"^\* 1 FETCH \(UID 2\)$"));

    // Nonexistent messages are silently skipped
    let lines = client.ok_command("F5", "FETCH 5 (UID)");
    assert_eq!(1, lines.len());
}

#[test]
fn examine_is_read_only() {
    let setup = set_up();
    let mut client = setup.connect("3501exam");
    quick_log_in(&mut client);
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);

    let lines = client.ok_command("E1", "EXAMINE INBOX");
    assert_like(r"^E1 OK \[READ-ONLY\]", lines.last().unwrap());
    assert!(has_line(&lines, r"^\* OK \[PERMANENTFLAGS \(\)\]"));

    client.ok_command("F1", "FETCH 1 BODY[]");
    let lines = client.ok_command("F2", "FETCH 1 FLAGS");
    assert!(has_line(&lines, r"^\* 1 FETCH \(FLAGS \(\)\)$"));

    let lines = client.command("S1", "STORE 1 +FLAGS (\\Seen)");
    assert_tagged(&lines, "S1", "NO");
    assert_like(r"\[CANNOT\]", lines.last().unwrap());

    client.ok_command("U1", "UNSELECT");
    let lines = client.command("F3", "FETCH 1 FLAGS");
    assert_tagged(&lines, "F3", "BAD");
}

#[test]
fn search_forms() {
    let setup = set_up();
    let mut client = setup.connect("3501srch");
    quick_log_in(&mut client);
    for _ in 0..3 {
        quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    }
    quick_select(&mut client, "INBOX");
    client.ok_command("T1", "STORE 2 +FLAGS.SILENT (\\Seen)");

    let lines = client.ok_command("S1", "SEARCH UNSEEN");
    assert!(has_line(&lines, r"^\* SEARCH 1 3$"));

    let lines = client.ok_command("S2", "UID SEARCH SEEN");
    assert!(has_line(&lines, r"^\* SEARCH 2$"));

    let lines = client.ok_command("S3", "SEARCH RETURN (MIN COUNT) BODY noon");
    assert!(has_line(&lines, r#"^\* ESEARCH \(TAG "S3"\) MIN 1 COUNT 3$"#));

    let lines = client.ok_command("S4", "SEARCH OR SEEN 3");
    assert!(has_line(&lines, r"^\* SEARCH 2 3$"));

    let lines = client.ok_command("S5", "SEARCH TEXT dinner");
    assert!(has_line(&lines, r"^\* SEARCH$"));
}

#[test]
fn pipelined_commands_complete_in_order() {
    let setup = set_up();
    let mut client = setup.connect("3501pipe");
    quick_log_in(&mut client);
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);

    client.write_raw(
        b"P1 SELECT INBOX\r\n\
          P2 FETCH 1 (FLAGS)\r\n\
          P3 STORE 1 +FLAGS (\\Flagged)\r\n\
          P4 FETCH 1 (FLAGS)\r\n",
    );

    let lines = client.read_through("P1");
    assert_tagged(&lines, "P1", "OK");
    let lines = client.read_through("P2");
    assert_eq!(2, lines.len());
    assert!(has_line(&lines, r"^\* 1 FETCH \(FLAGS \(\)\)$"));
    assert_tagged(&lines, "P2", "OK");
    let lines = client.read_through("P3");
    assert_tagged(&lines, "P3", "OK");
    let lines = client.read_through("P4");
    assert!(has_line(&lines, r"^\* 1 FETCH \(FLAGS \(\\Flagged\)\)$"));
    assert_tagged(&lines, "P4", "OK");
}

#[test]
fn concurrent_append_reported_after_command_data() {
    let setup = set_up();
    let mut watcher = setup.connect("3501cawa");
    let mut writer = setup.connect("3501cawr");
    quick_log_in(&mut watcher);
    quick_log_in(&mut writer);

    quick_append(&mut writer, "INBOX", SIMPLE_MESSAGE);
    quick_select(&mut watcher, "INBOX");
    quick_append(&mut writer, "INBOX", SIMPLE_MESSAGE);

    let lines = watcher.ok_command("F1", "FETCH 1:* (UID)");
    assert_eq!(
        vec![
            "* 1 FETCH (UID 1)".to_owned(),
            "* 2 EXISTS".to_owned(),
        ],
        lines[..2].to_vec()
    );

    let lines = watcher.ok_command("N1", "NOOP");
    assert_eq!(1, lines.len());

    // The writer sees the flag change made by the watcher
    quick_select(&mut writer, "INBOX");
    watcher.ok_command("T1", "STORE 2 +FLAGS.SILENT (\\Flagged)");
    let lines = writer.ok_command("N2", "NOOP");
    assert!(has_line(&lines, r"^\* 2 FETCH \(.*FLAGS \(\\Flagged\).*\)$"));
}

#[test]
fn concurrent_expunge_held_until_expunge_allowed() {
    let setup = set_up();
    let mut watcher = setup.connect("3501cewa");
    let mut writer = setup.connect("3501cewr");
    quick_log_in(&mut watcher);
    quick_log_in(&mut writer);

    for _ in 0..3 {
        quick_append(&mut writer, "INBOX", SIMPLE_MESSAGE);
    }
    quick_select(&mut watcher, "INBOX");
    quick_select(&mut writer, "INBOX");
    writer.ok_command("T1", "STORE 1 +FLAGS.SILENT (\\Deleted)");
    writer.ok_command("E1", "EXPUNGE");

    let lines = watcher.ok_command("F1", "FETCH 3 (UID)");
    assert!(has_line(&lines, r"^\* 3 FETCH \(UID 3\)$"));
    assert!(!has_line(&lines, "EXPUNGE"));

    let lines = watcher.ok_command("S2", "SEARCH ALL");
    assert!(!has_line(&lines, "EXPUNGE"));

    let lines = watcher.ok_command("T2", "STORE 3 +FLAGS (\\Seen)");
    assert!(has_line(&lines, r"^\* 3 FETCH \(.*\\Seen.*\)$"));
    assert!(!has_line(&lines, "EXPUNGE"));

    let lines = watcher.ok_command("N1", "NOOP");
    assert!(has_line(&lines, r"^\* 1 EXPUNGE$"));
    let lines = watcher.ok_command("F2", "FETCH 2 (UID)");
    assert!(has_line(&lines, r"^\* 2 FETCH \(UID 3\)$"));
}

#[test]
fn logout_says_goodbye() {
    let setup = set_up();
    let mut client = setup.connect("3501lout");
    quick_log_in(&mut client);

    let lines = client.command("Q1", "LOGOUT");
    assert_eq!(2, lines.len());
    assert_like(r"^\* BYE ", &lines[0]);
    assert_tagged(&lines, "Q1", "OK");
    assert!(client.at_eof());
}

#[test]
fn close_expunges_silently() {
    let setup = set_up();
    let mut client = setup.connect("3501clos");
    quick_log_in(&mut client);
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    quick_select(&mut client, "INBOX");

    client.ok_command("T1", "STORE 1 +FLAGS.SILENT (\\Deleted)");
    client.ok_command("K1", "CHECK");
    let lines = client.ok_command("C2", "CLOSE");
    assert_eq!(1, lines.len(), "Unexpected: {:?}", lines);

    let lines = client.ok_command("S2", "STATUS INBOX (MESSAGES UIDNEXT)");
    assert!(has_line(&lines, r"MESSAGES 1 UIDNEXT 3"));
}

#[test]
fn lsub_and_namespace() {
    let setup = set_up();
    let mut client = setup.connect("3501lsub");
    quick_log_in(&mut client);

    quick_create(&mut client, "Lists");
    client.ok_command("S1", "SUBSCRIBE Lists");

    let lines = client.ok_command("L2", "LSUB \"\" *");
    assert_eq!(2, lines.len(), "Unexpected: {:?}", lines);
    assert!(has_line(&lines, r#"^\* LSUB \(.*\) "/" Lists$"#));

    let lines = client.ok_command("N1", "NAMESPACE");
    assert!(has_line(&lines, r#"^\* NAMESPACE \(\("" "/"\)\) NIL NIL$"#));
}
