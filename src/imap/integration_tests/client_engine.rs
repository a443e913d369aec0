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

use std::io::Write;
use std::os::unix::net::UnixStream;
use std::time::Duration;

use crossbeam::channel::{self, Sender};

use super::defs::*;
use crate::imap::client::{
    self, ClientOptions, MailboxUpdate, UnilateralDataHandler,
};
use crate::imap::model::*;
use crate::imap::sasl::PlainClient;
use crate::wire::numset::{NumSet, SeqRange};

fn set(raw: &str) -> NumSet {
    NumSet::parse(raw).unwrap()
}

fn log_in(client: &client::Client) {
    client.login("azure", "hunter2").unwrap().wait().unwrap();
}

#[test]
fn full_session() {
    let setup = set_up();
    let client = setup.connect_client("ceflow");
    assert_eq!(ConnState::NotAuthenticated, client.conn_state());

    client
        .authenticate(&mut PlainClient::new("azure", "hunter2"))
        .unwrap();
    assert_eq!(ConnState::Authenticated, client.conn_state());
    assert!(client.has_capability("MOVE"));

    let ns = client.namespace().unwrap().wait().unwrap();
    assert_eq!(1, ns.personal.len());
    assert_eq!(Some('/'), ns.personal[0].delim);

    client.create("Archive").unwrap().wait().unwrap();
    let appended = client
        .append(
            "INBOX",
            &AppendOptions {
                flags: vec![Flag::Flagged],
                ..AppendOptions::default()
            },
            SIMPLE_MESSAGE,
        )
        .unwrap()
        .wait()
        .unwrap()
        .unwrap();
    assert_eq!(1, appended.uid);
    client
        .append("INBOX", &AppendOptions::default(), SIMPLE_MESSAGE)
        .unwrap()
        .wait()
        .unwrap();

    let mut boxes = client
        .list("", "*", ListOptions::default())
        .unwrap()
        .wait()
        .unwrap();
    boxes.sort_by(|a, b| a.mailbox.cmp(&b.mailbox));
    assert_eq!(
        vec!["Archive", "INBOX"],
        boxes.iter().map(|b| b.mailbox.as_str()).collect::<Vec<_>>()
    );

    let status = client
        .status("INBOX", &[StatusItem::Messages, StatusItem::Unseen])
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(Some(2), status.num_messages);
    assert_eq!(Some(2), status.num_unseen);

    let selected = client.select("INBOX").unwrap().wait().unwrap();
    assert_eq!(2, selected.num_messages);
    assert_eq!(3, selected.uid_next);
    assert_eq!(appended.uid_validity, selected.uid_validity);
    assert!(!selected.read_only);
    assert_eq!(ConnState::Selected, client.conn_state());

    let fetched = client
        .fetch(
            NumKind::Seq,
            &set("1:*"),
            &FetchOptions {
                uid: true,
                flags: true,
                rfc822_size: true,
                sections: vec![BodySection {
                    part: SectionPart::Header,
                    peek: true,
                }],
                ..FetchOptions::default()
            },
        )
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(2, fetched.len());
    assert_eq!(Some(1), fetched[0].uid);
    assert_eq!(Some(vec![Flag::Flagged]), fetched[0].flags);
    assert_eq!(Some(SIMPLE_MESSAGE.len() as u32), fetched[1].rfc822_size);
    let header = fetched[1].section(SectionPart::Header).unwrap();
    assert!(header.starts_with(b"From: alice@example.com\r\n"));
    assert!(header.ends_with(b"\r\n\r\n"));

    let stored = client
        .store(
            NumKind::Uid,
            &set("2"),
            &StoreFlags {
                op: StoreOp::Add,
                silent: false,
                flags: vec![Flag::Seen],
            },
        )
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(1, stored.len());
    assert_eq!(2, stored[0].seq);
    assert_eq!(Some(2), stored[0].uid);

    let found = client
        .search(
            NumKind::Seq,
            &SearchKey::Flag(Flag::Seen, false),
            None,
        )
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(SeqRange::just(1), found.all);
    assert_eq!(Some(1), found.count);

    let found = client
        .search(
            NumKind::Uid,
            &SearchKey::All,
            Some(SearchReturn {
                min: true,
                max: true,
                ..SearchReturn::default()
            }),
        )
        .unwrap()
        .wait()
        .unwrap();
    assert!(found.uid);
    assert_eq!(Some(1), found.min);
    assert_eq!(Some(2), found.max);

    let copied = client
        .copy(NumKind::Seq, &set("1"), "Archive")
        .unwrap()
        .wait()
        .unwrap()
        .unwrap();
    assert_eq!(SeqRange::just(1), copied.source_uids);
    assert_eq!(SeqRange::just(1), copied.dest_uids);

    let moved = client
        .move_messages(NumKind::Uid, &set("2"), "Archive")
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(vec![2], moved.expunged);
    assert_eq!(
        Some(SeqRange::just(2)),
        moved.copy_data.map(|c| c.dest_uids)
    );

    client
        .store(
            NumKind::Seq,
            &set("1"),
            &StoreFlags {
                op: StoreOp::Add,
                silent: true,
                flags: vec![Flag::Deleted],
            },
        )
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(vec![1], client.expunge().unwrap().wait().unwrap());

    let examined = client.examine("Archive").unwrap().wait().unwrap();
    assert!(examined.read_only);
    assert_eq!(2, examined.num_messages);

    client.unselect().unwrap().wait().unwrap();
    assert_eq!(ConnState::Authenticated, client.conn_state());

    client.logout().unwrap().wait().unwrap();
    assert_eq!(ConnState::Logout, client.conn_state());
}

#[test]
fn failures_carry_response_codes() {
    let setup = set_up();
    let client = setup.connect_client("ceerrs");

    assert_matches!(
        Err(client::Error::No(StatusResponse {
            code: Some(RespCode::AuthenticationFailed),
            ..
        })),
        client.login("azure", "wrong").unwrap().wait()
    );

    log_in(&client);

    assert_matches!(
        Err(client::Error::No(StatusResponse {
            code: Some(RespCode::Nonexistent),
            ..
        })),
        client.select("Nowhere").unwrap().wait()
    );
    assert_matches!(
        Err(client::Error::No(StatusResponse {
            code: Some(RespCode::AlreadyExists),
            ..
        })),
        client.create("INBOX").unwrap().wait()
    );
    assert_matches!(
        Err(client::Error::No(StatusResponse {
            code: Some(RespCode::TryCreate),
            ..
        })),
        client
            .append("Nowhere", &AppendOptions::default(), SIMPLE_MESSAGE)
            .unwrap()
            .wait()
    );
    assert_matches!(
        Err(client::Error::Bad(_)),
        client.expunge().unwrap().wait()
    );
}

#[test]
fn pipelined_handles_wait_in_any_order() {
    let setup = set_up();
    let client = setup.connect_client("cepipe");
    log_in(&client);

    let appends = (0..5)
        .map(|_| {
            client
                .append("INBOX", &AppendOptions::default(), SIMPLE_MESSAGE)
                .unwrap()
        })
        .collect::<Vec<_>>();
    let select = client.select("INBOX").unwrap();
    let search = client
        .search(NumKind::Uid, &SearchKey::Text("noon".to_owned()), None)
        .unwrap();
    let noop = client.noop().unwrap();

    noop.wait().unwrap();
    let found = search.wait().unwrap();
    assert_eq!(SeqRange::range(1, 5), found.all);
    assert_eq!(5, select.wait().unwrap().num_messages);

    let mut uids = appends
        .into_iter()
        .rev()
        .map(|p| p.wait().unwrap().unwrap().uid)
        .collect::<Vec<_>>();
    uids.sort();
    assert_eq!(vec![1, 2, 3, 4, 5], uids);
}

#[test]
fn commands_issued_from_many_threads() {
    let setup = set_up();
    let client = setup.connect_client("cethrd");
    log_in(&client);

    crossbeam::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|_| {
                for _ in 0..5 {
                    client
                        .append(
                            "INBOX",
                            &AppendOptions::default(),
                            SIMPLE_MESSAGE,
                        )
                        .unwrap()
                        .wait()
                        .unwrap();
                }
            });
        }
    })
    .unwrap();

    let status = client
        .status("INBOX", &[StatusItem::Messages])
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(Some(20), status.num_messages);
}

#[derive(Debug, PartialEq, Eq)]
enum Event {
    Expunge(u32),
    Update(MailboxUpdate),
    Fetch(u32, Option<Vec<Flag>>),
}

struct ChannelHandler(Sender<Event>);

impl UnilateralDataHandler for ChannelHandler {
    fn expunge(&mut self, seq: u32) {
        let _ = self.0.send(Event::Expunge(seq));
    }

    fn mailbox_update(&mut self, update: MailboxUpdate) {
        let _ = self.0.send(Event::Update(update));
    }

    fn fetch(&mut self, data: FetchMessageData) {
        let _ = self.0.send(Event::Fetch(data.seq, data.flags));
    }
}

#[test]
fn idle_delivers_unilateral_data() {
    let setup = set_up();
    let (tx, rx) = channel::unbounded();
    let watcher = setup.connect_client_with(
        "ceidlw",
        test_config(),
        ClientOptions {
            handler: Box::new(ChannelHandler(tx)),
            trace: None,
        },
    );
    let other = setup.connect_client("ceidlo");
    log_in(&watcher);
    log_in(&other);

    other
        .append("INBOX", &AppendOptions::default(), SIMPLE_MESSAGE)
        .unwrap()
        .wait()
        .unwrap();
    watcher.select("INBOX").unwrap().wait().unwrap();
    other.select("INBOX").unwrap().wait().unwrap();

    let idle = watcher.idle().unwrap();

    let next = || rx.recv_timeout(Duration::from_secs(10)).unwrap();

    other
        .append("INBOX", &AppendOptions::default(), SIMPLE_MESSAGE)
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(Event::Update(MailboxUpdate::Exists(2)), next());

    other
        .store(
            NumKind::Seq,
            &set("1"),
            &StoreFlags {
                op: StoreOp::Add,
                silent: true,
                flags: vec![Flag::Deleted],
            },
        )
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(Event::Fetch(1, Some(vec![Flag::Deleted])), next());

    other.expunge().unwrap().wait().unwrap();
    assert_eq!(Event::Expunge(1), next());

    idle.close().unwrap();

    let fetched = watcher
        .fetch(
            NumKind::Seq,
            &set("1:*"),
            &FetchOptions {
                uid: true,
                ..FetchOptions::default()
            },
        )
        .unwrap()
        .wait()
        .unwrap();
    assert_eq!(1, fetched.len());
    assert_eq!(Some(2), fetched[0].uid);
}

#[test]
fn nothing_after_logout() {
    let setup = set_up();
    let client = setup.connect_client("celout");
    log_in(&client);
    client.logout().unwrap().wait().unwrap();

    match client.noop() {
        Ok(pending) => assert!(pending.wait().is_err()),
        Err(_) => (),
    }
}

#[test]
fn enable_and_unauthenticate() {
    let setup = set_up();
    let client = setup.connect_client("ceenab");
    log_in(&client);

    let enabled = client.enable(&["IMAP4rev2"]).unwrap().wait().unwrap();
    assert_eq!(vec!["IMAP4rev2".to_owned()], enabled);
    assert!(client.enabled().has("IMAP4rev2"));

    client.unauthenticate().unwrap().wait().unwrap();
    assert_eq!(ConnState::NotAuthenticated, client.conn_state());
    assert!(!client.enabled().has("IMAP4rev2"));

    client.login("bleu", "swordfish").unwrap().wait().unwrap();
    let selected = client.select("INBOX").unwrap().wait().unwrap();
    assert_eq!(0, selected.num_messages);
}

#[test]
fn response_to_unknown_tag_kills_client() {
    crate::init_test_log();
    let (mut server, client_sock) = UnixStream::pair().unwrap();
    server
        .write_all(b"* OK [CAPABILITY IMAP4rev2] fake server\r\n")
        .unwrap();

    let client = client::Client::new(
        Box::new(client_sock),
        ClientOptions::default(),
    )
    .unwrap();
    let first = client.noop().unwrap();
    let second = client.noop().unwrap();
    server.write_all(b"ZZ9 OK who knows\r\n").unwrap();

    let is_unknown_tag = |e: &client::Error| {
        matches!(*e, client::Error::Protocol(ref msg)
            if msg == "Response to unknown tag ZZ9")
    };

    for pending in vec![first, second] {
        let err = pending.wait().unwrap_err();
        assert!(is_unknown_tag(&err), "Unexpected error: {}", err);
    }
    let err = client.closed().unwrap();
    assert!(is_unknown_tag(&err), "Unexpected error: {}", err);
    assert_eq!(ConnState::Logout, client.conn_state());

    let err = client.noop().err().unwrap();
    assert!(is_unknown_tag(&err), "Unexpected error: {}", err);
}
