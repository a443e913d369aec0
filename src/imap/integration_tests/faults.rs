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

//! A connection must survive a misbehaving session, or at least end cleanly
//! instead of hanging.

use std::io;

use crossbeam::channel::Receiver;

use super::defs::*;
use crate::imap::model::*;
use crate::imap::server::{FetchSink, MoveSink, Session, SessionFeatures};
use crate::imap::tracker::UpdateSink;
use crate::memstore::MemSession;
use crate::support::error::Error;
use crate::wire::numset::{NumSet, SeqRange};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Fault {
    PanicOnLogin,
    PanicOnIdle,
    FailIdle,
    /// Fail to write updates after commands that hold back expunges.
    FailQuietPoll,
}

/// A store session that breaks in one specific way.
struct Faulty {
    inner: MemSession,
    fault: Fault,
}

impl Faulty {
    fn connect(setup: &Setup, name: &'static str, fault: Fault) -> RawClient {
        // Without SASL, AUTHENTICATE PLAIN goes through `login`.
        let mut features = SessionFeatures::all();
        features.remove(SessionFeatures::SASL);
        setup.connect_session(
            name,
            Box::new(Faulty {
                inner: setup.session(features),
                fault,
            }),
        )
    }
}

impl Session for Faulty {
    fn features(&self) -> SessionFeatures {
        self.inner.features()
    }

    fn login(&mut self, user: &str, password: &str) -> Result<(), Error> {
        if Fault::PanicOnLogin == self.fault {
            panic!("login exploded");
        }
        self.inner.login(user, password)
    }

    fn unauthenticate(&mut self) -> Result<(), Error> {
        self.inner.unauthenticate()
    }

    fn namespace(&mut self) -> Result<NamespaceData, Error> {
        self.inner.namespace()
    }

    fn select(
        &mut self,
        mailbox: &str,
        read_only: bool,
    ) -> Result<SelectData, Error> {
        self.inner.select(mailbox, read_only)
    }

    fn unselect(&mut self) -> Result<(), Error> {
        self.inner.unselect()
    }

    fn create(&mut self, mailbox: &str) -> Result<(), Error> {
        self.inner.create(mailbox)
    }

    fn delete(&mut self, mailbox: &str) -> Result<(), Error> {
        self.inner.delete(mailbox)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Error> {
        self.inner.rename(from, to)
    }

    fn subscribe(&mut self, mailbox: &str) -> Result<(), Error> {
        self.inner.subscribe(mailbox)
    }

    fn unsubscribe(&mut self, mailbox: &str) -> Result<(), Error> {
        self.inner.unsubscribe(mailbox)
    }

    fn list(
        &mut self,
        reference: &str,
        patterns: &[String],
        options: &ListOptions,
    ) -> Result<Vec<ListData>, Error> {
        self.inner.list(reference, patterns, options)
    }

    fn status(
        &mut self,
        mailbox: &str,
        items: &[StatusItem],
    ) -> Result<StatusData, Error> {
        self.inner.status(mailbox, items)
    }

    fn append(
        &mut self,
        mailbox: &str,
        options: &AppendOptions,
        data: Vec<u8>,
    ) -> Result<AppendData, Error> {
        self.inner.append(mailbox, options, data)
    }

    fn expunge(
        &mut self,
        uids: Option<&NumSet>,
        sink: &mut dyn UpdateSink,
    ) -> Result<(), Error> {
        self.inner.expunge(uids, sink)
    }

    fn search(
        &mut self,
        kind: NumKind,
        key: &SearchKey,
    ) -> Result<SeqRange, Error> {
        self.inner.search(kind, key)
    }

    fn fetch(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        options: &FetchOptions,
        sink: &mut FetchSink<'_>,
    ) -> Result<(), Error> {
        self.inner.fetch(set, kind, options, sink)
    }

    fn store(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        flags: &StoreFlags,
        sink: &mut FetchSink<'_>,
    ) -> Result<(), Error> {
        self.inner.store(set, kind, flags, sink)
    }

    fn copy(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        dest: &str,
    ) -> Result<CopyData, Error> {
        self.inner.copy(set, kind, dest)
    }

    fn move_messages(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        dest: &str,
        sink: &mut dyn MoveSink,
    ) -> Result<(), Error> {
        self.inner.move_messages(set, kind, dest, sink)
    }

    fn poll(
        &mut self,
        allow_expunge: bool,
        sink: &mut dyn UpdateSink,
    ) -> Result<(), Error> {
        if Fault::FailQuietPoll == self.fault && !allow_expunge {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "update delivery failed",
            )));
        }
        self.inner.poll(allow_expunge, sink)
    }

    fn idle(
        &mut self,
        sink: &mut dyn UpdateSink,
        stop: &Receiver<()>,
    ) -> Result<(), Error> {
        match self.fault {
            Fault::PanicOnIdle => panic!("idle exploded"),
            Fault::FailIdle => Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "update delivery failed",
            ))),
            Fault::PanicOnLogin | Fault::FailQuietPoll => {
                self.inner.idle(sink, stop)
            }
        }
    }
}

#[test]
fn panic_during_authenticate_is_contained() {
    let setup = set_up();
    let mut client = Faulty::connect(&setup, "fltauth", Fault::PanicOnLogin);
    client.skip_greeting();

    let lines = client.command("A1", "AUTHENTICATE PLAIN AGF6dXJlAGh1bnRlcjI=");
    assert_tagged(&lines, "A1", "NO");
    assert_like(r"\[SERVERBUG\]", lines.last().unwrap());

    // Still usable, and still not logged in.
    client.ok_command("N1", "NOOP");
    let lines = client.command("S1", "SELECT INBOX");
    assert_tagged(&lines, "S1", "BAD");
}

#[test]
fn panic_during_login_is_contained() {
    let setup = set_up();
    let mut client = Faulty::connect(&setup, "fltlogn", Fault::PanicOnLogin);
    client.skip_greeting();

    let lines = client.command("L1", "LOGIN azure hunter2");
    assert_tagged(&lines, "L1", "NO");
    assert_like(r"\[SERVERBUG\]", lines.last().unwrap());
    client.ok_command("N1", "NOOP");
}

#[test]
fn failed_idle_delivery_ends_connection() {
    let setup = set_up();
    let mut client = Faulty::connect(&setup, "fltidle", Fault::FailIdle);
    quick_log_in(&mut client);

    client.write_raw(b"I1 IDLE\r\n");
    client.expect_line(r"^\+ ");
    // No DONE is sent; the server must give up on its own, with no tagged
    // response.
    assert!(client.at_eof());
}

#[test]
fn panic_during_idle_ends_connection() {
    let setup = set_up();
    let mut client = Faulty::connect(&setup, "fltidlp", Fault::PanicOnIdle);
    quick_log_in(&mut client);

    client.write_raw(b"I1 IDLE\r\n");
    client.expect_line(r"^\+ ");
    assert!(client.at_eof());

    // Other sessions on the same store are unaffected.
    let mut other = setup.connect("fltothr");
    quick_log_in(&mut other);
    quick_select(&mut other, "INBOX");
}

#[test]
fn failed_poll_after_command_ends_connection() {
    let setup = set_up();
    let mut client = Faulty::connect(&setup, "fltpoll", Fault::FailQuietPoll);
    quick_log_in(&mut client);
    quick_append(&mut client, "INBOX", SIMPLE_MESSAGE);
    quick_select(&mut client, "INBOX");

    client.write_raw(b"F1 FETCH 1 (UID)\r\n");
    client.expect_line(r"^\* 1 FETCH \(UID 1\)$");
    assert!(client.at_eof());
}
