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

//! Typed commands.
//!
//! Everything except AUTHENTICATE, STARTTLS and IDLE returns a `Pending` as
//! soon as the command has been sent, so commands can be pipelined freely.

use std::io::{self, Write};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use log::info;
use openssl::ssl::SslConnector;

use super::response::{Data, Response};
use super::{Client, CommandKind, Completion, Error, Inner, Pending};
use crate::imap::model::*;
use crate::imap::sasl::SaslClient;
use crate::wire::lex::{LexOutput, LexWriter};
use crate::wire::numset::{NumSet, SeqRange};

/// How long one IDLE command is left running before it is restarted, so
/// that servers with a 30 minute inactivity timer do not drop us.
pub const IDLE_RESTART: Duration = Duration::from_secs(28 * 60);

/// The result of MOVE.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MoveData {
    pub copy_data: Option<CopyData>,
    /// The sequence numbers expunged, in the order reported.
    pub expunged: Vec<u32>,
}

fn unit(handle: super::CommandHandle) -> Pending<()> {
    Pending::new(handle, |_| Ok(()))
}

impl Client {
    pub fn capability(&self) -> Result<Pending<CapSet>, Error> {
        let handle = self.issue_kind(CommandKind::Capability, |lex| {
            lex.verbatim("CAPABILITY")
        })?;
        Ok(Pending::new(handle, |c| {
            let Completion { data, status } = c;
            data.into_iter()
                .rev()
                .find_map(|r| match r {
                    Response::Data(Data::Capability(caps)) => Some(caps),
                    _ => None,
                })
                .or_else(|| match status.code {
                    Some(RespCode::Capability(caps)) => Some(caps),
                    _ => None,
                })
                .ok_or(Error::UnexpectedResponse)
        }))
    }

    pub fn noop(&self) -> Result<Pending<()>, Error> {
        self.issue_kind(CommandKind::Plain, |lex| lex.verbatim("NOOP"))
            .map(unit)
    }

    pub fn check(&self) -> Result<Pending<()>, Error> {
        self.issue_kind(CommandKind::Plain, |lex| lex.verbatim("CHECK"))
            .map(unit)
    }

    pub fn logout(&self) -> Result<Pending<()>, Error> {
        self.issue_kind(CommandKind::Logout, |lex| lex.verbatim("LOGOUT"))
            .map(unit)
    }

    pub fn login(
        &self,
        user: &str,
        password: &str,
    ) -> Result<Pending<()>, Error> {
        self.issue_kind(CommandKind::Login, |lex| {
            lex.verbatim("LOGIN ")?;
            lex.astring(user)?;
            lex.sp()?;
            lex.astring(password)
        })
        .map(unit)
    }

    /// Run a SASL exchange to completion.
    ///
    /// The initial response is sent inline when the server supports
    /// SASL-IR. If the mechanism cannot answer a challenge, the exchange is
    /// cancelled and the server's reply returned.
    pub fn authenticate(
        &self,
        sasl: &mut dyn SaslClient,
    ) -> Result<(), Error> {
        let initial = if self.has_capability("SASL-IR") {
            sasl.initial_response()
        } else {
            None
        };
        let mechanism = sasl.mechanism().to_ascii_uppercase();

        let mut w = self.inner.writer();
        let (handle, mut continuation) = self.inner.issue_locked(
            &mut w,
            CommandKind::Login,
            true,
            |lex| {
                lex.verbatim("AUTHENTICATE ")?;
                lex.verbatim(&mechanism)?;
                if let Some(ref initial) = initial {
                    lex.sp()?;
                    if initial.is_empty() {
                        lex.verbatim("=")?;
                    } else {
                        lex.verbatim(&base64::encode(initial))?;
                    }
                }
                Ok(())
            },
        )?;

        while let Some(Ok(Ok(challenge))) =
            continuation.take().map(|rx| rx.recv())
        {
            let next = self.inner.register_continuation(handle.tag())?;
            let reply = base64::decode(challenge.trim())
                .ok()
                .and_then(|challenge| sasl.respond(&challenge).ok())
                .map_or_else(|| "*".to_owned(), base64::encode);
            w.out.write_all(reply.as_bytes())?;
            w.out.write_all(b"\r\n")?;
            w.out.flush()?;
            continuation = Some(next);
        }

        handle.wait()?;
        Ok(())
    }

    /// Upgrade the connection to TLS.
    ///
    /// No other command can be sent until the handshake is over. The cached
    /// capabilities are cleared afterwards.
    pub fn starttls(
        &self,
        connector: SslConnector,
        domain: &str,
    ) -> Result<(), Error> {
        self.require("STARTTLS")?;

        let mut w = self.inner.writer();
        self.inner.state().starttls = Some((connector, domain.to_owned()));
        let (handle, _) = self.inner.issue_locked(
            &mut w,
            CommandKind::StartTls,
            false,
            |lex| lex.verbatim("STARTTLS"),
        )?;
        let result = handle.wait();
        if result.is_err() {
            self.inner.state().starttls = None;
        }
        result?;

        info!(
            "IMAP client: STARTTLS complete: {}",
            self.tls_description().unwrap_or_default()
        );
        Ok(())
    }

    pub fn unauthenticate(&self) -> Result<Pending<()>, Error> {
        self.require("UNAUTHENTICATE")?;
        self.issue_kind(CommandKind::Unauthenticate, |lex| {
            lex.verbatim("UNAUTHENTICATE")
        })
        .map(unit)
    }

    /// Returns the extensions the server reports as newly enabled.
    pub fn enable(
        &self,
        extensions: &[&str],
    ) -> Result<Pending<Vec<String>>, Error> {
        let handle = self.issue_kind(CommandKind::Enable, |lex| {
            lex.verbatim("ENABLE")?;
            for ext in extensions {
                lex.sp()?;
                lex.verbatim(ext)?;
            }
            Ok(())
        })?;
        Ok(Pending::new(handle, |c| {
            Ok(c.data
                .into_iter()
                .filter_map(|r| match r {
                    Response::Data(Data::Enabled(exts)) => Some(exts),
                    _ => None,
                })
                .flatten()
                .collect())
        }))
    }

    pub fn namespace(&self) -> Result<Pending<NamespaceData>, Error> {
        self.require("NAMESPACE")?;
        let handle = self.issue_kind(CommandKind::Namespace, |lex| {
            lex.verbatim("NAMESPACE")
        })?;
        Ok(Pending::new(handle, |c| {
            c.data
                .into_iter()
                .find_map(|r| match r {
                    Response::Data(Data::Namespace(ns)) => Some(ns),
                    _ => None,
                })
                .ok_or(Error::UnexpectedResponse)
        }))
    }

    pub fn select(
        &self,
        mailbox: &str,
    ) -> Result<Pending<SelectData>, Error> {
        self.select_impl("SELECT", mailbox)
    }

    pub fn examine(
        &self,
        mailbox: &str,
    ) -> Result<Pending<SelectData>, Error> {
        self.select_impl("EXAMINE", mailbox)
    }

    fn select_impl(
        &self,
        verb: &str,
        mailbox: &str,
    ) -> Result<Pending<SelectData>, Error> {
        let handle = self.issue_kind(CommandKind::Select, |lex| {
            lex.verbatim(verb)?;
            lex.sp()?;
            lex.mailbox(mailbox)
        })?;
        Ok(Pending::new(handle, finish_select))
    }

    pub fn create(&self, mailbox: &str) -> Result<Pending<()>, Error> {
        self.mailbox_command("CREATE", mailbox)
    }

    pub fn delete(&self, mailbox: &str) -> Result<Pending<()>, Error> {
        self.mailbox_command("DELETE", mailbox)
    }

    pub fn subscribe(&self, mailbox: &str) -> Result<Pending<()>, Error> {
        self.mailbox_command("SUBSCRIBE", mailbox)
    }

    pub fn unsubscribe(&self, mailbox: &str) -> Result<Pending<()>, Error> {
        self.mailbox_command("UNSUBSCRIBE", mailbox)
    }

    fn mailbox_command(
        &self,
        verb: &str,
        mailbox: &str,
    ) -> Result<Pending<()>, Error> {
        self.issue_kind(CommandKind::Plain, |lex| {
            lex.verbatim(verb)?;
            lex.sp()?;
            lex.mailbox(mailbox)
        })
        .map(unit)
    }

    pub fn rename(&self, from: &str, to: &str) -> Result<Pending<()>, Error> {
        self.issue_kind(CommandKind::Plain, |lex| {
            lex.verbatim("RENAME ")?;
            lex.mailbox(from)?;
            lex.sp()?;
            lex.mailbox(to)
        })
        .map(unit)
    }

    pub fn list(
        &self,
        reference: &str,
        pattern: &str,
        options: ListOptions,
    ) -> Result<Pending<Vec<ListData>>, Error> {
        let handle = self.issue_kind(CommandKind::List, |lex| {
            lex.verbatim("LIST ")?;
            if options.select_subscribed {
                lex.verbatim("(SUBSCRIBED) ")?;
            }
            lex.astring(reference)?;
            lex.sp()?;
            lex.astring(pattern)
        })?;
        Ok(Pending::new(handle, |c| Ok(collect_list(c, false))))
    }

    pub fn lsub(
        &self,
        reference: &str,
        pattern: &str,
    ) -> Result<Pending<Vec<ListData>>, Error> {
        let handle = self.issue_kind(CommandKind::List, |lex| {
            lex.verbatim("LSUB ")?;
            lex.astring(reference)?;
            lex.sp()?;
            lex.astring(pattern)
        })?;
        Ok(Pending::new(handle, |c| Ok(collect_list(c, true))))
    }

    pub fn status(
        &self,
        mailbox: &str,
        items: &[StatusItem],
    ) -> Result<Pending<StatusData>, Error> {
        let handle = self.issue_kind(CommandKind::Status, |lex| {
            lex.verbatim("STATUS ")?;
            lex.mailbox(mailbox)?;
            lex.verbatim(" (")?;
            for (ix, item) in items.iter().enumerate() {
                if ix > 0 {
                    lex.sp()?;
                }
                lex.verbatim(item.as_str())?;
            }
            lex.verbatim(")")
        })?;
        Ok(Pending::new(handle, |c| {
            c.data
                .into_iter()
                .find_map(|r| match r {
                    Response::Data(Data::MailboxStatus(status)) => Some(status),
                    _ => None,
                })
                .ok_or(Error::UnexpectedResponse)
        }))
    }

    /// Returns the `APPENDUID` data if the server sent any.
    pub fn append(
        &self,
        mailbox: &str,
        options: &AppendOptions,
        message: &[u8],
    ) -> Result<Pending<Option<AppendData>>, Error> {
        let handle = self.issue_kind(CommandKind::Append, |lex| {
            lex.verbatim("APPEND ")?;
            lex.mailbox(mailbox)?;
            if !options.flags.is_empty() {
                lex.sp()?;
                lex.flags(&options.flags)?;
            }
            if let Some(ref date) = options.internal_date {
                lex.sp()?;
                lex.datetime(date)?;
            }
            lex.sp()?;
            lex.literal(message)
        })?;
        Ok(Pending::new(handle, |c| match c.status.code {
            Some(RespCode::AppendUid(uid_validity, uid)) => {
                Ok(Some(AppendData { uid_validity, uid }))
            }
            _ => Ok(None),
        }))
    }

    pub fn close(&self) -> Result<Pending<()>, Error> {
        self.issue_kind(CommandKind::Close, |lex| lex.verbatim("CLOSE"))
            .map(unit)
    }

    pub fn unselect(&self) -> Result<Pending<()>, Error> {
        self.require("UNSELECT")?;
        self.issue_kind(CommandKind::Close, |lex| lex.verbatim("UNSELECT"))
            .map(unit)
    }

    /// Returns the expunged sequence numbers, in the order reported.
    pub fn expunge(&self) -> Result<Pending<Vec<u32>>, Error> {
        let handle = self
            .issue_kind(CommandKind::Expunge, |lex| lex.verbatim("EXPUNGE"))?;
        Ok(Pending::new(handle, |c| Ok(collect_expunged(&c))))
    }

    pub fn uid_expunge(
        &self,
        uids: &NumSet,
    ) -> Result<Pending<Vec<u32>>, Error> {
        self.require("UIDPLUS")?;
        let handle = self.issue_kind(CommandKind::Expunge, |lex| {
            lex.verbatim("UID EXPUNGE ")?;
            lex.verbatim(&uids.to_string())
        })?;
        Ok(Pending::new(handle, |c| Ok(collect_expunged(&c))))
    }

    /// Search the selected mailbox.
    ///
    /// With `ret`, the server must support ESEARCH. Without it, whichever
    /// form the server answers with is accepted and the summary fields are
    /// filled in locally.
    pub fn search(
        &self,
        kind: NumKind,
        key: &SearchKey,
        ret: Option<SearchReturn>,
    ) -> Result<Pending<SearchData>, Error> {
        if ret.is_some() {
            self.require("ESEARCH")?;
        }

        let handle = self.issue_kind(CommandKind::Search, |lex| {
            if NumKind::Uid == kind {
                lex.verbatim("UID ")?;
            }
            lex.verbatim("SEARCH ")?;
            if let Some(ret) = ret {
                write_search_return(lex, ret)?;
                lex.sp()?;
            }
            if !search_key_is_ascii(key) {
                lex.verbatim("CHARSET UTF-8 ")?;
            }
            write_search_key(lex, key, true)
        })?;

        Ok(Pending::new(handle, move |c| {
            let mut hits = Vec::new();
            for r in c.data {
                match r {
                    Response::Data(Data::ESearch { data, .. }) => {
                        return Ok(data)
                    }
                    Response::Data(Data::Search(nums)) => hits.extend(nums),
                    _ => (),
                }
            }

            let all = hits.iter().copied().collect::<SeqRange>();
            Ok(SearchData {
                uid: NumKind::Uid == kind,
                min: all.min(),
                max: all.max(),
                count: Some(hits.len() as u32),
                all,
            })
        }))
    }

    pub fn fetch(
        &self,
        kind: NumKind,
        set: &NumSet,
        options: &FetchOptions,
    ) -> Result<Pending<Vec<FetchMessageData>>, Error> {
        let handle = self.issue_kind(CommandKind::Fetch, |lex| {
            write_kind(lex, kind)?;
            lex.verbatim("FETCH ")?;
            lex.verbatim(&set.to_string())?;
            lex.sp()?;
            write_fetch_atts(lex, options)
        })?;
        Ok(Pending::new(handle, |c| Ok(collect_fetch(c))))
    }

    /// Returns the FETCH responses the server sent, which is nothing for
    /// silent stores.
    pub fn store(
        &self,
        kind: NumKind,
        set: &NumSet,
        flags: &StoreFlags,
    ) -> Result<Pending<Vec<FetchMessageData>>, Error> {
        let handle = self.issue_kind(CommandKind::Store, |lex| {
            write_kind(lex, kind)?;
            lex.verbatim("STORE ")?;
            lex.verbatim(&set.to_string())?;
            lex.sp()?;
            lex.verbatim(match flags.op {
                StoreOp::Replace => "FLAGS",
                StoreOp::Add => "+FLAGS",
                StoreOp::Remove => "-FLAGS",
            })?;
            if flags.silent {
                lex.verbatim(".SILENT")?;
            }
            lex.sp()?;
            lex.flags(&flags.flags)
        })?;
        Ok(Pending::new(handle, |c| Ok(collect_fetch(c))))
    }

    /// Returns the `COPYUID` data if the server sent any.
    pub fn copy(
        &self,
        kind: NumKind,
        set: &NumSet,
        mailbox: &str,
    ) -> Result<Pending<Option<CopyData>>, Error> {
        let handle = self.issue_kind(CommandKind::Copy, |lex| {
            write_kind(lex, kind)?;
            lex.verbatim("COPY ")?;
            lex.verbatim(&set.to_string())?;
            lex.sp()?;
            lex.mailbox(mailbox)
        })?;
        Ok(Pending::new(handle, |c| Ok(copy_data(c.status.code))))
    }

    pub fn move_messages(
        &self,
        kind: NumKind,
        set: &NumSet,
        mailbox: &str,
    ) -> Result<Pending<MoveData>, Error> {
        self.require("MOVE")?;
        let handle = self.issue_kind(CommandKind::Move, |lex| {
            write_kind(lex, kind)?;
            lex.verbatim("MOVE ")?;
            lex.verbatim(&set.to_string())?;
            lex.sp()?;
            lex.mailbox(mailbox)
        })?;
        Ok(Pending::new(handle, |c| {
            let expunged = collect_expunged(&c);
            let Completion { data, status } = c;
            let untagged = data.into_iter().find_map(|r| match r {
                Response::Status { status, .. } => copy_data(status.code),
                _ => None,
            });
            Ok(MoveData {
                copy_data: untagged.or_else(|| copy_data(status.code)),
                expunged,
            })
        }))
    }

    /// Start idling.
    ///
    /// Returns once the server has accepted IDLE. Nothing else can be sent
    /// until the returned handle is closed; updates arrive through the
    /// `UnilateralDataHandler`.
    pub fn idle(&self) -> Result<IdleHandle, Error> {
        self.require("IDLE")?;

        let inner = Arc::clone(&self.inner);
        let (ready_tx, ready_rx) = channel::bounded(1);
        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let worker = thread::Builder::new()
            .name("imap-client-idle".to_owned())
            .spawn(move || idle_worker(&inner, ready_tx, stop_rx))?;

        if ready_rx.recv().is_ok() {
            Ok(IdleHandle {
                stop: Some(stop_tx),
                worker: Some(worker),
            })
        } else {
            Err(match worker.join() {
                Ok(Err(e)) => e,
                _ => Error::Closed,
            })
        }
    }
}

fn idle_worker(
    inner: &Inner,
    ready: Sender<()>,
    stop: channel::Receiver<()>,
) -> Result<(), Error> {
    let mut w = inner.writer();
    let mut ready = Some(ready);
    loop {
        let (handle, continuation) = inner.issue_locked(
            &mut w,
            CommandKind::Idle,
            true,
            |lex| lex.verbatim("IDLE"),
        )?;

        match continuation.map(|rx| rx.recv()) {
            Some(Ok(Ok(_))) => (),
            _ => {
                handle.wait()?;
                return Err(Error::UnexpectedResponse);
            }
        }

        if let Some(ready) = ready.take() {
            let _ = ready.send(());
        }

        let restart = channel::select! {
            recv(stop) -> _ => false,
            recv(handle.done) -> done => {
                // The server ended IDLE by itself or the connection died
                super::interpret_done(done)?;
                return Err(Error::UnexpectedResponse);
            },
            default(IDLE_RESTART) => true,
        };

        w.out.write_all(b"DONE\r\n")?;
        w.out.flush()?;
        handle.wait()?;

        if !restart {
            return Ok(());
        }
    }
}

/// A running IDLE.
///
/// Dropping the handle ends IDLE too, but discards any error.
pub struct IdleHandle {
    stop: Option<Sender<()>>,
    worker: Option<thread::JoinHandle<Result<(), Error>>>,
}

impl IdleHandle {
    /// Send `DONE` and wait for the server to complete the IDLE command.
    pub fn close(mut self) -> Result<(), Error> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), Error> {
        self.stop.take();
        match self.worker.take() {
            Some(worker) => worker.join().unwrap_or(Err(Error::Closed)),
            None => Ok(()),
        }
    }
}

impl Drop for IdleHandle {
    fn drop(&mut self) {
        let _ = self.finish();
    }
}

fn finish_select(c: Completion) -> Result<SelectData, Error> {
    let mut data = SelectData {
        read_only: Some(RespCode::ReadOnly) == c.status.code,
        ..SelectData::default()
    };

    for r in c.data {
        match r {
            Response::Data(Data::Flags(flags)) => data.flags = flags,
            Response::Data(Data::Exists(n)) => data.num_messages = n,
            Response::Status { status, .. } => match status.code {
                Some(RespCode::UidValidity(v)) => data.uid_validity = v,
                Some(RespCode::UidNext(uid)) => data.uid_next = uid,
                Some(RespCode::PermanentFlags(flags)) => {
                    data.permanent_flags = flags
                }
                _ => (),
            },
            _ => (),
        }
    }

    Ok(data)
}

fn collect_list(c: Completion, want_lsub: bool) -> Vec<ListData> {
    c.data
        .into_iter()
        .filter_map(|r| match r {
            Response::Data(Data::List { lsub, data }) if lsub == want_lsub => {
                Some(data)
            }
            _ => None,
        })
        .collect()
}

fn collect_expunged(c: &Completion) -> Vec<u32> {
    c.data
        .iter()
        .filter_map(|r| match *r {
            Response::Data(Data::Expunge(seq)) => Some(seq),
            _ => None,
        })
        .collect()
}

fn collect_fetch(c: Completion) -> Vec<FetchMessageData> {
    c.data
        .into_iter()
        .filter_map(|r| match r {
            Response::Data(Data::Fetch(data)) => Some(data),
            _ => None,
        })
        .collect()
}

fn copy_data(code: Option<RespCode>) -> Option<CopyData> {
    match code {
        Some(RespCode::CopyUid(uid_validity, source_uids, dest_uids)) => {
            Some(CopyData {
                uid_validity,
                source_uids,
                dest_uids,
            })
        }
        _ => None,
    }
}

fn write_kind<W: LexOutput>(
    lex: &mut LexWriter<W>,
    kind: NumKind,
) -> io::Result<()> {
    match kind {
        NumKind::Seq => Ok(()),
        NumKind::Uid => lex.verbatim("UID "),
    }
}

fn write_fetch_atts<W: LexOutput>(
    lex: &mut LexWriter<W>,
    options: &FetchOptions,
) -> io::Result<()> {
    let mut atts = Vec::new();
    if options.uid {
        atts.push("UID".to_owned());
    }
    if options.flags {
        atts.push("FLAGS".to_owned());
    }
    if options.internal_date {
        atts.push("INTERNALDATE".to_owned());
    }
    if options.rfc822_size {
        atts.push("RFC822.SIZE".to_owned());
    }
    for section in &options.sections {
        atts.push(format!(
            "BODY{}[{}]",
            if section.peek { ".PEEK" } else { "" },
            section.part.as_str()
        ));
    }

    lex.verbatim("(")?;
    lex.verbatim(&atts.join(" "))?;
    lex.verbatim(")")
}

fn write_search_return<W: LexOutput>(
    lex: &mut LexWriter<W>,
    ret: SearchReturn,
) -> io::Result<()> {
    let names = [
        (ret.min, "MIN"),
        (ret.max, "MAX"),
        (ret.count, "COUNT"),
        (ret.all, "ALL"),
    ];
    let names = names
        .iter()
        .filter(|&&(on, _)| on)
        .map(|&(_, name)| name)
        .collect::<Vec<_>>();
    lex.verbatim("RETURN (")?;
    lex.verbatim(&names.join(" "))?;
    lex.verbatim(")")
}

fn search_key_is_ascii(key: &SearchKey) -> bool {
    match *key {
        SearchKey::Body(ref s) | SearchKey::Text(ref s) => s.is_ascii(),
        SearchKey::Not(ref k) => search_key_is_ascii(k),
        SearchKey::Or(ref a, ref b) => {
            search_key_is_ascii(a) && search_key_is_ascii(b)
        }
        SearchKey::And(ref keys) => keys.iter().all(search_key_is_ascii),
        _ => true,
    }
}

/// Write `key`. At the top level, the parts of an `And` are written without
/// parentheses.
fn write_search_key<W: LexOutput>(
    lex: &mut LexWriter<W>,
    key: &SearchKey,
    top: bool,
) -> io::Result<()> {
    match *key {
        SearchKey::All => lex.verbatim("ALL"),
        SearchKey::Seq(ref set) => lex.verbatim(&set.to_string()),
        SearchKey::Uid(ref set) => {
            lex.verbatim("UID ")?;
            lex.verbatim(&set.to_string())
        }
        SearchKey::Flag(ref flag, set) => {
            let (name, keyword) = match *flag {
                Flag::Answered => ("ANSWERED", None),
                Flag::Deleted => ("DELETED", None),
                Flag::Draft => ("DRAFT", None),
                Flag::Flagged => ("FLAGGED", None),
                Flag::Seen => ("SEEN", None),
                ref other => ("KEYWORD", Some(other)),
            };
            if !set {
                lex.verbatim("UN")?;
            }
            lex.verbatim(name)?;
            if let Some(keyword) = keyword {
                lex.sp()?;
                lex.flag(keyword)?;
            }
            Ok(())
        }
        SearchKey::Larger(n) => {
            lex.verbatim("LARGER ")?;
            lex.num_u32(n)
        }
        SearchKey::Smaller(n) => {
            lex.verbatim("SMALLER ")?;
            lex.num_u32(n)
        }
        SearchKey::Body(ref s) => {
            lex.verbatim("BODY ")?;
            lex.astring(s)
        }
        SearchKey::Text(ref s) => {
            lex.verbatim("TEXT ")?;
            lex.astring(s)
        }
        SearchKey::Not(ref k) => {
            lex.verbatim("NOT ")?;
            write_search_key(lex, k, false)
        }
        SearchKey::Or(ref a, ref b) => {
            lex.verbatim("OR ")?;
            write_search_key(lex, a, false)?;
            lex.sp()?;
            write_search_key(lex, b, false)
        }
        SearchKey::And(ref keys) if keys.is_empty() => lex.verbatim("ALL"),
        SearchKey::And(ref keys) => {
            if !top {
                lex.verbatim("(")?;
            }
            for (ix, k) in keys.iter().enumerate() {
                if ix > 0 {
                    lex.sp()?;
                }
                write_search_key(lex, k, false)?;
            }
            if !top {
                lex.verbatim(")")?;
            }
            Ok(())
        }
    }
}
