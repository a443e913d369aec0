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

//! Response framing for the server.
//!
//! All output of a connection funnels through one `Output` behind a mutex,
//! since during IDLE a helper thread writes mailbox updates while the
//! connection thread is blocked reading `DONE`.

use std::io::{self, BufWriter, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::imap::model::*;
use crate::imap::server::session::MoveSink;
use crate::imap::tracker::UpdateSink;
use crate::imap::transport::{self, Transport};
use crate::support::error::Error;
use crate::support::trace::{TraceWrite, Tracer};
use crate::wire::lex::{LexOutput, LexWriter};

pub struct Output {
    w: BufWriter<TraceWrite<transport::Writer>>,
    unicode: bool,
    rev2: bool,
}

impl Write for Output {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.w.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.w.flush()
    }
}

impl LexOutput for Output {
    fn literal_data(&mut self, data: &[u8], _: bool) -> io::Result<()> {
        self.w.write_all(data)
    }
}

/// Shared handle to the output of one connection.
#[derive(Clone)]
pub struct Responder {
    out: Arc<Mutex<Output>>,
    transport: Transport,
    write_timeout: Duration,
    literal_write_timeout: Duration,
}

impl Responder {
    pub fn new(
        transport: Transport,
        tracer: Option<Tracer>,
        write_timeout: Duration,
        literal_write_timeout: Duration,
    ) -> Self {
        transport.set_write_timeout(Some(write_timeout));
        Responder {
            out: Arc::new(Mutex::new(Output {
                w: BufWriter::new(TraceWrite::new(transport.writer(), tracer)),
                unicode: false,
                rev2: false,
            })),
            transport,
            write_timeout,
            literal_write_timeout,
        }
    }

    /// Lock the output for a sequence of writes that must not interleave
    /// with anything else.
    ///
    /// A panic in a command handler can poison the lock while a response is
    /// half written; the connection carries on regardless.
    pub fn lock(&self) -> MutexGuard<'_, Output> {
        self.out.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write a response that carries literals, under the longer write
    /// timeout.
    pub fn with_literal_timeout<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        self.transport
            .set_write_timeout(Some(self.literal_write_timeout));
        let ret = f(self);
        self.transport.set_write_timeout(Some(self.write_timeout));
        ret
    }
}

impl Output {
    /// Use UTF-8 quoted strings from now on (`ENABLE UTF8=ACCEPT`).
    pub fn set_unicode(&mut self, unicode: bool) {
        self.unicode = unicode;
    }

    /// Use IMAP4rev2 response forms from now on (`ENABLE IMAP4rev2`).
    pub fn set_rev2(&mut self, rev2: bool) {
        self.rev2 = rev2;
    }

    pub fn is_rev2(&self) -> bool {
        self.rev2
    }

    fn lex(&mut self) -> LexWriter<&mut Self> {
        let unicode = self.unicode;
        LexWriter::new(self, unicode)
    }

    /// Write a status response, tagged if `tag` is given, and flush.
    pub fn status(
        &mut self,
        tag: Option<&str>,
        response: &StatusResponse,
    ) -> io::Result<()> {
        {
            let mut lex = self.lex();
            lex.verbatim(tag.unwrap_or("*"))?;
            lex.sp()?;
            lex.verbatim(response.cond.as_str())?;
            if let Some(ref code) = response.code {
                lex.verbatim(" [")?;
                lex.text(&code.to_string())?;
                lex.verbatim("]")?;
            }
            lex.sp()?;
            lex.text(&response.text)?;
            lex.crlf()?;
        }
        self.flush()
    }

    /// Write an untagged status response without flushing.
    pub fn untagged(&mut self, response: &StatusResponse) -> io::Result<()> {
        let mut lex = self.lex();
        lex.verbatim("* ")?;
        lex.verbatim(response.cond.as_str())?;
        if let Some(ref code) = response.code {
            lex.verbatim(" [")?;
            lex.text(&code.to_string())?;
            lex.verbatim("]")?;
        }
        lex.sp()?;
        lex.text(&response.text)?;
        lex.crlf()
    }

    /// Write a continuation request and flush.
    pub fn continuation(&mut self, text: &str) -> io::Result<()> {
        {
            let mut lex = self.lex();
            lex.verbatim("+ ")?;
            lex.text(text)?;
            lex.crlf()?;
        }
        self.flush()
    }

    pub fn capability(&mut self, caps: &CapSet) -> io::Result<()> {
        let mut lex = self.lex();
        lex.verbatim("* CAPABILITY")?;
        for cap in caps.iter() {
            lex.sp()?;
            lex.verbatim(cap)?;
        }
        lex.crlf()
    }

    pub fn enabled(&mut self, caps: &[String]) -> io::Result<()> {
        let mut lex = self.lex();
        lex.verbatim("* ENABLED")?;
        for cap in caps {
            lex.sp()?;
            lex.verbatim(cap)?;
        }
        lex.crlf()
    }

    pub fn list(&mut self, verb: &str, data: &ListData) -> io::Result<()> {
        let mut lex = self.lex();
        lex.verbatim("* ")?;
        lex.verbatim(verb)?;
        lex.verbatim(" (")?;
        for (ix, attr) in data.attrs.iter().enumerate() {
            if ix > 0 {
                lex.sp()?;
            }
            lex.verbatim(attr)?;
        }
        lex.verbatim(") ")?;
        match data.delim {
            None => lex.nil()?,
            Some(delim) => lex.string(&delim.to_string())?,
        }
        lex.sp()?;
        lex.mailbox(&data.mailbox)?;
        lex.crlf()
    }

    pub fn status_data(&mut self, data: &StatusData) -> io::Result<()> {
        let mut lex = self.lex();
        lex.verbatim("* STATUS ")?;
        lex.mailbox(&data.mailbox)?;
        lex.verbatim(" (")?;

        let mut first = true;
        let mut item = |lex: &mut LexWriter<&mut Self>,
                        name: &str,
                        value: Option<u64>|
         -> io::Result<()> {
            if let Some(value) = value {
                if !first {
                    lex.sp()?;
                }
                first = false;
                lex.verbatim(name)?;
                lex.sp()?;
                lex.num_u64(value)?;
            }
            Ok(())
        };

        item(&mut lex, "MESSAGES", data.num_messages.map(u64::from))?;
        item(&mut lex, "UIDNEXT", data.uid_next.map(u64::from))?;
        item(&mut lex, "UIDVALIDITY", data.uid_validity.map(u64::from))?;
        item(&mut lex, "UNSEEN", data.num_unseen.map(u64::from))?;
        item(&mut lex, "DELETED", data.num_deleted.map(u64::from))?;
        item(&mut lex, "SIZE", data.size)?;

        lex.verbatim(")")?;
        lex.crlf()
    }

    /// The untagged data of a successful SELECT or EXAMINE.
    pub fn select_data(&mut self, data: &SelectData) -> io::Result<()> {
        let rev2 = self.rev2;
        let mut lex = self.lex();
        lex.verbatim("* ")?;
        lex.num_u32(data.num_messages)?;
        lex.verbatim(" EXISTS\r\n")?;
        if !rev2 {
            lex.verbatim("* 0 RECENT\r\n")?;
        }
        drop(lex);

        self.untagged(&StatusResponse::ok("UIDs valid").with_code(
            RespCode::UidValidity(data.uid_validity),
        ))?;
        self.untagged(
            &StatusResponse::ok("Predicted next UID")
                .with_code(RespCode::UidNext(data.uid_next)),
        )?;

        let mut lex = self.lex();
        lex.verbatim("* FLAGS ")?;
        lex.flags(&data.flags)?;
        lex.crlf()?;
        drop(lex);

        self.untagged(
            &StatusResponse::ok("Permanent flags").with_code(
                RespCode::PermanentFlags(data.permanent_flags.clone()),
            ),
        )
    }

    /// Write search results in the extended form if `esearch_tag` is given,
    /// otherwise as a plain `SEARCH` response.
    pub fn search(
        &mut self,
        esearch_tag: Option<&str>,
        ret: &SearchReturn,
        data: &SearchData,
    ) -> io::Result<()> {
        let mut lex = self.lex();
        let tag = match esearch_tag {
            Some(tag) => tag,
            None => {
                lex.verbatim("* SEARCH")?;
                for n in data.all.items() {
                    lex.sp()?;
                    lex.num_u32(n)?;
                }
                return lex.crlf();
            }
        };

        lex.verbatim("* ESEARCH (TAG ")?;
        lex.string(tag)?;
        lex.verbatim(")")?;
        if data.uid {
            lex.verbatim(" UID")?;
        }
        if let (true, Some(min)) = (ret.min, data.min) {
            lex.verbatim(" MIN ")?;
            lex.num_u32(min)?;
        }
        if let (true, Some(max)) = (ret.max, data.max) {
            lex.verbatim(" MAX ")?;
            lex.num_u32(max)?;
        }
        if let (true, Some(count)) = (ret.count, data.count) {
            lex.verbatim(" COUNT ")?;
            lex.num_u32(count)?;
        }
        if ret.all && !data.all.is_empty() {
            lex.verbatim(" ALL ")?;
            lex.verbatim(&data.all.to_string())?;
        }
        lex.crlf()
    }

    pub fn fetch(&mut self, data: &FetchMessageData) -> io::Result<()> {
        let mut lex = self.lex();
        lex.verbatim("* ")?;
        lex.num_u32(data.seq)?;
        lex.verbatim(" FETCH (")?;

        let mut first = true;
        let mut next = |lex: &mut LexWriter<&mut Self>| {
            let was_first = first;
            first = false;
            if was_first {
                Ok(())
            } else {
                lex.sp()
            }
        };

        if let Some(uid) = data.uid {
            next(&mut lex)?;
            lex.verbatim("UID ")?;
            lex.num_u32(uid)?;
        }
        if let Some(ref flags) = data.flags {
            next(&mut lex)?;
            lex.verbatim("FLAGS ")?;
            lex.flags(flags)?;
        }
        if let Some(ref date) = data.internal_date {
            next(&mut lex)?;
            lex.verbatim("INTERNALDATE ")?;
            lex.datetime(date)?;
        }
        if let Some(size) = data.rfc822_size {
            next(&mut lex)?;
            lex.verbatim("RFC822.SIZE ")?;
            lex.num_u32(size)?;
        }
        for &(part, ref content) in &data.sections {
            next(&mut lex)?;
            lex.verbatim("BODY[")?;
            lex.verbatim(part.as_str())?;
            lex.verbatim("] ")?;
            lex.literal(content)?;
        }

        lex.verbatim(")")?;
        lex.crlf()
    }

    pub fn namespace(&mut self, data: &NamespaceData) -> io::Result<()> {
        let mut lex = self.lex();
        lex.verbatim("* NAMESPACE")?;
        for group in &[&data.personal, &data.other, &data.shared] {
            lex.sp()?;
            if group.is_empty() {
                lex.nil()?;
                continue;
            }

            lex.verbatim("(")?;
            for ns in group.iter() {
                lex.verbatim("(")?;
                lex.string(&ns.prefix)?;
                lex.sp()?;
                match ns.delim {
                    None => lex.nil()?,
                    Some(delim) => lex.string(&delim.to_string())?,
                }
                lex.verbatim(")")?;
            }
            lex.verbatim(")")?;
        }
        lex.crlf()
    }
}

impl UpdateSink for Output {
    fn deliver_expunge(&mut self, seq: u32) -> Result<(), Error> {
        writeln!(self, "* {} EXPUNGE\r", seq)?;
        Ok(())
    }

    fn deliver_exists(&mut self, count: u32) -> Result<(), Error> {
        writeln!(self, "* {} EXISTS\r", count)?;
        Ok(())
    }

    fn deliver_mailbox_flags(&mut self, flags: &[Flag]) -> Result<(), Error> {
        let mut lex = self.lex();
        lex.verbatim("* FLAGS ")?;
        lex.flags(flags)?;
        lex.crlf()?;
        Ok(())
    }

    fn deliver_message_flags(
        &mut self,
        seq: u32,
        uid: Uid,
        flags: &[Flag],
    ) -> Result<(), Error> {
        self.fetch(&FetchMessageData {
            seq,
            uid: Some(uid),
            flags: Some(flags.to_vec()),
            ..FetchMessageData::default()
        })?;
        Ok(())
    }
}

impl MoveSink for Output {
    fn deliver_copy_data(&mut self, data: &CopyData) -> Result<(), Error> {
        self.untagged(&StatusResponse::ok("Moved").with_code(
            RespCode::CopyUid(
                data.uid_validity,
                data.source_uids.clone(),
                data.dest_uids.clone(),
            ),
        ))?;
        Ok(())
    }
}

/// An `UpdateSink` for IDLE, which takes the output lock per update and
/// flushes each one immediately.
pub struct FlushingSink<'a>(pub &'a Responder);

impl FlushingSink<'_> {
    fn deliver(
        &mut self,
        f: impl FnOnce(&mut Output) -> Result<(), Error>,
    ) -> Result<(), Error> {
        let mut out = self.0.lock();
        f(&mut out)?;
        out.flush()?;
        Ok(())
    }
}

impl UpdateSink for FlushingSink<'_> {
    fn deliver_expunge(&mut self, seq: u32) -> Result<(), Error> {
        self.deliver(|out| out.deliver_expunge(seq))
    }

    fn deliver_exists(&mut self, count: u32) -> Result<(), Error> {
        self.deliver(|out| out.deliver_exists(count))
    }

    fn deliver_mailbox_flags(&mut self, flags: &[Flag]) -> Result<(), Error> {
        self.deliver(|out| out.deliver_mailbox_flags(flags))
    }

    fn deliver_message_flags(
        &mut self,
        seq: u32,
        uid: Uid,
        flags: &[Flag],
    ) -> Result<(), Error> {
        self.deliver(|out| out.deliver_message_flags(seq, uid, flags))
    }
}

/// An `UpdateSink` which throws everything away, for the implicit expunge
/// of CLOSE.
pub struct DiscardSink;

impl UpdateSink for DiscardSink {
    fn deliver_expunge(&mut self, _: u32) -> Result<(), Error> {
        Ok(())
    }

    fn deliver_exists(&mut self, _: u32) -> Result<(), Error> {
        Ok(())
    }

    fn deliver_mailbox_flags(&mut self, _: &[Flag]) -> Result<(), Error> {
        Ok(())
    }

    fn deliver_message_flags(
        &mut self,
        _: u32,
        _: Uid,
        _: &[Flag],
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Map a session error to the tagged response for the failed command.
pub fn error_response(err: &Error) -> StatusResponse {
    let text = err.to_string();
    match *err {
        Error::UnsafeName => StatusResponse::no(Some(RespCode::Cannot), text),
        Error::NxMailbox => {
            StatusResponse::no(Some(RespCode::Nonexistent), text)
        }
        Error::MailboxExists => {
            StatusResponse::no(Some(RespCode::AlreadyExists), text)
        }
        Error::BadOperationOnInbox | Error::MailboxReadOnly => {
            StatusResponse::no(Some(RespCode::Cannot), text)
        }
        Error::NxFlag => StatusResponse::bad(Some(RespCode::ClientBug), text),
        Error::TooBig => StatusResponse::no(Some(RespCode::TooBig), text),
        Error::AuthFailed => {
            StatusResponse::no(Some(RespCode::AuthenticationFailed), text)
        }
        Error::AuthzForbidden => {
            StatusResponse::no(Some(RespCode::AuthorizationFailed), text)
        }
        Error::UnsupportedMechanism | Error::Unsupported => {
            StatusResponse::no(Some(RespCode::Cannot), text)
        }
        Error::BadSaslResponse => StatusResponse::bad(None, text),
        Error::AlreadyIdling | Error::Io(_) | Error::Ssl(_) => {
            StatusResponse::no(Some(RespCode::ServerBug), text)
        }
    }
}

/// Like `error_response`, but for commands whose target mailbox a client
/// might reasonably create and retry (APPEND, COPY, MOVE).
pub fn dest_error_response(err: &Error) -> StatusResponse {
    match *err {
        Error::NxMailbox => StatusResponse::no(
            Some(RespCode::TryCreate),
            "No such destination mailbox",
        ),
        ref err => error_response(err),
    }
}
