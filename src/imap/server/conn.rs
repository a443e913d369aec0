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

use std::io::{self, BufRead, BufReader, Read};
use std::panic::{self, AssertUnwindSafe};
use std::str;
use std::time::Duration;

use crossbeam::channel;
use log::{error, info, warn};
use openssl::ssl::SslAcceptor;

use super::command::{
    is_valid_tag, parse_command_line, Command, CommandError, CommandLine,
    RequiredState,
};
use super::response::{
    dest_error_response, error_response, DiscardSink, FlushingSink, Responder,
};
use super::session::{Session, SessionFeatures};
use crate::imap::model::*;
use crate::imap::sasl::{PlainServer, SaslServer, SaslStep};
use crate::imap::transport::{self, Transport};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::system_config::ImapConfig;
use crate::support::trace::{TraceRead, Tracer};
use crate::wire::{self, LiteralHeader, LITERAL_MINUS_MAX};

const MAX_CMDLINE: usize = 65536;

type CmdResult = Result<StatusResponse, StatusResponse>;
type Input = BufReader<TraceRead<transport::Reader>>;

/// Everything about a connection that comes from configuration rather than
/// from the session.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// If set, STARTTLS is offered on cleartext connections.
    pub acceptor: Option<SslAcceptor>,
    /// Permit LOGIN and AUTHENTICATE without TLS.
    pub insecure_auth: bool,
    pub literal_plus: bool,
    pub append_limit: u32,
    pub unauthenticated_timeout: Duration,
    pub authenticated_timeout: Duration,
    pub literal_timeout: Duration,
    pub write_timeout: Duration,
    pub literal_write_timeout: Duration,
    /// Copy the raw wire traffic to stderr. Sensitive.
    pub debug_trace: bool,
}

impl ConnectionConfig {
    pub fn new(imap: &ImapConfig) -> Self {
        ConnectionConfig {
            acceptor: None,
            insecure_auth: false,
            literal_plus: imap.literal_plus,
            append_limit: imap.append_limit,
            unauthenticated_timeout: imap.unauthenticated_timeout(),
            authenticated_timeout: imap.authenticated_timeout(),
            literal_timeout: imap.literal_timeout(),
            write_timeout: imap.write_timeout(),
            literal_write_timeout: imap.literal_write_timeout(),
            debug_trace: false,
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig::new(&ImapConfig::default())
    }
}

/// The server side of one IMAP connection.
pub struct Connection {
    session: Box<dyn Session>,
    config: ConnectionConfig,
    transport: Transport,
    read: Input,
    responder: Responder,
    state: ConnState,
    /// Whether the selected mailbox was opened with EXAMINE.
    read_only: bool,
    rev2: bool,
    utf8: bool,
    log_prefix: LogPrefix,
}

impl Connection {
    pub fn new(
        session: Box<dyn Session>,
        transport: Transport,
        config: ConnectionConfig,
        log_prefix: LogPrefix,
    ) -> Self {
        let tracer = if config.debug_trace {
            Some(Tracer::stderr(log_prefix.to_string()))
        } else {
            None
        };

        let read = BufReader::new(TraceRead::new(
            transport.reader(),
            tracer.clone(),
        ));
        let responder = Responder::new(
            transport.clone(),
            tracer,
            config.write_timeout,
            config.literal_write_timeout,
        );

        Connection {
            session,
            config,
            transport,
            read,
            responder,
            state: ConnState::NotAuthenticated,
            read_only: false,
            rev2: false,
            utf8: false,
            log_prefix,
        }
    }

    /// Serve the connection until the client logs out or the connection
    /// fails.
    pub fn run(mut self) -> Result<(), Error> {
        info!("{} Connection established", self.log_prefix);
        let result = self.run_inner();
        self.transport.shutdown();

        match result {
            Ok(()) => info!("{} Connection closed", self.log_prefix),
            Err(ref e) => {
                warn!("{} Connection terminated: {}", self.log_prefix, e)
            }
        }
        result
    }

    fn run_inner(&mut self) -> Result<(), Error> {
        let greeting = if self.session.preauthenticated() {
            self.state = ConnState::Authenticated;
            StatusResponse {
                cond: Cond::Preauth,
                code: None,
                text: "Tidemap ready".to_owned(),
            }
        } else {
            StatusResponse::ok("Tidemap ready")
        }
        .with_code(RespCode::Capability(self.capabilities()));
        self.responder.lock().status(None, &greeting)?;

        while ConnState::Logout != self.state {
            self.update_read_timeout();
            if let Some(line) = self.read_command()? {
                self.handle_line(&line)?;
            }
        }

        Ok(())
    }

    fn update_read_timeout(&self) {
        self.transport.set_read_timeout(Some(
            if ConnState::NotAuthenticated == self.state {
                self.config.unauthenticated_timeout
            } else {
                self.config.authenticated_timeout
            },
        ));
    }

    /// Read one complete command line, with any literals spliced in.
    ///
    /// Returns `None` if the command was rejected while it was being read.
    /// In that case the rest of it has already been discarded.
    fn read_command(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let mut cmdline = Vec::<u8>::new();
        let mut line_bytes = 0;

        loop {
            let nread = match self.buffer_next_line(&mut cmdline)? {
                Some(n) => n,
                None => return Ok(None),
            };

            line_bytes += nread;
            if line_bytes > MAX_CMDLINE {
                self.bye("Command line too long")?;
                return Ok(None);
            }

            let line_start = cmdline.len() - nread;
            let header = match wire::literal_at_eol(&cmdline[line_start..]) {
                Some(header) => header,
                None => return Ok(Some(cmdline)),
            };

            if let Some(rejection) = self.check_literal(&cmdline, &header) {
                let tag = first_word(&cmdline)
                    .filter(|t| is_valid_tag(t))
                    .map(str::to_owned);
                match tag {
                    Some(tag) => {
                        self.responder.lock().status(Some(&tag), &rejection)?
                    }
                    None => {
                        self.bye("Literal rejected")?;
                        return Ok(None);
                    }
                }

                if header.nonsync && header.is_out_of_range() {
                    self.bye("Literal length out of range")?;
                } else {
                    self.discard_command(Some(header))?;
                }
                return Ok(None);
            }

            self.accept_literal(&mut cmdline, &header)?;
        }
    }

    /// Decide whether a literal may be read. Returns the rejection if not.
    fn check_literal(
        &self,
        cmdline: &[u8],
        header: &LiteralHeader,
    ) -> Option<StatusResponse> {
        if header.is_out_of_range() {
            return Some(StatusResponse::bad(
                Some(RespCode::ClientBug),
                "Literal length out of range",
            ));
        }

        if header.nonsync
            && !self.config.literal_plus
            && header.len > LITERAL_MINUS_MAX
        {
            return Some(StatusResponse::bad(
                Some(RespCode::ClientBug),
                "Non-synchronising literal too large for LITERAL-",
            ));
        }

        let is_append = cmdline
            .split(|&b| b' ' == b)
            .nth(1)
            .map_or(false, |verb| verb.eq_ignore_ascii_case(b"APPEND"));
        let limit = if is_append {
            self.config.append_limit
        } else {
            LITERAL_MINUS_MAX
        };

        if header.len > limit {
            Some(StatusResponse::no(
                Some(RespCode::TooBig),
                "Literal too large",
            ))
        } else {
            None
        }
    }

    fn accept_literal(
        &mut self,
        cmdline: &mut Vec<u8>,
        header: &LiteralHeader,
    ) -> Result<(), Error> {
        cmdline.extend_from_slice(b"\r\n");
        if !header.nonsync {
            self.responder.lock().continuation("Ready for literal data")?;
        }

        self.transport
            .set_read_timeout(Some(self.config.literal_timeout));
        let nread = self
            .read
            .by_ref()
            .take(header.len.into())
            .read_to_end(cmdline)?;
        self.update_read_timeout();

        if nread != header.len as usize {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reading literal",
            )));
        }

        Ok(())
    }

    /// Read the next line, appending it to `cmdline` without its line
    /// ending.
    ///
    /// Returns the number of bytes added, or `None` if the line was too
    /// long, in which case BYE has been sent.
    fn buffer_next_line(
        &mut self,
        cmdline: &mut Vec<u8>,
    ) -> Result<Option<usize>, Error> {
        let mut nread = self
            .read
            .by_ref()
            .take(MAX_CMDLINE as u64)
            .read_until(b'\n', cmdline)?;

        if 0 == nread {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "EOF reached before reading full line",
            )));
        }

        if !cmdline.ends_with(b"\n") {
            self.bye("Command line too long")?;
            return Ok(None);
        }

        cmdline.pop();
        nread -= 1;
        if cmdline.ends_with(b"\r") {
            cmdline.pop();
            nread -= 1;
        }

        Ok(Some(nread))
    }

    /// Discard the rest of a command whose response has already been sent.
    ///
    /// `literal` is the literal that was announced at the end of the last
    /// line read, if any.
    fn discard_command(
        &mut self,
        mut literal: Option<LiteralHeader>,
    ) -> Result<(), Error> {
        let mut cmdline = Vec::new();
        while ConnState::Logout != self.state {
            if let Some(header) = literal.take() {
                // A synchronising literal was never sent, since no
                // continuation was issued, which also ends the command.
                if !header.nonsync {
                    break;
                }

                io::copy(
                    &mut self.read.by_ref().take(header.len.into()),
                    &mut io::sink(),
                )?;
            }

            cmdline.clear();
            let nread = match self.buffer_next_line(&mut cmdline)? {
                Some(n) => n,
                None => break,
            };

            literal = wire::literal_at_eol(&cmdline[cmdline.len() - nread..]);
            match literal {
                None => break,
                Some(header) if header.nonsync && header.is_out_of_range() => {
                    return self.bye("Literal length out of range");
                }
                Some(_) => (),
            }
        }

        Ok(())
    }

    fn bye(&mut self, text: &str) -> Result<(), Error> {
        self.state = ConnState::Logout;
        self.responder
            .lock()
            .status(None, &StatusResponse::bye(None, text))?;
        Ok(())
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<(), Error> {
        let CommandLine { tag, command } = match parse_command_line(line) {
            Ok(cl) => cl,
            Err(CommandError::NoTag) => {
                return if ConnState::NotAuthenticated == self.state {
                    self.bye("That doesn't look anything like an IMAP command")
                } else {
                    self.responder.lock().status(
                        None,
                        &StatusResponse::bad(
                            Some(RespCode::ClientBug),
                            "Missing or invalid tag",
                        ),
                    )?;
                    Ok(())
                };
            }
            Err(CommandError::Unknown { tag, verb }) => {
                return if ConnState::NotAuthenticated == self.state {
                    warn!(
                        "{} Unknown command {:?} before authentication",
                        self.log_prefix, verb
                    );
                    self.bye("Unknown command")
                } else {
                    self.responder.lock().status(
                        Some(&tag),
                        &StatusResponse::bad(
                            Some(RespCode::ClientBug),
                            "Unknown command",
                        ),
                    )?;
                    Ok(())
                };
            }
            Err(CommandError::Syntax { tag, error }) => {
                self.responder.lock().status(
                    Some(&tag),
                    &StatusResponse::bad(
                        Some(RespCode::ClientBug),
                        format!("Syntax error: {}", error),
                    ),
                )?;
                return Ok(());
            }
        };

        let name = command.name();
        if let Some(rejection) = self.check_permitted(&command) {
            self.responder.lock().status(Some(&tag), &rejection)?;
            return Ok(());
        }

        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            self.execute(&tag, command)
        }));

        let response = match result {
            Ok(Ok(Some(response))) => response,
            Ok(Ok(None)) => return Ok(()),
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                error!("{} Handler for {} panicked", self.log_prefix, name);
                StatusResponse::no(
                    Some(RespCode::ServerBug),
                    "Internal server error",
                )
            }
        };

        self.responder.lock().status(Some(&tag), &response)?;
        Ok(())
    }

    /// Run a permitted command.
    ///
    /// Returns the tagged response still to be sent, or `None` if the
    /// command already sent its own.
    fn execute(
        &mut self,
        tag: &str,
        command: Command,
    ) -> Result<Option<StatusResponse>, Error> {
        match command {
            Command::Logout => self.cmd_logout(tag)?,
            Command::StartTls => self.cmd_starttls(tag)?,
            Command::Idle => self.cmd_idle(tag)?,
            Command::Authenticate { mechanism, initial } => {
                self.cmd_authenticate(tag, &mechanism, initial)?
            }
            command => {
                let allow_expunge = command.allows_expunge();
                return match self.dispatch(tag, command) {
                    Ok(response) => {
                        self.poll(allow_expunge)?;
                        Ok(Some(response))
                    }
                    Err(response) => Ok(Some(response)),
                };
            }
        }

        Ok(None)
    }

    /// Deliver pending mailbox updates after a successful command.
    ///
    /// Failing to write them is fatal; any other failure is only logged.
    fn poll(&mut self, allow_expunge: bool) -> Result<(), Error> {
        if ConnState::Authenticated != self.state
            && ConnState::Selected != self.state
        {
            return Ok(());
        }

        let mut out = self.responder.lock();
        match self.session.poll(allow_expunge, &mut *out) {
            Ok(()) => Ok(()),
            Err(Error::Io(e)) => Err(Error::Io(e)),
            Err(e) => {
                warn!("{} Poll failed: {}", self.log_prefix, e);
                Ok(())
            }
        }
    }

    /// Check state and optional features. Returns the rejection if the
    /// command may not run now.
    fn check_permitted(&self, command: &Command) -> Option<StatusResponse> {
        let state_ok = match command.required_state() {
            RequiredState::Any => true,
            RequiredState::NotAuthenticated => {
                ConnState::NotAuthenticated == self.state
            }
            RequiredState::Authenticated => {
                ConnState::Authenticated == self.state
                    || ConnState::Selected == self.state
            }
            RequiredState::Selected => ConnState::Selected == self.state,
        };

        if !state_ok {
            return Some(StatusResponse::bad(
                Some(RespCode::ClientBug),
                format!(
                    "{} not allowed in {} state",
                    command.name(),
                    self.state
                ),
            ));
        }

        let feature = match *command {
            Command::Namespace => Some(SessionFeatures::NAMESPACE),
            Command::Move { .. } => Some(SessionFeatures::MOVE),
            Command::Unauthenticate => Some(SessionFeatures::UNAUTHENTICATE),
            _ => None,
        };
        match feature {
            Some(f) if !self.session.features().contains(f) => {
                Some(StatusResponse::bad(
                    Some(RespCode::ClientBug),
                    format!("{} not supported", command.name()),
                ))
            }
            _ => None,
        }
    }

    fn auth_allowed(&self) -> bool {
        self.config.insecure_auth || self.transport.is_tls()
    }

    fn capabilities(&self) -> CapSet {
        let mut caps = CapSet::new();
        caps.insert("IMAP4rev2");
        caps.insert("IMAP4rev1");
        caps.insert("SASL-IR");
        caps.insert(if self.config.literal_plus {
            "LITERAL+"
        } else {
            "LITERAL-"
        });

        let features = self.session.features();
        if ConnState::NotAuthenticated == self.state {
            if self.config.acceptor.is_some() && !self.transport.is_tls() {
                caps.insert("STARTTLS");
            }

            if !self.auth_allowed() {
                caps.insert("LOGINDISABLED");
            } else if features.contains(SessionFeatures::SASL) {
                for mechanism in self.session.sasl_mechanisms() {
                    caps.insert(&format!("AUTH={}", mechanism));
                }
            } else {
                caps.insert("AUTH=PLAIN");
            }
        } else {
            for cap in &[
                "UNSELECT",
                "ENABLE",
                "IDLE",
                "UTF8=ACCEPT",
                "UIDPLUS",
                "ESEARCH",
                "STATUS=SIZE",
            ] {
                caps.insert(cap);
            }
            caps.insert(&format!("APPENDLIMIT={}", self.config.append_limit));

            if features.contains(SessionFeatures::NAMESPACE) {
                caps.insert("NAMESPACE");
            }
            if features.contains(SessionFeatures::MOVE) {
                caps.insert("MOVE");
            }
            if features.contains(SessionFeatures::UNAUTHENTICATE) {
                caps.insert("UNAUTHENTICATE");
            }
        }

        caps
    }

    fn logged_in(&mut self, user: &str) -> StatusResponse {
        info!("{} Login successful as {:?}", self.log_prefix, user);
        self.log_prefix.set_user(user.to_owned());
        self.state = ConnState::Authenticated;
        StatusResponse::ok("Logged in")
            .with_code(RespCode::Capability(self.capabilities()))
    }

    fn dispatch(&mut self, tag: &str, command: Command) -> CmdResult {
        let err = |e: Error| error_response(&e);
        let written = |r: io::Result<()>| r.map_err(|e| err(Error::Io(e)));

        match command {
            Command::Capability => {
                let caps = self.capabilities();
                written(self.responder.lock().capability(&caps))?;
                Ok(StatusResponse::ok("CAPABILITY completed"))
            }

            Command::Noop => Ok(StatusResponse::ok("NOOP completed")),
            Command::Check => Ok(StatusResponse::ok("CHECK completed")),

            Command::Login { user, password } => {
                if !self.auth_allowed() {
                    return Err(StatusResponse::no(
                        Some(RespCode::PrivacyRequired),
                        "LOGIN requires TLS",
                    ));
                }

                match self.session.login(&user, &password) {
                    Ok(()) => Ok(self.logged_in(&user)),
                    Err(e) => {
                        warn!(
                            "{} Login failed for {:?}: {}",
                            self.log_prefix, user, e
                        );
                        Err(err(e))
                    }
                }
            }

            Command::Unauthenticate => {
                self.session.unauthenticate().map_err(err)?;
                self.state = ConnState::NotAuthenticated;
                self.read_only = false;
                self.rev2 = false;
                self.utf8 = false;
                {
                    let mut out = self.responder.lock();
                    out.set_rev2(false);
                    out.set_unicode(false);
                }
                self.log_prefix.clear_user();
                Ok(StatusResponse::ok("UNAUTHENTICATE completed"))
            }

            Command::Enable(caps) => {
                let mut enabled = Vec::new();
                for cap in caps {
                    if cap.eq_ignore_ascii_case("IMAP4rev2") {
                        self.rev2 = true;
                        enabled.push("IMAP4rev2".to_owned());
                    } else if cap.eq_ignore_ascii_case("UTF8=ACCEPT") {
                        self.utf8 = true;
                        enabled.push("UTF8=ACCEPT".to_owned());
                    }
                }

                let mut out = self.responder.lock();
                out.set_rev2(self.rev2);
                out.set_unicode(self.utf8);
                written(out.enabled(&enabled))?;
                Ok(StatusResponse::ok("ENABLE completed"))
            }

            Command::Namespace => {
                let data = self.session.namespace().map_err(err)?;
                written(self.responder.lock().namespace(&data))?;
                Ok(StatusResponse::ok("NAMESPACE completed"))
            }

            Command::Select { mailbox, read_only } => {
                let verb = if read_only { "EXAMINE" } else { "SELECT" };
                if ConnState::Selected == self.state {
                    self.session.unselect().map_err(err)?;
                    self.state = ConnState::Authenticated;
                    written(self.responder.lock().untagged(
                        &StatusResponse::ok("Previous mailbox closed")
                            .with_code(RespCode::Closed),
                    ))?;
                }

                let data = self
                    .session
                    .select(&mailbox, read_only)
                    .map_err(err)?;
                written(self.responder.lock().select_data(&data))?;
                self.state = ConnState::Selected;
                self.read_only = data.read_only;
                Ok(StatusResponse::ok(format!("{} completed", verb))
                    .with_code(if data.read_only {
                        RespCode::ReadOnly
                    } else {
                        RespCode::ReadWrite
                    }))
            }

            Command::Create(mailbox) => {
                self.session.create(&mailbox).map_err(err)?;
                Ok(StatusResponse::ok("CREATE completed"))
            }
            Command::Delete(mailbox) => {
                self.session.delete(&mailbox).map_err(err)?;
                Ok(StatusResponse::ok("DELETE completed"))
            }
            Command::Rename { from, to } => {
                self.session.rename(&from, &to).map_err(err)?;
                Ok(StatusResponse::ok("RENAME completed"))
            }
            Command::Subscribe(mailbox) => {
                self.session.subscribe(&mailbox).map_err(err)?;
                Ok(StatusResponse::ok("SUBSCRIBE completed"))
            }
            Command::Unsubscribe(mailbox) => {
                self.session.unsubscribe(&mailbox).map_err(err)?;
                Ok(StatusResponse::ok("UNSUBSCRIBE completed"))
            }

            Command::List {
                reference,
                patterns,
                options,
                lsub,
            } => {
                let verb = if lsub { "LSUB" } else { "LIST" };
                let results = self
                    .session
                    .list(&reference, &patterns, &options)
                    .map_err(err)?;
                let mut out = self.responder.lock();
                for data in &results {
                    written(out.list(verb, data))?;
                }
                Ok(StatusResponse::ok(format!("{} completed", verb)))
            }

            Command::Status { mailbox, items } => {
                let data = self.session.status(&mailbox, &items).map_err(err)?;
                written(self.responder.lock().status_data(&data))?;
                Ok(StatusResponse::ok("STATUS completed"))
            }

            Command::Append {
                mailbox,
                options,
                data,
            } => {
                let result = self
                    .session
                    .append(&mailbox, &options, data)
                    .map_err(|e| dest_error_response(&e))?;
                Ok(StatusResponse::ok("APPEND completed").with_code(
                    RespCode::AppendUid(result.uid_validity, result.uid),
                ))
            }

            Command::Close => {
                if !self.read_only {
                    if let Err(e) = self.session.expunge(None, &mut DiscardSink)
                    {
                        warn!(
                            "{} Implicit expunge on CLOSE failed: {}",
                            self.log_prefix, e
                        );
                    }
                }
                self.session.unselect().map_err(err)?;
                self.state = ConnState::Authenticated;
                Ok(StatusResponse::ok("CLOSE completed"))
            }

            Command::Unselect => {
                self.session.unselect().map_err(err)?;
                self.state = ConnState::Authenticated;
                Ok(StatusResponse::ok("UNSELECT completed"))
            }

            Command::Expunge { uids } => {
                let mut out = self.responder.lock();
                self.session.expunge(uids.as_ref(), &mut *out).map_err(err)?;
                Ok(StatusResponse::ok("EXPUNGE completed"))
            }

            Command::Search { kind, key, ret } => {
                let all = self.session.search(kind, &key).map_err(err)?;
                let data = SearchData {
                    uid: NumKind::Uid == kind,
                    min: all.min(),
                    max: all.max(),
                    count: Some(all.len() as u32),
                    all,
                };

                let esearch_tag =
                    if ret.is_some() || self.rev2 { Some(tag) } else { None };
                let ret = ret.unwrap_or(SearchReturn {
                    all: true,
                    ..SearchReturn::default()
                });
                written(
                    self.responder.lock().search(esearch_tag, &ret, &data),
                )?;
                Ok(StatusResponse::ok("SEARCH completed"))
            }

            Command::Fetch { kind, set, options } => {
                let session = &mut self.session;
                let mut fetch = |responder: &Responder| {
                    let mut out = responder.lock();
                    session.fetch(
                        &set,
                        kind,
                        &options,
                        &mut |data: FetchMessageData| -> Result<(), Error> {
                            out.fetch(&data)?;
                            Ok(())
                        },
                    )
                };

                let result = if options.sections.is_empty() {
                    fetch(&self.responder)
                } else {
                    self.responder.with_literal_timeout(fetch)
                };
                result.map_err(err)?;
                Ok(StatusResponse::ok("FETCH completed"))
            }

            Command::Store { kind, set, flags } => {
                let mut out = self.responder.lock();
                self.session
                    .store(
                        &set,
                        kind,
                        &flags,
                        &mut |data: FetchMessageData| -> Result<(), Error> {
                            out.fetch(&data)?;
                            Ok(())
                        },
                    )
                    .map_err(err)?;
                Ok(StatusResponse::ok("STORE completed"))
            }

            Command::Copy { kind, set, mailbox } => {
                let data = self
                    .session
                    .copy(&set, kind, &mailbox)
                    .map_err(|e| dest_error_response(&e))?;
                let ok = StatusResponse::ok("COPY completed");
                if data.source_uids.is_empty() {
                    Ok(ok)
                } else {
                    Ok(ok.with_code(RespCode::CopyUid(
                        data.uid_validity,
                        data.source_uids,
                        data.dest_uids,
                    )))
                }
            }

            Command::Move { kind, set, mailbox } => {
                let mut out = self.responder.lock();
                self.session
                    .move_messages(&set, kind, &mailbox, &mut *out)
                    .map_err(|e| dest_error_response(&e))?;
                Ok(StatusResponse::ok("MOVE completed"))
            }

            Command::Logout
            | Command::StartTls
            | Command::Idle
            | Command::Authenticate { .. } => Err(StatusResponse::no(
                Some(RespCode::ServerBug),
                "Command dispatched incorrectly",
            )),
        }
    }

    fn cmd_logout(&mut self, tag: &str) -> Result<(), Error> {
        if ConnState::Selected == self.state {
            if let Err(e) = self.session.unselect() {
                warn!("{} Unselect on LOGOUT failed: {}", self.log_prefix, e);
            }
        }

        self.state = ConnState::Logout;
        let mut out = self.responder.lock();
        out.untagged(&StatusResponse::bye(None, "Logging out"))?;
        out.status(Some(tag), &StatusResponse::ok("LOGOUT completed"))?;
        Ok(())
    }

    fn cmd_starttls(&mut self, tag: &str) -> Result<(), Error> {
        let acceptor = match self.config.acceptor {
            Some(ref acceptor) if !self.transport.is_tls() => acceptor.clone(),
            _ => {
                self.responder.lock().status(
                    Some(tag),
                    &StatusResponse::bad(
                        Some(RespCode::ClientBug),
                        "STARTTLS not available",
                    ),
                )?;
                return Ok(());
            }
        };

        {
            let mut out = self.responder.lock();
            out.status(
                Some(tag),
                &StatusResponse::ok("Begin TLS negotiation now"),
            )?;

            let unread = self.read.buffer().to_vec();
            self.read.consume(unread.len());
            self.transport.start_tls_server(&acceptor, unread)?;
        }

        self.log_prefix.set_tls();
        info!(
            "{} TLS established: {}",
            self.log_prefix,
            self.transport.tls_description().unwrap_or_default()
        );
        Ok(())
    }

    fn cmd_authenticate(
        &mut self,
        tag: &str,
        mechanism: &str,
        initial: Option<Vec<u8>>,
    ) -> Result<(), Error> {
        let response = if !self.auth_allowed() {
            StatusResponse::no(
                Some(RespCode::PrivacyRequired),
                "AUTHENTICATE requires TLS",
            )
        } else {
            let outcome = if self
                .session
                .features()
                .contains(SessionFeatures::SASL)
            {
                match self.session.authenticate(mechanism) {
                    Ok(mut server) => run_sasl(
                        &mut *server,
                        initial,
                        &mut self.read,
                        &self.responder,
                    )?,
                    Err(e) => Err(error_response(&e)),
                }
            } else if "PLAIN" == mechanism {
                let session = &mut self.session;
                let mut server =
                    PlainServer::new(|user: &str, password: &str| {
                        session.login(user, password)
                    });
                run_sasl(&mut server, initial, &mut self.read, &self.responder)?
            } else {
                Err(error_response(&Error::UnsupportedMechanism))
            };

            match outcome {
                Ok(user) => self.logged_in(&user),
                Err(response) => {
                    warn!(
                        "{} AUTHENTICATE {} failed: {}",
                        self.log_prefix, mechanism, response.text
                    );
                    response
                }
            }
        };

        self.responder.lock().status(Some(tag), &response)?;
        Ok(())
    }

    fn cmd_idle(&mut self, tag: &str) -> Result<(), Error> {
        self.responder.lock().continuation("idling")?;
        self.transport
            .set_read_timeout(Some(self.config.authenticated_timeout));

        let Connection {
            ref mut session,
            ref responder,
            ref mut read,
            ref transport,
            ref log_prefix,
            ..
        } = *self;
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);

        let outcome = crossbeam::scope(|scope| {
            let helper = scope.spawn(move |_| {
                let result = panic::catch_unwind(AssertUnwindSafe(|| {
                    session.idle(&mut FlushingSink(responder), &stop_rx)
                }));
                // The connection cannot continue past a failed delivery, so
                // wake the reader instead of waiting for DONE.
                if !matches!(result, Ok(Ok(()))) {
                    transport.shutdown();
                }
                result
            });

            let line = read_line(read);
            drop(stop_tx);
            (line, helper.join())
        });

        let (line, idle) = match outcome {
            Ok(outcome) => outcome,
            Err(_) => {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "IDLE helper thread failed",
                )))
            }
        };

        match idle {
            Ok(Ok(Ok(()))) => (),
            Ok(Ok(Err(e))) => {
                warn!("{} IDLE delivery failed: {}", log_prefix, e);
                return Err(e);
            }
            Ok(Err(_)) | Err(_) => {
                error!("{} IDLE helper panicked", log_prefix);
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::Other,
                    "IDLE helper panicked",
                )));
            }
        }

        let response = if line?.eq_ignore_ascii_case(b"DONE") {
            StatusResponse::ok("IDLE completed")
        } else {
            StatusResponse::bad(Some(RespCode::ClientBug), "Expected DONE")
        };
        self.responder.lock().status(Some(tag), &response)?;
        Ok(())
    }
}

/// Drive a SASL exchange to completion.
///
/// The outer error is fatal to the connection; the inner one is the tagged
/// response for a failed exchange.
fn run_sasl(
    server: &mut dyn SaslServer,
    initial: Option<Vec<u8>>,
    read: &mut Input,
    responder: &Responder,
) -> Result<Result<String, StatusResponse>, Error> {
    let mut response = initial;
    loop {
        let step = match server.step(response.as_deref()) {
            Ok(step) => step,
            Err(e) => return Ok(Err(error_response(&e))),
        };

        let challenge = match step {
            SaslStep::Done(user) => return Ok(Ok(user)),
            SaslStep::Challenge(challenge) => challenge,
        };

        responder.lock().continuation(&base64::encode(&challenge))?;
        let line = read_line(read)?;
        if b"*" == &line[..] {
            return Ok(Err(StatusResponse::bad(None, "AUTHENTICATE cancelled")));
        }

        match base64::decode(&line) {
            Ok(decoded) => response = Some(decoded),
            Err(_) => {
                return Ok(Err(error_response(&Error::BadSaslResponse)));
            }
        }
    }
}

/// Read one line outside of command framing, without its line ending.
fn read_line(read: &mut Input) -> Result<Vec<u8>, Error> {
    let mut line = Vec::new();
    read.by_ref()
        .take(MAX_CMDLINE as u64)
        .read_until(b'\n', &mut line)?;

    if !line.ends_with(b"\n") {
        return Err(Error::Io(io::Error::new(
            if line.is_empty() {
                io::ErrorKind::UnexpectedEof
            } else {
                io::ErrorKind::InvalidData
            },
            "Line too long or truncated",
        )));
    }

    line.pop();
    if line.ends_with(b"\r") {
        line.pop();
    }
    Ok(line)
}

fn first_word(line: &[u8]) -> Option<&str> {
    line.split(|&b| b' ' == b)
        .next()
        .and_then(|w| str::from_utf8(w).ok())
}
