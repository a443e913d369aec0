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

//! The pipelining IMAP client.
//!
//! A `Client` owns one connection and one background reader thread. Issuing
//! a command writes it (waiting for continuation requests only where
//! synchronising literals demand it) and immediately returns a handle; the
//! caller decides when to block on the result. Any number of commands may be
//! in flight at once, from any number of threads.
//!
//! Untagged data is attributed to the first in-flight command that asks for
//! that kind of data. Whatever no command claims is passed to the
//! `UnilateralDataHandler` supplied at construction.
//!
//! Lock order is always writer then state. The reader thread only ever takes
//! the state lock.

mod commands;
mod reader;
pub mod response;

use std::collections::VecDeque;
use std::io::{self, BufReader, BufWriter, Write};
use std::mem;
use std::net::TcpStream;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crossbeam::channel::{self, Receiver, Sender};
use log::{info, warn};
use openssl::ssl::{SslConnector, SslMethod};
use thiserror::Error;

pub(crate) use self::reader::read_logical_line;
pub use self::response::{Data, Response};
use crate::imap::model::*;
use crate::imap::transport::{self, Socket, Transport};
use crate::support::trace::{TraceRead, TraceWrite, Tracer};
use crate::wire::lex::{LexOutput, LexWriter};
use crate::wire::LITERAL_MINUS_MAX;

#[derive(Clone, Debug, Error)]
pub enum Error {
    #[error("Connection closed")]
    Closed,
    #[error("I/O error: {0}")]
    Io(String),
    #[error("TLS error: {0}")]
    Tls(String),
    #[error("Protocol violation: {0}")]
    Protocol(String),
    #[error("Command failed: {0}")]
    No(StatusResponse),
    #[error("Command rejected: {0}")]
    Bad(StatusResponse),
    #[error("Server closed the connection: {0}")]
    Bye(StatusResponse),
    #[error("Server does not support {0}")]
    MissingCapability(&'static str),
    #[error("Unexpected response from server")]
    UnexpectedResponse,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if io::ErrorKind::UnexpectedEof == e.kind() {
            Error::Closed
        } else {
            Error::Io(e.to_string())
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(e: openssl::error::ErrorStack) -> Self {
        Error::Tls(e.to_string())
    }
}

/// Receives server data that no in-flight command asked for.
///
/// Called on the reader thread; implementations must not issue commands on
/// the same client and wait for them.
pub trait UnilateralDataHandler: Send {
    fn expunge(&mut self, _seq: u32) {}
    fn mailbox_update(&mut self, _update: MailboxUpdate) {}
    fn fetch(&mut self, _data: FetchMessageData) {}
    fn status(&mut self, _data: StatusData) {}
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxUpdate {
    Exists(u32),
    Flags(Vec<Flag>),
}

/// A handler which discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct IgnoreUnilateral;
impl UnilateralDataHandler for IgnoreUnilateral {}

/// What kind of untagged data a command collects, and what state changes
/// its success implies.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum CommandKind {
    Plain,
    Capability,
    Login,
    Logout,
    StartTls,
    Unauthenticate,
    Enable,
    Namespace,
    Select,
    List,
    Status,
    Append,
    Idle,
    Close,
    Search,
    Fetch,
    Store,
    Expunge,
    Copy,
    Move,
}

impl CommandKind {
    /// Whether a command of this kind collects `response`.
    fn owns(self, response: &Response) -> bool {
        use self::CommandKind as K;

        match *response {
            Response::Data(Data::Fetch(_)) => {
                K::Fetch == self || K::Store == self
            }
            Response::Data(Data::Expunge(_)) => {
                K::Expunge == self || K::Move == self
            }
            Response::Data(Data::List { .. }) => K::List == self,
            Response::Data(Data::MailboxStatus(_)) => K::Status == self,
            Response::Data(Data::Search(_))
            | Response::Data(Data::ESearch { .. }) => K::Search == self,
            Response::Data(Data::Capability(_)) => K::Capability == self,
            Response::Data(Data::Enabled(_)) => K::Enable == self,
            Response::Data(Data::Namespace(_)) => K::Namespace == self,
            Response::Data(Data::Exists(_))
            | Response::Data(Data::Recent(_))
            | Response::Data(Data::Flags(_)) => K::Select == self,
            Response::Status {
                status:
                    StatusResponse {
                        code:
                            Some(RespCode::UidValidity(_))
                            | Some(RespCode::UidNext(_))
                            | Some(RespCode::PermanentFlags(_)),
                        ..
                    },
                ..
            } => K::Select == self,
            Response::Status {
                status:
                    StatusResponse {
                        code: Some(RespCode::CopyUid(..)),
                        ..
                    },
                ..
            } => K::Move == self,
            _ => false,
        }
    }
}

/// The successful result of a command: the tagged `OK` and whatever
/// untagged responses it collected, in arrival order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Completion {
    pub status: StatusResponse,
    pub data: Vec<Response>,
}

type Done = Result<(StatusResponse, Vec<Response>), Error>;
type ContinuationResult = Result<String, Error>;

/// An in-flight command without any interpretation of its result.
#[derive(Debug)]
pub struct CommandHandle {
    tag: String,
    done: Receiver<Done>,
}

impl CommandHandle {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Block until the command completes.
    ///
    /// `NO` and `BAD` become `Error::No` and `Error::Bad`.
    pub fn wait(self) -> Result<Completion, Error> {
        interpret_done(self.done.recv())
    }
}

fn interpret_done(
    done: Result<Done, channel::RecvError>,
) -> Result<Completion, Error> {
    let (status, data) = done.map_err(|_| Error::Closed)??;
    match status.cond {
        Cond::Ok => Ok(Completion { status, data }),
        Cond::No => Err(Error::No(status)),
        _ => Err(Error::Bad(status)),
    }
}

/// An in-flight command whose result is interpreted as a `T`.
pub struct Pending<T> {
    handle: CommandHandle,
    finish: Box<dyn FnOnce(Completion) -> Result<T, Error> + Send>,
}

impl<T> Pending<T> {
    fn new(
        handle: CommandHandle,
        finish: impl FnOnce(Completion) -> Result<T, Error> + Send + 'static,
    ) -> Self {
        Pending {
            handle,
            finish: Box::new(finish),
        }
    }

    pub fn tag(&self) -> &str {
        self.handle.tag()
    }

    pub fn wait(self) -> Result<T, Error> {
        (self.finish)(self.handle.wait()?)
    }
}

struct PendingCommand {
    tag: String,
    kind: CommandKind,
    data: Vec<Response>,
    done: Sender<Done>,
}

struct ContinuationWaiter {
    tag: String,
    tx: Sender<ContinuationResult>,
}

struct State {
    conn_state: ConnState,
    caps: CapSet,
    enabled: CapSet,
    pending: Vec<PendingCommand>,
    continuations: VecDeque<ContinuationWaiter>,
    /// Set once the connection is dead; every later command fails with it.
    closed: Option<Error>,
    /// The last untagged BYE, reported as the reason if the connection then
    /// closes.
    bye: Option<StatusResponse>,
    /// Handed to the reader by STARTTLS so it can shake hands as soon as the
    /// `OK` arrives.
    starttls: Option<(SslConnector, String)>,
}

impl State {
    fn fail_continuations(&mut self, tag: &str) {
        let (fail, keep): (VecDeque<_>, VecDeque<_>) =
            mem::take(&mut self.continuations)
                .into_iter()
                .partition(|w| w.tag == tag);
        self.continuations = keep;
        for waiter in fail {
            let _ = waiter.tx.send(Err(Error::UnexpectedResponse));
        }
    }
}

struct WriterState {
    out: BufWriter<TraceWrite<transport::Writer>>,
    next_tag: u32,
}

struct Inner {
    transport: Transport,
    writer: Mutex<WriterState>,
    state: Mutex<State>,
}

impl Inner {
    fn writer(&self) -> MutexGuard<'_, WriterState> {
        self.writer.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail everything in flight with `error` and shut the transport down.
    ///
    /// Only the first call has any effect on pending commands.
    fn close(&self, error: Error) {
        let mut state = self.state();
        let error = match (error, state.bye.take()) {
            (Error::Closed, Some(bye)) | (Error::Io(_), Some(bye)) => {
                Error::Bye(bye)
            }
            (e, _) => e,
        };

        if state.closed.is_none() {
            state.closed = Some(error.clone());
        }
        state.conn_state = ConnState::Logout;
        for cmd in state.pending.drain(..) {
            let _ = cmd.done.send(Err(error.clone()));
        }
        for waiter in state.continuations.drain(..) {
            let _ = waiter.tx.send(Err(error.clone()));
        }
        drop(state);

        self.transport.shutdown();
    }

    fn register_continuation(
        &self,
        tag: &str,
    ) -> Result<Receiver<ContinuationResult>, Error> {
        let mut state = self.state();
        if let Some(ref e) = state.closed {
            return Err(e.clone());
        }

        let (tx, rx) = channel::bounded(1);
        state.continuations.push_back(ContinuationWaiter {
            tag: tag.to_owned(),
            tx,
        });
        Ok(rx)
    }

    /// Write one complete command while holding the writer lock.
    ///
    /// If `expect_continuation`, a continuation waiter is registered for the
    /// command before any of it is sent, and returned alongside the handle.
    ///
    /// If a synchronising literal is refused, the rest of the command is
    /// not sent and the handle reports the server's answer.
    fn issue_locked(
        &self,
        w: &mut WriterState,
        kind: CommandKind,
        expect_continuation: bool,
        build: impl FnOnce(&mut LexWriter<CommandBuffer>) -> io::Result<()>,
    ) -> Result<(CommandHandle, Option<Receiver<ContinuationResult>>), Error>
    {
        let (unicode, nonsync_max) = {
            let state = self.state();
            if let Some(ref e) = state.closed {
                return Err(e.clone());
            }

            let unicode = state.enabled.has("UTF8=ACCEPT")
                || state.enabled.has("IMAP4rev2");
            let nonsync_max = if state.caps.has("LITERAL+") {
                usize::MAX
            } else if state.caps.has("LITERAL-") {
                LITERAL_MINUS_MAX as usize
            } else {
                0
            };
            (unicode, nonsync_max)
        };

        let tag = format!("T{}", w.next_tag);
        w.next_tag += 1;

        let mut lex = LexWriter::new(CommandBuffer::default(), unicode)
            .with_nonsync_max(nonsync_max);
        lex.verbatim(&tag)?;
        lex.sp()?;
        build(&mut lex)?;
        lex.crlf()?;
        let parts = lex.into_inner().finish();

        let (done_tx, done_rx) = channel::bounded(1);
        let continuation = {
            let mut state = self.state();
            if let Some(ref e) = state.closed {
                return Err(e.clone());
            }
            state.pending.push(PendingCommand {
                tag: tag.clone(),
                kind,
                data: Vec::new(),
                done: done_tx,
            });

            if expect_continuation {
                let (tx, rx) = channel::bounded(1);
                state.continuations.push_back(ContinuationWaiter {
                    tag: tag.clone(),
                    tx,
                });
                Some(rx)
            } else {
                None
            }
        };

        let handle = CommandHandle { tag, done: done_rx };
        if let Err(e) = self.send_parts(w, &handle.tag, parts) {
            // Nothing sensible can follow a partially written command
            self.transport.shutdown();
            return Err(e);
        }

        Ok((handle, continuation))
    }

    fn send_parts(
        &self,
        w: &mut WriterState,
        tag: &str,
        parts: Vec<CommandPart>,
    ) -> Result<(), Error> {
        for part in parts {
            match part {
                CommandPart::Text(text) => w.out.write_all(&text)?,
                CommandPart::SyncLiteral(data) => {
                    let go_ahead = self.register_continuation(tag)?;
                    w.out.flush()?;
                    match go_ahead.recv() {
                        Ok(Ok(_)) => w.out.write_all(&data)?,
                        // The command was rejected before the literal
                        _ => return Ok(()),
                    }
                }
            }
        }

        w.out.flush()?;
        Ok(())
    }
}

enum CommandPart {
    Text(Vec<u8>),
    SyncLiteral(Vec<u8>),
}

/// Collects a command, splitting it wherever the server must be heard from
/// before sending more.
#[derive(Default)]
pub struct CommandBuffer {
    parts: Vec<CommandPart>,
    current: Vec<u8>,
}

impl CommandBuffer {
    fn finish(mut self) -> Vec<CommandPart> {
        if !self.current.is_empty() {
            self.parts.push(CommandPart::Text(self.current));
        }
        self.parts
    }
}

impl Write for CommandBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.current.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl LexOutput for CommandBuffer {
    fn literal_data(
        &mut self,
        data: &[u8],
        synchronising: bool,
    ) -> io::Result<()> {
        if synchronising {
            self.parts
                .push(CommandPart::Text(mem::take(&mut self.current)));
            self.parts.push(CommandPart::SyncLiteral(data.to_vec()));
        } else {
            self.current.extend_from_slice(data);
        }
        Ok(())
    }
}

/// Construction parameters beyond the socket itself.
pub struct ClientOptions {
    pub handler: Box<dyn UnilateralDataHandler>,
    /// Mirror the raw wire to this tracer. The trace includes credentials.
    pub trace: Option<Tracer>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        ClientOptions {
            handler: Box::new(IgnoreUnilateral),
            trace: None,
        }
    }
}

pub struct Client {
    inner: Arc<Inner>,
    reader: Option<thread::JoinHandle<()>>,
}

impl Client {
    /// Start a client on an already-connected socket.
    ///
    /// Blocks until the greeting has been read.
    pub fn new(
        socket: Box<dyn Socket>,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        Client::start(Transport::new(socket)?, None, options)
    }

    fn start(
        transport: Transport,
        tls: Option<(&SslConnector, &str)>,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        if let Some((connector, domain)) = tls {
            if let Err(e) =
                transport.start_tls_client(connector, domain, Vec::new())
            {
                transport.shutdown();
                return Err(Error::Tls(e.to_string()));
            }
        }

        let mut read = BufReader::new(TraceRead::new(
            transport.reader(),
            options.trace.clone(),
        ));
        let out =
            BufWriter::new(TraceWrite::new(transport.writer(), options.trace));

        let mut line = Vec::new();
        if let Err(e) = reader::read_logical_line(&mut read, &mut line) {
            transport.shutdown();
            return Err(e);
        }
        let greeting = match response::parse_response(&line) {
            Ok(Response::Status { tag: None, status }) => status,
            _ => {
                transport.shutdown();
                return Err(Error::Protocol("Bad greeting".to_owned()));
            }
        };

        let conn_state = match greeting.cond {
            Cond::Ok => ConnState::NotAuthenticated,
            Cond::Preauth => ConnState::Authenticated,
            _ => {
                transport.shutdown();
                return Err(Error::Bye(greeting));
            }
        };
        let caps = match greeting.code {
            Some(RespCode::Capability(ref caps)) => caps.clone(),
            _ => CapSet::new(),
        };

        let inner = Arc::new(Inner {
            transport,
            writer: Mutex::new(WriterState { out, next_tag: 1 }),
            state: Mutex::new(State {
                conn_state,
                caps,
                enabled: CapSet::new(),
                pending: Vec::new(),
                continuations: VecDeque::new(),
                closed: None,
                bye: None,
                starttls: None,
            }),
        });

        let reader = {
            let inner = Arc::clone(&inner);
            let handler = options.handler;
            thread::Builder::new()
                .name("imap-client-reader".to_owned())
                .spawn(move || reader::run(inner, read, handler))?
        };

        Ok(Client {
            inner,
            reader: Some(reader),
        })
    }

    /// Connect over plain TCP.
    pub fn connect_insecure(
        addr: &str,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        let sock = TcpStream::connect(addr)?;
        sock.set_nodelay(true)?;
        Client::new(Box::new(sock), options)
    }

    /// Connect with TLS from the first byte.
    pub fn connect_tls(
        addr: &str,
        domain: &str,
        connector: &SslConnector,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        let sock = TcpStream::connect(addr)?;
        sock.set_nodelay(true)?;
        Client::start(
            Transport::new(Box::new(sock))?,
            Some((connector, domain)),
            options,
        )
    }

    /// Connect over plain TCP and immediately upgrade with STARTTLS.
    ///
    /// Capabilities are refreshed after the handshake.
    pub fn connect_starttls(
        addr: &str,
        domain: &str,
        connector: SslConnector,
        options: ClientOptions,
    ) -> Result<Self, Error> {
        let client = Client::connect_insecure(addr, options)?;
        client.starttls(connector, domain)?;
        client.capability()?.wait()?;
        Ok(client)
    }

    /// The default connector, verifying the server against the system trust
    /// store.
    pub fn default_connector() -> Result<SslConnector, Error> {
        Ok(SslConnector::builder(SslMethod::tls_client())?.build())
    }

    pub fn conn_state(&self) -> ConnState {
        self.inner.state().conn_state
    }

    /// The most recently seen capabilities.
    pub fn capabilities(&self) -> CapSet {
        self.inner.state().caps.clone()
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.inner.state().caps.has(cap)
    }

    /// Extensions the server has confirmed with `ENABLED`.
    pub fn enabled(&self) -> CapSet {
        self.inner.state().enabled.clone()
    }

    /// The error the connection died with, if it is dead.
    pub fn closed(&self) -> Option<Error> {
        self.inner.state().closed.clone()
    }

    pub fn tls_description(&self) -> Option<String> {
        self.inner.transport.tls_description()
    }

    fn require(&self, cap: &'static str) -> Result<(), Error> {
        if self.has_capability(cap) {
            Ok(())
        } else {
            Err(Error::MissingCapability(cap))
        }
    }

    /// Issue an arbitrary command, given everything after the tag.
    pub fn issue(
        &self,
        build: impl FnOnce(&mut LexWriter<CommandBuffer>) -> io::Result<()>,
    ) -> Result<CommandHandle, Error> {
        self.issue_kind(CommandKind::Plain, build)
    }

    fn issue_kind(
        &self,
        kind: CommandKind,
        build: impl FnOnce(&mut LexWriter<CommandBuffer>) -> io::Result<()>,
    ) -> Result<CommandHandle, Error> {
        let mut w = self.inner.writer();
        self.inner
            .issue_locked(&mut w, kind, false, build)
            .map(|(handle, _)| handle)
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.transport.shutdown();
        if let Some(reader) = self.reader.take() {
            if reader.join().is_err() {
                warn!("IMAP client reader thread panicked");
            }
        }
        info!("IMAP client connection closed");
    }
}
