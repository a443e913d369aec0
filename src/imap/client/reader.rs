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

//! The client's reader thread.

use std::io::{BufRead, BufReader};
use std::sync::Arc;

use log::{debug, info, warn};
use openssl::ssl::SslConnector;

use super::response::{parse_response, Data, Response};
use super::{
    CommandKind, Error, Inner, MailboxUpdate, State, UnilateralDataHandler,
};
use crate::imap::model::*;
use crate::imap::transport;
use crate::support::trace::TraceRead;
use crate::wire::literal_at_eol;

pub(super) type Input = BufReader<TraceRead<transport::Reader>>;

/// Responses (including their literals) larger than this are treated as a
/// protocol violation.
const MAX_RESPONSE: usize = 256 * 1024 * 1024;

pub(super) fn run(
    inner: Arc<Inner>,
    mut read: Input,
    mut handler: Box<dyn UnilateralDataHandler>,
) {
    let error = match read_loop(&inner, &mut read, &mut *handler) {
        Ok(()) => Error::Closed,
        Err(e) => e,
    };

    match error {
        Error::Closed => info!("IMAP client: server closed the connection"),
        ref e => warn!("IMAP client: connection failed: {}", e),
    }
    inner.close(error);
}

fn read_loop(
    inner: &Inner,
    read: &mut Input,
    handler: &mut dyn UnilateralDataHandler,
) -> Result<(), Error> {
    let mut line = Vec::new();
    loop {
        read_logical_line(read, &mut line)?;
        let response = parse_response(&line).map_err(|e| {
            Error::Protocol(format!("Unparsable response: {}", e))
        })?;

        match response {
            Response::Continuation(text) => {
                let waiter =
                    inner.state().continuations.pop_front().ok_or_else(|| {
                        Error::Protocol(
                            "Unexpected continuation request".to_owned(),
                        )
                    })?;
                let _ = waiter.tx.send(Ok(text));
            }

            Response::Status {
                tag: Some(tag),
                status,
            } => complete(inner, read, tag, status)?,

            response => dispatch_untagged(inner, handler, response),
        }
    }
}

/// Read one response into `dst`, following any literals it contains.
///
/// The final CRLF is stripped. Literals stay inline in their
/// `{n}\r\n<data>` form.
pub(crate) fn read_logical_line(
    read: &mut impl BufRead,
    dst: &mut Vec<u8>,
) -> Result<(), Error> {
    dst.clear();
    loop {
        let start = dst.len();
        read.read_until(b'\n', dst)?;
        if !dst.ends_with(b"\n") {
            return Err(Error::Closed);
        }

        dst.pop();
        if dst.ends_with(b"\r") {
            dst.pop();
        }

        let literal = match literal_at_eol(&dst[start..]) {
            None => return Ok(()),
            Some(literal) => literal,
        };

        let len = literal.len as usize;
        if dst.len() + len > MAX_RESPONSE {
            return Err(Error::Protocol("Response too long".to_owned()));
        }

        dst.extend_from_slice(b"\r\n");
        let data_start = dst.len();
        dst.resize(data_start + len, 0);
        read.read_exact(&mut dst[data_start..])?;
    }
}

fn complete(
    inner: &Inner,
    read: &mut Input,
    tag: String,
    status: StatusResponse,
) -> Result<(), Error> {
    let mut state = inner.state();
    let ix = state
        .pending
        .iter()
        .position(|cmd| cmd.tag == tag)
        .ok_or_else(|| {
            Error::Protocol(format!("Response to unknown tag {}", tag))
        })?;
    let cmd = state.pending.remove(ix);
    state.fail_continuations(&tag);

    let ok = Cond::Ok == status.cond;
    match cmd.kind {
        CommandKind::Login if ok => {
            state.conn_state = ConnState::Authenticated;
            state.caps = CapSet::new();
        }
        CommandKind::Unauthenticate if ok => {
            state.conn_state = ConnState::NotAuthenticated;
            state.caps = CapSet::new();
            state.enabled = CapSet::new();
        }
        CommandKind::Select if ok => state.conn_state = ConnState::Selected,
        // A failed SELECT still closes the previous mailbox
        CommandKind::Select if ConnState::Selected == state.conn_state => {
            state.conn_state = ConnState::Authenticated
        }
        CommandKind::Close if ok => {
            state.conn_state = ConnState::Authenticated
        }
        CommandKind::Logout if ok => state.conn_state = ConnState::Logout,
        _ => (),
    }

    if let Some(RespCode::Capability(ref caps)) = status.code {
        state.caps = caps.clone();
    }

    if CommandKind::StartTls == cmd.kind && ok {
        state.caps = CapSet::new();
        let tls = state.starttls.take();
        drop(state);

        if let Err(e) = start_tls(inner, read, tls) {
            let _ = cmd.done.send(Err(e.clone()));
            return Err(e);
        }
    } else {
        drop(state);
    }

    let _ = cmd.done.send(Ok((status, cmd.data)));
    Ok(())
}

fn start_tls(
    inner: &Inner,
    read: &mut Input,
    tls: Option<(SslConnector, String)>,
) -> Result<(), Error> {
    let (connector, domain) = tls.ok_or_else(|| {
        Error::Protocol("Unrequested STARTTLS completion".to_owned())
    })?;

    let buffered = read.buffer().to_vec();
    read.consume(buffered.len());
    inner
        .transport
        .start_tls_client(&connector, &domain, buffered)
        .map_err(|e| Error::Tls(e.to_string()))?;

    info!(
        "IMAP client: TLS established: {}",
        inner.transport.tls_description().unwrap_or_default()
    );
    Ok(())
}

fn dispatch_untagged(
    inner: &Inner,
    handler: &mut dyn UnilateralDataHandler,
    response: Response,
) {
    let unclaimed = {
        let mut state = inner.state();
        note_untagged(&mut state, &response);
        let owner = match response {
            // ESEARCH names the command it answers
            Response::Data(Data::ESearch {
                tag: Some(ref tag), ..
            }) => state.pending.iter_mut().find(|cmd| cmd.tag == *tag),
            _ => state
                .pending
                .iter_mut()
                .find(|cmd| cmd.kind.owns(&response)),
        };
        match owner {
            Some(cmd) => {
                cmd.data.push(response);
                None
            }
            None => Some(response),
        }
    };

    if let Some(response) = unclaimed {
        deliver_unilateral(handler, response);
    }
}

/// Update connection state from untagged responses, whether or not a
/// command also claims them.
fn note_untagged(state: &mut State, response: &Response) {
    match *response {
        Response::Data(Data::Capability(ref caps)) => {
            state.caps = caps.clone()
        }
        Response::Data(Data::Enabled(ref extensions)) => {
            for ext in extensions {
                state.enabled.insert(ext);
            }
        }
        Response::Status { ref status, .. } => {
            if let Some(RespCode::Capability(ref caps)) = status.code {
                state.caps = caps.clone();
            }

            if Cond::Bye == status.cond {
                state.bye = Some(status.clone());
            } else if Some(RespCode::Alert) == status.code {
                warn!("IMAP server alert: {}", status.text);
            }
        }
        _ => (),
    }
}

fn deliver_unilateral(
    handler: &mut dyn UnilateralDataHandler,
    response: Response,
) {
    match response {
        Response::Data(Data::Expunge(seq)) => handler.expunge(seq),
        Response::Data(Data::Exists(n)) => {
            handler.mailbox_update(MailboxUpdate::Exists(n))
        }
        Response::Data(Data::Flags(flags)) => {
            handler.mailbox_update(MailboxUpdate::Flags(flags))
        }
        Response::Data(Data::Fetch(data)) => handler.fetch(data),
        Response::Data(Data::MailboxStatus(data)) => handler.status(data),
        other => debug!("IMAP client: unsolicited {:?}", other),
    }
}
