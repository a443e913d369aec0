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

//! The contract between the connection engine and the mail store.
//!
//! The engine owns parsing, state, literals, and response framing. Everything
//! that touches mailboxes goes through a `Session`, one per connection.
//! Sessions that change a selected mailbox are responsible for notifying its
//! `MailboxTracker` themselves.

use bitflags::bitflags;
use crossbeam::channel::Receiver;

use crate::imap::model::*;
use crate::imap::sasl::SaslServer;
use crate::imap::tracker::UpdateSink;
use crate::support::error::Error;
use crate::wire::numset::{NumSet, SeqRange};

bitflags! {
    /// Optional parts of the `Session` contract.
    ///
    /// Fixed when the session is created. The engine only advertises and
    /// dispatches the corresponding commands when the feature is present.
    pub struct SessionFeatures: u32 {
        const NAMESPACE = 1 << 0;
        const MOVE = 1 << 1;
        /// The session supplies its own SASL mechanisms instead of the
        /// engine's PLAIN-over-`login`.
        const SASL = 1 << 2;
        const UNAUTHENTICATE = 1 << 3;
    }
}

/// Receives the results of MOVE.
pub trait MoveSink: UpdateSink {
    /// Report the `COPYUID` data. Called before any expunges are delivered.
    fn deliver_copy_data(&mut self, data: &CopyData) -> Result<(), Error>;
}

/// Receives FETCH results, one message at a time.
pub type FetchSink<'a> =
    dyn FnMut(FetchMessageData) -> Result<(), Error> + 'a;

pub trait Session: Send {
    fn features(&self) -> SessionFeatures;

    /// Whether the connection should start out authenticated.
    fn preauthenticated(&self) -> bool {
        false
    }

    fn login(&mut self, user: &str, password: &str) -> Result<(), Error>;

    /// The SASL mechanisms to advertise. Only consulted with `SASL`.
    fn sasl_mechanisms(&self) -> Vec<String> {
        Vec::new()
    }

    /// Begin a SASL exchange. Only called with `SASL`.
    fn authenticate(
        &mut self,
        _mechanism: &str,
    ) -> Result<Box<dyn SaslServer + '_>, Error> {
        Err(Error::UnsupportedMechanism)
    }

    /// Only called with `UNAUTHENTICATE`.
    fn unauthenticate(&mut self) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Only called with `NAMESPACE`.
    fn namespace(&mut self) -> Result<NamespaceData, Error> {
        Err(Error::Unsupported)
    }

    fn select(
        &mut self,
        mailbox: &str,
        read_only: bool,
    ) -> Result<SelectData, Error>;
    fn unselect(&mut self) -> Result<(), Error>;

    fn create(&mut self, mailbox: &str) -> Result<(), Error>;
    fn delete(&mut self, mailbox: &str) -> Result<(), Error>;
    fn rename(&mut self, from: &str, to: &str) -> Result<(), Error>;
    fn subscribe(&mut self, mailbox: &str) -> Result<(), Error>;
    fn unsubscribe(&mut self, mailbox: &str) -> Result<(), Error>;
    fn list(
        &mut self,
        reference: &str,
        patterns: &[String],
        options: &ListOptions,
    ) -> Result<Vec<ListData>, Error>;
    fn status(
        &mut self,
        mailbox: &str,
        items: &[StatusItem],
    ) -> Result<StatusData, Error>;
    fn append(
        &mut self,
        mailbox: &str,
        options: &AppendOptions,
        data: Vec<u8>,
    ) -> Result<AppendData, Error>;

    /// Remove `\Deleted` messages (limited to `uids` if given), reporting
    /// each removal to `sink` in the order performed.
    fn expunge(
        &mut self,
        uids: Option<&NumSet>,
        sink: &mut dyn UpdateSink,
    ) -> Result<(), Error>;
    /// Returns the matching sequence numbers or UIDs, according to `kind`.
    fn search(
        &mut self,
        kind: NumKind,
        key: &SearchKey,
    ) -> Result<SeqRange, Error>;
    fn fetch(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        options: &FetchOptions,
        sink: &mut FetchSink<'_>,
    ) -> Result<(), Error>;
    /// Change flags. Unless `flags.silent`, the new flags of each message are
    /// passed to `sink`.
    fn store(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        flags: &StoreFlags,
        sink: &mut FetchSink<'_>,
    ) -> Result<(), Error>;
    fn copy(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        dest: &str,
    ) -> Result<CopyData, Error>;
    /// Only called with `MOVE`.
    fn move_messages(
        &mut self,
        _set: &NumSet,
        _kind: NumKind,
        _dest: &str,
        _sink: &mut dyn MoveSink,
    ) -> Result<(), Error> {
        Err(Error::Unsupported)
    }

    /// Deliver pending mailbox updates. Does nothing if no mailbox is
    /// selected.
    fn poll(
        &mut self,
        allow_expunge: bool,
        sink: &mut dyn UpdateSink,
    ) -> Result<(), Error>;

    /// Deliver mailbox updates as they happen until `stop` fires.
    fn idle(
        &mut self,
        sink: &mut dyn UpdateSink,
        stop: &Receiver<()>,
    ) -> Result<(), Error>;
}
