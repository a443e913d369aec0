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

//! Sequence number tracking across concurrent sessions.
//!
//! Every selected mailbox has one `MailboxTracker` which knows the canonical
//! number of messages and a registry of attached `SessionTracker`s. Whenever
//! a session changes the mailbox, it broadcasts an `Update` to every *other*
//! session's queue while still holding the store's lock on the mailbox.
//!
//! A session's client only learns about those updates when the session
//! polls. Until then, the client's idea of which message has which sequence
//! number lags behind the canonical state. `decode` and `encode` translate
//! between the two by replaying the pending queue.
//!
//! Lock order is: store mailbox, then `MailboxTracker`, then the individual
//! observer queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam::channel::{self, Receiver, Sender};
use log::warn;

use crate::imap::model::{Flag, Uid};
use crate::support::error::Error;

/// Receives updates as a session's client should see them.
pub trait UpdateSink {
    /// `* seq EXPUNGE`
    fn deliver_expunge(&mut self, seq: u32) -> Result<(), Error>;
    /// `* count EXISTS`
    fn deliver_exists(&mut self, count: u32) -> Result<(), Error>;
    /// `* FLAGS (...)`
    fn deliver_mailbox_flags(&mut self, flags: &[Flag]) -> Result<(), Error>;
    /// `* seq FETCH (UID uid FLAGS (...))`
    fn deliver_message_flags(
        &mut self,
        seq: u32,
        uid: Uid,
        flags: &[Flag],
    ) -> Result<(), Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Update {
    Expunge(u32),
    NumMessages(u32),
    MailboxFlags(Vec<Flag>),
    MessageFlags { seq: u32, uid: Uid, flags: Vec<Flag> },
}

#[derive(Clone, Debug)]
struct Queued {
    update: Update,
    /// The canonical message count before this update was applied.
    prior_count: u32,
}

#[derive(Debug, Default)]
struct ObserverState {
    pending: VecDeque<Queued>,
    view_count: u32,
    wakeup: Option<Sender<()>>,
}

#[derive(Debug, Default)]
struct ObserverQueue {
    state: Mutex<ObserverState>,
}

impl ObserverQueue {
    fn lock(&self) -> MutexGuard<'_, ObserverState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, queued: Queued) {
        let mut state = self.lock();
        state.pending.push_back(queued);
        if let Some(ref wakeup) = state.wakeup {
            // A full channel already guarantees the idler will poll again.
            let _ = wakeup.try_send(());
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    num_messages: u32,
    next_id: u64,
    observers: HashMap<u64, Arc<ObserverQueue>>,
}

/// The canonical side of sequence number tracking for one mailbox.
#[derive(Debug)]
pub struct MailboxTracker {
    state: Mutex<TrackerState>,
}

impl MailboxTracker {
    pub fn new(num_messages: u32) -> Self {
        MailboxTracker {
            state: Mutex::new(TrackerState {
                num_messages,
                next_id: 0,
                observers: HashMap::new(),
            }),
        }
    }

    /// Lock the canonical state.
    ///
    /// Every update checks its preconditions before changing anything, so
    /// a panic under the lock leaves the state consistent and poisoning is
    /// ignored.
    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new observer whose client believes the mailbox has the
    /// current canonical number of messages.
    pub fn attach(self: &Arc<Self>) -> SessionTracker {
        let queue = Arc::new(ObserverQueue::default());
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        queue.lock().view_count = state.num_messages;
        state.observers.insert(id, Arc::clone(&queue));

        SessionTracker {
            id,
            tracker: Arc::clone(self),
            queue,
        }
    }

    pub fn num_messages(&self) -> u32 {
        self.lock().num_messages
    }

    pub fn num_observers(&self) -> usize {
        self.lock().observers.len()
    }

    /// Broadcast the removal of the message currently at `seq`.
    ///
    /// Panics if `seq` is 0 or beyond the canonical message count; either
    /// means the store has lost track of its own contents.
    pub fn notify_expunge(&self, seq: u32, source: Option<&SessionTracker>) {
        assert!(0 != seq, "expunge of sequence number 0");
        let mut state = self.lock();
        assert!(
            seq <= state.num_messages,
            "expunge of {} beyond message count {}",
            seq,
            state.num_messages
        );

        self.broadcast(&state, Update::Expunge(seq), source);
        state.num_messages -= 1;

        if let Some(source) = source {
            let mut src = source.queue.lock();
            src.view_count = src.view_count.saturating_sub(1);
        }
    }

    /// Broadcast that the mailbox now has `count` messages.
    ///
    /// Panics if this would shrink the mailbox.
    pub fn notify_grow(&self, count: u32, source: Option<&SessionTracker>) {
        let mut state = self.lock();
        assert!(
            count >= state.num_messages,
            "cannot shrink mailbox from {} to {}",
            state.num_messages,
            count
        );

        self.broadcast(&state, Update::NumMessages(count), source);
        state.num_messages = count;

        if let Some(source) = source {
            source.queue.lock().view_count = count;
        }
    }

    pub fn notify_mailbox_flags(
        &self,
        flags: Vec<Flag>,
        source: Option<&SessionTracker>,
    ) {
        let state = self.lock();
        self.broadcast(&state, Update::MailboxFlags(flags), source);
    }

    /// Broadcast new flags for the message at `seq`, except to `exclude`
    /// (normally the session that made the change and reports it itself).
    pub fn notify_flags(
        &self,
        seq: u32,
        uid: Uid,
        flags: Vec<Flag>,
        exclude: Option<&SessionTracker>,
    ) {
        let state = self.lock();
        self.broadcast(
            &state,
            Update::MessageFlags { seq, uid, flags },
            exclude,
        );
    }

    fn broadcast(
        &self,
        state: &TrackerState,
        update: Update,
        source: Option<&SessionTracker>,
    ) {
        let source_id = source.map(|s| {
            debug_assert!(
                std::ptr::eq(self, &*s.tracker),
                "source observer belongs to a different mailbox"
            );
            s.id
        });

        for (&id, observer) in &state.observers {
            if Some(id) == source_id {
                continue;
            }

            observer.push(Queued {
                update: update.clone(),
                prior_count: state.num_messages,
            });
        }
    }
}

/// One session's view of a `MailboxTracker`.
///
/// Detaches from the mailbox when dropped.
#[derive(Debug)]
pub struct SessionTracker {
    id: u64,
    tracker: Arc<MailboxTracker>,
    queue: Arc<ObserverQueue>,
}

impl Drop for SessionTracker {
    fn drop(&mut self) {
        self.tracker.lock().observers.remove(&self.id);
    }
}

impl SessionTracker {
    pub fn mailbox(&self) -> &Arc<MailboxTracker> {
        &self.tracker
    }

    /// The number of messages the client has been told about.
    ///
    /// This is what `*` means in a sequence set.
    pub fn view_count(&self) -> u32 {
        self.queue.lock().view_count
    }

    /// Translate a sequence number as the client knows it into the canonical
    /// sequence number.
    ///
    /// Returns 0 if the message no longer exists.
    pub fn decode(&self, seq: u32) -> u32 {
        if 0 == seq {
            return 0;
        }

        let tracker = self.tracker.lock();
        let queue = self.queue.lock();

        let mut seq = seq;
        for queued in &queue.pending {
            if let Update::Expunge(expunged) = queued.update {
                if expunged == seq {
                    return 0;
                } else if expunged < seq {
                    seq -= 1;
                }
            }
        }

        if seq > tracker.num_messages {
            0
        } else {
            seq
        }
    }

    /// Translate a canonical sequence number into the one the client knows.
    ///
    /// Returns 0 if the client has not yet been told about the message.
    pub fn encode(&self, seq: u32) -> u32 {
        if 0 == seq {
            return 0;
        }

        let tracker = self.tracker.lock();
        if seq > tracker.num_messages {
            return 0;
        }

        let queue = self.queue.lock();
        let mut seq = seq;
        for queued in queue.pending.iter().rev() {
            match queued.update {
                Update::NumMessages(count)
                    if seq > queued.prior_count && seq <= count =>
                {
                    return 0;
                }
                Update::Expunge(expunged) if expunged <= seq => seq += 1,
                _ => (),
            }
        }

        seq
    }

    /// Deliver pending updates to `sink`.
    ///
    /// If `allow_expunge` is false, delivery stops before the first pending
    /// expunge, since the client is in a context where sequence numbers must
    /// not shift under it.
    pub fn poll(
        &self,
        allow_expunge: bool,
        sink: &mut dyn UpdateSink,
    ) -> Result<(), Error> {
        let updates: Vec<Update> = {
            let mut queue = self.queue.lock();
            let stop = if allow_expunge {
                queue.pending.len()
            } else {
                queue
                    .pending
                    .iter()
                    .position(|q| matches!(q.update, Update::Expunge(_)))
                    .unwrap_or_else(|| queue.pending.len())
            };

            let updates: Vec<Update> =
                queue.pending.drain(..stop).map(|q| q.update).collect();
            for update in &updates {
                match *update {
                    Update::Expunge(_) => {
                        queue.view_count = queue.view_count.saturating_sub(1)
                    }
                    Update::NumMessages(count) => queue.view_count = count,
                    _ => (),
                }
            }
            updates
        };

        for update in updates {
            match update {
                Update::Expunge(seq) => sink.deliver_expunge(seq)?,
                Update::NumMessages(count) => sink.deliver_exists(count)?,
                Update::MailboxFlags(ref flags) => {
                    sink.deliver_mailbox_flags(flags)?
                }
                Update::MessageFlags { seq, uid, ref flags } => {
                    sink.deliver_message_flags(seq, uid, flags)?
                }
            }
        }

        Ok(())
    }

    /// Deliver updates to `sink` as they happen until `stop` fires (by
    /// message or by disconnection).
    ///
    /// Only one `idle` may run on a tracker at a time.
    pub fn idle(
        &self,
        sink: &mut dyn UpdateSink,
        stop: &Receiver<()>,
    ) -> Result<(), Error> {
        let (wake_tx, wake_rx) = channel::bounded(64);
        {
            let mut queue = self.queue.lock();
            if queue.wakeup.is_some() {
                return Err(Error::AlreadyIdling);
            }
            queue.wakeup = Some(wake_tx);
        }

        let result = self.idle_loop(sink, stop, &wake_rx);
        self.queue.lock().wakeup = None;
        if let Err(ref e) = result {
            warn!("IDLE delivery failed: {}", e);
        }
        result
    }

    fn idle_loop(
        &self,
        sink: &mut dyn UpdateSink,
        stop: &Receiver<()>,
        wake_rx: &Receiver<()>,
    ) -> Result<(), Error> {
        self.poll(true, sink)?;
        loop {
            crossbeam::select! {
                recv(wake_rx) -> _ => self.poll(true, sink)?,
                recv(stop) -> _ => return Ok(()),
            }
        }
    }

    #[cfg(test)]
    fn pending(&self) -> Vec<Update> {
        self.queue
            .lock()
            .pending
            .iter()
            .map(|q| q.update.clone())
            .collect()
    }
}
