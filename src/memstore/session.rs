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

//! `Session` over the in-memory store.

use std::sync::Arc;

use chrono::prelude::*;
use crossbeam::channel::Receiver;

use super::mailbox::{Mailbox, MailboxState, Message, SearchContext};
use super::user::{User, DELIMITER};
use super::MemStore;
use crate::imap::model::*;
use crate::imap::sasl::{PlainServer, SaslServer};
use crate::imap::server::{FetchSink, MoveSink, Session, SessionFeatures};
use crate::imap::tracker::{SessionTracker, UpdateSink};
use crate::support::error::Error;
use crate::wire::numset::{NumSet, SeqRange};

/// The selected mailbox.
struct View {
    mailbox: Arc<Mailbox>,
    tracker: SessionTracker,
    read_only: bool,
}

impl View {
    /// Find the messages `set` names, as pairs of index into the canonical
    /// message list and the sequence number the client knows.
    ///
    /// Messages the client has not been told about are never included.
    fn targets(
        &self,
        state: &MailboxState,
        set: &NumSet,
        kind: NumKind,
    ) -> Vec<(usize, u32)> {
        let resolved = match kind {
            NumKind::Seq => set.resolve(self.tracker.view_count()),
            NumKind::Uid => state.uids_of(set),
        };

        state
            .messages
            .iter()
            .enumerate()
            .filter_map(|(ix, msg)| {
                let seq = self.tracker.encode(ix as u32 + 1);
                let id = match kind {
                    NumKind::Seq => seq,
                    NumKind::Uid => msg.uid,
                };
                if 0 != seq && resolved.contains(id) {
                    Some((ix, seq))
                } else {
                    None
                }
            })
            .collect()
    }

    /// Announce new flags on the message at index `ix` to everyone else.
    fn notify_flags(&self, state: &MailboxState, ix: usize) {
        let msg = &state.messages[ix];
        self.mailbox.tracker().notify_flags(
            ix as u32 + 1,
            msg.uid,
            msg.flag_list(),
            Some(&self.tracker),
        );
    }

    /// Remove every message for which `doomed` returns true, highest first.
    ///
    /// Pending updates are delivered to `sink` beforehand so that the
    /// canonical sequence numbers are also the ones the client knows.
    fn expunge_where(
        &self,
        sink: &mut dyn UpdateSink,
        doomed: impl Fn(&Message) -> bool,
    ) -> Result<(), Error> {
        let mut state = self.mailbox.lock();
        self.tracker.poll(true, sink)?;

        for ix in (0..state.messages.len()).rev() {
            if !doomed(&state.messages[ix]) {
                continue;
            }

            state.messages.remove(ix);
            let seq = ix as u32 + 1;
            self.mailbox.tracker().notify_expunge(seq, Some(&self.tracker));
            sink.deliver_expunge(seq)?;
        }

        Ok(())
    }
}

/// Passes MOVE's expunges through to the `MoveSink`.
struct MoveUpdates<'a>(&'a mut dyn MoveSink);

impl UpdateSink for MoveUpdates<'_> {
    fn deliver_expunge(&mut self, seq: u32) -> Result<(), Error> {
        self.0.deliver_expunge(seq)
    }

    fn deliver_exists(&mut self, count: u32) -> Result<(), Error> {
        self.0.deliver_exists(count)
    }

    fn deliver_mailbox_flags(&mut self, flags: &[Flag]) -> Result<(), Error> {
        self.0.deliver_mailbox_flags(flags)
    }

    fn deliver_message_flags(
        &mut self,
        seq: u32,
        uid: Uid,
        flags: &[Flag],
    ) -> Result<(), Error> {
        self.0.deliver_message_flags(seq, uid, flags)
    }
}

pub struct MemSession {
    store: Arc<MemStore>,
    features: SessionFeatures,
    user: Option<Arc<User>>,
    view: Option<View>,
}

impl MemSession {
    pub fn new(store: Arc<MemStore>, features: SessionFeatures) -> Self {
        MemSession {
            store,
            features,
            user: None,
            view: None,
        }
    }

    fn user(&self) -> Result<&User, Error> {
        // The engine never dispatches these commands before login
        self.user.as_deref().ok_or(Error::AuthFailed)
    }

    fn view(&self) -> Result<&View, Error> {
        self.view.as_ref().ok_or(Error::NxMailbox)
    }

    fn writable_view(&self) -> Result<&View, Error> {
        let view = self.view()?;
        if view.read_only {
            Err(Error::MailboxReadOnly)
        } else {
            Ok(view)
        }
    }
}

fn check_storable(flags: &[Flag]) -> Result<(), Error> {
    if flags
        .iter()
        .any(|f| matches!(*f, Flag::Wildcard | Flag::Extension(_)))
    {
        Err(Error::NxFlag)
    } else {
        Ok(())
    }
}

impl Session for MemSession {
    fn features(&self) -> SessionFeatures {
        self.features
    }

    fn login(&mut self, user: &str, password: &str) -> Result<(), Error> {
        let account = self.store.user(user).ok_or(Error::AuthFailed)?;
        account.check_password(password)?;
        self.view = None;
        self.user = Some(account);
        Ok(())
    }

    fn sasl_mechanisms(&self) -> Vec<String> {
        vec!["PLAIN".to_owned()]
    }

    fn authenticate(
        &mut self,
        mechanism: &str,
    ) -> Result<Box<dyn SaslServer + '_>, Error> {
        if !mechanism.eq_ignore_ascii_case("PLAIN") {
            return Err(Error::UnsupportedMechanism);
        }

        Ok(Box::new(PlainServer::new(move |user: &str, password: &str| {
            self.login(user, password)
        })))
    }

    fn unauthenticate(&mut self) -> Result<(), Error> {
        self.view = None;
        self.user = None;
        Ok(())
    }

    fn namespace(&mut self) -> Result<NamespaceData, Error> {
        Ok(NamespaceData {
            personal: vec![NamespaceDescriptor {
                prefix: String::new(),
                delim: Some(DELIMITER),
            }],
            ..NamespaceData::default()
        })
    }

    fn select(
        &mut self,
        mailbox: &str,
        read_only: bool,
    ) -> Result<SelectData, Error> {
        self.view = None;
        let mailbox = self.user()?.mailbox(mailbox)?;

        let (tracker, data) = {
            let state = mailbox.lock();
            let tracker = mailbox.tracker().attach();
            let flags = state.flags();
            let permanent_flags = if read_only {
                Vec::new()
            } else {
                flags.iter().cloned().chain(Some(Flag::Wildcard)).collect()
            };

            let data = SelectData {
                flags,
                permanent_flags,
                num_messages: state.messages.len() as u32,
                uid_next: state.uid_next,
                uid_validity: mailbox.uid_validity(),
                read_only,
            };
            (tracker, data)
        };

        self.view = Some(View {
            mailbox,
            tracker,
            read_only,
        });
        Ok(data)
    }

    fn unselect(&mut self) -> Result<(), Error> {
        self.view = None;
        Ok(())
    }

    fn create(&mut self, mailbox: &str) -> Result<(), Error> {
        self.user()?.create(mailbox)
    }

    fn delete(&mut self, mailbox: &str) -> Result<(), Error> {
        self.user()?.delete(mailbox)
    }

    fn rename(&mut self, from: &str, to: &str) -> Result<(), Error> {
        self.user()?.rename(from, to)
    }

    fn subscribe(&mut self, mailbox: &str) -> Result<(), Error> {
        self.user()?.set_subscribed(mailbox, true)
    }

    fn unsubscribe(&mut self, mailbox: &str) -> Result<(), Error> {
        self.user()?.set_subscribed(mailbox, false)
    }

    fn list(
        &mut self,
        reference: &str,
        patterns: &[String],
        options: &ListOptions,
    ) -> Result<Vec<ListData>, Error> {
        Ok(self.user()?.list(reference, patterns, options))
    }

    fn status(
        &mut self,
        mailbox: &str,
        items: &[StatusItem],
    ) -> Result<StatusData, Error> {
        Ok(self.user()?.mailbox(mailbox)?.status(mailbox, items))
    }

    fn append(
        &mut self,
        mailbox: &str,
        options: &AppendOptions,
        data: Vec<u8>,
    ) -> Result<AppendData, Error> {
        check_storable(&options.flags)?;
        let mailbox = self.user()?.mailbox(mailbox)?;
        let internal_date = options
            .internal_date
            .unwrap_or_else(|| Utc::now().with_timezone(&FixedOffset::east(0)));

        let uids = mailbox.append(vec![Message {
            uid: 0,
            flags: options.flags.iter().cloned().collect(),
            internal_date,
            data: Arc::new(data),
        }]);

        Ok(AppendData {
            uid_validity: mailbox.uid_validity(),
            uid: uids[0],
        })
    }

    fn expunge(
        &mut self,
        uids: Option<&NumSet>,
        sink: &mut dyn UpdateSink,
    ) -> Result<(), Error> {
        let view = self.writable_view()?;
        let uids = uids.map(|set| view.mailbox.lock().uids_of(set));
        view.expunge_where(sink, |msg| {
            msg.flags.contains(&Flag::Deleted)
                && uids.as_ref().map_or(true, |u| u.contains(msg.uid))
        })
    }

    fn search(
        &mut self,
        kind: NumKind,
        key: &SearchKey,
    ) -> Result<SeqRange, Error> {
        let view = self.view()?;
        let state = view.mailbox.lock();
        let max_seq = view.tracker.view_count();
        let max_uid = state.max_uid();

        Ok(state
            .messages
            .iter()
            .enumerate()
            .filter_map(|(ix, msg)| {
                let seq = view.tracker.encode(ix as u32 + 1);
                if 0 == seq {
                    return None;
                }

                let ctx = SearchContext {
                    seq,
                    max_seq,
                    max_uid,
                };
                if !msg.matches(key, &ctx) {
                    None
                } else if NumKind::Uid == kind {
                    Some(msg.uid)
                } else {
                    Some(seq)
                }
            })
            .collect())
    }

    fn fetch(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        options: &FetchOptions,
        sink: &mut FetchSink<'_>,
    ) -> Result<(), Error> {
        let view = self.view()?;
        let marks_seen =
            !view.read_only && options.sections.iter().any(|s| !s.peek);

        let results = {
            let mut state = view.mailbox.lock();
            let targets = view.targets(&state, set, kind);
            let mut results = Vec::with_capacity(targets.len());

            for (ix, seq) in targets {
                let newly_seen = marks_seen
                    && state.messages[ix].flags.insert(Flag::Seen);
                if newly_seen {
                    view.notify_flags(&state, ix);
                }

                let msg = &state.messages[ix];
                results.push(FetchMessageData {
                    seq,
                    uid: if options.uid { Some(msg.uid) } else { None },
                    flags: if options.flags || newly_seen {
                        Some(msg.flag_list())
                    } else {
                        None
                    },
                    internal_date: if options.internal_date {
                        Some(msg.internal_date)
                    } else {
                        None
                    },
                    rfc822_size: if options.rfc822_size {
                        Some(msg.size())
                    } else {
                        None
                    },
                    sections: options
                        .sections
                        .iter()
                        .map(|s| (s.part, msg.section(s.part).to_vec()))
                        .collect(),
                });
            }

            results
        };

        for result in results {
            sink(result)?;
        }
        Ok(())
    }

    fn store(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        flags: &StoreFlags,
        sink: &mut FetchSink<'_>,
    ) -> Result<(), Error> {
        check_storable(&flags.flags)?;
        let view = self.writable_view()?;

        let results = {
            let mut state = view.mailbox.lock();
            if StoreOp::Remove != flags.op
                && state.learn_keywords(flags.flags.iter())
            {
                view.mailbox
                    .tracker()
                    .notify_mailbox_flags(state.flags(), None);
            }

            let targets = view.targets(&state, set, kind);
            let mut results = Vec::new();
            for (ix, seq) in targets {
                let msg = &mut state.messages[ix];
                let before = msg.flags.clone();
                match flags.op {
                    StoreOp::Replace => {
                        msg.flags = flags.flags.iter().cloned().collect()
                    }
                    StoreOp::Add => {
                        msg.flags.extend(flags.flags.iter().cloned())
                    }
                    StoreOp::Remove => {
                        for flag in &flags.flags {
                            msg.flags.remove(flag);
                        }
                    }
                }

                let uid = msg.uid;
                if before != msg.flags {
                    view.notify_flags(&state, ix);
                }

                if !flags.silent {
                    results.push(FetchMessageData {
                        seq,
                        uid: if NumKind::Uid == kind {
                            Some(uid)
                        } else {
                            None
                        },
                        flags: Some(state.messages[ix].flag_list()),
                        ..FetchMessageData::default()
                    });
                }
            }

            results
        };

        for result in results {
            sink(result)?;
        }
        Ok(())
    }

    fn copy(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        dest: &str,
    ) -> Result<CopyData, Error> {
        let dest = self.user()?.mailbox(dest)?;
        let view = self.view()?;

        let originals: Vec<Message> = {
            let state = view.mailbox.lock();
            view.targets(&state, set, kind)
                .into_iter()
                .map(|(ix, _)| state.messages[ix].clone())
                .collect()
        };

        let source_uids: SeqRange = originals.iter().map(|m| m.uid).collect();
        let dest_uids: SeqRange = if originals.is_empty() {
            SeqRange::new()
        } else {
            dest.append(originals).into_iter().collect()
        };

        Ok(CopyData {
            uid_validity: dest.uid_validity(),
            source_uids,
            dest_uids,
        })
    }

    fn move_messages(
        &mut self,
        set: &NumSet,
        kind: NumKind,
        dest: &str,
        sink: &mut dyn MoveSink,
    ) -> Result<(), Error> {
        self.writable_view()?;
        let data = self.copy(set, kind, dest)?;
        if data.source_uids.is_empty() {
            return Ok(());
        }

        sink.deliver_copy_data(&data)?;
        self.writable_view()?
            .expunge_where(&mut MoveUpdates(sink), |msg| {
                data.source_uids.contains(msg.uid)
            })
    }

    fn poll(
        &mut self,
        allow_expunge: bool,
        sink: &mut dyn UpdateSink,
    ) -> Result<(), Error> {
        match self.view {
            Some(ref view) => view.tracker.poll(allow_expunge, sink),
            None => Ok(()),
        }
    }

    fn idle(
        &mut self,
        sink: &mut dyn UpdateSink,
        stop: &Receiver<()>,
    ) -> Result<(), Error> {
        match self.view {
            Some(ref view) => view.tracker.idle(sink, stop),
            None => {
                // Either a message or disconnection ends the wait
                let _ = stop.recv();
                Ok(())
            }
        }
    }
}
