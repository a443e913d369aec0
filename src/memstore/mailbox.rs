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

//! One in-memory mailbox.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::prelude::*;
use memchr::memmem;

use crate::imap::model::*;
use crate::imap::tracker::MailboxTracker;
use crate::wire::numset::{NumSet, SeqRange};

#[derive(Clone, Debug)]
pub struct Message {
    pub uid: Uid,
    pub flags: BTreeSet<Flag>,
    pub internal_date: DateTime<FixedOffset>,
    pub data: Arc<Vec<u8>>,
}

impl Message {
    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn flag_list(&self) -> Vec<Flag> {
        self.flags.iter().cloned().collect()
    }

    /// The header block, including the blank line ending it.
    pub fn header(&self) -> &[u8] {
        &self.data[..self.body_offset()]
    }

    pub fn text(&self) -> &[u8] {
        &self.data[self.body_offset()..]
    }

    pub fn section(&self, part: SectionPart) -> &[u8] {
        match part {
            SectionPart::Full => &self.data,
            SectionPart::Header => self.header(),
            SectionPart::Text => self.text(),
        }
    }

    fn body_offset(&self) -> usize {
        let data = &self.data[..];
        let crlf = memmem::find(data, b"\r\n\r\n").map(|ix| ix + 4);
        let lf = memmem::find(data, b"\n\n").map(|ix| ix + 2);
        match (crlf, lf) {
            (Some(a), Some(b)) => a.min(b),
            (a, b) => a.or(b).unwrap_or_else(|| data.len()),
        }
    }
}

/// How a message is addressed while evaluating a search.
pub struct SearchContext {
    /// The sequence number as the client knows it.
    pub seq: u32,
    /// What `*` means in a sequence set.
    pub max_seq: u32,
    /// What `*` means in a UID set.
    pub max_uid: Uid,
}

impl Message {
    pub fn matches(&self, key: &SearchKey, ctx: &SearchContext) -> bool {
        match *key {
            SearchKey::All => true,
            SearchKey::Seq(ref set) => {
                set.resolve(ctx.max_seq).contains(ctx.seq)
            }
            SearchKey::Uid(ref set) => {
                set.resolve(ctx.max_uid).contains(self.uid)
            }
            SearchKey::Flag(ref flag, set) => self.flags.contains(flag) == set,
            SearchKey::Larger(n) => self.size() > n,
            SearchKey::Smaller(n) => self.size() < n,
            SearchKey::Body(ref s) => contains_ignore_case(self.text(), s),
            SearchKey::Text(ref s) => contains_ignore_case(&self.data, s),
            SearchKey::Not(ref k) => !self.matches(k, ctx),
            SearchKey::Or(ref a, ref b) => {
                self.matches(a, ctx) || self.matches(b, ctx)
            }
            SearchKey::And(ref keys) => {
                keys.iter().all(|k| self.matches(k, ctx))
            }
        }
    }
}

fn contains_ignore_case(haystack: &[u8], needle: &str) -> bool {
    String::from_utf8_lossy(haystack)
        .to_lowercase()
        .contains(&needle.to_lowercase())
}

#[derive(Debug, Default)]
pub struct MailboxState {
    pub messages: Vec<Message>,
    pub uid_next: Uid,
    pub subscribed: bool,
    /// Every keyword ever set in this mailbox.
    pub keywords: BTreeSet<Flag>,
}

impl MailboxState {
    /// The `FLAGS` list: the system flags plus every keyword in use.
    pub fn flags(&self) -> Vec<Flag> {
        vec![
            Flag::Answered,
            Flag::Deleted,
            Flag::Draft,
            Flag::Flagged,
            Flag::Seen,
        ]
        .into_iter()
        .chain(self.keywords.iter().cloned())
        .collect()
    }

    /// Record any new keywords in `flags`, returning whether the `FLAGS`
    /// list changed.
    pub fn learn_keywords<'a>(
        &mut self,
        flags: impl IntoIterator<Item = &'a Flag>,
    ) -> bool {
        let mut changed = false;
        for flag in flags {
            if let Flag::Keyword(_) = *flag {
                changed |= self.keywords.insert(flag.clone());
            }
        }
        changed
    }

    pub fn max_uid(&self) -> Uid {
        self.uid_next.saturating_sub(1)
    }

    pub fn uids_of(&self, set: &NumSet) -> SeqRange {
        set.resolve(self.max_uid())
    }

    pub fn status(
        &self,
        name: &str,
        uid_validity: u32,
        items: &[StatusItem],
    ) -> StatusData {
        let mut data = StatusData {
            mailbox: name.to_owned(),
            ..StatusData::default()
        };
        let count = |flag: &Flag| {
            self.messages
                .iter()
                .filter(|m| m.flags.contains(flag))
                .count() as u32
        };

        for &item in items {
            match item {
                StatusItem::Messages => {
                    data.num_messages = Some(self.messages.len() as u32)
                }
                StatusItem::UidNext => data.uid_next = Some(self.uid_next),
                StatusItem::UidValidity => {
                    data.uid_validity = Some(uid_validity)
                }
                StatusItem::Unseen => {
                    data.num_unseen =
                        Some(self.messages.len() as u32 - count(&Flag::Seen))
                }
                StatusItem::Deleted => {
                    data.num_deleted = Some(count(&Flag::Deleted))
                }
                StatusItem::Size => {
                    data.size = Some(
                        self.messages.iter().map(|m| m.data.len() as u64).sum(),
                    )
                }
            }
        }

        data
    }

    /// Add a message, returning its UID. The tracker is not notified.
    pub fn push(
        &mut self,
        data: Arc<Vec<u8>>,
        flags: BTreeSet<Flag>,
        internal_date: DateTime<FixedOffset>,
    ) -> Uid {
        let uid = self.uid_next;
        self.uid_next += 1;
        self.messages.push(Message {
            uid,
            flags,
            internal_date,
            data,
        });
        uid
    }
}

pub struct Mailbox {
    uid_validity: u32,
    tracker: Arc<MailboxTracker>,
    state: Mutex<MailboxState>,
}

impl Mailbox {
    pub fn new(uid_validity: u32) -> Self {
        Mailbox {
            uid_validity,
            tracker: Arc::new(MailboxTracker::new(0)),
            state: Mutex::new(MailboxState {
                uid_next: 1,
                ..MailboxState::default()
            }),
        }
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn tracker(&self) -> &Arc<MailboxTracker> {
        &self.tracker
    }

    /// Lock the mailbox. Tracker notifications for changes made through the
    /// guard must be sent before it is released.
    pub fn lock(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self, name: &str, items: &[StatusItem]) -> StatusData {
        self.lock().status(name, self.uid_validity, items)
    }

    /// Append messages and announce them to every session on the mailbox.
    ///
    /// Returns the new UIDs in order.
    pub fn append(&self, messages: Vec<Message>) -> Vec<Uid> {
        let mut state = self.lock();
        let flags_changed = state.learn_keywords(
            messages.iter().flat_map(|m| m.flags.iter()),
        );

        let uids = messages
            .into_iter()
            .map(|m| state.push(m.data, m.flags, m.internal_date))
            .collect();

        if flags_changed {
            self.tracker.notify_mailbox_flags(state.flags(), None);
        }
        self.tracker.notify_grow(state.messages.len() as u32, None);
        uids
    }
}
