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

//! Users and their mailbox hierarchies.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::mailbox::Mailbox;
use crate::imap::model::*;
use crate::support::error::Error;

pub const DELIMITER: char = '/';
pub const INBOX: &str = "INBOX";

struct Hierarchy {
    mailboxes: BTreeMap<String, Arc<Mailbox>>,
    last_uid_validity: u32,
}

impl Hierarchy {
    fn create(&mut self, name: String) {
        self.last_uid_validity += 1;
        self.mailboxes
            .insert(name, Arc::new(Mailbox::new(self.last_uid_validity)));
    }
}

pub struct User {
    name: String,
    password: String,
    hierarchy: Mutex<Hierarchy>,
}

impl User {
    pub fn new(name: &str, password: &str) -> Self {
        let mut hierarchy = Hierarchy {
            mailboxes: BTreeMap::new(),
            last_uid_validity: 0,
        };
        hierarchy.create(INBOX.to_owned());

        User {
            name: name.to_owned(),
            password: password.to_owned(),
            hierarchy: Mutex::new(hierarchy),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check_password(&self, password: &str) -> Result<(), Error> {
        if password.len() == self.password.len()
            && openssl::memcmp::eq(
                password.as_bytes(),
                self.password.as_bytes(),
            )
        {
            Ok(())
        } else {
            Err(Error::AuthFailed)
        }
    }

    fn lock(&self) -> MutexGuard<'_, Hierarchy> {
        self.hierarchy.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mailbox(&self, name: &str) -> Result<Arc<Mailbox>, Error> {
        let name = normalise_name(name)?;
        self.lock()
            .mailboxes
            .get(&name)
            .cloned()
            .ok_or(Error::NxMailbox)
    }

    pub fn create(&self, name: &str) -> Result<(), Error> {
        let name = normalise_name(name)?;
        let mut hierarchy = self.lock();
        if hierarchy.mailboxes.contains_key(&name) {
            return Err(Error::MailboxExists);
        }

        hierarchy.create(name);
        Ok(())
    }

    /// Delete a mailbox. Its children, if any, are unaffected.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let name = normalise_name(name)?;
        if INBOX == name {
            return Err(Error::BadOperationOnInbox);
        }

        self.lock()
            .mailboxes
            .remove(&name)
            .map(|_| ())
            .ok_or(Error::NxMailbox)
    }

    /// Rename a mailbox and everything beneath it.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        let from = normalise_name(from)?;
        let to = normalise_name(to)?;
        if INBOX == from {
            return Err(Error::BadOperationOnInbox);
        }

        let mut hierarchy = self.lock();
        if !hierarchy.mailboxes.contains_key(&from) {
            return Err(Error::NxMailbox);
        }
        if hierarchy.mailboxes.contains_key(&to) {
            return Err(Error::MailboxExists);
        }
        if is_beneath(&to, &from) {
            return Err(Error::UnsafeName);
        }

        let moving = hierarchy
            .mailboxes
            .keys()
            .filter(|name| **name == from || is_beneath(name, &from))
            .cloned()
            .collect::<Vec<_>>();
        for old in moving {
            if let Some(mailbox) = hierarchy.mailboxes.remove(&old) {
                let new = format!("{}{}", to, &old[from.len()..]);
                hierarchy.mailboxes.insert(new, mailbox);
            }
        }

        Ok(())
    }

    pub fn set_subscribed(
        &self,
        name: &str,
        subscribed: bool,
    ) -> Result<(), Error> {
        self.mailbox(name)?.lock().subscribed = subscribed;
        Ok(())
    }

    pub fn list(
        &self,
        reference: &str,
        patterns: &[String],
        options: &ListOptions,
    ) -> Vec<ListData> {
        // An empty pattern asks for the delimiter and root only
        if patterns.iter().all(String::is_empty) {
            return vec![ListData {
                attrs: vec!["\\Noselect".to_owned()],
                delim: Some(DELIMITER),
                mailbox: String::new(),
            }];
        }

        let hierarchy = self.lock();
        let mut results = Vec::new();
        for (name, mailbox) in &hierarchy.mailboxes {
            if !patterns
                .iter()
                .any(|pattern| list_matches(name, reference, pattern))
            {
                continue;
            }

            let subscribed = mailbox.lock().subscribed;
            if options.select_subscribed && !subscribed {
                continue;
            }

            let mut attrs = Vec::new();
            if subscribed {
                attrs.push("\\Subscribed".to_owned());
            }
            if hierarchy.mailboxes.keys().any(|other| is_beneath(other, name)) {
                attrs.push("\\HasChildren".to_owned());
            } else {
                attrs.push("\\HasNoChildren".to_owned());
            }

            results.push(ListData {
                attrs,
                delim: Some(DELIMITER),
                mailbox: name.clone(),
            });
        }

        results
    }
}

/// Validate a mailbox name and put it in canonical form.
///
/// A trailing delimiter is dropped and `INBOX` is matched case-insensitively.
fn normalise_name(name: &str) -> Result<String, Error> {
    let name = name.strip_suffix(DELIMITER).unwrap_or(name);
    if name.is_empty()
        || name.split(DELIMITER).any(str::is_empty)
        || name.chars().any(|c| c.is_control() || '*' == c || '%' == c)
    {
        return Err(Error::UnsafeName);
    }

    if name.eq_ignore_ascii_case(INBOX) {
        Ok(INBOX.to_owned())
    } else {
        Ok(name.to_owned())
    }
}

fn is_beneath(name: &str, parent: &str) -> bool {
    name.len() > parent.len()
        && name.starts_with(parent)
        && name[parent.len()..].starts_with(DELIMITER)
}

/// Whether `name` matches the LIST `pattern` relative to `reference`.
///
/// `*` matches anything; `%` matches anything but the delimiter.
pub fn list_matches(name: &str, reference: &str, pattern: &str) -> bool {
    let full = format!("{}{}", reference, pattern);
    let full: Vec<char> = if INBOX == name {
        full.to_ascii_uppercase().chars().collect()
    } else {
        full.chars().collect()
    };
    let name: Vec<char> = name.chars().collect();
    wildcard_match(&full, &name)
}

fn wildcard_match(pattern: &[char], name: &[char]) -> bool {
    match pattern.split_first() {
        None => name.is_empty(),
        Some((&'*', rest)) => {
            (0..=name.len()).any(|skip| wildcard_match(rest, &name[skip..]))
        }
        Some((&'%', rest)) => (0..=name.len())
            .take_while(|&skip| {
                0 == skip || DELIMITER != name[skip - 1]
            })
            .any(|skip| wildcard_match(rest, &name[skip..])),
        Some((&c, rest)) => {
            name.first() == Some(&c) && wildcard_match(rest, &name[1..])
        }
    }
}
