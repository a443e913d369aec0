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

//! An in-memory mail store.
//!
//! Nothing here survives a restart. It exists to back the server with
//! something real enough to exercise every part of the protocol, and to give
//! the integration tests a store they can set up in a line or two.

mod mailbox;
mod session;
mod user;

use std::collections::HashMap;
use std::sync::Arc;

pub use self::session::MemSession;
use self::user::User;
use crate::imap::server::SessionFeatures;
use crate::support::system_config::UserConfig;

/// Every account the store knows about.
pub struct MemStore {
    users: HashMap<String, Arc<User>>,
}

impl MemStore {
    pub fn new(users: &[UserConfig]) -> Self {
        MemStore {
            users: users
                .iter()
                .map(|u| {
                    (u.name.clone(), Arc::new(User::new(&u.name, &u.password)))
                })
                .collect(),
        }
    }

    fn user(&self, name: &str) -> Option<Arc<User>> {
        self.users.get(name).cloned()
    }

    pub fn num_users(&self) -> usize {
        self.users.len()
    }

    /// Open a new session on the store with the given optional features.
    pub fn session(
        self: &Arc<Self>,
        features: SessionFeatures,
    ) -> MemSession {
        MemSession::new(Arc::clone(self), features)
    }
}
