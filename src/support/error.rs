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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Unsafe mailbox name")]
    UnsafeName,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Operation not allowed on INBOX")]
    BadOperationOnInbox,
    #[error("Mailbox is read-only")]
    MailboxReadOnly,
    #[error("Invalid flag")]
    NxFlag,
    #[error("Message too large")]
    TooBig,
    #[error("Authentication failed")]
    AuthFailed,
    #[error("Authorisation identity may not differ from user")]
    AuthzForbidden,
    #[error("Unsupported SASL mechanism")]
    UnsupportedMechanism,
    #[error("Malformed SASL response")]
    BadSaslResponse,
    #[error("Operation not supported")]
    Unsupported,
    #[error("IDLE already in progress")]
    AlreadyIdling,
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
}
