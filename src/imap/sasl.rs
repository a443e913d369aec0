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

//! The PLAIN SASL mechanism (RFC 4616), for both ends of the connection.

use crate::support::error::Error;

/// What a server-side SASL exchange wants to do next.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SaslStep {
    /// Send this challenge and wait for the client's response.
    Challenge(Vec<u8>),
    /// Authentication succeeded as the given user.
    Done(String),
}

/// The server side of one SASL exchange.
pub trait SaslServer {
    /// Process the next client response. The first call receives the
    /// initial response, if the client sent one with the command.
    fn step(&mut self, response: Option<&[u8]>) -> Result<SaslStep, Error>;
}

/// The server side of PLAIN, delegating the credential check to `login`.
pub struct PlainServer<F> {
    login: F,
}

impl<F: FnMut(&str, &str) -> Result<(), Error>> PlainServer<F> {
    pub fn new(login: F) -> Self {
        PlainServer { login }
    }
}

impl<F: FnMut(&str, &str) -> Result<(), Error>> SaslServer
    for PlainServer<F>
{
    fn step(&mut self, response: Option<&[u8]>) -> Result<SaslStep, Error> {
        let response = match response {
            None => return Ok(SaslStep::Challenge(Vec::new())),
            Some(r) => r,
        };

        let mut parts = response.split(|&b| 0 == b);
        let (authzid, authcid, password) =
            match (parts.next(), parts.next(), parts.next(), parts.next()) {
                (Some(z), Some(c), Some(p), None) => (z, c, p),
                _ => return Err(Error::BadSaslResponse),
            };

        let authzid = std::str::from_utf8(authzid)
            .map_err(|_| Error::BadSaslResponse)?;
        let authcid = std::str::from_utf8(authcid)
            .map_err(|_| Error::BadSaslResponse)?;
        let password = std::str::from_utf8(password)
            .map_err(|_| Error::BadSaslResponse)?;

        if !authzid.is_empty() && authzid != authcid {
            return Err(Error::AuthzForbidden);
        }

        (self.login)(authcid, password)?;
        Ok(SaslStep::Done(authcid.to_owned()))
    }
}

/// The client side of one SASL exchange.
pub trait SaslClient: Send {
    fn mechanism(&self) -> &str;

    /// The initial response, if the mechanism sends one first.
    fn initial_response(&mut self) -> Option<Vec<u8>>;

    /// Answer a server challenge.
    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error>;
}

pub struct PlainClient {
    authzid: String,
    user: String,
    password: String,
    sent: bool,
}

impl PlainClient {
    pub fn new(user: &str, password: &str) -> Self {
        PlainClient {
            authzid: String::new(),
            user: user.to_owned(),
            password: password.to_owned(),
            sent: false,
        }
    }

    pub fn with_authzid(mut self, authzid: &str) -> Self {
        self.authzid = authzid.to_owned();
        self
    }

    fn message(&self) -> Vec<u8> {
        format!("{}\0{}\0{}", self.authzid, self.user, self.password)
            .into_bytes()
    }
}

impl SaslClient for PlainClient {
    fn mechanism(&self) -> &str {
        "PLAIN"
    }

    fn initial_response(&mut self) -> Option<Vec<u8>> {
        self.sent = true;
        Some(self.message())
    }

    fn respond(&mut self, challenge: &[u8]) -> Result<Vec<u8>, Error> {
        if self.sent || !challenge.is_empty() {
            return Err(Error::BadSaslResponse);
        }

        self.sent = true;
        Ok(self.message())
    }
}
