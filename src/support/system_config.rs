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

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// The system-wide configuration for Tidemap.
///
/// This is stored in a file named `tidemap.toml` under the Tidemap system
/// root, which is typically `/usr/local/etc/tidemap` or `/etc/tidemap`.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Where and how to accept connections.
    #[serde(default)]
    pub server: ServerConfig,

    /// Configuration for TLS.
    ///
    /// If absent, STARTTLS is not offered and `listen_tls` cannot be used.
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Protocol limits and timeouts.
    ///
    /// The defaults are reasonable for most installations.
    #[serde(default)]
    pub imap: ImapConfig,

    /// The accounts served by the in-memory store.
    #[serde(default)]
    pub users: Vec<UserConfig>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address of the cleartext listener, which offers STARTTLS if TLS is
    /// configured.
    pub listen: Option<String>,

    /// Address of the implicit-TLS listener.
    pub listen_tls: Option<String>,

    /// If true, LOGIN and AUTHENTICATE are permitted before TLS is active.
    ///
    /// This exposes passwords to anyone who can observe the network and
    /// should only be used for local testing.
    pub insecure_auth: bool,

    /// If true, every byte read from and written to each connection is
    /// copied to standard error.
    ///
    /// SENSITIVE: the trace includes passwords and message content verbatim.
    pub debug_trace: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            listen: Some("127.0.0.1:1143".to_owned()),
            listen_tls: None,
            insecure_auth: false,
            debug_trace: false,
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct TlsConfig {
    /// The path to the TLS private key, which must be in PEM format.
    pub private_key: PathBuf,
    /// The path to the TLS certificate chain, which must be in PEM format.
    pub certificate_chain: PathBuf,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct ImapConfig {
    /// How long to wait for a command from a client that has not logged in.
    pub unauthenticated_timeout_secs: u64,
    /// How long to wait for a command (or for `DONE` during IDLE) from a
    /// logged-in client.
    pub authenticated_timeout_secs: u64,
    /// How long to wait for the bytes of a literal once it has been accepted.
    pub literal_timeout_secs: u64,
    /// How long a single response may take to write.
    pub write_timeout_secs: u64,
    /// How long a response carrying literals may take to write.
    pub literal_write_timeout_secs: u64,
    /// The largest message APPEND accepts, in bytes.
    pub append_limit: u32,
    /// Advertise LITERAL+ instead of LITERAL-, allowing non-synchronising
    /// literals of any size.
    pub literal_plus: bool,
}

impl Default for ImapConfig {
    fn default() -> Self {
        ImapConfig {
            unauthenticated_timeout_secs: 30,
            authenticated_timeout_secs: 35 * 60,
            literal_timeout_secs: 5 * 60,
            write_timeout_secs: 30,
            literal_write_timeout_secs: 5 * 60,
            append_limit: 64 * 1024 * 1024,
            literal_plus: false,
        }
    }
}

impl ImapConfig {
    pub fn unauthenticated_timeout(&self) -> Duration {
        Duration::from_secs(self.unauthenticated_timeout_secs)
    }

    pub fn authenticated_timeout(&self) -> Duration {
        Duration::from_secs(self.authenticated_timeout_secs)
    }

    pub fn literal_timeout(&self) -> Duration {
        Duration::from_secs(self.literal_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn literal_write_timeout(&self) -> Duration {
        Duration::from_secs(self.literal_write_timeout_secs)
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
}
