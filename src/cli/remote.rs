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

use openssl::ssl::{SslConnector, SslMethod, SslVerifyMode};
use thiserror::Error;

use super::main::*;
use crate::imap::client::{Client, ClientOptions};
use crate::imap::model::ListOptions;
use crate::imap::sasl::PlainClient;
use crate::support::trace::Tracer;

#[derive(Error, Debug)]
enum Error {
    #[error(transparent)]
    Ssl(#[from] openssl::error::ErrorStack),
    #[error(transparent)]
    Client(#[from] crate::imap::client::Error),
}

pub(super) fn main(cmd: RemoteSubcommand) {
    if let Err(e) = main_impl(cmd) {
        die!(EX_SOFTWARE, "Error: {}", e);
    }
}

fn main_impl(cmd: RemoteSubcommand) -> Result<(), Error> {
    match cmd {
        RemoteSubcommand::Test(options) => test(options),
    }
}

fn test(options: RemoteCommonOptions) -> Result<(), Error> {
    let user = match options.user {
        Some(ref user) => user.clone(),
        None => match nix::unistd::User::from_uid(nix::unistd::getuid()) {
            Ok(Some(u)) => u.name,
            Ok(None) => die!(EX_NOUSER, "No passwd entry for current user"),
            Err(e) => {
                die!(EX_NOUSER, "Failed to look up current UNIX user: {}", e)
            }
        },
    };

    let client = connect(&options)?;
    if let Some(tls) = client.tls_description() {
        println!("Connected with {}", tls);
    }

    let password = match rpassword::read_password_from_tty(Some("Password: "))
    {
        Ok(p) => p,
        Err(e) => die!(EX_NOINPUT, "Failed to read password: {}", e),
    };

    if client.has_capability("AUTH=PLAIN") {
        client.authenticate(&mut PlainClient::new(&user, &password))?;
    } else {
        client.login(&user, &password)?.wait()?;
    }

    // Pipeline the rest; they complete in order
    let list = client.list("", "*", ListOptions::default())?;
    let inbox = client.examine("INBOX")?;
    let logout = client.logout()?;

    for mailbox in list.wait()? {
        println!("Mailbox: {} {}", mailbox.mailbox, mailbox.attrs.join(" "));
    }
    let inbox = inbox.wait()?;
    println!(
        "INBOX: {} message(s), UIDVALIDITY {}, UIDNEXT {}",
        inbox.num_messages, inbox.uid_validity, inbox.uid_next
    );
    logout.wait()?;

    println!("Server looks OK");
    Ok(())
}

fn connect(options: &RemoteCommonOptions) -> Result<Client, Error> {
    let port = options
        .port
        .unwrap_or(if options.implicit_tls { 993 } else { 143 });
    let address = format!("{}:{}", options.host, port);
    let client_options = ClientOptions {
        trace: if options.trace {
            Some(Tracer::stderr("remote".to_owned()))
        } else {
            None
        },
        ..ClientOptions::default()
    };

    if options.trace {
        eprintln!("Opening connection to {}", address);
    }

    if options.no_tls {
        return Ok(Client::connect_insecure(&address, client_options)?);
    }

    let mut connector = SslConnector::builder(SslMethod::tls_client())?;
    if options.allow_insecure_tls_connections {
        connector.set_verify(SslVerifyMode::NONE);
    }
    let connector = connector.build();

    if options.implicit_tls {
        Ok(Client::connect_tls(
            &address,
            &options.host,
            &connector,
            client_options,
        )?)
    } else {
        Ok(Client::connect_starttls(
            &address,
            &options.host,
            connector,
            client_options,
        )?)
    }
}
