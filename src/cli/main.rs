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

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
enum Command {
    /// Commands which connect to a remote IMAP server.
    Remote(RemoteSubcommand),
    /// Commands to be run on the Tidemap server system.
    Server(ServerSubcommand),
}

#[derive(StructOpt, Default)]
pub(super) struct ServerCommonOptions {
    /// The directory containing `tidemap.toml` etc
    /// [default: /etc/tidemap or /usr/local/etc/tidemap]
    #[structopt(long, parse(from_os_str))]
    root: Option<PathBuf>,
}

#[derive(StructOpt)]
enum ServerSubcommand {
    /// Run the IMAP server in the foreground.
    ///
    /// The server listens on the addresses given by `listen` and
    /// `listen_tls` in `tidemap.toml` and serves the accounts listed under
    /// `[[users]]` from memory. Nothing is persisted: all mail is lost when
    /// the process exits.
    Serve(ServerCommonOptions),
    /// Load the configuration and TLS files, report any problems, and exit.
    CheckConfig(ServerCommonOptions),
}

impl ServerSubcommand {
    fn common_options(&self) -> &ServerCommonOptions {
        match *self {
            ServerSubcommand::Serve(ref c)
            | ServerSubcommand::CheckConfig(ref c) => c,
        }
    }
}

#[derive(StructOpt, Default)]
pub(super) struct RemoteCommonOptions {
    /// The user name to log in as [default: current UNIX user name]
    #[structopt(long, short)]
    pub(super) user: Option<String>,
    /// The host to connect to
    #[structopt(long, short)]
    pub(super) host: String,
    /// The port to connect to [default: 993 with --implicit-tls, else 143]
    #[structopt(long, short)]
    pub(super) port: Option<u16>,
    /// Use TLS from the start of the connection instead of STARTTLS
    #[structopt(long)]
    pub(super) implicit_tls: bool,
    /// Do not use TLS at all. The password is sent in the clear.
    #[structopt(long, conflicts_with = "implicit-tls")]
    pub(super) no_tls: bool,
    /// Allow insecure TLS connections
    #[structopt(long)]
    pub(super) allow_insecure_tls_connections: bool,
    /// Dump a trace of the IMAP connection to standard error.
    ///
    /// The trace includes the password.
    #[structopt(long)]
    pub(super) trace: bool,
}

#[derive(StructOpt)]
pub(super) enum RemoteSubcommand {
    /// Connect and log in to a remote IMAP server, then disconnect.
    ///
    /// Along the way, the mailboxes of the account are listed and INBOX is
    /// examined. If this succeeds, it means that the following are working
    /// properly:
    ///
    /// - TLS (assuming --allow-insecure-tls-connections was not passed)
    ///
    /// - User login
    ///
    /// - Any proxy in front of the server
    Test(RemoteCommonOptions),
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    match cmd {
        Command::Remote(cmd) => super::remote::main(cmd),
        Command::Server(cmd) => server(cmd),
    }
}

fn server(cmd: ServerSubcommand) {
    let root = cmd.common_options().root.clone().unwrap_or_else(|| {
        if Path::new("/etc/tidemap/tidemap.toml").is_file() {
            "/etc/tidemap".to_owned().into()
        } else if Path::new("/usr/local/etc/tidemap/tidemap.toml").is_file() {
            "/usr/local/etc/tidemap".to_owned().into()
        } else {
            die!(
                EX_CONFIG,
                "Neither /etc/tidemap nor /usr/local/etc/tidemap looks like\n\
                 the Tidemap root; use --root=/path/to/tidemap if your\n\
                 installation is elsewhere."
            )
        }
    });

    let system_config = load_system_config(&root);

    match cmd {
        ServerSubcommand::Serve(_) => {
            init_logging(&root);
            super::serve::serve(system_config, root);
        }
        ServerSubcommand::CheckConfig(_) => {
            crate::init_simple_log();
            super::serve::check_config(&system_config, &root);
        }
    }
}

fn load_system_config(root: &Path) -> SystemConfig {
    let system_config_path = root.join("tidemap.toml");
    let mut system_config_toml = Vec::new();
    if let Err(e) = fs::File::open(&system_config_path)
        .and_then(|mut f| f.read_to_end(&mut system_config_toml))
    {
        die!(
            EX_CONFIG,
            "Error reading '{}': {}",
            system_config_path.display(),
            e
        );
    }

    match toml::from_slice(&system_config_toml) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            system_config_path.display(),
            e
        ),
    }
}

fn init_logging(root: &Path) {
    if Ok(true) == nix::unistd::isatty(2) {
        // Running interactively; ignore logging configuration and just write
        // to stderr.
        crate::init_simple_log();
        return;
    }

    let log_config_file = root.join("logging.toml");
    if log_config_file.is_file() {
        let config = match load_log_config(&log_config_file) {
            Ok(config) => config,
            Err(e) => die!(
                EX_CONFIG,
                "Failed to load logging config from '{}': {}",
                log_config_file.display(),
                e
            ),
        };
        if let Err(e) = log4rs::init_config(config) {
            die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
        }
        return;
    }

    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_MAIL,
        hostname: None,
        process: env!("CARGO_PKG_NAME").to_owned(),
        pid: nix::unistd::getpid().as_raw(),
    };

    let logger = match syslog::unix(formatter) {
        Ok(logger) => logger,
        Err(e) => die!(EX_OSERR, "Failed to connect to syslog: {}", e),
    };
    if let Err(e) =
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|_| log::set_max_level(log::LevelFilter::Info))
    {
        die!(EX_SOFTWARE, "Failed to initialise logging: {}", e);
    }
}

fn load_log_config(
    path: &Path,
) -> Result<log4rs::config::Config, log4rs::Error> {
    log4rs::load_config_file(path, log4rs::file::Deserializers::new())
}
