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

//! Command parsing for the server.
//!
//! A command line arrives here complete, with its literals already read and
//! spliced in. Parsing happens in two steps: the generic tokeniser in
//! `wire::parse`, then the per-command grammar below.

use std::borrow::Cow;

use crate::imap::model::*;
use crate::wire::numset::NumSet;
use crate::wire::parse::{self, ParseError, Token, TokenStream};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandLine {
    pub tag: String,
    pub command: Command,
}

/// The least a connection must have achieved for a command to be legal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequiredState {
    Any,
    NotAuthenticated,
    Authenticated,
    Selected,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Capability,
    Noop,
    Check,
    Logout,
    StartTls,
    Authenticate {
        mechanism: String,
        /// The SASL-IR initial response, decoded.
        initial: Option<Vec<u8>>,
    },
    Login {
        user: String,
        password: String,
    },
    Unauthenticate,
    Enable(Vec<String>),
    Namespace,
    Select {
        mailbox: String,
        read_only: bool,
    },
    Create(String),
    Delete(String),
    Rename {
        from: String,
        to: String,
    },
    Subscribe(String),
    Unsubscribe(String),
    List {
        reference: String,
        patterns: Vec<String>,
        options: ListOptions,
        lsub: bool,
    },
    Status {
        mailbox: String,
        items: Vec<StatusItem>,
    },
    Append {
        mailbox: String,
        options: AppendOptions,
        data: Vec<u8>,
    },
    Idle,
    Close,
    Unselect,
    Expunge {
        uids: Option<NumSet>,
    },
    Search {
        kind: NumKind,
        key: SearchKey,
        ret: Option<SearchReturn>,
    },
    Fetch {
        kind: NumKind,
        set: NumSet,
        options: FetchOptions,
    },
    Store {
        kind: NumKind,
        set: NumSet,
        flags: StoreFlags,
    },
    Copy {
        kind: NumKind,
        set: NumSet,
        mailbox: String,
    },
    Move {
        kind: NumKind,
        set: NumSet,
        mailbox: String,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match *self {
            Command::Capability => "CAPABILITY",
            Command::Noop => "NOOP",
            Command::Check => "CHECK",
            Command::Logout => "LOGOUT",
            Command::StartTls => "STARTTLS",
            Command::Authenticate { .. } => "AUTHENTICATE",
            Command::Login { .. } => "LOGIN",
            Command::Unauthenticate => "UNAUTHENTICATE",
            Command::Enable(..) => "ENABLE",
            Command::Namespace => "NAMESPACE",
            Command::Select {
                read_only: false, ..
            } => "SELECT",
            Command::Select { read_only: true, .. } => "EXAMINE",
            Command::Create(..) => "CREATE",
            Command::Delete(..) => "DELETE",
            Command::Rename { .. } => "RENAME",
            Command::Subscribe(..) => "SUBSCRIBE",
            Command::Unsubscribe(..) => "UNSUBSCRIBE",
            Command::List { lsub: false, .. } => "LIST",
            Command::List { lsub: true, .. } => "LSUB",
            Command::Status { .. } => "STATUS",
            Command::Append { .. } => "APPEND",
            Command::Idle => "IDLE",
            Command::Close => "CLOSE",
            Command::Unselect => "UNSELECT",
            Command::Expunge { uids: None } => "EXPUNGE",
            Command::Expunge { uids: Some(_) } => "UID EXPUNGE",
            Command::Search {
                kind: NumKind::Seq, ..
            } => "SEARCH",
            Command::Search {
                kind: NumKind::Uid, ..
            } => "UID SEARCH",
            Command::Fetch {
                kind: NumKind::Seq, ..
            } => "FETCH",
            Command::Fetch {
                kind: NumKind::Uid, ..
            } => "UID FETCH",
            Command::Store {
                kind: NumKind::Seq, ..
            } => "STORE",
            Command::Store {
                kind: NumKind::Uid, ..
            } => "UID STORE",
            Command::Copy {
                kind: NumKind::Seq, ..
            } => "COPY",
            Command::Copy {
                kind: NumKind::Uid, ..
            } => "UID COPY",
            Command::Move {
                kind: NumKind::Seq, ..
            } => "MOVE",
            Command::Move {
                kind: NumKind::Uid, ..
            } => "UID MOVE",
        }
    }

    pub fn required_state(&self) -> RequiredState {
        match *self {
            Command::Capability
            | Command::Noop
            | Command::Check
            | Command::Logout => RequiredState::Any,

            Command::StartTls
            | Command::Authenticate { .. }
            | Command::Login { .. } => RequiredState::NotAuthenticated,

            Command::Unauthenticate
            | Command::Enable(..)
            | Command::Namespace
            | Command::Select { .. }
            | Command::Create(..)
            | Command::Delete(..)
            | Command::Rename { .. }
            | Command::Subscribe(..)
            | Command::Unsubscribe(..)
            | Command::List { .. }
            | Command::Status { .. }
            | Command::Append { .. }
            | Command::Idle => RequiredState::Authenticated,

            Command::Close
            | Command::Unselect
            | Command::Expunge { .. }
            | Command::Search { .. }
            | Command::Fetch { .. }
            | Command::Store { .. }
            | Command::Copy { .. }
            | Command::Move { .. } => RequiredState::Selected,
        }
    }

    /// Whether expunges may be reported after this command completes.
    ///
    /// Sequence numbers must not shift under the client while it is working
    /// with the results of the sequence-number forms of these commands.
    pub fn allows_expunge(&self) -> bool {
        !matches!(
            *self,
            Command::Fetch {
                kind: NumKind::Seq,
                ..
            } | Command::Store {
                kind: NumKind::Seq,
                ..
            } | Command::Search {
                kind: NumKind::Seq,
                ..
            }
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandError {
    /// The line does not even start with a usable tag.
    NoTag,
    /// The command name is not one we know.
    Unknown { tag: String, verb: String },
    /// A known command with malformed arguments.
    Syntax { tag: String, error: ParseError },
}

/// Parse a complete command line (without its final CRLF).
pub fn parse_command_line(line: &[u8]) -> Result<CommandLine, CommandError> {
    let tokens = match parse::tokenize(line) {
        Ok(tokens) => tokens,
        Err(error) => {
            let first = line.split(|&b| b' ' == b).next().unwrap_or(b"");
            return match std::str::from_utf8(first) {
                Ok(tag) if is_valid_tag(tag) && first.len() < line.len() => {
                    Err(CommandError::Syntax {
                        tag: tag.to_owned(),
                        error,
                    })
                }
                _ => Err(CommandError::NoTag),
            };
        }
    };

    let mut ts = TokenStream::new(tokens);
    let tag = match ts.next_token() {
        Some(Token::Atom(tag)) if is_valid_tag(&tag) => tag,
        _ => return Err(CommandError::NoTag),
    };

    let verb = match ts.next_token() {
        Some(Token::Atom(verb)) => verb.to_ascii_uppercase(),
        _ => {
            return Err(CommandError::Syntax {
                tag,
                error: ParseError::Expected("command"),
            })
        }
    };

    let (kind, verb) = if "UID" == verb {
        match ts.next_token() {
            Some(Token::Atom(sub)) => {
                (NumKind::Uid, format!("UID {}", sub.to_ascii_uppercase()))
            }
            _ => {
                return Err(CommandError::Syntax {
                    tag,
                    error: ParseError::Expected("UID command"),
                })
            }
        }
    } else {
        (NumKind::Seq, verb)
    };

    match parse_command(&verb, kind, &mut ts) {
        Ok(Some(command)) => Ok(CommandLine { tag, command }),
        Ok(None) => Err(CommandError::Unknown { tag, verb }),
        Err(error) => Err(CommandError::Syntax { tag, error }),
    }
}

pub(super) fn is_valid_tag(tag: &str) -> bool {
    !tag.is_empty()
        && tag
            .bytes()
            .all(|b| b'+' != b && b'*' != b && b'%' != b && b'\\' != b)
}

fn parse_command(
    verb: &str,
    kind: NumKind,
    ts: &mut TokenStream,
) -> Result<Option<Command>, ParseError> {
    let command = match verb {
        "CAPABILITY" => Command::Capability,
        "NOOP" => Command::Noop,
        "CHECK" => Command::Check,
        "LOGOUT" => Command::Logout,
        "STARTTLS" => Command::StartTls,
        "AUTHENTICATE" => {
            let mechanism = ts.expect_atom("SASL mechanism")?;
            let initial = match ts.next_token() {
                None => None,
                Some(Token::Atom(ref ir)) if "=" == ir => Some(Vec::new()),
                Some(Token::Atom(ir)) => Some(
                    base64::decode(&ir)
                        .map_err(|_| ParseError::Invalid("base64"))?,
                ),
                Some(_) => return Err(ParseError::Expected("base64")),
            };
            Command::Authenticate {
                mechanism: mechanism.to_ascii_uppercase(),
                initial,
            }
        }
        "LOGIN" => Command::Login {
            user: ts.expect_astring("user name")?,
            password: ts.expect_astring("password")?,
        },
        "UNAUTHENTICATE" => Command::Unauthenticate,
        "ENABLE" => {
            let mut caps = Vec::new();
            while let Some(token) = ts.next_token() {
                caps.push(
                    token
                        .atom()
                        .ok_or(ParseError::Expected("capability"))?
                        .to_owned(),
                );
            }
            if caps.is_empty() {
                return Err(ParseError::Expected("capability"));
            }
            Command::Enable(caps)
        }
        "NAMESPACE" => Command::Namespace,
        "SELECT" | "EXAMINE" => Command::Select {
            mailbox: ts.expect_astring("mailbox")?,
            read_only: "EXAMINE" == verb,
        },
        "CREATE" => Command::Create(ts.expect_astring("mailbox")?),
        "DELETE" => Command::Delete(ts.expect_astring("mailbox")?),
        "RENAME" => Command::Rename {
            from: ts.expect_astring("mailbox")?,
            to: ts.expect_astring("mailbox")?,
        },
        "SUBSCRIBE" => Command::Subscribe(ts.expect_astring("mailbox")?),
        "UNSUBSCRIBE" => Command::Unsubscribe(ts.expect_astring("mailbox")?),
        "LIST" => parse_list(ts)?,
        "LSUB" => Command::List {
            reference: ts.expect_astring("reference")?,
            patterns: vec![ts.expect_astring("mailbox pattern")?],
            options: ListOptions {
                select_subscribed: true,
            },
            lsub: true,
        },
        "STATUS" => {
            let mailbox = ts.expect_astring("mailbox")?;
            let items = ts
                .expect_list("status items")?
                .iter()
                .map(|t| {
                    t.atom()
                        .and_then(StatusItem::parse)
                        .ok_or(ParseError::Invalid("status item"))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Command::Status { mailbox, items }
        }
        "APPEND" => parse_append(ts)?,
        "IDLE" => Command::Idle,
        "CLOSE" => Command::Close,
        "UNSELECT" => Command::Unselect,
        "EXPUNGE" => Command::Expunge { uids: None },
        "UID EXPUNGE" => Command::Expunge {
            uids: Some(expect_num_set(ts)?),
        },
        "SEARCH" | "UID SEARCH" => parse_search(kind, ts)?,
        "FETCH" | "UID FETCH" => {
            let set = expect_num_set(ts)?;
            let mut options =
                parse_fetch_atts(ts.expect_token("fetch attributes")?)?;
            options.uid |= NumKind::Uid == kind;
            Command::Fetch { kind, set, options }
        }
        "STORE" | "UID STORE" => Command::Store {
            kind,
            set: expect_num_set(ts)?,
            flags: parse_store_flags(ts)?,
        },
        "COPY" | "UID COPY" => Command::Copy {
            kind,
            set: expect_num_set(ts)?,
            mailbox: ts.expect_astring("mailbox")?,
        },
        "MOVE" | "UID MOVE" => Command::Move {
            kind,
            set: expect_num_set(ts)?,
            mailbox: ts.expect_astring("mailbox")?,
        },
        _ => return Ok(None),
    };

    ts.expect_end()?;
    Ok(Some(command))
}

fn expect_num_set(ts: &mut TokenStream) -> Result<NumSet, ParseError> {
    let raw = ts.expect_atom("sequence set")?;
    NumSet::parse(&raw).ok_or(ParseError::Invalid("sequence set"))
}

fn parse_list(ts: &mut TokenStream) -> Result<Command, ParseError> {
    let mut options = ListOptions::default();
    if let Some(&Token::List(_)) = ts.peek() {
        for opt in ts.expect_list("selection options")? {
            if opt.is_atom("SUBSCRIBED") {
                options.select_subscribed = true;
            } else if opt.atom().is_none() {
                return Err(ParseError::Invalid("selection option"));
            }
        }
    }

    let reference = ts.expect_astring("reference")?;
    let patterns = match ts.expect_token("mailbox pattern")? {
        Token::List(list) => list
            .iter()
            .map(|t| {
                t.astring()
                    .map(Cow::into_owned)
                    .ok_or(ParseError::Expected("mailbox pattern"))
            })
            .collect::<Result<Vec<_>, _>>()?,
        token => vec![token
            .astring()
            .map(Cow::into_owned)
            .ok_or(ParseError::Expected("mailbox pattern"))?],
    };

    // Every mailbox is reported with its subscription attribute anyway, so
    // the return options need no further handling.
    if ts.accept_keyword("RETURN") {
        ts.expect_list("return options")?;
    }

    Ok(Command::List {
        reference,
        patterns,
        options,
        lsub: false,
    })
}

fn parse_append(ts: &mut TokenStream) -> Result<Command, ParseError> {
    let mailbox = ts.expect_astring("mailbox")?;
    let mut options = AppendOptions::default();

    if let Some(&Token::List(_)) = ts.peek() {
        options.flags = ts.expect_flags()?;
        if options
            .flags
            .iter()
            .any(|f| matches!(*f, Flag::Wildcard | Flag::Extension(_)))
        {
            return Err(ParseError::Invalid("flag"));
        }
    }

    if let Some(&Token::Quoted(_)) = ts.peek() {
        let raw = ts.expect_string("date-time")?;
        // A quoted string in the final position is a misplaced message,
        // not a date.
        if ts.is_empty() {
            return Err(ParseError::Expected("message literal"));
        }
        options.internal_date = Some(
            parse_datetime(&raw).ok_or(ParseError::Invalid("date-time"))?,
        );
    }

    let data = match ts.expect_token("message literal")? {
        Token::Literal(data) => data,
        _ => return Err(ParseError::Expected("message literal")),
    };

    Ok(Command::Append {
        mailbox,
        options,
        data,
    })
}

fn parse_search(
    kind: NumKind,
    ts: &mut TokenStream,
) -> Result<Command, ParseError> {
    let mut ret = None;
    if ts.accept_keyword("RETURN") {
        let mut r = SearchReturn::default();
        for opt in ts.expect_list("search return options")? {
            match opt.atom().map(str::to_ascii_uppercase).as_deref() {
                Some("MIN") => r.min = true,
                Some("MAX") => r.max = true,
                Some("COUNT") => r.count = true,
                Some("ALL") => r.all = true,
                _ => return Err(ParseError::Invalid("search return option")),
            }
        }
        if r.is_empty() {
            r.all = true;
        }
        ret = Some(r);
    }

    if ts.accept_keyword("CHARSET") {
        let charset = ts.expect_astring("charset")?;
        if !charset.eq_ignore_ascii_case("UTF-8")
            && !charset.eq_ignore_ascii_case("US-ASCII")
        {
            return Err(ParseError::Invalid("charset"));
        }
    }

    let mut keys = Vec::new();
    while !ts.is_empty() {
        keys.push(search_key(ts)?);
    }

    let key = match keys.len() {
        0 => return Err(ParseError::Expected("search key")),
        1 => keys.pop().unwrap_or(SearchKey::All),
        _ => SearchKey::And(keys),
    };

    Ok(Command::Search { kind, key, ret })
}

fn search_key(ts: &mut TokenStream) -> Result<SearchKey, ParseError> {
    let atom = match ts.expect_token("search key")? {
        Token::List(list) => {
            let mut sub = TokenStream::new(list);
            let mut keys = Vec::new();
            while !sub.is_empty() {
                keys.push(search_key(&mut sub)?);
            }
            if keys.is_empty() {
                return Err(ParseError::Expected("search key"));
            }
            return Ok(SearchKey::And(keys));
        }
        Token::Atom(atom) => atom,
        _ => return Err(ParseError::Expected("search key")),
    };

    let flag = |flag, set| Ok(SearchKey::Flag(flag, set));
    match atom.to_ascii_uppercase().as_str() {
        "ALL" => Ok(SearchKey::All),
        "ANSWERED" => flag(Flag::Answered, true),
        "DELETED" => flag(Flag::Deleted, true),
        "DRAFT" => flag(Flag::Draft, true),
        "FLAGGED" => flag(Flag::Flagged, true),
        "SEEN" => flag(Flag::Seen, true),
        "UNANSWERED" => flag(Flag::Answered, false),
        "UNDELETED" => flag(Flag::Deleted, false),
        "UNDRAFT" => flag(Flag::Draft, false),
        "UNFLAGGED" => flag(Flag::Flagged, false),
        "UNSEEN" => flag(Flag::Seen, false),
        "KEYWORD" | "UNKEYWORD" => {
            let kw = ts
                .expect_atom("keyword")?
                .parse::<Flag>()
                .map_err(|_| ParseError::Invalid("keyword"))?;
            flag(kw, atom.eq_ignore_ascii_case("KEYWORD"))
        }
        "LARGER" => Ok(SearchKey::Larger(ts.expect_number("size")?)),
        "SMALLER" => Ok(SearchKey::Smaller(ts.expect_number("size")?)),
        "BODY" => Ok(SearchKey::Body(ts.expect_astring("search string")?)),
        "TEXT" => Ok(SearchKey::Text(ts.expect_astring("search string")?)),
        "NOT" => Ok(SearchKey::Not(Box::new(search_key(ts)?))),
        "OR" => {
            let a = search_key(ts)?;
            let b = search_key(ts)?;
            Ok(SearchKey::Or(Box::new(a), Box::new(b)))
        }
        "UID" => Ok(SearchKey::Uid(expect_num_set(ts)?)),
        _ => NumSet::parse(&atom)
            .map(SearchKey::Seq)
            .ok_or(ParseError::Invalid("search key")),
    }
}

fn parse_fetch_atts(token: Token) -> Result<FetchOptions, ParseError> {
    let atoms = match token {
        Token::Atom(atom) => vec![atom],
        Token::List(list) => list
            .into_iter()
            .map(|t| match t {
                Token::Atom(atom) => Ok(atom),
                _ => Err(ParseError::Expected("fetch attribute")),
            })
            .collect::<Result<Vec<_>, _>>()?,
        _ => return Err(ParseError::Expected("fetch attributes")),
    };

    let mut options = FetchOptions::default();
    for atom in atoms {
        let upper = atom.to_ascii_uppercase();
        match upper.as_str() {
            "UID" => options.uid = true,
            "FLAGS" => options.flags = true,
            "INTERNALDATE" => options.internal_date = true,
            "RFC822.SIZE" => options.rfc822_size = true,
            // ENVELOPE is not served, so ALL means the same as FAST
            "FAST" | "ALL" => {
                options.flags = true;
                options.internal_date = true;
                options.rfc822_size = true;
            }
            _ => options.sections.push(parse_body_section(&upper)?),
        }
    }

    Ok(options)
}

fn parse_body_section(upper: &str) -> Result<BodySection, ParseError> {
    let (peek, rest) = if let Some(rest) = upper.strip_prefix("BODY.PEEK[") {
        (true, rest)
    } else if let Some(rest) = upper.strip_prefix("BODY[") {
        (false, rest)
    } else {
        return Err(ParseError::Invalid("fetch attribute"));
    };

    let section = rest
        .strip_suffix("]")
        .ok_or(ParseError::Invalid("body section"))?;
    let part =
        SectionPart::parse(section).ok_or(ParseError::Invalid("body section"))?;
    Ok(BodySection { part, peek })
}

fn parse_store_flags(ts: &mut TokenStream) -> Result<StoreFlags, ParseError> {
    let item = ts.expect_atom("store item")?.to_ascii_uppercase();
    let (op, rest) = if let Some(rest) = item.strip_prefix('+') {
        (StoreOp::Add, rest)
    } else if let Some(rest) = item.strip_prefix('-') {
        (StoreOp::Remove, rest)
    } else {
        (StoreOp::Replace, item.as_str())
    };

    let silent = match rest {
        "FLAGS" => false,
        "FLAGS.SILENT" => true,
        _ => return Err(ParseError::Invalid("store item")),
    };

    let flags = if let Some(&Token::List(_)) = ts.peek() {
        ts.expect_flags()?
    } else {
        let rest: Vec<Token> = std::iter::from_fn(|| ts.next_token()).collect();
        parse::parse_flags(&rest)?
    };

    if flags
        .iter()
        .any(|f| matches!(*f, Flag::Wildcard | Flag::Extension(_)))
    {
        return Err(ParseError::Invalid("flag"));
    }

    Ok(StoreFlags { op, silent, flags })
}
