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

//! Protocol-level data shared by the server and the client.
//!
//! Nothing here knows about connections; these are the values that flow
//! between the wire codec, the connection engines, and sessions.

use std::borrow::Cow;
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

use chrono::prelude::*;

use crate::support::error::Error;
use crate::wire::numset::{NumSet, SeqRange};

pub type Uid = u32;

/// The RFC 3501/9051 connection states.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnState {
    NotAuthenticated,
    Authenticated,
    Selected,
    Logout,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match *self {
            ConnState::NotAuthenticated => "not authenticated",
            ConnState::Authenticated => "authenticated",
            ConnState::Selected => "selected",
            ConnState::Logout => "logout",
        })
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. `\*` (only
/// meaningful in PERMANENTFLAGS) is `Wildcard`. Other backslash flags the
/// server might send (e.g. `\Recent`) are `Extension`, and user-defined
/// keywords are `Keyword`.
///
/// The `Display` format is the exact wire form. `FromStr` does the reverse
/// conversion and also understands non-standard casing of the system flags.
/// Comparison is case-insensitive, as the RFCs require.
#[derive(Clone)]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Wildcard,
    Extension(String),
    Keyword(String),
}

impl Flag {
    fn sort_key(&self) -> (u8, Cow<'_, str>) {
        match *self {
            Flag::Answered => (0, Cow::Borrowed("")),
            Flag::Deleted => (1, Cow::Borrowed("")),
            Flag::Draft => (2, Cow::Borrowed("")),
            Flag::Flagged => (3, Cow::Borrowed("")),
            Flag::Seen => (4, Cow::Borrowed("")),
            Flag::Wildcard => (5, Cow::Borrowed("")),
            Flag::Extension(ref s) => (6, Cow::Owned(s.to_ascii_lowercase())),
            Flag::Keyword(ref s) => (7, Cow::Owned(s.to_ascii_lowercase())),
        }
    }
}

fn is_atom(s: &str) -> bool {
    !s.is_empty() && s.as_bytes().iter().copied().all(is_atom_char)
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Wildcard => write!(f, "\\*"),
            Flag::Extension(ref s) | Flag::Keyword(ref s) => write!(f, "{}", s),
        }
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if "\\*" == s {
            Ok(Flag::Wildcard)
        } else if let Some(name) = s.strip_prefix('\\') {
            if is_atom(name) {
                Ok(Flag::Extension(s.to_owned()))
            } else {
                Err(Error::NxFlag)
            }
        } else if is_atom(s) {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::NxFlag)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    match ch {
        0..=b' ' => false,
        127..=255 => false,
        b'(' | b')' | b'{' | b'*' | b'%' | b'\\' | b'"' | b']' => false,
        _ => true,
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Flag {}

impl PartialOrd for Flag {
    fn partial_cmp(&self, other: &Flag) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Flag {
    fn cmp(&self, other: &Flag) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl Hash for Flag {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.sort_key().hash(state)
    }
}

/// A set of capability names.
///
/// Names keep the case and order they were inserted with; lookups are
/// case-insensitive.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CapSet(Vec<String>);

impl CapSet {
    pub fn new() -> Self {
        CapSet::default()
    }

    pub fn insert(&mut self, cap: &str) {
        if !self.has(cap) {
            self.0.push(cap.to_owned());
        }
    }

    pub fn has(&self, cap: &str) -> bool {
        self.0.iter().any(|c| c.eq_ignore_ascii_case(cap))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> + '_ {
        self.0.iter().map(String::as_str)
    }

    /// Return the SASL mechanisms advertised through `AUTH=` capabilities.
    pub fn auth_mechanisms(&self) -> Vec<&str> {
        self.0
            .iter()
            .filter(|c| {
                c.len() > 5 && c.as_bytes()[..5].eq_ignore_ascii_case(b"AUTH=")
            })
            .map(|c| &c[5..])
            .collect()
    }
}

impl<S: AsRef<str>> std::iter::FromIterator<S> for CapSet {
    fn from_iter<I: IntoIterator<Item = S>>(it: I) -> Self {
        let mut this = CapSet::new();
        for cap in it {
            this.insert(cap.as_ref());
        }
        this
    }
}

/// The condition of a status response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Cond {
    Ok,
    No,
    Bad,
    Bye,
    Preauth,
}

impl Cond {
    pub fn as_str(self) -> &'static str {
        match self {
            Cond::Ok => "OK",
            Cond::No => "NO",
            Cond::Bad => "BAD",
            Cond::Bye => "BYE",
            Cond::Preauth => "PREAUTH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("OK") {
            Some(Cond::Ok)
        } else if s.eq_ignore_ascii_case("NO") {
            Some(Cond::No)
        } else if s.eq_ignore_ascii_case("BAD") {
            Some(Cond::Bad)
        } else if s.eq_ignore_ascii_case("BYE") {
            Some(Cond::Bye)
        } else if s.eq_ignore_ascii_case("PREAUTH") {
            Some(Cond::Preauth)
        } else {
            None
        }
    }
}

/// A machine-readable response code, i.e., the part in square brackets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RespCode {
    Alert,
    AlreadyExists,
    AppendUid(u32, Uid),
    AuthenticationFailed,
    AuthorizationFailed,
    Cannot,
    Capability(CapSet),
    ClientBug,
    Closed,
    CopyUid(u32, SeqRange, SeqRange),
    Limit,
    Nonexistent,
    NoPerm,
    Parse,
    PermanentFlags(Vec<Flag>),
    PrivacyRequired,
    ReadOnly,
    ReadWrite,
    ServerBug,
    TooBig,
    TryCreate,
    UidNext(Uid),
    UidValidity(u32),
    Unavailable,
    /// Anything else, as the code atom and its raw arguments.
    Other(String, Option<String>),
}

impl fmt::Display for RespCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            RespCode::Alert => f.write_str("ALERT"),
            RespCode::AlreadyExists => f.write_str("ALREADYEXISTS"),
            RespCode::AppendUid(validity, uid) => {
                write!(f, "APPENDUID {} {}", validity, uid)
            }
            RespCode::AuthenticationFailed => {
                f.write_str("AUTHENTICATIONFAILED")
            }
            RespCode::AuthorizationFailed => f.write_str("AUTHORIZATIONFAILED"),
            RespCode::Cannot => f.write_str("CANNOT"),
            RespCode::Capability(ref caps) => {
                f.write_str("CAPABILITY")?;
                for cap in caps.iter() {
                    write!(f, " {}", cap)?;
                }
                Ok(())
            }
            RespCode::ClientBug => f.write_str("CLIENTBUG"),
            RespCode::Closed => f.write_str("CLOSED"),
            RespCode::CopyUid(validity, ref src, ref dst) => {
                write!(f, "COPYUID {} {} {}", validity, src, dst)
            }
            RespCode::Limit => f.write_str("LIMIT"),
            RespCode::Nonexistent => f.write_str("NONEXISTENT"),
            RespCode::NoPerm => f.write_str("NOPERM"),
            RespCode::Parse => f.write_str("PARSE"),
            RespCode::PermanentFlags(ref flags) => {
                f.write_str("PERMANENTFLAGS (")?;
                for (ix, flag) in flags.iter().enumerate() {
                    if ix > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{}", flag)?;
                }
                f.write_str(")")
            }
            RespCode::PrivacyRequired => f.write_str("PRIVACYREQUIRED"),
            RespCode::ReadOnly => f.write_str("READ-ONLY"),
            RespCode::ReadWrite => f.write_str("READ-WRITE"),
            RespCode::ServerBug => f.write_str("SERVERBUG"),
            RespCode::TooBig => f.write_str("TOOBIG"),
            RespCode::TryCreate => f.write_str("TRYCREATE"),
            RespCode::UidNext(uid) => write!(f, "UIDNEXT {}", uid),
            RespCode::UidValidity(validity) => {
                write!(f, "UIDVALIDITY {}", validity)
            }
            RespCode::Unavailable => f.write_str("UNAVAILABLE"),
            RespCode::Other(ref name, None) => f.write_str(name),
            RespCode::Other(ref name, Some(ref args)) => {
                write!(f, "{} {}", name, args)
            }
        }
    }
}

/// A tagged or untagged `OK`, `NO`, `BAD`, `BYE` or `PREAUTH` response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatusResponse {
    pub cond: Cond,
    pub code: Option<RespCode>,
    pub text: String,
}

impl StatusResponse {
    pub fn ok(text: impl Into<String>) -> Self {
        StatusResponse {
            cond: Cond::Ok,
            code: None,
            text: text.into(),
        }
    }

    pub fn no(code: Option<RespCode>, text: impl Into<String>) -> Self {
        StatusResponse {
            cond: Cond::No,
            code,
            text: text.into(),
        }
    }

    pub fn bad(code: Option<RespCode>, text: impl Into<String>) -> Self {
        StatusResponse {
            cond: Cond::Bad,
            code,
            text: text.into(),
        }
    }

    pub fn bye(code: Option<RespCode>, text: impl Into<String>) -> Self {
        StatusResponse {
            cond: Cond::Bye,
            code,
            text: text.into(),
        }
    }

    pub fn with_code(mut self, code: RespCode) -> Self {
        self.code = Some(code);
        self
    }
}

impl fmt::Display for StatusResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.cond.as_str())?;
        if let Some(ref code) = self.code {
            write!(f, " [{}]", code)?;
        }
        write!(f, " {}", self.text)
    }
}

/// Whether a number or number set refers to sequence numbers or UIDs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NumKind {
    Seq,
    Uid,
}

/// What SELECT and EXAMINE report about the opened mailbox.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SelectData {
    pub flags: Vec<Flag>,
    pub permanent_flags: Vec<Flag>,
    pub num_messages: u32,
    pub uid_next: Uid,
    pub uid_validity: u32,
    pub read_only: bool,
}

/// One `LIST` (or `LSUB`) response.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ListData {
    pub attrs: Vec<String>,
    pub delim: Option<char>,
    pub mailbox: String,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListOptions {
    /// Only return subscribed mailboxes (`LIST (SUBSCRIBED)` or `LSUB`).
    pub select_subscribed: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StatusItem {
    Messages,
    UidNext,
    UidValidity,
    Unseen,
    Deleted,
    Size,
}

impl StatusItem {
    pub fn as_str(self) -> &'static str {
        match self {
            StatusItem::Messages => "MESSAGES",
            StatusItem::UidNext => "UIDNEXT",
            StatusItem::UidValidity => "UIDVALIDITY",
            StatusItem::Unseen => "UNSEEN",
            StatusItem::Deleted => "DELETED",
            StatusItem::Size => "SIZE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            StatusItem::Messages,
            StatusItem::UidNext,
            StatusItem::UidValidity,
            StatusItem::Unseen,
            StatusItem::Deleted,
            StatusItem::Size,
        ]
        .iter()
        .copied()
        .find(|item| item.as_str().eq_ignore_ascii_case(s))
    }
}

/// The result of `STATUS`. Items not requested are `None`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StatusData {
    pub mailbox: String,
    pub num_messages: Option<u32>,
    pub uid_next: Option<Uid>,
    pub uid_validity: Option<u32>,
    pub num_unseen: Option<u32>,
    pub num_deleted: Option<u32>,
    pub size: Option<u64>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AppendOptions {
    pub flags: Vec<Flag>,
    pub internal_date: Option<DateTime<FixedOffset>>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendData {
    pub uid_validity: u32,
    pub uid: Uid,
}

/// The `COPYUID` data of COPY and MOVE.
///
/// The two sets correspond element-wise in ascending order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyData {
    pub uid_validity: u32,
    pub source_uids: SeqRange,
    pub dest_uids: SeqRange,
}

/// A search key.
///
/// A whole search program is an `And` of the top-level keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SearchKey {
    All,
    Seq(NumSet),
    Uid(NumSet),
    /// The message has (`true`) or lacks (`false`) the flag.
    Flag(Flag, bool),
    Larger(u32),
    Smaller(u32),
    /// Case-insensitive substring of the body (everything after the header
    /// block).
    Body(String),
    /// Case-insensitive substring of the whole message.
    Text(String),
    Not(Box<SearchKey>),
    Or(Box<SearchKey>, Box<SearchKey>),
    And(Vec<SearchKey>),
}

/// The `RETURN` options of an extended search.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SearchReturn {
    pub min: bool,
    pub max: bool,
    pub count: bool,
    pub all: bool,
}

impl SearchReturn {
    pub fn is_empty(&self) -> bool {
        !self.min && !self.max && !self.count && !self.all
    }
}

/// The result of a search.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchData {
    pub uid: bool,
    pub all: SeqRange,
    pub min: Option<u32>,
    pub max: Option<u32>,
    pub count: Option<u32>,
}

/// Which part of a message a body section refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SectionPart {
    Full,
    Header,
    Text,
}

impl SectionPart {
    pub fn as_str(self) -> &'static str {
        match self {
            SectionPart::Full => "",
            SectionPart::Header => "HEADER",
            SectionPart::Text => "TEXT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if s.is_empty() {
            Some(SectionPart::Full)
        } else if s.eq_ignore_ascii_case("HEADER") {
            Some(SectionPart::Header)
        } else if s.eq_ignore_ascii_case("TEXT") {
            Some(SectionPart::Text)
        } else {
            None
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BodySection {
    pub part: SectionPart,
    pub peek: bool,
}

/// The attributes a FETCH asks for.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub uid: bool,
    pub flags: bool,
    pub internal_date: bool,
    pub rfc822_size: bool,
    pub sections: Vec<BodySection>,
}

/// One message's worth of FETCH data as seen by the client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FetchMessageData {
    pub seq: u32,
    pub uid: Option<Uid>,
    pub flags: Option<Vec<Flag>>,
    pub internal_date: Option<DateTime<FixedOffset>>,
    pub rfc822_size: Option<u32>,
    pub sections: Vec<(SectionPart, Vec<u8>)>,
}

impl FetchMessageData {
    pub fn section(&self, part: SectionPart) -> Option<&[u8]> {
        self.sections
            .iter()
            .find(|&&(p, _)| p == part)
            .map(|(_, data)| &data[..])
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreOp {
    Replace,
    Add,
    Remove,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreFlags {
    pub op: StoreOp,
    pub silent: bool,
    pub flags: Vec<Flag>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamespaceDescriptor {
    pub prefix: String,
    pub delim: Option<char>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespaceData {
    pub personal: Vec<NamespaceDescriptor>,
    pub other: Vec<NamespaceDescriptor>,
    pub shared: Vec<NamespaceDescriptor>,
}

/// Format a date-time in the IMAP `date-time` syntax, without quotes.
pub fn format_datetime(datetime: &DateTime<FixedOffset>) -> String {
    datetime.format("%_d-%b-%Y %H:%M:%S %z").to_string()
}

/// Parse the IMAP `date-time` syntax, without quotes.
pub fn parse_datetime(s: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(s.trim(), "%d-%b-%Y %H:%M:%S %z").ok()
}
