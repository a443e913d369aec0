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

//! Parsing of server responses.

use std::convert::TryFrom;
use std::str;

use crate::imap::model::*;
use crate::wire::numset::SeqRange;
use crate::wire::parse::{self, ParseError, Token, TokenStream};

/// One complete response line from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// A status response; `tag` is `None` for untagged ones.
    Status {
        tag: Option<String>,
        status: StatusResponse,
    },
    /// A continuation request, with the text after `+`.
    Continuation(String),
    Data(Data),
}

/// Untagged data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Data {
    Capability(CapSet),
    Enabled(Vec<String>),
    List { lsub: bool, data: ListData },
    MailboxStatus(StatusData),
    Search(Vec<u32>),
    ESearch { tag: Option<String>, data: SearchData },
    Flags(Vec<Flag>),
    Exists(u32),
    Recent(u32),
    Expunge(u32),
    Fetch(FetchMessageData),
    Namespace(NamespaceData),
}

/// Parse one response line. `line` excludes the final CRLF but includes any
/// literals in `{n}\r\n<data>` form.
pub fn parse_response(line: &[u8]) -> Result<Response, ParseError> {
    if let Some(rest) = line.strip_prefix(b"+") {
        let rest = rest.strip_prefix(b" ").unwrap_or(rest);
        return Ok(Response::Continuation(
            String::from_utf8_lossy(rest).into_owned(),
        ));
    }

    let (tag, rest) = split_word(line);
    if tag.is_empty() {
        return Err(ParseError::Expected("tag"));
    }
    let (word, after_word) = split_word(rest);

    let word_str = str::from_utf8(word).unwrap_or("");
    if let Some(cond) = Cond::parse(word_str) {
        return Ok(Response::Status {
            tag: if b"*" == tag {
                None
            } else {
                Some(String::from_utf8_lossy(tag).into_owned())
            },
            status: parse_status(cond, after_word)?,
        });
    }

    if b"*" != tag {
        return Err(ParseError::Expected("status response"));
    }

    let mut ts = TokenStream::parse(rest)?;
    let first = ts.expect_atom("response")?;
    let data = if let Some(n) = parse::parse_number(&first) {
        let what = ts.expect_atom("message data")?.to_ascii_uppercase();
        match what.as_str() {
            "EXISTS" => Data::Exists(n),
            "RECENT" => Data::Recent(n),
            "EXPUNGE" => Data::Expunge(n),
            "FETCH" => Data::Fetch(parse_fetch(n, ts.expect_list("msg-att")?)?),
            _ => return Err(ParseError::Invalid("message data")),
        }
    } else {
        match first.to_ascii_uppercase().as_str() {
            "CAPABILITY" => Data::Capability(
                ts.into_rest()
                    .iter()
                    .map(|t| t.atom().ok_or(ParseError::Expected("capability")))
                    .collect::<Result<CapSet, _>>()?,
            ),
            "ENABLED" => Data::Enabled(
                ts.into_rest()
                    .iter()
                    .map(|t| {
                        t.atom()
                            .map(str::to_owned)
                            .ok_or(ParseError::Expected("capability"))
                    })
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            "LIST" => Data::List {
                lsub: false,
                data: parse_list(&mut ts)?,
            },
            "LSUB" => Data::List {
                lsub: true,
                data: parse_list(&mut ts)?,
            },
            "STATUS" => Data::MailboxStatus(parse_status_data(&mut ts)?),
            "SEARCH" => Data::Search(
                ts.into_rest()
                    .iter()
                    .map(|t| t.number().ok_or(ParseError::Expected("number")))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            "ESEARCH" => parse_esearch(ts)?,
            "FLAGS" => Data::Flags(ts.expect_flags()?),
            "NAMESPACE" => Data::Namespace(NamespaceData {
                personal: parse_namespace(ts.expect_token("namespace")?)?,
                other: parse_namespace(ts.expect_token("namespace")?)?,
                shared: parse_namespace(ts.expect_token("namespace")?)?,
            }),
            _ => return Err(ParseError::Invalid("response")),
        }
    };

    Ok(Response::Data(data))
}

fn split_word(s: &[u8]) -> (&[u8], &[u8]) {
    match s.iter().position(|&b| b' ' == b) {
        Some(sp) => (&s[..sp], &s[sp + 1..]),
        None => (s, &[]),
    }
}

fn parse_status(cond: Cond, text: &[u8]) -> Result<StatusResponse, ParseError> {
    let text = parse::resp_text(text)?;
    Ok(StatusResponse {
        cond,
        code: text.code.map(|(name, args)| parse_code(name, args)),
        text: text.text,
    })
}

/// Interpret a response code. Codes that are not understood, or whose
/// arguments are malformed, become `RespCode::Other`.
pub fn parse_code(name: String, args: Option<String>) -> RespCode {
    let upper = name.to_ascii_uppercase();
    let simple = match upper.as_str() {
        "ALERT" => Some(RespCode::Alert),
        "ALREADYEXISTS" => Some(RespCode::AlreadyExists),
        "AUTHENTICATIONFAILED" => Some(RespCode::AuthenticationFailed),
        "AUTHORIZATIONFAILED" => Some(RespCode::AuthorizationFailed),
        "CANNOT" => Some(RespCode::Cannot),
        "CLIENTBUG" => Some(RespCode::ClientBug),
        "CLOSED" => Some(RespCode::Closed),
        "LIMIT" => Some(RespCode::Limit),
        "NONEXISTENT" => Some(RespCode::Nonexistent),
        "NOPERM" => Some(RespCode::NoPerm),
        "PARSE" => Some(RespCode::Parse),
        "PRIVACYREQUIRED" => Some(RespCode::PrivacyRequired),
        "READ-ONLY" => Some(RespCode::ReadOnly),
        "READ-WRITE" => Some(RespCode::ReadWrite),
        "SERVERBUG" => Some(RespCode::ServerBug),
        "TOOBIG" => Some(RespCode::TooBig),
        "TRYCREATE" => Some(RespCode::TryCreate),
        "UNAVAILABLE" => Some(RespCode::Unavailable),
        _ => None,
    };
    if let (Some(code), None) = (simple.clone(), args.as_ref()) {
        return code;
    }

    let words: Vec<&str> = args
        .as_deref()
        .map(|a| a.split(' ').collect())
        .unwrap_or_default();
    let parsed = match (upper.as_str(), &words[..]) {
        ("CAPABILITY", caps) => Some(RespCode::Capability(
            caps.iter().filter(|c| !c.is_empty()).collect(),
        )),
        ("APPENDUID", [validity, uid]) => validity
            .parse()
            .ok()
            .zip(uid.parse().ok())
            .map(|(v, u)| RespCode::AppendUid(v, u)),
        ("COPYUID", [validity, src, dst]) => {
            match (validity.parse(), SeqRange::parse(src), SeqRange::parse(dst))
            {
                (Ok(v), Some(s), Some(d)) => Some(RespCode::CopyUid(v, s, d)),
                _ => None,
            }
        }
        ("UIDNEXT", [n]) => n.parse().ok().map(RespCode::UidNext),
        ("UIDVALIDITY", [n]) => n.parse().ok().map(RespCode::UidValidity),
        ("PERMANENTFLAGS", _) => args
            .as_deref()
            .and_then(|a| TokenStream::parse(a.as_bytes()).ok())
            .and_then(|mut ts| ts.expect_flags().ok())
            .map(RespCode::PermanentFlags),
        _ => simple,
    };

    parsed.unwrap_or(RespCode::Other(name, args))
}

fn parse_fetch(
    seq: u32,
    atts: Vec<Token>,
) -> Result<FetchMessageData, ParseError> {
    let mut data = FetchMessageData {
        seq,
        ..FetchMessageData::default()
    };

    let mut ts = TokenStream::new(atts);
    while !ts.is_empty() {
        let name = ts.expect_atom("msg-att")?.to_ascii_uppercase();
        match name.as_str() {
            "UID" => data.uid = Some(ts.expect_number("uid")?),
            "FLAGS" => data.flags = Some(ts.expect_flags()?),
            "INTERNALDATE" => {
                data.internal_date = Some(
                    parse_datetime(&ts.expect_string("date-time")?)
                        .ok_or(ParseError::Invalid("date-time"))?,
                )
            }
            "RFC822.SIZE" => data.rfc822_size = Some(ts.expect_number("size")?),
            _ => {
                let section = name
                    .strip_prefix("BODY[")
                    .and_then(|s| s.strip_suffix("]"))
                    .and_then(SectionPart::parse)
                    .ok_or(ParseError::Invalid("msg-att"))?;
                let content = ts
                    .expect_token("section data")?
                    .into_bytes()
                    .unwrap_or_default();
                data.sections.push((section, content));
            }
        }
    }

    Ok(data)
}

fn parse_list(ts: &mut TokenStream) -> Result<ListData, ParseError> {
    let attrs = ts
        .expect_list("mailbox attributes")?
        .iter()
        .map(|t| {
            t.atom()
                .map(str::to_owned)
                .ok_or(ParseError::Expected("mailbox attribute"))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let delim = ts.expect_nstring("delimiter")?.and_then(|d| d.chars().next());
    let mailbox = ts.expect_astring("mailbox")?;
    Ok(ListData {
        attrs,
        delim,
        mailbox,
    })
}

fn parse_status_data(ts: &mut TokenStream) -> Result<StatusData, ParseError> {
    let mut data = StatusData {
        mailbox: ts.expect_astring("mailbox")?,
        ..StatusData::default()
    };

    let mut items = TokenStream::new(ts.expect_list("status attributes")?);
    while !items.is_empty() {
        let item = items.expect_atom("status attribute")?;
        let value = items
            .expect_token("status value")?
            .number_u64()
            .ok_or(ParseError::Expected("number"))?;
        let narrow = || u32::try_from(value).ok();
        match StatusItem::parse(&item) {
            Some(StatusItem::Messages) => data.num_messages = narrow(),
            Some(StatusItem::UidNext) => data.uid_next = narrow(),
            Some(StatusItem::UidValidity) => data.uid_validity = narrow(),
            Some(StatusItem::Unseen) => data.num_unseen = narrow(),
            Some(StatusItem::Deleted) => data.num_deleted = narrow(),
            Some(StatusItem::Size) => data.size = Some(value),
            None => (),
        }
    }

    Ok(data)
}

fn parse_esearch(mut ts: TokenStream) -> Result<Data, ParseError> {
    let mut tag = None;
    if let Some(&Token::List(_)) = ts.peek() {
        let mut correlator = TokenStream::new(ts.expect_list("correlator")?);
        correlator.expect_keyword("TAG")?;
        tag = Some(correlator.expect_string("tag")?);
    }

    let mut data = SearchData::default();
    data.uid = ts.accept_keyword("UID");
    while !ts.is_empty() {
        let name = ts.expect_atom("search return data")?.to_ascii_uppercase();
        match name.as_str() {
            "MIN" => data.min = Some(ts.expect_number("number")?),
            "MAX" => data.max = Some(ts.expect_number("number")?),
            "COUNT" => data.count = Some(ts.expect_number("number")?),
            "ALL" => {
                data.all = SeqRange::parse(&ts.expect_atom("sequence set")?)
                    .ok_or(ParseError::Invalid("sequence set"))?
            }
            // Unknown return data has a single value
            _ => {
                ts.expect_token("search return value")?;
            }
        }
    }

    Ok(Data::ESearch { tag, data })
}

fn parse_namespace(
    token: Token,
) -> Result<Vec<NamespaceDescriptor>, ParseError> {
    if token.is_nil() {
        return Ok(Vec::new());
    }

    token
        .list()
        .ok_or(ParseError::Expected("namespace"))?
        .iter()
        .map(|ns| {
            let mut ts = TokenStream::new(
                ns.list().ok_or(ParseError::Expected("namespace"))?.to_vec(),
            );
            let prefix = ts.expect_string("namespace prefix")?;
            let delim = ts
                .expect_nstring("delimiter")?
                .and_then(|d| d.chars().next());
            Ok(NamespaceDescriptor { prefix, delim })
        })
        .collect()
}
