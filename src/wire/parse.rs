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

//! Tokeniser for IMAP command and response lines.
//!
//! Both ends of the connection first gather a complete logical line (with any
//! literals spliced in after their `{n}\r\n` headers) and then break it into
//! `Token`s here. What the tokens mean is decided by the command parser on the
//! server and the response parser on the client.
//!
//! Response text (the part after `OK`, `NO`, etc.) is not tokenisable in
//! general, so `resp_text` handles it separately.

use std::borrow::Cow;
use std::str;

use nom::{
    branch::alt,
    bytes::complete::{is_not, tag, take, take_while1},
    combinator::{all_consuming, map, map_opt},
    multi::{fold_many0, separated_list},
    sequence::{delimited, preceded, terminated},
    IResult,
};
use thiserror::Error;

use crate::imap::model::Flag;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Syntax error at byte {0}")]
    Syntax(usize),
    #[error("Unterminated response code")]
    UnterminatedCode,
    #[error("Expected {0}")]
    Expected(&'static str),
    #[error("Invalid {0}")]
    Invalid(&'static str),
    #[error("Unexpected trailing arguments")]
    Trailing,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Token {
    Atom(String),
    Quoted(String),
    Literal(Vec<u8>),
    List(Vec<Token>),
}

impl Token {
    pub fn atom(&self) -> Option<&str> {
        match *self {
            Token::Atom(ref s) => Some(s),
            _ => None,
        }
    }

    pub fn is_atom(&self, keyword: &str) -> bool {
        self.atom().map_or(false, |a| a.eq_ignore_ascii_case(keyword))
    }

    pub fn is_nil(&self) -> bool {
        self.is_atom("NIL")
    }

    /// The value of a quoted string or literal.
    pub fn string(&self) -> Option<Cow<'_, str>> {
        match *self {
            Token::Quoted(ref s) => Some(Cow::Borrowed(s)),
            Token::Literal(ref data) => Some(String::from_utf8_lossy(data)),
            _ => None,
        }
    }

    /// The value of an atom, quoted string, or literal.
    pub fn astring(&self) -> Option<Cow<'_, str>> {
        match *self {
            Token::Atom(ref s) => Some(Cow::Borrowed(s)),
            _ => self.string(),
        }
    }

    /// Like `string`, but `NIL` yields `Some(None)`.
    pub fn nstring(&self) -> Option<Option<Cow<'_, str>>> {
        if self.is_nil() {
            Some(None)
        } else {
            self.string().map(Some)
        }
    }

    pub fn number(&self) -> Option<u32> {
        self.atom().and_then(parse_number)
    }

    pub fn number_u64(&self) -> Option<u64> {
        self.atom().and_then(|a| {
            if a.bytes().all(|b| b.is_ascii_digit()) {
                a.parse().ok()
            } else {
                None
            }
        })
    }

    pub fn list(&self) -> Option<&[Token]> {
        match *self {
            Token::List(ref l) => Some(l),
            _ => None,
        }
    }

    /// Consume the token as raw bytes, as for message contents.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self {
            Token::Quoted(s) => Some(s.into_bytes()),
            Token::Literal(data) => Some(data),
            _ => None,
        }
    }
}

pub fn parse_number(s: &str) -> Option<u32> {
    if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
        s.parse().ok()
    } else {
        None
    }
}

/// Sequential access to the arguments of a command or response.
#[derive(Debug)]
pub struct TokenStream {
    tokens: std::iter::Peekable<std::vec::IntoIter<Token>>,
}

impl TokenStream {
    pub fn new(tokens: Vec<Token>) -> Self {
        TokenStream {
            tokens: tokens.into_iter().peekable(),
        }
    }

    pub fn parse(line: &[u8]) -> Result<Self, ParseError> {
        tokenize(line).map(TokenStream::new)
    }

    pub fn peek(&mut self) -> Option<&Token> {
        self.tokens.peek()
    }

    pub fn is_empty(&mut self) -> bool {
        self.tokens.peek().is_none()
    }

    pub fn next_token(&mut self) -> Option<Token> {
        self.tokens.next()
    }

    pub fn expect_token(
        &mut self,
        what: &'static str,
    ) -> Result<Token, ParseError> {
        self.tokens.next().ok_or(ParseError::Expected(what))
    }

    pub fn expect_atom(
        &mut self,
        what: &'static str,
    ) -> Result<String, ParseError> {
        match self.tokens.next() {
            Some(Token::Atom(a)) => Ok(a),
            _ => Err(ParseError::Expected(what)),
        }
    }

    /// Consume the next token if it is the given keyword.
    pub fn accept_keyword(&mut self, keyword: &str) -> bool {
        if self.tokens.peek().map_or(false, |t| t.is_atom(keyword)) {
            self.tokens.next();
            true
        } else {
            false
        }
    }

    pub fn expect_keyword(
        &mut self,
        keyword: &'static str,
    ) -> Result<(), ParseError> {
        if self.accept_keyword(keyword) {
            Ok(())
        } else {
            Err(ParseError::Expected(keyword))
        }
    }

    pub fn expect_astring(
        &mut self,
        what: &'static str,
    ) -> Result<String, ParseError> {
        self.tokens
            .next()
            .as_ref()
            .and_then(Token::astring)
            .map(Cow::into_owned)
            .ok_or(ParseError::Expected(what))
    }

    pub fn expect_string(
        &mut self,
        what: &'static str,
    ) -> Result<String, ParseError> {
        self.tokens
            .next()
            .as_ref()
            .and_then(Token::string)
            .map(Cow::into_owned)
            .ok_or(ParseError::Expected(what))
    }

    pub fn expect_nstring(
        &mut self,
        what: &'static str,
    ) -> Result<Option<String>, ParseError> {
        self.tokens
            .next()
            .as_ref()
            .and_then(Token::nstring)
            .map(|s| s.map(Cow::into_owned))
            .ok_or(ParseError::Expected(what))
    }

    pub fn expect_number(
        &mut self,
        what: &'static str,
    ) -> Result<u32, ParseError> {
        self.tokens
            .next()
            .as_ref()
            .and_then(Token::number)
            .ok_or(ParseError::Expected(what))
    }

    pub fn expect_list(
        &mut self,
        what: &'static str,
    ) -> Result<Vec<Token>, ParseError> {
        match self.tokens.next() {
            Some(Token::List(l)) => Ok(l),
            _ => Err(ParseError::Expected(what)),
        }
    }

    pub fn expect_flags(&mut self) -> Result<Vec<Flag>, ParseError> {
        let list = self.expect_list("flag list")?;
        parse_flags(&list)
    }

    pub fn expect_end(&mut self) -> Result<(), ParseError> {
        if self.tokens.peek().is_none() {
            Ok(())
        } else {
            Err(ParseError::Trailing)
        }
    }

    pub fn into_rest(self) -> Vec<Token> {
        self.tokens.collect()
    }
}

/// Interpret a list of atoms as flags.
pub fn parse_flags(list: &[Token]) -> Result<Vec<Flag>, ParseError> {
    list.iter()
        .map(|t| {
            t.atom()
                .and_then(|a| a.parse::<Flag>().ok())
                .ok_or(ParseError::Invalid("flag"))
        })
        .collect()
}

/// Split a whole line into space-separated tokens.
///
/// `line` must not include the final CRLF, but does include literals in their
/// `{n}\r\n<data>` form.
pub fn tokenize(line: &[u8]) -> Result<Vec<Token>, ParseError> {
    match all_consuming(separated_list(tag(" "), token))(line) {
        Ok((_, tokens)) => Ok(tokens),
        Err(nom::Err::Error((rest, _)))
        | Err(nom::Err::Failure((rest, _))) => {
            Err(ParseError::Syntax(line.len() - rest.len()))
        }
        Err(nom::Err::Incomplete(_)) => Err(ParseError::Syntax(line.len())),
    }
}

/// The parts of a `resp-text`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RespText {
    /// The response code name and its raw argument text, if there is a code.
    pub code: Option<(String, Option<String>)>,
    pub text: String,
}

/// Parse the text following `OK`, `NO`, `BAD`, `BYE` or `PREAUTH`.
///
/// The code ends at the first `]` outside any quoted string or parenthesised
/// group.
pub fn resp_text(input: &[u8]) -> Result<RespText, ParseError> {
    if !input.starts_with(b"[") {
        return Ok(RespText {
            code: None,
            text: String::from_utf8_lossy(input).into_owned(),
        });
    }

    let mut depth = 0u32;
    let mut in_quote = false;
    let mut escaped = false;
    let mut end = None;
    for (ix, &b) in input.iter().enumerate().skip(1) {
        if in_quote {
            if escaped {
                escaped = false;
            } else if b'\\' == b {
                escaped = true;
            } else if b'"' == b {
                in_quote = false;
            }
            continue;
        }

        match b {
            b'"' => in_quote = true,
            b'(' => depth += 1,
            b')' => depth = depth.saturating_sub(1),
            b']' if 0 == depth => {
                end = Some(ix);
                break;
            }
            _ => (),
        }
    }

    let end = end.ok_or(ParseError::UnterminatedCode)?;
    let inner = String::from_utf8_lossy(&input[1..end]);
    let (name, args) = match inner.find(' ') {
        Some(sp) => (
            inner[..sp].to_owned(),
            Some(inner[sp + 1..].to_owned()),
        ),
        None => (inner.into_owned(), None),
    };
    if name.is_empty() {
        return Err(ParseError::Invalid("response code"));
    }

    let rest = &input[end + 1..];
    let rest = rest.strip_prefix(b" ").unwrap_or(rest);
    Ok(RespText {
        code: Some((name, args)),
        text: String::from_utf8_lossy(rest).into_owned(),
    })
}

fn token(i: &[u8]) -> IResult<&[u8], Token> {
    alt((
        map(literal, |d| Token::Literal(d.to_vec())),
        map(quoted, Token::Quoted),
        map(list, Token::List),
        map(atom, Token::Atom),
    ))(i)
}

fn atom(i: &[u8]) -> IResult<&[u8], String> {
    map(
        take_while1(|b| match b {
            0..=b' ' => false,
            127..=255 => false,
            b'(' | b')' | b'{' | b'"' => false,
            _ => true,
        }),
        |s| String::from_utf8_lossy(s).into_owned(),
    )(i)
}

fn list(i: &[u8]) -> IResult<&[u8], Vec<Token>> {
    delimited(tag("("), separated_list(tag(" "), token), tag(")"))(i)
}

fn number(i: &[u8]) -> IResult<&[u8], u32> {
    map_opt(nom::character::complete::digit1, |s| {
        str::from_utf8(s).ok().and_then(parse_number)
    })(i)
}

fn literal(i: &[u8]) -> IResult<&[u8], &[u8]> {
    let (i, len) = delimited(
        alt((tag("~{"), tag("{"))),
        number,
        alt((tag("+}\r\n"), tag("}\r\n"))),
    )(i)?;
    take(len)(i)
}

fn quoted_char(i: &[u8]) -> IResult<&[u8], &[u8]> {
    preceded(tag("\\"), alt((tag("\\"), tag("\""))))(i)
}

fn quoted_string_content(i: &[u8]) -> IResult<&[u8], &[u8]> {
    alt((quoted_char, is_not("\r\n\"\\")))(i)
}

fn quoted(i: &[u8]) -> IResult<&[u8], String> {
    map(
        terminated(
            preceded(
                tag("\""),
                fold_many0(
                    quoted_string_content,
                    Vec::new(),
                    |mut accum, piece| {
                        accum.extend_from_slice(piece);
                        accum
                    },
                ),
            ),
            tag("\""),
        ),
        |bytes| String::from_utf8_lossy(&bytes).into_owned(),
    )(i)
}
