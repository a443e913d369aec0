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

//! Utilities for *writing* values under IMAP's "lexical rules".
//!
//! This is write-only; reading is done by the tokeniser in `parse`.
//!
//! The main job here is deciding which form to use to encode strings (atom,
//! quoted string, or literal), and emitting literals in a way the two ends of
//! the connection can each act on.
//!
//! # Encoding Decisions
//!
//! We're generally pretty conservative here.
//!
//! Given the choice between encoding a string as an atom-like value or some
//! other form, we only use atom if all characters are in the set
//! `a-zA-Z0-9?=+/_.-` and the string is not "NIL".
//!
//! Given the choice between encoding a string as a quoted string or a literal,
//! we only choose the quoted string if it only contains characters other than
//! controls, backslash, double-quote, is less than 100 bytes long, and if the
//! peer is not Unicode-aware, non-ASCII characters.
//!
//! # Literals
//!
//! Literals are written as the `{n}` or `{n+}` header followed by CRLF, then
//! handed to `LexOutput::literal_data` along with whether the peer must
//! acknowledge the header before the data may follow. Servers never use the
//! non-synchronising form; clients use it for literals up to
//! `nonsync_max` bytes.

use std::io::{self, Write};

use chrono::prelude::*;

use crate::imap::model::{format_datetime, Flag};

#[derive(Clone, Copy, Debug)]
pub struct LexWriter<W> {
    writer: W,
    unicode_aware: bool,
    nonsync_max: usize,
}

impl<W: LexOutput> LexWriter<W> {
    pub fn new(writer: W, unicode_aware: bool) -> Self {
        LexWriter {
            writer,
            unicode_aware,
            nonsync_max: 0,
        }
    }

    /// Allow non-synchronising literals of up to `max` bytes.
    pub fn with_nonsync_max(mut self, max: usize) -> Self {
        self.nonsync_max = max;
        self
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn verbatim(&mut self, s: &str) -> io::Result<()> {
        self.writer.write_all(s.as_bytes())
    }

    pub fn verbatim_bytes(&mut self, s: &[u8]) -> io::Result<()> {
        self.writer.write_all(s)
    }

    pub fn sp(&mut self) -> io::Result<()> {
        self.verbatim(" ")
    }

    pub fn crlf(&mut self) -> io::Result<()> {
        self.verbatim("\r\n")
    }

    pub fn nil(&mut self) -> io::Result<()> {
        self.verbatim("NIL")
    }

    pub fn num_u32(&mut self, value: u32) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }

    pub fn num_u64(&mut self, value: u64) -> io::Result<()> {
        write!(self.writer, "{}", value)
    }

    /// Write free text, as found after a response code.
    ///
    /// Line breaks cannot occur in text, so they are replaced with spaces.
    pub fn text(&mut self, s: &str) -> io::Result<()> {
        if s.contains(|c| '\r' == c || '\n' == c) {
            self.verbatim(&s.replace(|c| '\r' == c || '\n' == c, " "))
        } else {
            self.verbatim(s)
        }
    }

    pub fn astring(&mut self, s: &str) -> io::Result<()> {
        if self.is_conservative_atom(s) {
            self.verbatim(s)
        } else {
            self.string(s)
        }
    }

    /// Write a mailbox name.
    ///
    /// INBOX is case-insensitive and always written in its canonical form.
    pub fn mailbox(&mut self, name: &str) -> io::Result<()> {
        if name.eq_ignore_ascii_case("INBOX") {
            self.verbatim("INBOX")
        } else {
            self.astring(name)
        }
    }

    pub fn string(&mut self, s: &str) -> io::Result<()> {
        if self.is_quotable(s) {
            write!(self.writer, "\"{}\"", s)
        } else {
            self.literal(s.as_bytes())
        }
    }

    pub fn nstring(&mut self, s: Option<&str>) -> io::Result<()> {
        match s {
            None => self.nil(),
            Some(s) => self.string(s),
        }
    }

    pub fn literal(&mut self, data: &[u8]) -> io::Result<()> {
        let synchronising = data.len() > self.nonsync_max;
        write!(
            self.writer,
            "{{{}{}}}\r\n",
            data.len(),
            if synchronising { "" } else { "+" }
        )?;
        self.writer.literal_data(data, synchronising)
    }

    pub fn flag(&mut self, flag: &Flag) -> io::Result<()> {
        write!(self.writer, "{}", flag)
    }

    /// Write a parenthesised flag list.
    pub fn flags(&mut self, flags: &[Flag]) -> io::Result<()> {
        self.verbatim("(")?;
        for (ix, flag) in flags.iter().enumerate() {
            if ix > 0 {
                self.sp()?;
            }
            self.flag(flag)?;
        }
        self.verbatim(")")
    }

    pub fn datetime(
        &mut self,
        datetime: &DateTime<FixedOffset>,
    ) -> io::Result<()> {
        write!(self.writer, "\"{}\"", format_datetime(datetime))
    }

    fn is_conservative_atom(&self, s: &str) -> bool {
        !"nil".eq_ignore_ascii_case(s)
            && !s.is_empty()
            && s.as_bytes().iter().copied().all(|b| {
                matches!(
                b,
                b'a'..=b'z'
                | b'A'..=b'Z'
                | b'0'..=b'9'
                | b'='
                | b'?'
                | b'/'
                | b'+'
                | b'_'
                | b'.'
                    | b'-')
            })
    }

    fn is_quotable(&self, s: &str) -> bool {
        s.len() < 100
            && s.as_bytes().iter().copied().all(|b| match b {
                0..=31 | 127 | b'\\' | b'"' => false,
                128..=255 => self.unicode_aware,
                _ => true,
            })
    }
}

pub trait LexOutput: Write {
    /// Write the payload of a literal whose header has just been written.
    ///
    /// If `synchronising` is true, the peer must send a continuation request
    /// before `data` may be sent. Outputs that merely buffer bytes ignore it.
    fn literal_data(
        &mut self,
        data: &[u8],
        synchronising: bool,
    ) -> io::Result<()>;
}

impl LexOutput for Vec<u8> {
    fn literal_data(&mut self, data: &[u8], _: bool) -> io::Result<()> {
        self.extend_from_slice(data);
        Ok(())
    }
}

impl<T: LexOutput + ?Sized> LexOutput for &mut T {
    fn literal_data(
        &mut self,
        data: &[u8],
        synchronising: bool,
    ) -> io::Result<()> {
        (**self).literal_data(data, synchronising)
    }
}
