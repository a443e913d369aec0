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

//! The IMAP wire format, shared by the server and the client.

pub mod lex;
pub mod numset;
pub mod parse;

use std::str;

use lazy_static::lazy_static;
use regex::bytes::Regex;

/// The largest literal the peer may send without synchronising when it only
/// advertises `LITERAL-`.
pub const LITERAL_MINUS_MAX: u32 = 4096;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r#"~?\{([0-9]+)(\+?)\}$"#).unwrap();
}

/// A literal header found at the end of a line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LiteralHeader {
    /// Offset of the header within the examined slice.
    pub start: usize,
    pub len: u32,
    /// Whether the header used the non-synchronising `{n+}` form.
    pub nonsync: bool,
}

impl LiteralHeader {
    /// Whether the announced length did not fit in a `u32`.
    ///
    /// The true length is then unknown, so the literal can be neither read
    /// nor skipped.
    pub fn is_out_of_range(&self) -> bool {
        u32::MAX == self.len
    }
}

/// Check whether `line` (without its line ending) ends with a literal
/// header.
///
/// Lengths beyond `u32` are reported as `u32::MAX`, which no limit admits.
pub fn literal_at_eol(line: &[u8]) -> Option<LiteralHeader> {
    let cap = LITERAL_AT_EOL.captures(line)?;
    let m0 = cap.get(0)?;
    let len = str::from_utf8(cap.get(1)?.as_bytes())
        .ok()?
        .parse::<u32>()
        .unwrap_or(u32::MAX);
    Some(LiteralHeader {
        start: m0.start(),
        len,
        nonsync: cap.get(2).map_or(false, |m| !m.as_bytes().is_empty()),
    })
}
