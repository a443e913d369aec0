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

//! Full-stack tests: a real `Connection` over the in-memory store on one end
//! of a UNIX socket pair, driven either by hand-written wire traffic or by
//! the client engine on the other end.
//!
//! Every test builds its own store, so tests never see each other's mail.

mod defs;

mod client_engine;
mod faults;
mod rfc2177;
mod rfc3501;
mod rfc6851;
mod rfc7888;
mod starttls;
