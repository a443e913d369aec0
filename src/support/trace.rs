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

//! Wire tracing.
//!
//! When enabled, every byte read from or written to a connection is copied to
//! a side channel in a visible form. **Traces are sensitive**: they include
//! passwords, SASL exchanges, and message content exactly as sent.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex};

/// A destination for wire traces.
///
/// Clones share the same sink, so the read and write halves of a connection
/// produce one interleaved trace.
#[derive(Clone)]
pub struct Tracer {
    prefix: String,
    sink: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl Tracer {
    pub fn new(prefix: String, sink: Box<dyn Write + Send>) -> Self {
        Tracer {
            prefix,
            sink: Arc::new(Mutex::new(sink)),
        }
    }

    pub fn stderr(prefix: String) -> Self {
        Self::new(prefix, Box::new(io::stderr()))
    }

    /// Write `data` to the trace, one output line per input line.
    ///
    /// Errors writing the trace are ignored.
    pub fn trace(&self, what: &str, data: &[u8]) {
        let mut sink = self.sink.lock().unwrap();
        if data.is_empty() {
            let _ = writeln!(sink, "{} WIRE {}<empty>", self.prefix, what);
            return;
        }

        let mut start = 0;
        for split in memchr::memchr_iter(b'\n', data)
            .chain(std::iter::once(data.len() - 1))
        {
            if split < start {
                continue;
            }

            let line = &data[start..=split];
            start = split + 1;

            let mut vis = String::new();
            for &byte in line {
                match byte {
                    b' '..=b'~' => vis.push(byte as char),
                    b'\n' => vis.push_str("\\n"),
                    b'\r' => vis.push_str("\\r"),
                    b => vis.push_str(&format!("\\x{:02X}", b)),
                }
            }

            let _ = writeln!(sink, "{} WIRE {} {}", self.prefix, what, vis);
        }
        let _ = sink.flush();
    }
}

/// Wraps a reader, copying everything read to a `Tracer` if one is set.
pub struct TraceRead<R> {
    inner: R,
    tracer: Option<Tracer>,
}

impl<R: Read> TraceRead<R> {
    pub fn new(inner: R, tracer: Option<Tracer>) -> Self {
        TraceRead { inner, tracer }
    }
}

impl<R: Read> Read for TraceRead<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        if let Some(ref tracer) = self.tracer {
            if n > 0 {
                tracer.trace("<<", &buf[..n]);
            }
        }
        Ok(n)
    }
}

/// Wraps a writer, copying everything written to a `Tracer` if one is set.
pub struct TraceWrite<W> {
    inner: W,
    tracer: Option<Tracer>,
}

impl<W: Write> TraceWrite<W> {
    pub fn new(inner: W, tracer: Option<Tracer>) -> Self {
        TraceWrite { inner, tracer }
    }
}

impl<W: Write> Write for TraceWrite<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        if let Some(ref tracer) = self.tracer {
            tracer.trace(">>", &buf[..n]);
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
