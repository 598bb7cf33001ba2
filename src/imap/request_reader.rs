//-
// Copyright (c) 2024, the Wingmap authors
//
// This file is part of Wingmap.
//
// Wingmap is free software: you can  redistribute it and/or modify it under
// the terms of  the GNU General Public  License as published  by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Wingmap is distributed  in the hope that  it will be useful,  but WITHOUT
// ANY WARRANTY; without  even the implied warranty of  MERCHANTABILITY or
// FITNESS FOR A PARTICULAR PURPOSE. See the GNU General Public License for
// more details.
//
// You should have received a copy of the GNU General Public License along
// with Wingmap. If not, see <http://www.gnu.org/licenses/>.

//! Line framing and literal handling.
//!
//! This is the only place that understands `{n}` / `{n+}` continuation
//! syntax. A complete command is delivered as the logical command line
//! (with the literal markers still embedded, so the tokenizer knows
//! where they belong) plus the literal payloads in order.

use lazy_static::lazy_static;
use regex::bytes::Regex;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader, ReadHalf};

use super::response_writer::ResponseWriter;
use super::BoxStream;
use crate::support::error::Error;

const MAX_CMDLINE: usize = 65536;

lazy_static! {
    static ref LITERAL_AT_EOL: Regex =
        Regex::new(r"~?\{([0-9]+)(\+?)\}$").unwrap();
}

/// One framed command: the logical line and its literal payloads.
pub struct RawCommand {
    pub line: Vec<u8>,
    pub literals: Vec<Vec<u8>>,
}

/// How a framing attempt ended.
pub enum ReadOutcome {
    Command(RawCommand),
    /// The peer closed the connection between commands.
    Eof,
    /// The command violated a framing limit; a response naming the
    /// problem has NOT been sent yet. The connection must be torn down
    /// (recovery would require parsing arbitrarily broken input).
    TooLong,
}

pub struct RequestReader {
    read: BufReader<ReadHalf<BoxStream>>,
    max_literal: u32,
}

impl RequestReader {
    pub fn new(read: ReadHalf<BoxStream>, max_literal: u32) -> Self {
        Self {
            read: BufReader::new(read),
            max_literal,
        }
    }

    /// Surrender the raw read half, for the STARTTLS upgrade. The
    /// internal buffer is discarded; the caller must only do this at a
    /// command boundary, where the client is waiting on our response and
    /// the buffer is empty.
    pub fn into_inner(self) -> ReadHalf<BoxStream> {
        self.read.into_inner()
    }

    /// Read one raw line without literal interpretation (IDLE's `DONE`).
    pub async fn read_bare_line(&mut self) -> Result<Vec<u8>, Error> {
        let mut line = Vec::new();
        self.fill_line(&mut line).await?;
        Ok(line)
    }

    /// Read a complete command, following literal continuations.
    pub async fn read_command(
        &mut self,
        w: &mut ResponseWriter,
    ) -> Result<ReadOutcome, Error> {
        let mut line = Vec::new();
        let mut literals = Vec::new();

        let nread = self
            .read
            .read_until(b'\n', &mut line)
            .await
            .map_err(Error::Io)?;
        if 0 == nread {
            return Ok(ReadOutcome::Eof);
        }
        if !strip_crlf(&mut line) || line.len() > MAX_CMDLINE {
            return Ok(ReadOutcome::TooLong);
        }

        loop {
            let Some((length, literal_plus)) = trailing_literal(&line)
            else {
                return Ok(ReadOutcome::Command(RawCommand {
                    line,
                    literals,
                }));
            };

            if length > self.max_literal {
                return Ok(ReadOutcome::TooLong);
            }

            if !literal_plus {
                w.write_continuation("go ahead").await?;
            }

            let mut literal = vec![0u8; length as usize];
            self.read
                .read_exact(&mut literal)
                .await
                .map_err(Error::Io)?;
            literals.push(literal);

            // The rest of the command follows on the next line,
            // continuing the same logical command line.
            let mark = line.len();
            self.fill_line(&mut line).await?;
            if line.len() - mark > MAX_CMDLINE {
                return Ok(ReadOutcome::TooLong);
            }
        }
    }

    async fn fill_line(&mut self, line: &mut Vec<u8>) -> Result<(), Error> {
        let nread = self
            .read
            .read_until(b'\n', line)
            .await
            .map_err(Error::Io)?;
        if 0 == nread {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "EOF mid-command",
            )));
        }
        if !strip_crlf(line) {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "line too long",
            )));
        }
        Ok(())
    }
}

/// Strip the line terminator; false if there wasn't one (overlong line).
fn strip_crlf(line: &mut Vec<u8>) -> bool {
    if line.last() != Some(&b'\n') {
        return false;
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    true
}

fn trailing_literal(line: &[u8]) -> Option<(u32, bool)> {
    let captures = LITERAL_AT_EOL.captures(line)?;
    let length = std::str::from_utf8(&captures[1])
        .ok()?
        .parse::<u32>()
        .ok()?;
    Some((length, !captures[2].is_empty()))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn detects_trailing_literals() {
        assert_eq!(
            Some((12, false)),
            trailing_literal(b"a APPEND saved {12}"),
        );
        assert_eq!(
            Some((12, true)),
            trailing_literal(b"a APPEND saved {12+}"),
        );
        assert_eq!(
            Some((3, false)),
            trailing_literal(b"a LOGIN who ~{3}"),
        );
        assert_eq!(None, trailing_literal(b"a NOOP"));
        assert_eq!(None, trailing_literal(b"a SEARCH TEXT {brace}"));
    }

    #[test]
    fn strips_either_line_ending() {
        let mut line = b"hello\r\n".to_vec();
        assert!(strip_crlf(&mut line));
        assert_eq!(b"hello".to_vec(), line);

        let mut line = b"hello\n".to_vec();
        assert!(strip_crlf(&mut line));
        assert_eq!(b"hello".to_vec(), line);

        let mut line = b"no newline".to_vec();
        assert!(!strip_crlf(&mut line));
    }
}
