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

use std::io;

use tokio::io::{AsyncWriteExt, WriteHalf};

use super::BoxStream;

/// The output half of a session.
///
/// Nothing clever: response lines are already fully rendered (including
/// any literal syntax) by the time they get here. Each line is flushed
/// eagerly; IMAP conversations are chatty and latency-bound, not
/// throughput-bound.
pub struct ResponseWriter {
    out: WriteHalf<BoxStream>,
}

impl ResponseWriter {
    pub fn new(out: WriteHalf<BoxStream>) -> Self {
        Self { out }
    }

    /// Write a complete line; the CRLF is added here.
    pub async fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.write_line_bytes(line.as_bytes()).await
    }

    /// Write a complete line that may contain literal payloads.
    pub async fn write_line_bytes(
        &mut self,
        line: &[u8],
    ) -> io::Result<()> {
        self.out.write_all(line).await?;
        self.out.write_all(b"\r\n").await?;
        self.out.flush().await
    }

    /// Write a continuation request.
    pub async fn write_continuation(
        &mut self,
        text: &str,
    ) -> io::Result<()> {
        self.out.write_all(b"+ ").await?;
        self.out.write_all(text.as_bytes()).await?;
        self.out.write_all(b"\r\n").await?;
        self.out.flush().await
    }

    /// Surrender the write half, for the STARTTLS upgrade.
    pub fn into_inner(self) -> WriteHalf<BoxStream> {
        self.out
    }
}
