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

pub mod dispatcher;
pub mod request_reader;
pub mod response_writer;
pub mod server;
pub mod syntax;

use tokio::io::{AsyncRead, AsyncWrite};

/// The connection stream, plaintext or TLS, behind one object so the
/// session loop survives a STARTTLS upgrade.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxStream = Box<dyn AsyncStream>;
