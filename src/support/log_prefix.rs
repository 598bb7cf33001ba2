//-
// Copyright (c) 2023, 2024, the Wingmap authors
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

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Tracks text that should be included at the start of every log statement
/// for one connection.
///
/// Clones of a `LogPrefix` share the same underlying data, so the session
/// can fill in the user and user-agent after login / ID exchange and have
/// them show up everywhere.
#[derive(Clone)]
pub struct LogPrefix {
    inner: Arc<Mutex<Inner>>,
}

#[derive(Clone)]
struct Inner {
    peer: SocketAddr,
    session_id: u32,
    user: Option<String>,
    ua_name: Option<String>,
    ua_version: Option<String>,
}

impl LogPrefix {
    pub fn new(peer: SocketAddr, session_id: u32) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                peer,
                session_id,
                user: None,
                ua_name: None,
                ua_version: None,
            })),
        }
    }

    pub fn set_user(&self, user: String) {
        self.inner.lock().unwrap().user = Some(user);
    }

    pub fn set_user_agent(
        &self,
        name: Option<String>,
        version: Option<String>,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.ua_name = name;
        inner.ua_version = version;
    }
}

impl fmt::Display for LogPrefix {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        write!(f, "imap:{}#{}", inner.peer, inner.session_id)?;
        if inner.user.is_some()
            || inner.ua_name.is_some()
            || inner.ua_version.is_some()
        {
            write!(f, "[{}", inner.user.as_deref().unwrap_or("<anon>"))?;

            if inner.ua_name.is_some() || inner.ua_version.is_some() {
                write!(
                    f,
                    " {}/{}",
                    inner.ua_name.as_deref().unwrap_or("unknown"),
                    inner.ua_version.as_deref().unwrap_or("unknown"),
                )?;
            }
            write!(f, "]")?;
        }

        Ok(())
    }
}
