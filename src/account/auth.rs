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

use std::net::IpAddr;
use std::sync::Arc;

use log::info;

use crate::storage::{Storage, UserId};
use crate::support::error::Error;
use crate::support::rate_limit::LoginThrottle;

/// A hash of nothing in particular, verified when the username does not
/// exist so that the work factor is the same on both failure paths.
const DUMMY_HASH: &str =
    "$2b$10$N9qo8uLOickgx2ZMRZoMye1J9JbB3dXemvScW4P8RBKS7VRRmJOca";

/// The session-bound principal produced by a successful login.
#[derive(Clone, Debug)]
pub struct Principal {
    pub id: UserId,
    pub username: String,
}

pub struct Authenticator {
    storage: Arc<Storage>,
    throttle: LoginThrottle,
}

impl Authenticator {
    pub fn new(storage: Arc<Storage>, throttle: LoginThrottle) -> Self {
        Self { storage, throttle }
    }

    /// Verify `password` for `username`, enforcing the login window first.
    ///
    /// Every unsuccessful outcome other than rate limiting is folded into
    /// `InvalidCredentials`: a missing user and a wrong password are
    /// indistinguishable in both response text and timing.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        remote: IpAddr,
    ) -> Result<Principal, Error> {
        if !self.throttle.check(username, remote) {
            info!("login for {} from {} throttled", username, remote);
            return Err(Error::RateLimited);
        }

        let user = self.storage.find_user_by_name(username).await?;

        let (hash, user) = match user {
            Some(ref user) => (user.password.as_str(), Some(user)),
            None => (DUMMY_HASH, None),
        };

        let password = password.to_owned();
        let hash = hash.to_owned();
        let verified =
            tokio::task::spawn_blocking(move || {
                bcrypt::verify(password, &hash)
            })
            .await
            .expect("bcrypt verification task panicked")
            .unwrap_or(false);

        match user {
            Some(user) if verified => Ok(Principal {
                id: user.id,
                username: user.username.clone(),
            }),
            _ => Err(Error::InvalidCredentials),
        }
    }
}
