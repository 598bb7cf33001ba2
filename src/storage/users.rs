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

use mongodb::bson::doc;

use super::{Storage, User, UserId};
use crate::support::error::Error;

impl Storage {
    pub async fn find_user_by_name(
        &self,
        username: &str,
    ) -> Result<Option<User>, Error> {
        Ok(self.users.find_one(doc! { "username": username }).await?)
    }

    pub async fn find_user(
        &self,
        id: UserId,
    ) -> Result<Option<User>, Error> {
        Ok(self.users.find_one(doc! { "_id": id.0 }).await?)
    }

    /// Adjust the user's storage accounting by `delta` bytes.
    ///
    /// The counter is allowed to drift below zero under pathological
    /// interleavings; readers clamp instead of this method guarding, so
    /// that the adjustment stays a single unconditional `$inc`.
    pub async fn adjust_storage_used(
        &self,
        user: UserId,
        delta: i64,
    ) -> Result<(), Error> {
        self.users
            .update_one(
                doc! { "_id": user.0 },
                doc! { "$inc": { "storage_used": delta } },
            )
            .await?;
        Ok(())
    }
}
